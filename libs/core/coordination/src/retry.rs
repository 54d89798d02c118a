//! Exponential backoff shared by store connection retries and the polling
//! loops of [`DistributedLock`](crate::DistributedLock) and
//! [`Semaphore`](crate::Semaphore).

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (ignored by polling loops, which are
    /// bounded by their own deadline)
    pub max_retries: u32,

    /// First delay
    pub initial_delay: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,

    /// Multiplier applied after every attempt
    pub backoff_multiplier: f64,

    /// Spread delays over 50%..100% of the nominal value
    pub use_jitter: bool,
}

impl RetryConfig {
    /// Defaults: 3 retries, 100ms initial delay, 5s cap, x2, jitter on.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tight polling profile used while waiting on a contended key.
    pub fn polling() -> Self {
        Self {
            max_retries: u32::MAX,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(250),
            backoff_multiplier: 1.5,
            use_jitter: true,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Start a fresh delay sequence.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: self.initial_delay,
            config: self.clone(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

/// Stateful delay generator.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    config: RetryConfig,
}

impl Backoff {
    /// Delay to sleep before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.next.min(self.config.max_delay);
        let scaled = nominal.as_secs_f64() * self.config.backoff_multiplier;
        self.next = Duration::from_secs_f64(scaled).min(self.config.max_delay);

        if self.config.use_jitter {
            apply_jitter(nominal)
        } else {
            nominal
        }
    }

    /// Like [`next_delay`](Self::next_delay) but never longer than `remaining`.
    pub fn next_delay_within(&mut self, remaining: Duration) -> Duration {
        self.next_delay().min(remaining)
    }
}

/// Retry an async operation with exponential backoff
///
/// # Example
/// ```ignore
/// use coordination::retry::{retry_with_backoff, RetryConfig};
///
/// let store = retry_with_backoff(
///     || RedisStore::connect(&redis_config),
///     RetryConfig::new().with_max_retries(5),
/// )
/// .await?;
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(mut operation: F, config: RetryConfig) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    let mut backoff = config.backoff();

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt, "Operation succeeded after retries");
                }
                return Ok(result);
            }
            Err(e) => {
                attempt += 1;

                if attempt > config.max_retries {
                    warn!(attempts = attempt, error = %e, "Operation failed, giving up");
                    return Err(e);
                }

                let delay = backoff.next_delay();
                debug!(
                    attempt,
                    max_retries = config.max_retries,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Retry with the default configuration.
pub async fn retry<F, Fut, T, E>(operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff(operation, RetryConfig::default()).await
}

/// Scale a delay to a pseudo-random 50%..100% of its value.
fn apply_jitter(delay: Duration) -> Duration {
    use std::collections::hash_map::RandomState;
    use std::hash::BuildHasher;

    let random_factor =
        (RandomState::new().hash_one(std::time::SystemTime::now()) % 50) as f64 / 100.0 + 0.5;

    delay.mul_f64(random_factor)
}
