use async_trait::async_trait;
use core_config::redis::RedisConfig;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::time::Duration;
use tracing::{debug, info};

use super::{KeyValueStore, StoreResult, WindowCount};
use crate::error::StoreError;
use crate::retry::{retry, retry_with_backoff, RetryConfig};

static COMPARE_AND_DELETE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
        ",
    )
});

static COMPARE_AND_EXPIRE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('PEXPIRE', KEYS[1], ARGV[2])
        end
        return 0
        ",
    )
});

// PEXPIRE only on the first hit of a window; the PTTL fix-up covers a
// counter that somehow lost its expiry.
static INCREMENT_WINDOW: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        local count = redis.call('INCR', KEYS[1])
        if count == 1 then
            redis.call('PEXPIRE', KEYS[1], ARGV[1])
        end
        local ttl = redis.call('PTTL', KEYS[1])
        if ttl < 0 then
            redis.call('PEXPIRE', KEYS[1], ARGV[1])
            ttl = tonumber(ARGV[1])
        end
        return {count, ttl}
        ",
    )
});

/// Redis-backed store shared by every process pointing at the same database.
///
/// `ConnectionManager` reconnects on its own; each call clones it, which is
/// cheap and lets calls run concurrently.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    /// Open a connection and verify it with `PING`.
    pub async fn connect(config: &RedisConfig) -> Result<Self, StoreError> {
        info!(url = %config.redacted_url(), "Connecting to Redis");

        let client = Client::open(config.url())?;
        let manager = ConnectionManager::new(client).await?;
        let store = Self::from_manager(manager);
        store.ping().await?;

        info!("Successfully connected to Redis");
        Ok(store)
    }

    /// [`connect`](Self::connect) with exponential backoff.
    ///
    /// # Example
    /// ```ignore
    /// use coordination::{RedisStore, RetryConfig};
    /// use core_config::{redis::RedisConfig, FromEnv};
    ///
    /// let config = RedisConfig::from_env()?;
    /// let store = RedisStore::connect_with_retry(&config, Some(RetryConfig::new().with_max_retries(5))).await?;
    /// ```
    pub async fn connect_with_retry(
        config: &RedisConfig,
        retry_config: Option<RetryConfig>,
    ) -> Result<Self, StoreError> {
        match retry_config {
            Some(retry_config) => retry_with_backoff(|| Self::connect(config), retry_config).await,
            None => retry(|| Self::connect(config)).await,
        }
    }

    pub fn from_manager(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// `PING` with timing, for readiness probes.
    pub async fn health(&self) -> HealthStatus {
        let start = std::time::Instant::now();
        let result = self.ping().await;
        let elapsed = start.elapsed().as_millis() as u64;

        match result {
            Ok(()) => HealthStatus::healthy(elapsed),
            Err(e) => HealthStatus::unhealthy(e.to_string(), elapsed),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// One `SCAN` page. Cursor 0 in the reply means the scan is complete.
    async fn scan(&self, pattern: &str, cursor: u64) -> StoreResult<(u64, Vec<String>)> {
        let mut conn = self.conn();
        let page: (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(SCAN_PAGE)
            .query_async(&mut conn)
            .await?;
        Ok(page)
    }
}

const SCAN_PAGE: usize = 500;

/// `MATCH` pattern for keys starting with `prefix`, glob characters escaped.
fn match_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

/// Sub-millisecond TTLs would be rejected by `PX`/`PEXPIRE`.
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl KeyValueStore for RedisStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn();
        let response: String = redis::cmd("PING").query_async(&mut conn).await?;
        if response != "PONG" {
            return Err(StoreError::Command(format!(
                "PING returned unexpected response: {response}"
            )));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut conn = self.conn();
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_many(&self, entries: &[(String, Vec<u8>)], ttl: Duration) -> StoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            pipe.cmd("SET")
                .arg(key)
                .arg(value.as_slice())
                .arg("PX")
                .arg(ttl_millis(ttl))
                .ignore();
        }

        let mut conn = self.conn();
        let _: () = pipe.query_async(&mut conn).await?;
        debug!(count = entries.len(), "Wrote cache batch");
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn count_prefixed(&self, prefix: &str) -> StoreResult<usize> {
        let pattern = match_prefix(prefix);
        let mut cursor = 0;
        let mut count = 0;
        loop {
            let (next, keys) = self.scan(&pattern, cursor).await?;
            count += keys.len();
            if next == 0 {
                return Ok(count);
            }
            cursor = next;
        }
    }

    async fn delete_prefixed(&self, prefix: &str) -> StoreResult<usize> {
        let pattern = match_prefix(prefix);
        let mut cursor = 0;
        let mut removed = 0;
        loop {
            let (next, keys) = self.scan(&pattern, cursor).await?;
            if !keys.is_empty() {
                let mut conn = self.conn();
                let unlinked: usize = redis::cmd("UNLINK").arg(&keys).query_async(&mut conn).await?;
                removed += unlinked;
            }
            if next == 0 {
                debug!(prefix, removed, "Deleted prefixed keys");
                return Ok(removed);
            }
            cursor = next;
        }
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = COMPARE_AND_DELETE
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut conn = self.conn();
        let updated: i64 = COMPARE_AND_EXPIRE
            .key(key)
            .arg(expected)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn increment_window(&self, key: &str, window: Duration) -> StoreResult<WindowCount> {
        let mut conn = self.conn();
        let (count, ttl_ms): (i64, i64) = INCREMENT_WINDOW
            .key(key)
            .arg(ttl_millis(window))
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowCount {
            count: count.max(0) as u64,
            resets_in: Duration::from_millis(ttl_ms.max(0) as u64),
        })
    }
}

/// Health check result for detailed status reporting
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    /// Failure detail when unhealthy
    pub message: Option<String>,
    pub response_time_ms: u64,
}

impl HealthStatus {
    pub fn healthy(response_time_ms: u64) -> Self {
        Self {
            healthy: true,
            message: None,
            response_time_ms,
        }
    }

    pub fn unhealthy(message: String, response_time_ms: u64) -> Self {
        Self {
            healthy: false,
            message: Some(message),
            response_time_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_unhealthy_carries_message() {
        let status = HealthStatus::unhealthy("connection refused".to_string(), 12);
        assert!(!status.healthy);
        assert_eq!(status.message.as_deref(), Some("connection refused"));
        assert!(HealthStatus::healthy(3).message.is_none());
    }

    #[test]
    fn test_match_prefix_escapes_glob() {
        assert_eq!(match_prefix("cache:"), "cache:*");
        assert_eq!(match_prefix("a*b?[c]"), "a\\*b\\?\\[c\\]*");
    }

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(60)), 60_000);
    }

    #[tokio::test]
    #[ignore] // Requires actual Redis
    async fn test_connect_refused_is_unavailable() {
        let config = RedisConfig::new("127.0.0.1", 1);
        let err = match RedisStore::connect(&config).await {
            Ok(_) => panic!("nothing listens on port 1"),
            Err(err) => err,
        };
        assert!(err.is_unavailable());
    }
}
