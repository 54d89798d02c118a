//! Fixed-window admission control.
//!
//! Each scope owns one counter in the shared store under
//! `ratelimit:<scope key>`. The first request of a window creates the counter
//! with an expiry of `window`; once it expires the next request starts a
//! fresh window. Counting and expiry happen in one atomic store call.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::RateLimitError;
use crate::metrics::CoordinationMetrics;
use crate::store::KeyValueStore;

const KEY_PREFIX: &str = "ratelimit";

/// `limit` requests per `window`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub limit: u64,
    pub window: Duration,
}

impl RateLimitRule {
    pub const fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }

    pub const fn per_minute(limit: u64) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }
}

/// A counter identity plus the rule that governs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateScope {
    name: String,
    key: String,
    rule: RateLimitRule,
}

impl RateScope {
    /// One counter shared by every caller, e.g. `chat:stream`.
    pub fn global(name: impl Into<String>, rule: RateLimitRule) -> Self {
        let name = name.into();
        Self {
            key: name.clone(),
            name,
            rule,
        }
    }

    /// One counter per caller, e.g. `chat:user:<id>`.
    pub fn per_caller(name: impl Into<String>, caller: impl fmt::Display, rule: RateLimitRule) -> Self {
        let name = name.into();
        Self {
            key: format!("{name}:{caller}"),
            name,
            rule,
        }
    }

    /// Rule name, shared by all callers of a per-caller scope
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn rule(&self) -> RateLimitRule {
        self.rule
    }

    fn store_key(&self) -> String {
        format!("{KEY_PREFIX}:{}", self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub scope: String,
    pub allowed: bool,
    /// Requests left in the current window; 0 when denied
    pub remaining: u64,
    /// Time until the window resets; zero when allowed
    pub retry_after: Duration,
}

impl RateDecision {
    /// Turn a denial into [`RateLimitError::Exceeded`].
    pub fn into_result(self) -> Result<Self, RateLimitError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(RateLimitError::Exceeded {
                scope: self.scope,
                remaining: 0,
                retry_after: self.retry_after,
            })
        }
    }
}

/// Admission control over the shared store.
///
/// There is no local fallback: if the store is unreachable the call fails with
/// [`RateLimitError::Backend`] rather than admitting traffic unchecked.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Count this request against `scope` and report whether it is admitted.
    ///
    /// Denied requests still count, so hammering a closed window does not
    /// reopen it early.
    pub async fn is_allowed(&self, scope: &RateScope) -> Result<RateDecision, RateLimitError> {
        let rule = scope.rule();
        let window = self
            .store
            .increment_window(&scope.store_key(), rule.window)
            .await?;

        let allowed = window.count <= rule.limit;
        let decision = RateDecision {
            scope: scope.key().to_string(),
            allowed,
            remaining: rule.limit.saturating_sub(window.count),
            retry_after: if allowed { Duration::ZERO } else { window.resets_in },
        };

        CoordinationMetrics::rate_decision(scope.name(), allowed);
        if allowed {
            debug!(scope = %scope.key(), remaining = decision.remaining, "Request admitted");
        } else {
            warn!(
                scope = %scope.key(),
                limit = rule.limit,
                retry_after_ms = decision.retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    /// Like [`is_allowed`](Self::is_allowed) but a denial is an error.
    pub async fn admit(&self, scope: &RateScope) -> Result<RateDecision, RateLimitError> {
        self.is_allowed(scope).await?.into_result()
    }

    /// Admit only if every scope admits, checked in order.
    ///
    /// Stops at the first denial; scopes checked before it have already
    /// counted the request.
    pub async fn check_all(&self, scopes: &[RateScope]) -> Result<Vec<RateDecision>, RateLimitError> {
        let mut decisions = Vec::with_capacity(scopes.len());
        for scope in scopes {
            decisions.push(self.admit(scope).await?);
        }
        Ok(decisions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_per_caller_key() {
        let scope = RateScope::per_caller("chat:user", 42, RateLimitRule::per_minute(30));
        assert_eq!(scope.key(), "chat:user:42");
        assert_eq!(scope.name(), "chat:user");
        assert_eq!(scope.store_key(), "ratelimit:chat:user:42");
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_counts_down() {
        let limiter = limiter();
        let scope = RateScope::global("search:vector", RateLimitRule::per_minute(3));

        let remaining: Vec<u64> = {
            let mut out = Vec::new();
            for _ in 0..3 {
                out.push(limiter.is_allowed(&scope).await.unwrap().remaining);
            }
            out
        };
        assert_eq!(remaining, vec![2, 1, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_limit_denies_everything() {
        let limiter = limiter();
        let scope = RateScope::global("closed", RateLimitRule::per_minute(0));

        let decision = limiter.is_allowed(&scope).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.retry_after, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_callers_have_independent_windows() {
        let limiter = limiter();
        let rule = RateLimitRule::per_minute(1);
        let alice = RateScope::per_caller("chat:user", "alice", rule);
        let bob = RateScope::per_caller("chat:user", "bob", rule);

        assert!(limiter.is_allowed(&alice).await.unwrap().allowed);
        assert!(!limiter.is_allowed(&alice).await.unwrap().allowed);
        assert!(limiter.is_allowed(&bob).await.unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admit_maps_denial_to_error() {
        let limiter = limiter();
        let scope = RateScope::global("chat:stream", RateLimitRule::per_minute(1));
        limiter.admit(&scope).await.unwrap();

        match limiter.admit(&scope).await {
            Err(RateLimitError::Exceeded { scope, remaining, retry_after }) => {
                assert_eq!(scope, "chat:stream");
                assert_eq!(remaining, 0);
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("expected Exceeded, got {other:?}"),
        }
    }
}
