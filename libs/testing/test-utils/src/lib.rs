//! Shared test utilities for the coordination crates
//!
//! - `TestDatabase`: PostgreSQL container for transaction tests (feature: "postgres")
//! - `TestRedis`: Redis container backing locks, semaphores and caches (feature: "redis")
//! - `TestDataBuilder`: deterministic keys and caller ids (always available)
//! - `assertions`: assertion helpers (always available)
//!
//! # Features
//!
//! - `postgres` (default): Enables PostgreSQL test infrastructure
//! - `redis`: Enables Redis test infrastructure
//! - `all`: Enables both
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis"] }
//! ```
//!
//! ```rust,ignore
//! use coordination::{DistributedLock, RedisStore};
//! use test_utils::{TestDataBuilder, TestRedis};
//!
//! #[tokio::test]
//! #[ignore = "requires docker"]
//! async fn lock_against_real_redis() {
//!     let redis = TestRedis::new().await;
//!     let store = RedisStore::connect(&redis.config()).await.unwrap();
//!     let builder = TestDataBuilder::from_test_name("lock_against_real_redis");
//!
//!     let lock = DistributedLock::new(std::sync::Arc::new(store));
//!     let key = builder.key("lock", "batch");
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "postgres")]
mod postgres;

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "postgres")]
pub use postgres::TestDatabase;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Builder for test data with deterministic randomization
///
/// Keys derived from the same test name are identical across runs, and keys
/// from different tests never collide in a shared store.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (seed is the hash of the name)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_lock_contention");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Deterministic caller id, for per-user rate limits
    pub fn caller_id(&self) -> Uuid {
        let bytes = self.seed.to_le_bytes();
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&bytes);
        uuid_bytes[8..16].copy_from_slice(&bytes);
        Uuid::from_bytes(uuid_bytes)
    }

    /// Store key scoped to this test
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(7);
    /// assert_eq!(builder.key("embedding", "a"), "test:embedding:7:a");
    /// ```
    pub fn key(&self, namespace: &str, suffix: &str) -> String {
        format!("test:{}:{}:{}", namespace, self.seed, suffix)
    }

    /// Batch id in the `batch-<seed>-<n>` form used by upsert locks
    pub fn batch_id(&self, n: usize) -> String {
        format!("batch-{}-{}", self.seed, n)
    }
}

/// Test assertion helpers
pub mod assertions {
    use std::time::Duration;

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }

    /// Assert that `elapsed` is in `[min, max]`
    pub fn assert_elapsed_between(elapsed: Duration, min: Duration, max: Duration, context: &str) {
        assert!(
            elapsed >= min && elapsed <= max,
            "{}: expected elapsed between {:?} and {:?}, got {:?}",
            context,
            min,
            max,
            elapsed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_data_builder_deterministic() {
        let builder1 = TestDataBuilder::new(42);
        let builder2 = TestDataBuilder::new(42);

        assert_eq!(builder1.caller_id(), builder2.caller_id());
        assert_eq!(
            builder1.key("search", "query"),
            builder2.key("search", "query")
        );
    }

    #[test]
    fn test_data_builder_from_name() {
        let builder1 = TestDataBuilder::from_test_name("my_test");
        let builder2 = TestDataBuilder::from_test_name("my_test");

        assert_eq!(builder1.caller_id(), builder2.caller_id());
        assert_eq!(builder1.batch_id(3), builder2.batch_id(3));
    }

    #[test]
    fn test_data_builder_different_names() {
        let builder1 = TestDataBuilder::from_test_name("test1");
        let builder2 = TestDataBuilder::from_test_name("test2");

        assert_ne!(builder1.caller_id(), builder2.caller_id());
        assert_ne!(builder1.key("lock", "a"), builder2.key("lock", "a"));
    }

    #[test]
    #[should_panic(expected = "expected elapsed between")]
    fn test_elapsed_assertion_rejects_out_of_range() {
        assertions::assert_elapsed_between(
            Duration::from_secs(5),
            Duration::from_secs(1),
            Duration::from_secs(2),
            "wait",
        );
    }
}
