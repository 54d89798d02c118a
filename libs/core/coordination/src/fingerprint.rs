//! Deterministic keys for cache entries and lock records.
//!
//! Every key has the shape `<namespace>:<sha256-hex>`, where the digest covers
//! the ordered parts of an operation's semantic identity.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Digest an ordered list of parts into a 64-char lowercase hex string.
///
/// Each part is length-prefixed, so `["ab", "c"]` and `["a", "bc"]` never
/// collide.
pub fn fingerprint<I, P>(parts: I) -> String
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let bytes = part.as_ref();
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(bytes);
    }
    format!("{:x}", hasher.finalize())
}

/// Producer of a key. The string form is the key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::AsRefStr, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Namespace {
    Embedding,
    VectorSearch,
    Classification,
    EmbeddingLock,
    SearchLock,
    UpsertBatch,
}

/// A rendered `<namespace>:<hex>` key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new<I, P>(namespace: impl AsRef<str>, parts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        Self(format!("{}:{}", namespace.as_ref(), fingerprint(parts)))
    }

    pub fn embedding(text: &str, model: &str) -> Self {
        Self::new(Namespace::Embedding, [text, model])
    }

    pub fn embedding_lock(text: &str, model: &str) -> Self {
        Self::new(Namespace::EmbeddingLock, [text, model])
    }

    /// `filter` objects are canonical because serde_json maps are key-ordered.
    pub fn vector_search(query: &str, top_k: usize, filter: Option<&Value>) -> Self {
        let (top_k, filter) = search_parts(top_k, filter);
        Self::new(Namespace::VectorSearch, [query, &top_k, &filter])
    }

    pub fn search_lock(query: &str, top_k: usize, filter: Option<&Value>) -> Self {
        let (top_k, filter) = search_parts(top_k, filter);
        Self::new(Namespace::SearchLock, [query, &top_k, &filter])
    }

    pub fn classification(query: &str) -> Self {
        Self::new(Namespace::Classification, [query])
    }

    pub fn upsert_batch(batch_id: &str) -> Self {
        Self::new(Namespace::UpsertBatch, [batch_id])
    }

    /// Prefix before the first `:`.
    pub fn namespace(&self) -> &str {
        namespace_of(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

fn search_parts(top_k: usize, filter: Option<&Value>) -> (String, String) {
    let filter = filter
        .map(Value::to_string)
        .unwrap_or_else(|| "no_filter".to_string());
    (top_k.to_string(), filter)
}

/// Metric label for an arbitrary key: everything before the first `:`.
pub(crate) fn namespace_of(key: &str) -> &str {
    key.split(':').next().unwrap_or(key)
}
