//! Storage substrate for the pipeline.
//!
//! The [`Store`] trait exposes exactly the operations the analytics
//! components use, in storage terms (ordered sets, hashes, capped streams,
//! TTLs). [`RedisStore`] is the production implementation; [`MemoryStore`]
//! backs tests and single-process runs. Compound mutations are atomic in
//! both: Redis uses `MULTI`/`EXEC` pipelines, the in-memory store a single
//! lock.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// One entry read back from an append-only stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Vec<(String, String)>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// The hot-page window update, applied as one atomic transaction.
///
/// Mirrors the promotion pipeline: insert the edit reference, drop members
/// older than the horizon, trim to the member cap from the oldest end, bump
/// metadata, editor counts and the byte-change history, refresh TTLs.
#[derive(Debug, Clone)]
pub struct WindowAppend<'a> {
    pub window_key: &'a str,
    pub meta_key: &'a str,
    pub editors_key: &'a str,
    pub changes_key: &'a str,
    /// Hot-set registry; the page is upserted with the edit timestamp so
    /// cardinality checks and cleanup read one ordered set.
    pub registry_key: &'a str,
    pub page: &'a str,
    /// `ts:edit_id`, which also deduplicates broker replays.
    pub member: &'a str,
    pub timestamp: i64,
    pub editor: &'a str,
    pub byte_delta: i64,
    pub window: Duration,
    pub max_members: u64,
    pub changes_cap: u64,
    pub ttl: Duration,
}

/// The edit-war per-page state update, applied as one atomic transaction:
/// bump the editor's count and prepend the byte delta, trimming the history
/// and refreshing both TTLs.
#[derive(Debug, Clone)]
pub struct WarAppend<'a> {
    pub editors_key: &'a str,
    pub changes_key: &'a str,
    pub editor: &'a str,
    pub byte_delta: i64,
    pub changes_cap: u64,
    pub ttl: Duration,
}

/// Shared handle to a store implementation.
pub type SharedStore = Arc<dyn Store>;

#[async_trait]
pub trait Store: Send + Sync {
    // Strings and counters
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn incr(&self, key: &str) -> Result<i64>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
    /// `SET key value NX EX ttl`; returns whether the key was set. The
    /// detectors' cooldown and dedup markers are built on this.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn del(&self, keys: &[String]) -> Result<()>;

    // Ordered sets
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;
    async fn zcard(&self, key: &str) -> Result<u64>;
    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64>;
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;
    async fn zrevrank(&self, key: &str, member: &str) -> Result<Option<u64>>;
    /// Descending by score; `start`/`stop` are rank bounds, `-1` = last.
    async fn zrevrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>>;
    /// Ascending by score.
    async fn zrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>>;
    async fn zrem(&self, key: &str, members: &[String]) -> Result<u64>;

    // Hashes
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hlen(&self, key: &str) -> Result<u64>;
    async fn hdel(&self, key: &str, fields: &[String]) -> Result<()>;

    // Lists
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    // Sets
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;
    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    // Capped streams
    /// `XADD <stream> MAXLEN ~ <maxlen> * fields..`; returns the entry id.
    async fn xadd_capped(
        &self,
        stream: &str,
        fields: &[(String, String)],
        maxlen: u64,
    ) -> Result<String>;
    /// Entries strictly after `after` in id order (from the start when
    /// `None`), at most `count`.
    async fn xrange_after(
        &self,
        stream: &str,
        after: Option<&str>,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;
    /// Newest entries first, at most `count`.
    async fn xrevrange_count(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>>;
    async fn xlen(&self, stream: &str) -> Result<u64>;
    async fn xlast_id(&self, stream: &str) -> Result<Option<String>>;

    // Compound atomic operations
    async fn window_append(&self, req: WindowAppend<'_>) -> Result<()>;
    async fn war_append(&self, req: WarAppend<'_>) -> Result<()>;
    /// Writes a trending score and its last-update stamp together.
    async fn trending_store(&self, page: &str, score: f64, now: i64) -> Result<()>;
}
