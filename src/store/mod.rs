//! Shared coordination store.
//!
//! Every process instance talks to the same store; it is the only place where
//! queue membership and room participants are authoritative. The trait mirrors
//! the handful of key-value, hash, sorted-set and set primitives the core needs,
//! each of which is atomic on its own. Nothing spans more than one call.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;

use crate::error::StoreError;

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /* ── strings ── */
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()>;
    /// Sets the key only when absent. Returns whether the write happened.
    async fn set_nx(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<bool>;
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    /// Increments an integer counter. A counter created by this call expires
    /// after `window`; later increments leave the expiry alone.
    async fn incr(&self, key: &str, window: Duration) -> StoreResult<i64>;

    /* ── generic ── */
    async fn del(&self, key: &str) -> StoreResult<bool>;
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /* ── hashes ── */
    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<()>;
    /// Writes one field only when it is absent. Returns whether the write happened.
    async fn hset_nx(&self, key: &str, field: &str, value: String) -> StoreResult<bool>;
    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool>;
    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /* ── sorted sets ── */
    /// Adds `member` only when it is not already present; an existing score is kept.
    async fn zadd_nx(&self, key: &str, member: &str, score: f64) -> StoreResult<bool>;
    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;
    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>>;
    /// 0-based rank in ascending score order.
    async fn zrank(&self, key: &str, member: &str) -> StoreResult<Option<usize>>;
    /// All members in ascending score order (ties broken by member).
    async fn zrange(&self, key: &str) -> StoreResult<Vec<String>>;
    async fn zcard(&self, key: &str) -> StoreResult<usize>;

    /* ── sets ── */
    /// Adds `member` and returns the resulting membership in one step.
    async fn sadd(&self, key: &str, member: &str) -> StoreResult<Vec<String>>;
    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;
}

/// Key naming shared by every instance.
pub mod keys {
    pub const QUEUE: &str = "matchmaking:queue";

    pub fn queue_meta(user: &str) -> String { format!("matchmaking:user:{user}") }

    pub fn match_claim(user: &str) -> String { format!("matchmaking:claim:{user}") }

    /// Order-independent key for a pair of users.
    pub fn match_pair(a: &str, b: &str) -> String {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        format!("matchmaking:pair:{lo}:{hi}")
    }

    pub fn room(room: &str) -> String { format!("room:{room}") }

    pub fn room_accepted(room: &str) -> String { format!("room:{room}:accepted") }

    pub fn online(user: &str) -> String { format!("user:{user}:online") }

    pub fn rate_limit(ip: &str) -> String { format!("ratelimit:{ip}") }
}

#[cfg(test)]
mod tests {
    use super::keys;

    #[test]
    fn pair_key_ignores_argument_order() {
        assert_eq!(keys::match_pair("bob", "alice"), keys::match_pair("alice", "bob"));
        assert_eq!(keys::match_pair("alice", "bob"), "matchmaking:pair:alice:bob");
    }

    #[test]
    fn key_layout() {
        assert_eq!(keys::room("r1"), "room:r1");
        assert_eq!(keys::room_accepted("r1"), "room:r1:accepted");
        assert_eq!(keys::online("u"), "user:u:online");
        assert_eq!(keys::queue_meta("u"), "matchmaking:user:u");
        assert_eq!(keys::rate_limit("10.0.0.1"), "ratelimit:10.0.0.1");
    }
}
