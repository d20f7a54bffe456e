//! Process-local view of room membership.
//!
//! Staleness is bounded by the TTL; the store stays authoritative.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{sync::RwLock, time::Instant};
use tracing::debug;

use crate::store::{keys, CoordinationStore, StoreResult};

/// Slot fields of a room hash, in slot order.
pub const SLOTS: [&str; 2] = ["slot1", "slot2"];

/// Ordered slot → user mapping of one room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Participants {
    slots: Vec<String>,
}

impl Participants {
    pub fn from_hash(h: &HashMap<String, String>) -> Self {
        let slots = SLOTS
            .iter()
            .filter_map(|s| h.get(*s))
            .filter(|u| !u.is_empty())
            .cloned()
            .collect();
        Self { slots }
    }

    pub fn users(&self) -> &[String] { &self.slots }

    pub fn contains(&self, user: &str) -> bool { self.slots.iter().any(|u| u == user) }

    /// Members other than `user`.
    pub fn others<'a>(&'a self, user: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.slots.iter().map(String::as_str).filter(move |u| *u != user)
    }

    pub fn is_empty(&self) -> bool { self.slots.is_empty() }
}

struct Cached {
    participants: Participants,
    fetched_at:   Instant,
}

pub struct RoomCache {
    store:   Arc<dyn CoordinationStore>,
    ttl:     Duration,
    entries: RwLock<HashMap<String, Cached>>,
}

impl RoomCache {
    pub fn new(store: Arc<dyn CoordinationStore>, ttl: Duration) -> Self {
        Self { store, ttl, entries: RwLock::new(HashMap::new()) }
    }

    pub async fn participants_of(&self, room: &str) -> StoreResult<Participants> {
        {
            let m = self.entries.read().await;
            if let Some(c) = m.get(room) {
                if c.fetched_at.elapsed() < self.ttl {
                    return Ok(c.participants.clone());
                }
            }
        }

        let fresh = Participants::from_hash(&self.store.hgetall(&keys::room(room)).await?);
        debug!(room, participants = ?fresh.users(), "room participants fetched");

        let mut m = self.entries.write().await;
        if fresh.is_empty() {
            m.remove(room);
        } else {
            m.insert(room.to_string(), Cached { participants: fresh.clone(), fetched_at: Instant::now() });
        }
        Ok(fresh)
    }

    pub async fn invalidate(&self, room: &str) {
        self.entries.write().await.remove(room);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn seeded(users: &[(&str, &str)]) -> (Arc<MemoryStore>, RoomCache) {
        let store = Arc::new(MemoryStore::new());
        let fields: Vec<(&str, String)> = users.iter().map(|(k, v)| (*k, v.to_string())).collect();
        store.hset(&keys::room("r"), &fields).await.unwrap();
        let cache = RoomCache::new(store.clone(), Duration::from_secs(30));
        (store, cache)
    }

    #[test]
    fn slots_keep_order_and_skip_foreign_fields() {
        let h = HashMap::from([
            ("slot2".to_string(), "bob".to_string()),
            ("status".to_string(), "waiting".to_string()),
            ("slot1".to_string(), "alice".to_string()),
        ]);
        let p = Participants::from_hash(&h);
        assert_eq!(p.users(), ["alice", "bob"]);
        assert_eq!(p.others("alice").collect::<Vec<_>>(), ["bob"]);
    }

    #[tokio::test(start_paused = true)]
    async fn serves_cached_copy_until_ttl() {
        let (store, cache) = seeded(&[("slot1", "alice"), ("slot2", "bob")]).await;
        assert!(cache.participants_of("r").await.unwrap().contains("bob"));

        store.hset(&keys::room("r"), &[("slot2", "carol".into())]).await.unwrap();
        assert!(cache.participants_of("r").await.unwrap().contains("bob"), "stale within ttl");

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cache.participants_of("r").await.unwrap().contains("carol"));
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let (store, cache) = seeded(&[("slot1", "alice")]).await;
        assert_eq!(cache.participants_of("r").await.unwrap().users(), ["alice"]);

        store.hset(&keys::room("r"), &[("slot2", "bob".into())]).await.unwrap();
        cache.invalidate("r").await;
        assert_eq!(cache.participants_of("r").await.unwrap().users(), ["alice", "bob"]);
    }

    #[tokio::test]
    async fn unknown_rooms_are_not_cached() {
        let (store, cache) = seeded(&[]).await;
        assert!(cache.participants_of("other").await.unwrap().is_empty());

        store.hset(&keys::room("other"), &[("slot1", "zed".into())]).await.unwrap();
        assert_eq!(cache.participants_of("other").await.unwrap().users(), ["zed"]);
    }
}
