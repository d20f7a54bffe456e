use std::{collections::HashMap, str::FromStr, sync::Arc, time::Duration};

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::{
    error::RoomErr,
    hub::{cache::SLOTS, Participants, RoomCache},
    store::{keys, CoordinationStore},
};

/// Lifetime of a live room record, refreshed on activity.
pub const ROOM_TTL: Duration = Duration::from_secs(2 * 60 * 60);
/// How long an ended room is kept before the store drops it.
pub const ENDED_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Room status. Only ever advances: waiting → active → ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Waiting,
    Active,
    Ended,
}

impl RoomStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RoomStatus::Waiting => "waiting",
            RoomStatus::Active => "active",
            RoomStatus::Ended => "ended",
        }
    }
}

impl FromStr for RoomStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "waiting" => Ok(RoomStatus::Waiting),
            "active" => Ok(RoomStatus::Active),
            "ended" => Ok(RoomStatus::Ended),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub room_id:      String,
    pub status:       RoomStatus,
    pub participants: Vec<String>,
    pub created_at:   Option<i64>,
    pub started_at:   Option<i64>,
    pub ended_at:     Option<i64>,
}

impl RoomRecord {
    fn from_hash(room_id: &str, h: &HashMap<String, String>) -> Self {
        let stamp = |f: &str| h.get(f).and_then(|v| v.parse().ok());
        Self {
            room_id:      room_id.to_string(),
            status:       h.get("status").and_then(|s| s.parse().ok()).unwrap_or(RoomStatus::Waiting),
            participants: Participants::from_hash(h).users().to_vec(),
            created_at:   stamp("createdAt"),
            started_at:   stamp("startedAt"),
            ended_at:     stamp("endedAt"),
        }
    }
}

/// Room records in the coordination store.
pub struct RoomService {
    store: Arc<dyn CoordinationStore>,
    cache: Arc<RoomCache>,
}

impl RoomService {
    pub fn new(store: Arc<dyn CoordinationStore>, cache: Arc<RoomCache>) -> Self {
        Self { store, cache }
    }

    /// Writes a fresh `waiting` room for a matched pair.
    pub async fn create(&self, room: &str, first: &str, second: &str) -> Result<(), RoomErr> {
        let key = keys::room(room);
        self.store
            .hset(&key, &[
                ("status", RoomStatus::Waiting.as_str().to_string()),
                (SLOTS[0], first.to_string()),
                (SLOTS[1], second.to_string()),
                ("createdAt", Utc::now().timestamp().to_string()),
            ])
            .await?;
        self.store.expire(&key, ROOM_TTL).await?;
        info!(room, first, second, "room created");
        Ok(())
    }

    pub async fn get(&self, room: &str) -> Result<RoomRecord, RoomErr> {
        let h = self.store.hgetall(&keys::room(room)).await?;
        if h.is_empty() {
            return Err(RoomErr::NotFound);
        }
        Ok(RoomRecord::from_hash(room, &h))
    }

    pub async fn is_participant(&self, room: &str, user: &str) -> Result<bool, RoomErr> {
        Ok(self.get(room).await?.participants.iter().any(|p| p == user))
    }

    /// Takes the first free slot. Joining a room one already belongs to is a no-op.
    pub async fn join(&self, room: &str, user: &str) -> Result<RoomRecord, RoomErr> {
        let rec = self.get(room).await?;
        if rec.participants.iter().any(|p| p == user) {
            return Ok(rec);
        }
        if rec.participants.len() >= SLOTS.len() {
            return Err(RoomErr::Full);
        }

        let key = keys::room(room);
        let h = self.store.hgetall(&key).await?;
        let free: Vec<&str> = SLOTS.iter().copied().filter(|s| !h.contains_key(*s)).collect();
        let Some(slot) = self.claim_slot(&key, &free, user).await? else {
            return Err(RoomErr::Full);
        };
        self.store.expire(&key, ROOM_TTL).await?;
        self.cache.invalidate(room).await;
        info!(room, user, slot, "joined room");

        if rec.participants.len() + 1 >= SLOTS.len() {
            self.start(room).await?;
        }
        self.get(room).await
    }

    /// Sets the first still-absent slot field. A slot another joiner took
    /// since `free` was read is skipped, never overwritten.
    async fn claim_slot<'a>(&self, key: &str, free: &[&'a str], user: &str) -> Result<Option<&'a str>, RoomErr> {
        for slot in free {
            if self.store.hset_nx(key, slot, user.to_string()).await? {
                return Ok(Some(*slot));
            }
        }
        Ok(None)
    }

    /// Raw room hash as stored.
    pub async fn state(&self, room: &str) -> Result<HashMap<String, String>, RoomErr> {
        let h = self.store.hgetall(&keys::room(room)).await?;
        if h.is_empty() {
            return Err(RoomErr::NotFound);
        }
        Ok(h)
    }

    /// Frees the user's slot; the last one out ends the room.
    pub async fn leave(&self, room: &str, user: &str) -> Result<(), RoomErr> {
        let key = keys::room(room);
        let h = self.store.hgetall(&key).await?;
        if h.is_empty() {
            return Err(RoomErr::NotFound);
        }
        let Some(slot) = SLOTS.iter().find(|s| h.get(**s).is_some_and(|u| u == user)) else {
            return Err(RoomErr::NotParticipant);
        };
        self.store.hdel(&key, slot).await?;
        self.cache.invalidate(room).await;
        info!(room, user, "left room");

        if self.get(room).await?.participants.is_empty() {
            self.end(room).await?;
        }
        Ok(())
    }

    /// waiting → active. Returns whether the status changed.
    pub async fn start(&self, room: &str) -> Result<bool, RoomErr> {
        let moved = self.advance(room, RoomStatus::Active, "startedAt").await?;
        if moved {
            self.store.expire(&keys::room(room), ROOM_TTL).await?;
        }
        Ok(moved)
    }

    /// → ended, then kept for the retention window only.
    pub async fn end(&self, room: &str) -> Result<bool, RoomErr> {
        let moved = self.advance(room, RoomStatus::Ended, "endedAt").await?;
        if moved {
            self.store.expire(&keys::room(room), ENDED_RETENTION).await?;
        }
        Ok(moved)
    }

    async fn advance(&self, room: &str, to: RoomStatus, stamp: &str) -> Result<bool, RoomErr> {
        let rec = self.get(room).await?;
        if rec.status >= to {
            return Ok(false);
        }
        self.store
            .hset(&keys::room(room), &[
                ("status", to.as_str().to_string()),
                (stamp, Utc::now().timestamp().to_string()),
            ])
            .await?;
        info!(room, from = rec.status.as_str(), to = to.as_str(), "room status changed");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn service() -> (Arc<MemoryStore>, RoomService) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(RoomCache::new(store.clone(), Duration::from_secs(30)));
        (store.clone(), RoomService::new(store, cache))
    }

    #[tokio::test]
    async fn create_then_get() {
        let (_, rooms) = service();
        rooms.create("r", "alice", "bob").await.unwrap();
        let rec = rooms.get("r").await.unwrap();
        assert_eq!(rec.status, RoomStatus::Waiting);
        assert_eq!(rec.participants, ["alice", "bob"]);
        assert!(rec.created_at.is_some());
        assert!(rooms.is_participant("r", "bob").await.unwrap());
        assert!(matches!(rooms.get("nope").await, Err(RoomErr::NotFound)));
    }

    #[tokio::test]
    async fn third_user_cannot_join_full_room() {
        let (_, rooms) = service();
        rooms.create("r", "alice", "bob").await.unwrap();
        assert!(matches!(rooms.join("r", "carol").await, Err(RoomErr::Full)));
        assert_eq!(rooms.join("r", "alice").await.unwrap().participants.len(), 2);
        assert!(matches!(rooms.join("missing", "carol").await, Err(RoomErr::NotFound)));
    }

    #[tokio::test]
    async fn rejoin_after_leave_fills_free_slot_and_activates() {
        let (_, rooms) = service();
        rooms.create("r", "alice", "bob").await.unwrap();
        rooms.leave("r", "alice").await.unwrap();
        assert_eq!(rooms.get("r").await.unwrap().participants, ["bob"]);

        let rec = rooms.join("r", "carol").await.unwrap();
        assert_eq!(rec.participants, ["carol", "bob"]);
        assert_eq!(rec.status, RoomStatus::Active);
        assert!(matches!(rooms.leave("r", "alice").await, Err(RoomErr::NotParticipant)));
    }

    #[tokio::test]
    async fn taken_slot_is_not_overwritten() {
        let (store, rooms) = service();
        rooms.create("r", "alice", "bob").await.unwrap();
        rooms.leave("r", "alice").await.unwrap();
        let key = keys::room("r");

        // dave lands in slot1 after carol read it as free
        store.hset(&key, &[(SLOTS[0], "dave".to_string())]).await.unwrap();
        assert_eq!(rooms.claim_slot(&key, &[SLOTS[0]], "carol").await.unwrap(), None);
        assert_eq!(store.hgetall(&key).await.unwrap()[SLOTS[0]], "dave");
    }

    #[tokio::test]
    async fn concurrent_joins_fill_one_free_slot_once() {
        let (_, rooms) = service();
        rooms.create("r", "alice", "bob").await.unwrap();
        rooms.leave("r", "alice").await.unwrap();

        let (c, d) = tokio::join!(rooms.join("r", "carol"), rooms.join("r", "dave"));
        assert_eq!(c.is_ok() as u8 + d.is_ok() as u8, 1);
        assert!(matches!(c.err().or(d.err()), Some(RoomErr::Full)));

        let rec = rooms.get("r").await.unwrap();
        assert_eq!(rec.participants.len(), 2);
        assert!(rec.participants.contains(&"bob".to_string()));
    }

    #[tokio::test]
    async fn state_is_the_raw_hash() {
        let (_, rooms) = service();
        rooms.create("r", "alice", "bob").await.unwrap();
        let h = rooms.state("r").await.unwrap();
        assert_eq!(h["status"], "waiting");
        assert_eq!(h[SLOTS[1]], "bob");
        assert!(h.contains_key("createdAt"));
        assert!(matches!(rooms.state("nope").await, Err(RoomErr::NotFound)));
    }

    #[tokio::test]
    async fn status_never_moves_backwards() {
        let (_, rooms) = service();
        rooms.create("r", "alice", "bob").await.unwrap();
        assert!(rooms.start("r").await.unwrap());
        assert!(!rooms.start("r").await.unwrap());
        assert!(rooms.end("r").await.unwrap());
        assert!(!rooms.start("r").await.unwrap());
        let rec = rooms.get("r").await.unwrap();
        assert_eq!(rec.status, RoomStatus::Ended);
        assert!(rec.started_at.is_some() && rec.ended_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_room_ends_and_expires_after_retention() {
        let (store, rooms) = service();
        rooms.create("r", "alice", "bob").await.unwrap();
        rooms.leave("r", "alice").await.unwrap();
        rooms.leave("r", "bob").await.unwrap();
        assert_eq!(rooms.get("r").await.unwrap().status, RoomStatus::Ended);

        tokio::time::advance(ENDED_RETENTION + Duration::from_secs(1)).await;
        assert!(store.hgetall(&keys::room("r")).await.unwrap().is_empty());
    }
}
