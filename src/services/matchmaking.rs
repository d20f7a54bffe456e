use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::{
    error::{MatchErr, RoomErr},
    services::rooms::{RoomService, RoomStatus},
    store::{keys, CoordinationStore},
};

/// Orphaned queue metadata heals itself after this long.
pub const QUEUE_META_TTL: Duration = Duration::from_secs(30 * 60);
/// How long a freshly formed pair stays reserved.
pub const CLAIM_TTL: Duration = Duration::from_secs(60);
/// Assumed time to form one match, for wait estimates.
pub const MATCH_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_SKILL: i32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub position:       usize,
    pub estimated_wait: Duration,
    pub queue_size:     usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub room_id: String,
    /// Room slot order.
    pub users:   [String; 2],
}

impl Match {
    pub fn partner_of(&self, user: &str) -> Option<&str> {
        match &self.users {
            [a, b] if a == user => Some(b.as_str()),
            [a, b] if b == user => Some(a.as_str()),
            _ => None,
        }
    }
}

/// Picks the pair to form from the FIFO-ordered queue.
///
/// A requester found before any pair is complete takes the next member after
/// it, or the one before it when nobody follows. Otherwise the first two
/// queued users are paired and the requester keeps waiting.
pub fn pick_pair<'a>(members: &'a [String], requester: &str) -> Option<(&'a str, &'a str)> {
    let mut first: Option<&'a str> = None;
    let mut before_requester: Option<&'a str> = None;
    for m in members {
        let m = m.as_str();
        if m == requester {
            before_requester = first;
            first = Some(m);
        } else if let Some(f) = first {
            if f != m {
                return Some((f, m));
            }
        } else {
            first = Some(m);
        }
    }
    match (first, before_requester) {
        (Some(r), Some(prev)) if r == requester && prev != r => Some((prev, r)),
        _ => None,
    }
}

fn estimate_wait(position: usize) -> Duration {
    MATCH_INTERVAL * (position / 2) as u32
}

pub struct MatchmakingService {
    store: Arc<dyn CoordinationStore>,
    rooms: Arc<RoomService>,
}

impl MatchmakingService {
    pub fn new(store: Arc<dyn CoordinationStore>, rooms: Arc<RoomService>) -> Self {
        Self { store, rooms }
    }

    /// Skill is stored for display only; pairing is strictly by join time.
    pub async fn join_queue(&self, user: &str, skill_level: i32) -> Result<(), MatchErr> {
        let now = Utc::now();
        if !self.store.zadd_nx(keys::QUEUE, user, now.timestamp_micros() as f64).await? {
            return Err(MatchErr::AlreadyQueued);
        }
        // a claim left over from an earlier match must not block this one
        self.store.del(&keys::match_claim(user)).await?;

        let meta = keys::queue_meta(user);
        self.store
            .hset(&meta, &[
                ("skillLevel", skill_level.to_string()),
                ("joinedAt", now.timestamp().to_string()),
            ])
            .await?;
        self.store.expire(&meta, QUEUE_META_TTL).await?;
        info!(user, skill_level, "joined matchmaking queue");
        Ok(())
    }

    /// Removing a user who is not queued is fine.
    pub async fn leave_queue(&self, user: &str) -> Result<(), MatchErr> {
        self.store.zrem(keys::QUEUE, user).await?;
        self.store.del(&keys::queue_meta(user)).await?;
        debug!(user, "left matchmaking queue");
        Ok(())
    }

    pub async fn is_queued(&self, user: &str) -> Result<bool, MatchErr> {
        Ok(self.store.zscore(keys::QUEUE, user).await?.is_some())
    }

    pub async fn queue_size(&self) -> Result<usize, MatchErr> {
        Ok(self.store.zcard(keys::QUEUE).await?)
    }

    pub async fn queue_status(&self, user: &str) -> Result<QueueStatus, MatchErr> {
        let rank = self.store.zrank(keys::QUEUE, user).await?.ok_or(MatchErr::NotQueued)?;
        let position = rank + 1;
        Ok(QueueStatus {
            position,
            estimated_wait: estimate_wait(position),
            queue_size: self.queue_size().await?,
        })
    }

    /// Room a user was recently matched into, if the reservation is still live.
    pub async fn pending_match(&self, user: &str) -> Result<Option<String>, MatchErr> {
        Ok(self.store.get(&keys::match_claim(user)).await?)
    }

    pub async fn find_match(&self, requester: &str) -> Result<Match, MatchErr> {
        let members = self.store.zrange(keys::QUEUE).await?;
        if members.len() < 2 {
            return Err(MatchErr::NoMatchFound);
        }
        let (a, b) = pick_pair(&members, requester).ok_or(MatchErr::NoMatchFound)?;
        self.form_room(a, b).await
    }

    /// Reserves the pair, then each user, then writes the room. Whoever wins the
    /// pair reservation creates the room; everyone else gets that room back.
    async fn form_room(&self, a: &str, b: &str) -> Result<Match, MatchErr> {
        let room_id = uuid::Uuid::new_v4().simple().to_string();
        let pair = keys::match_pair(a, b);

        if !self.store.set_nx(&pair, room_id.clone(), Some(CLAIM_TTL)).await? {
            if let Some(m) = self.existing_room(&pair, a, b).await? {
                return Ok(m);
            }
            // stale reservation released; one more try for a fresh room
            if !self.store.set_nx(&pair, room_id.clone(), Some(CLAIM_TTL)).await? {
                return Err(MatchErr::NoMatchFound);
            }
        }

        let claim_a = keys::match_claim(a);
        let claim_b = keys::match_claim(b);
        if !self.store.set_nx(&claim_a, room_id.clone(), Some(CLAIM_TTL)).await? {
            self.release(&[&pair]).await;
            debug!(user = a, "already claimed by another pair");
            return Err(MatchErr::NoMatchFound);
        }
        if !self.store.set_nx(&claim_b, room_id.clone(), Some(CLAIM_TTL)).await? {
            self.release(&[&claim_a, &pair]).await;
            debug!(user = b, "already claimed by another pair");
            return Err(MatchErr::NoMatchFound);
        }

        if let Err(e) = self.rooms.create(&room_id, a, b).await {
            self.release(&[&claim_a, &claim_b, &pair]).await;
            return Err(match e {
                RoomErr::Store(s) => MatchErr::Store(s),
                other => {
                    warn!(error = %other, "room creation failed");
                    MatchErr::NoMatchFound
                }
            });
        }

        self.leave_queue(a).await?;
        self.leave_queue(b).await?;
        info!(room = %room_id, a, b, "match formed");
        Ok(Match { room_id, users: [a.to_string(), b.to_string()] })
    }

    /// Pair already reserved. `Some` with its room while that match is current,
    /// `None` once the reservation is stale and has been dropped.
    ///
    /// A reservation is current while the room is not ended and both users'
    /// claims still name it. Re-joining the queue clears a user's claim, so a
    /// pair that queues again never inherits the old room or its acceptances.
    async fn existing_room(&self, pair: &str, a: &str, b: &str) -> Result<Option<Match>, MatchErr> {
        let Some(room_id) = self.store.get(pair).await? else {
            return Ok(None);
        };
        let rec = match self.rooms.get(&room_id).await {
            Ok(rec) => rec,
            // reserved but not written yet: the winner is still forming it
            Err(RoomErr::NotFound) => return Err(MatchErr::NoMatchFound),
            Err(RoomErr::Store(e)) => return Err(MatchErr::Store(e)),
            Err(_) => return Err(MatchErr::NoMatchFound),
        };

        let mut current = rec.status != RoomStatus::Ended;
        for user in [a, b] {
            current &= self.store.get(&keys::match_claim(user)).await?.as_deref() == Some(room_id.as_str());
        }
        if !current {
            debug!(room = %room_id, a, b, "stale pair reservation dropped");
            self.release(&[pair]).await;
            return Ok(None);
        }

        self.leave_queue(a).await?;
        self.leave_queue(b).await?;
        let users = match rec.participants.as_slice() {
            [x, y] => [x.clone(), y.clone()],
            _ => [a.to_string(), b.to_string()],
        };
        debug!(room = %room_id, "pair already matched");
        Ok(Some(Match { room_id, users }))
    }

    async fn release(&self, keys: &[&str]) {
        for k in keys {
            if let Err(e) = self.store.del(k).await {
                warn!(key = %k, error = %e, "failed to release claim");
            }
        }
    }
}
