//! Two-phase call readiness.
//!
//! Both matched users must send `accept_match` before anyone dials. The
//! acceptance set lives in the store so the two accepts may land on different
//! instances; it expires on its own when a handshake is abandoned.

use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    error::RoomErr,
    events::{Ready, Role, RoomRef, ServerEvent},
    hub::{Connection, Hub, Participants},
    services::rooms::RoomService,
    store::{keys, CoordinationStore},
};

pub const ACCEPT_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acceptance {
    /// Only this user has accepted so far.
    Waiting,
    /// Both accepted; roles handed out and the set cleared.
    Ready { caller: String, callee: String },
}

/// The lexicographically smaller user id calls.
pub fn assign_roles(accepted: &[String]) -> Option<(String, String)> {
    let mut sorted = accepted.to_vec();
    sorted.sort();
    sorted.dedup();
    match sorted.as_slice() {
        [caller, callee] => Some((caller.clone(), callee.clone())),
        _ => None,
    }
}

pub struct ReadinessCoordinator {
    store: Arc<dyn CoordinationStore>,
    hub:   Hub,
    rooms: Arc<RoomService>,
}

impl ReadinessCoordinator {
    pub fn new(store: Arc<dyn CoordinationStore>, hub: Hub, rooms: Arc<RoomService>) -> Self {
        Self { store, hub, rooms }
    }

    pub async fn accept(&self, conn: &Connection, room: &str) -> Result<Acceptance, RoomErr> {
        let user = conn.user_id();
        let participants = self.hub.cache().participants_of(room).await?;
        if participants.is_empty() {
            conn.send_event(&ServerEvent::error("room not found", "room_not_found"));
            return Err(RoomErr::NotFound);
        }
        if !participants.contains(user) {
            conn.send_event(&ServerEvent::error("not a participant of this room", "not_participant"));
            return Err(RoomErr::NotParticipant);
        }

        let key = keys::room_accepted(room);
        let accepted = self.store.sadd(&key, user).await?;
        self.store.expire(&key, ACCEPT_TTL).await?;
        info!(user, room, accepted = accepted.len(), "match accepted");

        let Some((caller, callee)) = assign_roles(&accepted) else {
            self.announce_waiting(conn, room, &participants).await?;
            return Ok(Acceptance::Waiting);
        };

        // cleared first so a racing one-member accept sees it gone
        self.store.del(&key).await?;
        for (who, role) in [(&caller, Role::Caller), (&callee, Role::Callee)] {
            info!(user = %who, room, ?role, "role assigned");
            self.hub.send(who, &ServerEvent::BothReady(Ready { room_id: room.to_string(), role }));
        }

        if let Err(e) = self.rooms.start(room).await {
            warn!(room, error = %e, "could not mark room active");
        }
        Ok(Acceptance::Ready { caller, callee })
    }

    /// Sends the one-member notices unless the set no longer holds this user,
    /// which means the partner's accept already completed the handshake.
    async fn announce_waiting(&self, conn: &Connection, room: &str, participants: &Participants) -> Result<bool, RoomErr> {
        let user = conn.user_id();
        let members = self.store.smembers(&keys::room_accepted(room)).await?;
        if !members.iter().any(|m| m == user) {
            debug!(user, room, "handshake already completed, no waiting notice");
            return Ok(false);
        }
        let room_ref = RoomRef { room_id: room.to_string() };
        conn.send_event(&ServerEvent::WaitingForPartner(room_ref.clone()));
        for other in participants.others(user) {
            self.hub.send(other, &ServerEvent::PartnerAccepted(room_ref.clone()));
        }
        Ok(true)
    }
}
