//! Inbound frame handling for one connection.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    events::{notice, Chat, DeliveryScope, Envelope, EventKind, PeerRef, ServerEvent},
    hub::{Connection, Hub},
    services::readiness::ReadinessCoordinator,
};

pub struct SignalingRelay {
    hub:       Hub,
    readiness: Arc<ReadinessCoordinator>,
}

impl SignalingRelay {
    pub fn new(hub: Hub, readiness: Arc<ReadinessCoordinator>) -> Self {
        Self { hub, readiness }
    }

    /// Handles one text frame. Nothing here is fatal to the connection.
    pub async fn handle(&self, conn: &Connection, raw: &str) {
        let env = match Envelope::parse(raw) {
            Ok(env) => env,
            Err(e) => {
                warn!(user = %conn.user_id(), error = %e, "malformed frame dropped");
                return;
            }
        };
        let user = conn.user_id();

        match &env.kind {
            EventKind::Ping => conn.send_event(&ServerEvent::Pong),
            EventKind::Pong => debug!(user, "application pong"),
            EventKind::JoinQueue => conn.send_event(&ServerEvent::QueueAck(notice("Queue request received"))),
            EventKind::LeaveQueue => conn.send_event(&ServerEvent::QueueLeftAck(notice("Left queue"))),
            EventKind::AcceptMatch => match env.room() {
                Some(room) => {
                    if let Err(e) = self.readiness.accept(conn, room).await {
                        warn!(user, room, error = %e, "accept rejected");
                    }
                }
                None => conn.send_event(&ServerEvent::error("roomId required", "missing_room")),
            },
            EventKind::WebrtcOffer | EventKind::WebrtcAnswer | EventKind::IceCandidate => self.relay_negotiation(conn, &env),
            EventKind::CallEnded => {
                let Some(room) = self.room_of(conn, &env) else { return };
                let ev = ServerEvent::CallEnded(PeerRef { from: user.to_string(), room_id: room.to_string() });
                self.hub.broadcast_room(room, Some(user), &ev);
            }
            EventKind::MediaStateChanged => {
                let Some(room) = self.room_of(conn, &env) else { return };
                self.hub.broadcast_room(room, Some(user), &ServerEvent::media_state(&env, user, room));
            }
            EventKind::Message => {
                let Some(room) = self.room_of(conn, &env) else { return };
                let ev = ServerEvent::Message(Chat {
                    from:    user.to_string(),
                    room_id: room.to_string(),
                    data:    env.data.clone(),
                });
                self.hub.broadcast_room(room, None, &ev);
            }
            EventKind::Unknown(kind) => warn!(user, kind = %kind, "unknown message type"),
        }
    }

    /// Room copy for the addressed room, plus a fan-out copy to everyone else here.
    fn relay_negotiation(&self, conn: &Connection, env: &Envelope) {
        let user = conn.user_id();
        let room = env.destination_room();
        if let Some(room) = room {
            conn.latch_room(room);
            if let Some(ev) = ServerEvent::negotiation(env, user, Some(room), DeliveryScope::Room) {
                self.hub.broadcast_room(room, Some(user), &ev);
            }
        }
        if let Some(ev) = ServerEvent::negotiation(env, user, room, DeliveryScope::Fanout) {
            self.hub.broadcast_all(Some(user), &ev);
        }
        debug!(user, room = ?room, kind = ?env.kind, "negotiation relayed");
    }

    fn room_of<'a>(&self, conn: &Connection, env: &'a Envelope) -> Option<&'a str> {
        let room = env.room();
        match room {
            Some(r) => {
                conn.latch_room(r);
            }
            None => warn!(user = %conn.user_id(), kind = ?env.kind, "room-scoped frame without room dropped"),
        }
        room
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hub::tests::{assert_silent, connect, hub_with, next_json},
        services::rooms::RoomService,
        store::MemoryStore,
    };

    async fn setup() -> (Hub, SignalingRelay) {
        let store = Arc::new(MemoryStore::new());
        let hub = hub_with(store.clone());
        let rooms = Arc::new(RoomService::new(store.clone(), hub.cache().clone()));
        rooms.create("r", "alice", "bob").await.unwrap();
        let readiness = Arc::new(ReadinessCoordinator::new(store, hub.clone(), rooms));
        (hub.clone(), SignalingRelay::new(hub, readiness))
    }

    #[tokio::test]
    async fn offer_reaches_partner_twice_and_outsider_once() {
        let (hub, relay) = setup().await;
        let (alice, mut a_rx) = connect(&hub, "alice").await;
        let (_bob, mut b_rx) = connect(&hub, "bob").await;
        let (_carol, mut c_rx) = connect(&hub, "carol").await;

        relay.handle(&alice, r#"{"type":"webrtc_offer","to":"r","sdp":{"type":"offer","sdp":"v=0"}}"#).await;

        let mut scopes = vec![];
        for _ in 0..2 {
            let ev = next_json(&mut b_rx).await;
            assert_eq!(ev["type"], "webrtc_offer");
            assert_eq!(ev["from"], "alice");
            assert_eq!(ev["roomId"], "r");
            assert_eq!(ev["sdp"]["sdp"], "v=0");
            scopes.push(ev["scope"].as_str().unwrap().to_string());
        }
        scopes.sort();
        assert_eq!(scopes, ["fanout", "room"]);

        let ev = next_json(&mut c_rx).await;
        assert_eq!(ev["scope"], "fanout");
        assert_eq!(ev["roomId"], "r");
        assert_silent(&mut c_rx).await;
        assert_silent(&mut a_rx).await;
        assert_eq!(alice.room_id(), Some("r"));
    }

    #[tokio::test]
    async fn negotiation_without_room_is_fanout_only() {
        let (hub, relay) = setup().await;
        let (alice, _a_rx) = connect(&hub, "alice").await;
        let (_bob, mut b_rx) = connect(&hub, "bob").await;

        relay.handle(&alice, r#"{"type":"ice_candidate","candidate":{"candidate":"c1"}}"#).await;
        let ev = next_json(&mut b_rx).await;
        assert_eq!(ev["scope"], "fanout");
        assert_eq!(ev["roomId"], serde_json::Value::Null);
        assert_eq!(ev["candidate"]["candidate"], "c1");
        assert_silent(&mut b_rx).await;
        assert_eq!(alice.room_id(), None);
    }

    #[tokio::test]
    async fn chat_includes_sender_but_call_events_do_not() {
        let (hub, relay) = setup().await;
        let (alice, mut a_rx) = connect(&hub, "alice").await;
        let (_bob, mut b_rx) = connect(&hub, "bob").await;

        relay.handle(&alice, r#"{"type":"message","roomId":"r","data":{"text":"hi"}}"#).await;
        for rx in [&mut a_rx, &mut b_rx] {
            let ev = next_json(rx).await;
            assert_eq!(ev["type"], "message");
            assert_eq!(ev["data"]["text"], "hi");
        }

        relay.handle(&alice, r#"{"type":"media_state_changed","roomId":"r","data":{"isMuted":true,"isVideoOff":false}}"#).await;
        let ev = next_json(&mut b_rx).await;
        assert_eq!(ev["type"], "media_state_changed");
        assert_eq!(ev["isMuted"], true);
        assert_eq!(ev["isVideoOff"], false);

        relay.handle(&alice, r#"{"type":"call_ended","roomId":"r"}"#).await;
        let ev = next_json(&mut b_rx).await;
        assert_eq!(ev["type"], "call_ended");
        assert_eq!(ev["from"], "alice");
        assert_silent(&mut a_rx).await;
    }

    #[tokio::test]
    async fn control_frames_answer_the_sender_only() {
        let (hub, relay) = setup().await;
        let (alice, mut a_rx) = connect(&hub, "alice").await;
        let (_bob, mut b_rx) = connect(&hub, "bob").await;

        relay.handle(&alice, r#"{"type":"ping"}"#).await;
        assert_eq!(next_json(&mut a_rx).await["type"], "pong");
        relay.handle(&alice, r#"{"type":"join_queue"}"#).await;
        assert_eq!(next_json(&mut a_rx).await["type"], "queue_ack");
        relay.handle(&alice, r#"{"type":"leave_queue"}"#).await;
        assert_eq!(next_json(&mut a_rx).await["type"], "queue_left_ack");
        assert_silent(&mut b_rx).await;
    }

    #[tokio::test]
    async fn accept_match_goes_through_readiness() {
        let (hub, relay) = setup().await;
        let (alice, mut a_rx) = connect(&hub, "alice").await;
        let (bob, mut b_rx) = connect(&hub, "bob").await;

        relay.handle(&alice, r#"{"type":"accept_match","roomId":"r"}"#).await;
        assert_eq!(next_json(&mut a_rx).await["type"], "waiting_for_partner");
        assert_eq!(next_json(&mut b_rx).await["type"], "partner_accepted");

        relay.handle(&bob, r#"{"type":"accept_match","roomId":"r"}"#).await;
        assert_eq!(next_json(&mut a_rx).await["role"], "caller");
        assert_eq!(next_json(&mut b_rx).await["role"], "callee");

        relay.handle(&alice, r#"{"type":"accept_match"}"#).await;
        assert_eq!(next_json(&mut a_rx).await["code"], "missing_room");
    }

    #[tokio::test]
    async fn junk_is_dropped_quietly() {
        let (hub, relay) = setup().await;
        let (alice, mut a_rx) = connect(&hub, "alice").await;
        let (_bob, mut b_rx) = connect(&hub, "bob").await;

        relay.handle(&alice, "{not json").await;
        relay.handle(&alice, r#"{"roomId":"r"}"#).await;
        relay.handle(&alice, r#"{"type":"dance","roomId":"r"}"#).await;
        relay.handle(&alice, r#"{"type":"call_ended"}"#).await;
        assert_silent(&mut a_rx).await;
        assert_silent(&mut b_rx).await;
    }
}
