//! Wire events carried over the persistent connection.
//!
//! Inbound frames are parsed into an [`Envelope`] whose `type` is the closed
//! [`EventKind`] set. Everything the server pushes is a [`ServerEvent`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/* ---------------- inbound ---------------- */

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum EventKind {
    Ping,
    Pong,
    JoinQueue,
    LeaveQueue,
    AcceptMatch,
    WebrtcOffer,
    WebrtcAnswer,
    IceCandidate,
    CallEnded,
    MediaStateChanged,
    Message,
    Unknown(String),
}

impl From<String> for EventKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ping"                => Self::Ping,
            "pong"                => Self::Pong,
            "join_queue"          => Self::JoinQueue,
            "leave_queue"         => Self::LeaveQueue,
            "accept_match"        => Self::AcceptMatch,
            "webrtc_offer"        => Self::WebrtcOffer,
            "webrtc_answer"       => Self::WebrtcAnswer,
            "ice_candidate"       => Self::IceCandidate,
            "call_ended"          => Self::CallEnded,
            "media_state_changed" => Self::MediaStateChanged,
            "message"             => Self::Message,
            _                     => Self::Unknown(s),
        }
    }
}

/// Envelope of every client frame. Only `type` is mandatory.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind:      EventKind,
    #[serde(default)]
    pub to:        Option<String>,
    #[serde(default)]
    pub room_id:   Option<String>,
    #[serde(default)]
    pub data:      Option<Map<String, Value>>,
    #[serde(default)]
    pub sdp:       Option<Value>,
    #[serde(default)]
    pub candidate: Option<Value>,
}

fn non_empty(s: &Option<String>) -> Option<&str> {
    s.as_deref().filter(|s| !s.is_empty())
}

impl Envelope {
    pub fn parse(raw: &str) -> serde_json::Result<Self> { serde_json::from_str(raw) }

    /// Room addressed by a negotiation frame: `to`, then `roomId`.
    pub fn destination_room(&self) -> Option<&str> {
        non_empty(&self.to).or_else(|| non_empty(&self.room_id))
    }

    /// Room named by a room-scoped frame: `roomId`, then `to`.
    pub fn room(&self) -> Option<&str> {
        non_empty(&self.room_id).or_else(|| non_empty(&self.to))
    }

    fn flag(&self, key: &str) -> Option<Value> {
        self.data.as_ref().and_then(|d| d.get(key)).cloned()
    }
}

/* ---------------- outbound ---------------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Caller,
    Callee,
}

/// How a negotiation copy reached the receiver. `fanout` copies go to every
/// connection of the instance, so receivers must drop those whose `roomId`
/// is not their own and may see a `room` copy of the same frame as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryScope {
    Room,
    Fanout,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRef {
    pub from:    String,
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ready {
    pub room_id: String,
    pub role:    Role,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub from:      String,
    pub room_id:   Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp:       Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Value>,
    pub scope:     DeliveryScope,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaState {
    pub from:         String,
    pub room_id:      String,
    pub is_muted:     Option<Value>,
    pub is_video_off: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub from:    String,
    pub room_id: String,
    pub data:    Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Failure {
    pub message: String,
    pub code:    &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected(Notice),
    Pong,
    QueueAck(Notice),
    QueueLeftAck(Notice),
    QueueJoined(Notice),
    QueueLeft(Notice),
    MatchFound(RoomRef),
    WaitingForPartner(RoomRef),
    PartnerAccepted(RoomRef),
    BothReady(Ready),
    WebrtcOffer(Signal),
    WebrtcAnswer(Signal),
    IceCandidate(Signal),
    CallEnded(PeerRef),
    PartnerDisconnected(PeerRef),
    MediaStateChanged(MediaState),
    Message(Chat),
    Error(Failure),
}

pub fn notice(message: &str) -> Notice { Notice { message: message.to_string() } }

impl ServerEvent {
    pub fn to_json(&self) -> serde_json::Result<String> { serde_json::to_string(self) }

    /// Outbound copy of a negotiation frame, `None` for any other kind.
    pub fn negotiation(env: &Envelope, from: &str, room: Option<&str>, scope: DeliveryScope) -> Option<Self> {
        let signal = Signal {
            from:      from.to_string(),
            room_id:   room.map(str::to_string),
            sdp:       env.sdp.clone(),
            candidate: env.candidate.clone(),
            scope,
        };
        match env.kind {
            EventKind::WebrtcOffer  => Some(Self::WebrtcOffer(signal)),
            EventKind::WebrtcAnswer => Some(Self::WebrtcAnswer(signal)),
            EventKind::IceCandidate => Some(Self::IceCandidate(signal)),
            _ => None,
        }
    }

    pub fn media_state(env: &Envelope, from: &str, room: &str) -> Self {
        Self::MediaStateChanged(MediaState {
            from:         from.to_string(),
            room_id:      room.to_string(),
            is_muted:     env.flag("isMuted"),
            is_video_off: env.flag("isVideoOff"),
        })
    }

    pub fn error(message: impl Into<String>, code: &'static str) -> Self {
        Self::Error(Failure { message: message.into(), code })
    }
}
