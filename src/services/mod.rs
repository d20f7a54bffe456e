pub mod matchmaking;
pub mod readiness;
pub mod rooms;
pub mod signaling;
