//! routes/matchmaking.rs
use axum::{
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{
    error::{bad, AppResult, MatchErr},
    events::{notice, RoomRef, ServerEvent},
    services::matchmaking::{Match, DEFAULT_SKILL},
    state::AppState,
    utils::jwt::AuthUser,
};

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct JoinInput {
    skill_level: Option<i32>,
}

pub fn router() -> Router {
    Router::new()
        .route("/matchmaking/join", post(join))
        .route("/matchmaking/leave", post(leave))
        .route("/matchmaking/status", get(status))
}

fn notify_match(st: &AppState, m: &Match) {
    for user in &m.users {
        st.hub.send(user, &ServerEvent::MatchFound(RoomRef { room_id: m.room_id.clone() }));
    }
}

/* ---------------- Join ---------------- */
#[tracing::instrument(skip(st, body))]
async fn join(
    AuthUser(user): AuthUser,
    Extension(st): Extension<AppState>,
    body: Option<Json<JoinInput>>,
) -> AppResult<Json<Value>> {
    let skill = body.and_then(|Json(b)| b.skill_level).unwrap_or(DEFAULT_SKILL);
    if skill < 0 {
        return Err(bad("skillLevel must not be negative"));
    }
    st.matchmaking.join_queue(&user, skill).await?;
    st.hub.send(&user, &ServerEvent::QueueJoined(notice("Joined matchmaking queue")));

    // pairing happens off the request path
    let bg = st.clone();
    tokio::spawn(async move {
        match bg.matchmaking.find_match(&user).await {
            Ok(m) => notify_match(&bg, &m),
            Err(MatchErr::NoMatchFound) => debug!(user = %user, "no partner yet"),
            Err(e) => warn!(user = %user, error = %e, "background match failed"),
        }
    });

    Ok(Json(json!({ "success": true, "message": "Joined matchmaking queue", "skillLevel": skill })))
}

/* ---------------- Leave ---------------- */
#[tracing::instrument(skip(st))]
async fn leave(AuthUser(user): AuthUser, Extension(st): Extension<AppState>) -> AppResult<Json<Value>> {
    st.matchmaking.leave_queue(&user).await?;
    st.hub.send(&user, &ServerEvent::QueueLeft(notice("Left matchmaking queue")));
    Ok(Json(json!({ "success": true, "message": "Left matchmaking queue" })))
}

/* ---------------- Status ---------------- */
#[tracing::instrument(skip(st))]
async fn status(AuthUser(user): AuthUser, Extension(st): Extension<AppState>) -> AppResult<Json<Value>> {
    if !st.matchmaking.is_queued(&user).await? {
        return matched_or_not_queued(&st, &user).await;
    }

    match st.matchmaking.find_match(&user).await {
        Ok(m) => match m.partner_of(&user) {
            Some(partner) => {
                st.hub.send(partner, &ServerEvent::MatchFound(RoomRef { room_id: m.room_id.clone() }));
                info!(user = %user, room = %m.room_id, "matched on status poll");
                return Ok(Json(json!({ "matchFound": true, "roomId": m.room_id })));
            }
            // the poll paired two users ahead of the caller
            None => notify_match(&st, &m),
        },
        Err(MatchErr::NoMatchFound) => {}
        Err(e) => return Err(e.into()),
    }

    match st.matchmaking.queue_status(&user).await {
        Ok(q) => Ok(Json(json!({
            "position":      q.position,
            "estimatedWait": q.estimated_wait.as_secs(),
            "totalInQueue":  q.queue_size,
            "matchFound":    false,
        }))),
        // matched by someone else between the two reads
        Err(MatchErr::NotQueued) => matched_or_not_queued(&st, &user).await,
        Err(e) => Err(e.into()),
    }
}

async fn matched_or_not_queued(st: &AppState, user: &str) -> AppResult<Json<Value>> {
    match st.matchmaking.pending_match(user).await? {
        Some(room) => Ok(Json(json!({ "matchFound": true, "roomId": room }))),
        None => Err(MatchErr::NotQueued.into()),
    }
}
