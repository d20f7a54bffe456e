use axum::{
    extract::Path,
    routing::{get, post},
    Extension, Json, Router,
};
use std::collections::HashMap;

use serde_json::{json, Value};

use crate::{
    error::{AppResult, RoomErr},
    services::rooms::RoomRecord,
    state::AppState,
    utils::jwt::AuthUser,
};

pub fn router() -> Router {
    Router::new()
        .route("/rooms/:room_id", get(get_room))
        .route("/rooms/:room_id/state", get(room_state))
        .route("/rooms/:room_id/join", post(join_room))
        .route("/rooms/:room_id/leave", post(leave_room))
}

/// Participants only.
async fn get_room(
    AuthUser(user): AuthUser,
    Extension(st): Extension<AppState>,
    Path(room_id): Path<String>,
) -> AppResult<Json<RoomRecord>> {
    if !st.rooms.is_participant(&room_id, &user).await? {
        return Err(RoomErr::NotParticipant.into());
    }
    Ok(Json(st.rooms.get(&room_id).await?))
}

/// Stored hash as-is, participants only.
async fn room_state(
    AuthUser(user): AuthUser,
    Extension(st): Extension<AppState>,
    Path(room_id): Path<String>,
) -> AppResult<Json<HashMap<String, String>>> {
    if !st.rooms.is_participant(&room_id, &user).await? {
        return Err(RoomErr::NotParticipant.into());
    }
    Ok(Json(st.rooms.state(&room_id).await?))
}

async fn join_room(
    AuthUser(user): AuthUser,
    Extension(st): Extension<AppState>,
    Path(room_id): Path<String>,
) -> AppResult<Json<RoomRecord>> {
    Ok(Json(st.rooms.join(&room_id, &user).await?))
}

async fn leave_room(
    AuthUser(user): AuthUser,
    Extension(st): Extension<AppState>,
    Path(room_id): Path<String>,
) -> AppResult<Json<Value>> {
    st.rooms.leave(&room_id, &user).await?;
    Ok(Json(json!({ "success": true })))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};

    use crate::routes::{app, tests::{call, test_state}};

    #[tokio::test]
    async fn room_access_and_membership_errors() {
        let (_, state) = test_state();
        state.rooms.create("r1", "alice", "bob").await.unwrap();
        let app = app(state);

        let (status, body) = call(&app, Method::GET, "/api/rooms/r1", Some("alice")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["roomId"], "r1");
        assert_eq!(body["status"], "waiting");
        assert_eq!(body["participants"], serde_json::json!(["alice", "bob"]));

        let (status, body) = call(&app, Method::GET, "/api/rooms/r1/state", Some("bob")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "waiting");
        assert_eq!(body["slot1"], "alice");
        assert_eq!(body["slot2"], "bob");

        let (status, _) = call(&app, Method::GET, "/api/rooms/r1", Some("carol")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(&app, Method::GET, "/api/rooms/r1/state", Some("carol")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(&app, Method::GET, "/api/rooms/nope/state", Some("alice")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, Method::GET, "/api/rooms/nope", Some("alice")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, Method::POST, "/api/rooms/r1/join", Some("carol")).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(&app, Method::POST, "/api/rooms/r1/leave", Some("alice")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&app, Method::POST, "/api/rooms/r1/join", Some("carol")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "active");

        let (status, _) = call(&app, Method::POST, "/api/rooms/r1/leave", Some("alice")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
