use axum::{routing::get, Extension, Json, Router};
use serde_json::{json, Value};

use crate::{error::AppResult, state::AppState};

pub fn router() -> Router {
    Router::new().route("/health", get(health_check))
}

async fn health_check(Extension(st): Extension<AppState>) -> AppResult<Json<Value>> {
    Ok(Json(json!({
        "status":          "ok",
        "online":          st.hub.online_count().await,
        "queueSize":       st.matchmaking.queue_size().await?,
        "droppedMessages": st.hub.dropped_messages(),
    })))
}
