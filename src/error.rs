use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

pub type AppResult<T> = Result<T, AppErr>;

/* ── coordination store ── */
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("key {0} holds a value of another type")]
    WrongType(String),

    #[error("store backend: {0}")]
    Backend(String),
}

/* ── matchmaking queue ── */
#[derive(thiserror::Error, Debug)]
pub enum MatchErr {
    #[error("user already in matchmaking queue")]
    AlreadyQueued,

    #[error("user not in matchmaking queue")]
    NotQueued,

    #[error("no suitable match found")]
    NoMatchFound,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/* ── rooms ── */
#[derive(thiserror::Error, Debug)]
pub enum RoomErr {
    #[error("room not found")]
    NotFound,

    #[error("room is full")]
    Full,

    #[error("user is not a participant")]
    NotParticipant,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(thiserror::Error, Debug)]
pub enum AppErr {
    #[error("Bad request: {0}")]
    Bad(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Match(#[from] MatchErr),

    #[error(transparent)]
    Room(#[from] RoomErr),

    #[error("Rate limit exceeded. Please try again later.")]
    RateLimited,
}

impl AppErr {
    fn status(&self) -> StatusCode {
        match self {
            AppErr::Bad(_) => StatusCode::BAD_REQUEST,
            AppErr::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppErr::Match(MatchErr::AlreadyQueued) => StatusCode::CONFLICT,
            AppErr::Match(MatchErr::NotQueued | MatchErr::NoMatchFound) => StatusCode::NOT_FOUND,
            AppErr::Room(RoomErr::NotFound) => StatusCode::NOT_FOUND,
            AppErr::Room(RoomErr::Full) => StatusCode::CONFLICT,
            AppErr::Room(RoomErr::NotParticipant) => StatusCode::FORBIDDEN,
            AppErr::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppErr::Match(MatchErr::Store(_)) | AppErr::Room(RoomErr::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppErr {
    fn into_response(self) -> axum::response::Response {
        let code = self.status();
        if code.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (code, Json(json!({ "success": false, "error": self.to_string() }))).into_response()
    }
}

/* ── helpers: anything displayable into Bad / Unauthorized ── */
pub fn bad<E: std::fmt::Display>(e: E) -> AppErr { AppErr::Bad(e.to_string()) }

pub fn unauthorized<E: std::fmt::Display>(e: E) -> AppErr { AppErr::Unauthorized(e.to_string()) }
