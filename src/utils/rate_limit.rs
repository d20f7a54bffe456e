use std::{net::SocketAddr, time::Duration};

use axum::{
    extract::{ConnectInfo, Request},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::{error::AppErr, state::AppState, store::keys};

/// Fixed counting window per client.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Forwarded address first (we sit behind a proxy in production), then the peer.
fn client_ip(req: &Request) -> String {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(String::from)
        .or_else(|| req.extensions().get::<ConnectInfo<SocketAddr>>().map(|c| c.0.ip().to_string()))
        .unwrap_or_else(|| "unknown".into())
}

fn set_headers(h: &mut HeaderMap, limit: i64, remaining: i64) {
    h.insert("x-ratelimit-limit", HeaderValue::from(limit));
    h.insert("x-ratelimit-remaining", HeaderValue::from(remaining.max(0)));
}

/// Per-IP request counter in the coordination store. Needs `Extension<AppState>`
/// outside it; lets traffic through when the store is unreachable.
pub async fn limit(req: Request, next: Next) -> Response {
    let Some(st) = req.extensions().get::<AppState>().cloned() else {
        return next.run(req).await;
    };
    let ip = client_ip(&req);
    let limit = st.config.rate_limit;

    let count = match st.store.incr(&keys::rate_limit(&ip), WINDOW).await {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %e, "rate limiter unavailable");
            return next.run(req).await;
        }
    };

    let mut res = if count > limit {
        warn!(ip = %ip, count, "rate limit exceeded");
        AppErr::RateLimited.into_response()
    } else {
        next.run(req).await
    };
    set_headers(res.headers_mut(), limit, limit - count);
    res
}
