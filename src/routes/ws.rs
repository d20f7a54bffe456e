use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use tokio::{
    sync::mpsc,
    time::{self, Instant},
};
use tracing::{debug, info, warn};

use crate::{config::Config, hub::Connection, state::AppState, utils::jwt::AuthUser};

const MAX_MESSAGE: usize = 512 * 1024;

pub fn router() -> Router {
    Router::new().route("/ws", get(ws_handler))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    AuthUser(user): AuthUser,
    Extension(st): Extension<AppState>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE)
        .max_frame_size(MAX_MESSAGE)
        .on_upgrade(move |s| user_ws(s, user, st))
}

/* ---------------- per connection ---------------- */
async fn user_ws(sock: WebSocket, user: String, st: AppState) {
    let (conn, rx) = Connection::new(user, st.config.send_buffer);
    st.hub.register(conn.clone()).await;

    let (sink, stream) = sock.split();
    let writer = tokio::spawn(write_pump(sink, rx, conn.clone(), st.config.clone()));
    read_pump(stream, &conn, &st).await;

    st.hub.unregister(conn.clone()).await;
    conn.close_transport();
    if let Err(e) = writer.await {
        warn!(conn = %conn.id(), error = %e, "write pump panicked");
    }
    debug!(user = %conn.user_id(), conn = %conn.id(), dropped = conn.dropped(), "connection finished");
}

/// Inbound frames until close, error, read deadline or transport shutdown.
/// Every pong pushes the deadline out by one pong wait.
async fn read_pump(mut stream: SplitStream<WebSocket>, conn: &Connection, st: &AppState) {
    let pong_wait = st.config.pong_wait;
    let deadline = time::sleep(pong_wait);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                info!(user = %conn.user_id(), conn = %conn.id(), "read deadline passed");
                break;
            }
            _ = conn.wait_closed() => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(raw))) => st.relay.handle(conn, &raw).await,
                Some(Ok(Message::Pong(_))) => deadline.as_mut().reset(Instant::now() + pong_wait),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(user = %conn.user_id(), error = %e, "read failed");
                    break;
                }
            },
        }
    }
}

/// Drains the outbound queue in order and keeps the peer alive with pings.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<String>,
    conn: Arc<Connection>,
    cfg: Arc<Config>,
) {
    let period = cfg.ping_period();
    let mut ping = time::interval_at(Instant::now() + period, period);

    loop {
        let frame = tokio::select! {
            msg = rx.recv() => match msg {
                Some(text) => Message::Text(text),
                None => {
                    // queue closed by unregister
                    let _ = time::timeout(cfg.write_wait, sink.send(Message::Close(None))).await;
                    break;
                }
            },
            _ = ping.tick() => Message::Ping(Vec::new()),
            _ = conn.wait_closed() => break,
        };

        match time::timeout(cfg.write_wait, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(conn = %conn.id(), error = %e, "write failed");
                break;
            }
            Err(_) => {
                warn!(user = %conn.user_id(), conn = %conn.id(), "write timed out");
                break;
            }
        }
    }
    conn.close_transport();
}
