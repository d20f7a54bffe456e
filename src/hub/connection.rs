use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, OnceLock, PoisonError,
};

use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::events::ServerEvent;

#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueErr {
    Full,
    Closed,
}

/// One live socket of one user in this process.
///
/// Identity is the allocation: two `Arc<Connection>` are the same connection
/// only if [`Arc::ptr_eq`] says so, whatever their user ids.
pub struct Connection {
    id:       String,
    user_id:  String,
    room_id:  OnceLock<String>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    closed:   watch::Sender<bool>,
    dropped:  AtomicU64,
}

impl Connection {
    /// New connection plus the receiving half of its outbound queue.
    pub fn new(user_id: impl Into<String>, buffer: usize) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (closed, _) = watch::channel(false);
        let conn = Self {
            id: nanoid::nanoid!(10),
            user_id: user_id.into(),
            room_id: OnceLock::new(),
            outbound: Mutex::new(Some(tx)),
            closed,
            dropped: AtomicU64::new(0),
        };
        (Arc::new(conn), rx)
    }

    pub fn id(&self) -> &str { &self.id }

    pub fn user_id(&self) -> &str { &self.user_id }

    pub fn room_id(&self) -> Option<&str> { self.room_id.get().map(String::as_str) }

    /// Records the room on first use; later calls are ignored.
    pub fn latch_room(&self, room: &str) -> bool {
        self.room_id.set(room.to_string()).is_ok()
    }

    /// Non-blocking push onto the outbound queue.
    pub fn enqueue(&self, payload: String) -> Result<(), EnqueueErr> {
        let guard = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            return Err(EnqueueErr::Closed);
        };
        tx.try_send(payload).map_err(|e| {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            match e {
                mpsc::error::TrySendError::Full(_) => EnqueueErr::Full,
                mpsc::error::TrySendError::Closed(_) => EnqueueErr::Closed,
            }
        })
    }

    /// Direct reply to this connection, bypassing the hub's dispatch queue.
    pub fn send_event(&self, ev: &ServerEvent) {
        let payload = match ev.to_json() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "unserialisable event");
                return;
            }
        };
        if let Err(e) = self.enqueue(payload) {
            warn!(user = %self.user_id, conn = %self.id, reason = ?e, "send buffer unavailable, dropping message");
        }
    }

    /// Drops the only sender so the write pump sees the queue end.
    /// Returns `true` for the call that actually closed it.
    pub fn close_outbound(&self) -> bool {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner).take().is_some()
    }

    /// Asks both pumps to stop; the socket goes with them.
    pub fn close_transport(&self) {
        self.closed.send_replace(true);
    }

    /// Resolves once [`close_transport`](Self::close_transport) has been called,
    /// immediately if it already was.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }

    pub fn dropped(&self) -> u64 { self.dropped.load(Ordering::Relaxed) }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("room_id", &self.room_id.get())
            .finish()
    }
}
