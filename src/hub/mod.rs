//! Connection registry and outbound fan-out for this process.
//!
//! `register`/`unregister` go through a control queue owned by one task.
//! `send`/`broadcast_*` serialise once and hand the payload to a fixed pool of
//! dispatch workers. Each worker drains its own lane and a target always maps
//! to the same lane, so items for one target are delivered in order.

use std::{
    collections::hash_map::DefaultHasher,
    collections::HashMap,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    events::{notice, PeerRef, ServerEvent},
    store::{keys, CoordinationStore},
};

pub mod cache;
pub mod connection;

pub use cache::{Participants, RoomCache};
pub use connection::Connection;

const CONTROL_BUFFER: usize = 100;
const ONLINE_TTL: Duration = Duration::from_secs(30 * 60);

enum Control {
    Register(Arc<Connection>),
    Unregister(Arc<Connection>),
}

#[derive(Debug)]
enum Target {
    User(String),
    Room { room: String, exclude: Option<String> },
    All { exclude: Option<String> },
}

impl Target {
    fn lane(&self, lanes: usize) -> usize {
        let mut h = DefaultHasher::new();
        match self {
            Target::User(u) => ("user", u).hash(&mut h),
            Target::Room { room, .. } => ("room", room).hash(&mut h),
            Target::All { exclude } => ("all", exclude).hash(&mut h),
        }
        (h.finish() % lanes as u64) as usize
    }
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|s| *s).await;
}

struct Dispatch {
    target:  Target,
    payload: String,
}

struct Inner {
    clients:  RwLock<HashMap<String, Arc<Connection>>>,
    cache:    Arc<RoomCache>,
    store:    Arc<dyn CoordinationStore>,
    control:  mpsc::Sender<Control>,
    lanes:    Vec<mpsc::Sender<Dispatch>>,
    dropped:  AtomicU64,
    grace:    Duration,
    shutdown: watch::Sender<bool>,
}

/// Cheap to clone; every clone talks to the same registry.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<Inner>,
}

impl Hub {
    /// Builds the hub and spawns its control loop and dispatch workers.
    pub fn start(store: Arc<dyn CoordinationStore>, cache: Arc<RoomCache>, cfg: &Config) -> Self {
        let workers = cfg.dispatch_workers.max(1);
        let per_lane = (cfg.dispatch_buffer / workers).max(1);

        let (control, control_rx) = mpsc::channel(CONTROL_BUFFER);
        let (shutdown, _) = watch::channel(false);
        let mut lane_rx = Vec::with_capacity(workers);
        let mut lanes = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = mpsc::channel(per_lane);
            lanes.push(tx);
            lane_rx.push(rx);
        }

        let hub = Hub {
            inner: Arc::new(Inner {
                clients: RwLock::new(HashMap::new()),
                cache,
                store,
                control,
                lanes,
                dropped: AtomicU64::new(0),
                grace: cfg.reconnect_grace,
                shutdown,
            }),
        };

        tokio::spawn(hub.clone().control_loop(control_rx));
        for (id, rx) in lane_rx.into_iter().enumerate() {
            tokio::spawn(hub.clone().dispatch_worker(id, rx));
        }
        hub
    }

    pub fn cache(&self) -> &Arc<RoomCache> { &self.inner.cache }

    /* ---------------- control ---------------- */

    pub async fn register(&self, conn: Arc<Connection>) {
        if self.inner.control.send(Control::Register(conn)).await.is_err() {
            warn!("hub stopped, register ignored");
        }
    }

    pub async fn unregister(&self, conn: Arc<Connection>) {
        if self.inner.control.send(Control::Unregister(conn)).await.is_err() {
            warn!("hub stopped, unregister ignored");
        }
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    async fn control_loop(self, mut rx: mpsc::Receiver<Control>) {
        let mut stop = self.inner.shutdown.subscribe();
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(Control::Register(c))   => self.apply_register(c).await,
                    Some(Control::Unregister(c)) => { self.apply_unregister(c).await; }
                    None => break,
                },
                _ = stopped(&mut stop) => break,
            }
        }
        debug!("hub control loop stopped");
    }

    async fn apply_register(&self, conn: Arc<Connection>) {
        let user = conn.user_id().to_string();
        let total = {
            let mut m = self.inner.clients.write().await;
            if let Some(old) = m.insert(user.clone(), conn.clone()) {
                if !Arc::ptr_eq(&old, &conn) {
                    // Outbound queue stays open; only the socket goes, after a beat.
                    info!(user = %user, old = %old.id(), new = %conn.id(), "replacing existing connection");
                    let grace = self.inner.grace;
                    tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        old.close_transport();
                    });
                }
            }
            m.len()
        };
        info!(user = %user, conn = %conn.id(), total, "client registered");

        let store = self.inner.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.set(&keys::online(&user), "true".into(), Some(ONLINE_TTL)).await {
                warn!(user = %user, error = %e, "failed to mark user online");
            }
        });

        conn.send_event(&ServerEvent::Connected(notice("Connected to interview matchmaking")));
    }

    /// Returns whether `conn` was still the registered connection.
    async fn apply_unregister(&self, conn: Arc<Connection>) -> bool {
        let user = conn.user_id().to_string();
        let total = {
            let mut m = self.inner.clients.write().await;
            if !m.get(&user).is_some_and(|current| Arc::ptr_eq(current, &conn)) {
                debug!(user = %user, conn = %conn.id(), "stale unregister ignored");
                return false;
            }
            m.remove(&user);
            conn.close_outbound();
            m.len()
        };
        info!(user = %user, conn = %conn.id(), total, "client unregistered");

        if let Some(room) = conn.room_id() {
            info!(user = %user, room, "notifying partner of disconnect");
            self.broadcast_room(
                room,
                Some(&user),
                &ServerEvent::PartnerDisconnected(PeerRef { from: user.clone(), room_id: room.to_string() }),
            );
        }

        let store = self.inner.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.del(&keys::online(&user)).await {
                warn!(user = %user, error = %e, "failed to clear online flag");
            }
        });
        true
    }

    /* ---------------- fan-out ---------------- */

    pub fn send(&self, user: &str, ev: &ServerEvent) {
        self.dispatch(Target::User(user.to_string()), ev);
    }

    pub fn broadcast_room(&self, room: &str, exclude: Option<&str>, ev: &ServerEvent) {
        self.dispatch(Target::Room { room: room.to_string(), exclude: exclude.map(str::to_string) }, ev);
    }

    pub fn broadcast_all(&self, exclude: Option<&str>, ev: &ServerEvent) {
        self.dispatch(Target::All { exclude: exclude.map(str::to_string) }, ev);
    }

    fn dispatch(&self, target: Target, ev: &ServerEvent) {
        let payload = match ev.to_json() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "unserialisable event");
                return;
            }
        };
        let lane = &self.inner.lanes[target.lane(self.inner.lanes.len())];
        if let Err(e) = lane.try_send(Dispatch { target, payload }) {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            let target = match e {
                mpsc::error::TrySendError::Full(d) | mpsc::error::TrySendError::Closed(d) => d.target,
            };
            warn!(?target, "dispatch queue full, dropping message");
        }
    }

    async fn dispatch_worker(self, id: usize, mut rx: mpsc::Receiver<Dispatch>) {
        let mut stop = self.inner.shutdown.subscribe();
        loop {
            tokio::select! {
                d = rx.recv() => match d {
                    Some(d) => self.deliver(d).await,
                    None => break,
                },
                _ = stopped(&mut stop) => break,
            }
        }
        debug!(worker = id, "dispatch worker stopped");
    }

    async fn deliver(&self, d: Dispatch) {
        match d.target {
            Target::User(user) => {
                let conn = self.inner.clients.read().await.get(&user).cloned();
                match conn {
                    Some(c) => self.push(&c, d.payload),
                    None => debug!(user = %user, "user not connected here"),
                }
            }
            Target::Room { room, exclude } => {
                let participants = match self.inner.cache.participants_of(&room).await {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(room = %room, error = %e, "room lookup failed");
                        return;
                    }
                };
                let m = self.inner.clients.read().await;
                let mut sent = 0;
                for user in participants.users() {
                    if exclude.as_deref() == Some(user.as_str()) {
                        continue;
                    }
                    match m.get(user) {
                        Some(c) => {
                            self.push(c, d.payload.clone());
                            sent += 1;
                        }
                        None => debug!(room = %room, user = %user, "participant not connected here"),
                    }
                }
                debug!(room = %room, sent, "room broadcast");
            }
            Target::All { exclude } => {
                let m = self.inner.clients.read().await;
                for (user, c) in m.iter() {
                    if exclude.as_deref() != Some(user.as_str()) {
                        self.push(c, d.payload.clone());
                    }
                }
            }
        }
    }

    fn push(&self, conn: &Connection, payload: String) {
        if let Err(e) = conn.enqueue(payload) {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(user = %conn.user_id(), conn = %conn.id(), reason = ?e, "send buffer full, dropping message");
        }
    }

    /* ---------------- introspection ---------------- */

    pub async fn online_count(&self) -> usize { self.inner.clients.read().await.len() }

    pub async fn is_online(&self, user: &str) -> bool { self.inner.clients.read().await.contains_key(user) }

    /// Messages dropped by the hub: full dispatch lanes plus full connection queues.
    pub fn dropped_messages(&self) -> u64 { self.inner.dropped.load(Ordering::Relaxed) }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::Value;

    pub(crate) fn test_config() -> Config {
        Config { jwt_secret: "test-secret".into(), reconnect_grace: Duration::from_millis(20), ..Config::default() }
    }

    pub(crate) fn hub_with(store: Arc<MemoryStore>) -> Hub {
        let cfg = test_config();
        let cache = Arc::new(RoomCache::new(store.clone(), cfg.room_cache_ttl));
        Hub::start(store, cache, &cfg)
    }

    pub(crate) async fn next_json(rx: &mut mpsc::Receiver<String>) -> Value {
        let raw = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("queue closed");
        serde_json::from_str(&raw).unwrap()
    }

    pub(crate) async fn assert_silent(rx: &mut mpsc::Receiver<String>) {
        let got = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(got.is_err(), "unexpected message: {got:?}");
    }

    /// Registers through the control loop and waits for the welcome event.
    pub(crate) async fn connect(hub: &Hub, user: &str) -> (Arc<Connection>, mpsc::Receiver<String>) {
        let (conn, mut rx) = Connection::new(user, 16);
        hub.register(conn.clone()).await;
        assert_eq!(next_json(&mut rx).await["type"], "connected");
        (conn, rx)
    }

    async fn seed_room(store: &MemoryStore, room: &str, a: &str, b: &str) {
        store.hset(&keys::room(room), &[("slot1", a.into()), ("slot2", b.into())]).await.unwrap();
    }

    #[tokio::test]
    async fn register_marks_online_and_routes_direct_sends() {
        let store = Arc::new(MemoryStore::new());
        let hub = hub_with(store.clone());
        let (_alice, mut rx) = connect(&hub, "alice").await;

        hub.send("alice", &ServerEvent::Pong);
        assert_eq!(next_json(&mut rx).await["type"], "pong");
        assert!(hub.is_online("alice").await);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get(&keys::online("alice")).await.unwrap().as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn stale_unregister_keeps_newer_connection() {
        let hub = hub_with(Arc::new(MemoryStore::new()));
        let (old, _old_rx) = Connection::new("alice", 4);
        let (new, mut new_rx) = Connection::new("alice", 4);

        hub.apply_register(old.clone()).await;
        hub.apply_register(new.clone()).await;
        assert!(!hub.apply_unregister(old.clone()).await);
        assert!(hub.is_online("alice").await);

        assert_eq!(next_json(&mut new_rx).await["type"], "connected");
        hub.send("alice", &ServerEvent::Pong);
        assert_eq!(next_json(&mut new_rx).await["type"], "pong");

        assert!(hub.apply_unregister(new.clone()).await);
        assert!(!hub.is_online("alice").await);
        assert!(!new.close_outbound(), "already closed by unregister");
    }

    #[tokio::test]
    async fn reconnect_closes_superseded_socket_after_grace() {
        let hub = hub_with(Arc::new(MemoryStore::new()));
        let (first, mut first_rx) = connect(&hub, "alice").await;
        let (_second, mut second_rx) = connect(&hub, "alice").await;

        tokio::time::timeout(Duration::from_secs(1), first.wait_closed())
            .await
            .expect("old transport not closed");
        assert_eq!(hub.online_count().await, 1);

        hub.send("alice", &ServerEvent::Pong);
        assert_eq!(next_json(&mut second_rx).await["type"], "pong");
        assert_silent(&mut first_rx).await;
        assert_eq!(first.enqueue("still open".into()), Ok(()), "old queue is left open");
    }

    #[tokio::test]
    async fn room_broadcast_skips_excluded_participant() {
        let store = Arc::new(MemoryStore::new());
        seed_room(&store, "r", "alice", "bob").await;
        let hub = hub_with(store);
        let (_a, mut a_rx) = connect(&hub, "alice").await;
        let (_b, mut b_rx) = connect(&hub, "bob").await;
        let (_c, mut c_rx) = connect(&hub, "carol").await;

        hub.broadcast_room("r", Some("alice"), &ServerEvent::Pong);
        assert_eq!(next_json(&mut b_rx).await["type"], "pong");
        assert_silent(&mut a_rx).await;
        assert_silent(&mut c_rx).await;
    }

    #[tokio::test]
    async fn broadcast_all_honours_exclusion() {
        let hub = hub_with(Arc::new(MemoryStore::new()));
        let (_a, mut a_rx) = connect(&hub, "alice").await;
        let (_b, mut b_rx) = connect(&hub, "bob").await;

        hub.broadcast_all(Some("bob"), &ServerEvent::Pong);
        assert_eq!(next_json(&mut a_rx).await["type"], "pong");
        assert_silent(&mut b_rx).await;

        hub.broadcast_all(None, &ServerEvent::Pong);
        assert_eq!(next_json(&mut a_rx).await["type"], "pong");
        assert_eq!(next_json(&mut b_rx).await["type"], "pong");
    }

    #[tokio::test]
    async fn unregister_notifies_partner_of_latched_room() {
        let store = Arc::new(MemoryStore::new());
        seed_room(&store, "r", "alice", "bob").await;
        let hub = hub_with(store.clone());
        let (alice, _a_rx) = connect(&hub, "alice").await;
        let (_b, mut b_rx) = connect(&hub, "bob").await;

        alice.latch_room("r");
        hub.unregister(alice).await;

        let ev = next_json(&mut b_rx).await;
        assert_eq!(ev["type"], "partner_disconnected");
        assert_eq!(ev["from"], "alice");
        assert_eq!(ev["roomId"], "r");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get(&keys::online("alice")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn full_connection_queue_is_counted_not_blocking() {
        let hub = hub_with(Arc::new(MemoryStore::new()));
        let (conn, _rx) = Connection::new("alice", 1);
        hub.apply_register(conn.clone()).await; // welcome message fills the queue

        hub.send("alice", &ServerEvent::Pong);
        for _ in 0..50 {
            if hub.dropped_messages() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hub.dropped_messages(), 1);
    }

    #[test]
    fn lanes_are_stable_per_target() {
        let a = Target::User("alice".into());
        assert_eq!(a.lane(4), Target::User("alice".into()).lane(4));
        assert!(a.lane(4) < 4);
        assert_eq!(Target::All { exclude: None }.lane(1), 0);
    }
}
