use std::sync::Arc;

use crate::{
    config::Config,
    hub::{Hub, RoomCache},
    services::{
        matchmaking::MatchmakingService, readiness::ReadinessCoordinator, rooms::RoomService,
        signaling::SignalingRelay,
    },
    store::CoordinationStore,
};

/* ------------ shared per-process state, injected via Extension ------------ */
#[derive(Clone)]
pub struct AppState {
    pub config:      Arc<Config>,
    pub hub:         Hub,
    pub rooms:       Arc<RoomService>,
    pub matchmaking: Arc<MatchmakingService>,
    pub relay:       Arc<SignalingRelay>,
    /// Direct store access for request-level counters.
    pub store:       Arc<dyn CoordinationStore>,
}

impl AppState {
    /// Wires every component onto one store and starts the hub's tasks.
    pub fn new(config: Config, store: Arc<dyn CoordinationStore>) -> Self {
        let cache = Arc::new(RoomCache::new(store.clone(), config.room_cache_ttl));
        let hub = Hub::start(store.clone(), cache.clone(), &config);
        let rooms = Arc::new(RoomService::new(store.clone(), cache));
        let matchmaking = Arc::new(MatchmakingService::new(store.clone(), rooms.clone()));
        let readiness = Arc::new(ReadinessCoordinator::new(store.clone(), hub.clone(), rooms.clone()));
        let relay = Arc::new(SignalingRelay::new(hub.clone(), readiness));

        Self { config: Arc::new(config), hub, rooms, matchmaking, relay, store }
    }
}
