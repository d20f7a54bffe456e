mod config;
mod error;
mod events;
mod hub;
mod routes;
mod services;
mod state;
mod store;
mod utils {
    pub mod clean;
    pub mod jwt;
    pub mod rate_limit;
}

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use crate::{
    config::Config,
    state::AppState,
    store::{CoordinationStore, MemoryStore, RedisStore},
    utils::clean,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = Config::from_env()?;
    let bind = cfg.bind_addr.clone();

    let store: Arc<dyn CoordinationStore> = match cfg.redis_url.as_deref() {
        Some(url) => Arc::new(RedisStore::connect(url).await.context("connecting to redis")?),
        None => {
            tracing::warn!("REDIS_URL not set; coordination state is local to this process");
            let store = MemoryStore::new();
            tokio::spawn(clean::task(store.clone()));  // expired-key sweeper
            Arc::new(store)
        }
    };

    let state = AppState::new(cfg, store);
    let app = routes::app(state.clone());

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!(addr = %bind, "listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    state.hub.shutdown();
    Ok(())
}
