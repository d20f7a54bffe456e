use tokio::time;
use tracing::debug;

use crate::store::MemoryStore;

pub const SWEEP_EVERY: time::Duration = time::Duration::from_secs(30);

/// Expired keys are already invisible to readers; this only reclaims memory.
pub async fn task(store: MemoryStore) {
    let mut tick = time::interval(SWEEP_EVERY);
    loop {
        tick.tick().await;
        let purged = store.purge_expired().await;
        if purged > 0 {
            debug!(purged, "expired keys swept");
        }
    }
}
