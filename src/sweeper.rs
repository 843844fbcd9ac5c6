use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::store::WeatherStore;

/// Starts the periodic expiry sweep. `store` must be a handle of its own,
/// not the one serving requests. Abort the returned handle to stop it.
pub fn spawn_sweeper(store: WeatherStore, every: Duration) -> JoinHandle<()> {
    tracing::info!(
        "Starting expiry sweep every {:?} on the {} backend",
        every,
        store.backend_kind()
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            sweep_once(&store).await;
        }
    })
}

/// One pass. Errors are logged and the next tick tries again.
pub async fn sweep_once(store: &WeatherStore) -> Option<u64> {
    match store.purge_expired().await {
        Ok(removed) => {
            if removed > 0 {
                tracing::info!("Expiry sweep removed {} snapshots", removed);
            } else {
                tracing::debug!("Expiry sweep found nothing to remove");
            }
            Some(removed)
        }
        Err(e) => {
            tracing::error!("Expiry sweep failed: {}", e);
            None
        }
    }
}
