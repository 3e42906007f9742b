//! Periodic purge of events past their retention.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relay::EventStore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Purge expired events every `interval` until `shutdown` is cancelled.
///
/// The first sweep runs immediately.
pub async fn run_retention_sweeper(events: Arc<dyn EventStore>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match events.purge_expired(Utc::now()).await {
            Ok(0) => debug!("No expired events"),
            Ok(purged) => info!(purged, "Purged expired events"),
            Err(e) => warn!(error = %e, "Retention sweep failed"),
        }
    }

    info!("Retention sweeper stopped");
}
