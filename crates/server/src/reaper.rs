//! Background removal of expired uploads.

use crate::engine::UploadEngine;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Run the expiration sweep every `interval` until the runtime shuts down.
pub fn spawn_reaper(engine: Arc<UploadEngine>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match engine.sweep_expired(OffsetDateTime::now_utc()).await {
                Ok(0) => tracing::debug!("Expiration sweep found nothing to remove"),
                Ok(removed) => tracing::info!(removed = removed, "Removed expired uploads"),
                Err(e) => tracing::warn!(error = %e, "Expiration sweep failed"),
            }
        }
    })
}
