//! Periodic recycling sweep
//!
//! Requests already recycle inline, so the sweep only matters when pages go
//! quiet for long stretches and the pool counts should still reflect reality.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::rotator::CodeRotator;

/// Spawn a background task that recycles cooled-down codes every `interval`.
///
/// Store failures are logged and retried on the next tick.
pub fn spawn_sweep_task(
    rotator: Arc<CodeRotator>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately; startup already initialized the pool
        ticker.tick().await;

        loop {
            ticker.tick().await;
            sweep_cycle(&rotator).await;
        }
    })
}

async fn sweep_cycle(rotator: &CodeRotator) {
    match rotator.recycle_expired().await {
        Ok(0) => debug!("sweep found nothing to recycle"),
        Ok(released) => debug!(released, "sweep recycled codes"),
        Err(e) => warn!(error = %e, "recycling sweep failed, will retry next cycle"),
    }
}
