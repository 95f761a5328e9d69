use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites a tenant's WAL once `threshold` appends
/// have accumulated since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// One compactor pass. Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if threshold == 0 || appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            metrics::counter!(crate::observability::COMPACTIONS_TOTAL, "status" => "ok").increment(1);
            true
        }
        Err(e) => {
            error!("WAL compaction failed: {e}");
            metrics::counter!(crate::observability::COMPACTIONS_TOTAL, "status" => "error").increment(1);
            false
        }
    }
}
