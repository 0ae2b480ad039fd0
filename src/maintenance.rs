//! Background WAL compaction.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Periodically rewrites the WAL once enough appends have accumulated
/// since the last compaction. Runs until the process exits; a failed
/// pass is logged and retried on the next sweep.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tick.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            debug!(appends, threshold, "compaction not due");
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "WAL compacted"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
