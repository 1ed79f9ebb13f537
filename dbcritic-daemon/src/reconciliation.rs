//! Startup reconciliation for crash recovery.
//!
//! An attempt left `in_progress` by a previous process can never finish,
//! so before the first poll cycle we settle every such row as `failed`.
//! The per-PR rows need no touching: a crashed attempt never stored its
//! revision, so the affected PRs are picked up again on the next cycle.

use anyhow::Result;
use tracing::info;

use crate::store::MetricsStore;

/// Reason recorded on attempts found half-open at startup.
const STALE_ATTEMPT_REASON: &str = "interrupted by daemon restart";

/// Run once at startup, after the store opens and before polling starts.
pub async fn reconcile_stale_attempts(store: &MetricsStore) -> Result<usize> {
    info!("Starting crash recovery reconciliation...");

    let reconciled = store
        .mark_stale_attempts_failed(STALE_ATTEMPT_REASON.to_string())
        .await?;

    if reconciled == 0 {
        info!("No interrupted attempts found. Reconciliation complete.");
    } else {
        info!(
            "Marked {} interrupted attempt(s) as failed. Reconciliation complete.",
            reconciled
        );
    }
    Ok(reconciled)
}
