use anyhow::Result;
use trade_engine_core::Clock;
use trade_engine_data::RunRecordStore;

/// Status message written to runs found active at worker start.
pub const INTERRUPTED_MESSAGE: &str = "interrupted by restart";

/// Forces every RUNNING / STOP_REQUESTED record to STOPPED.
///
/// Call once at worker start-up, before any task is accepted; at that point no
/// run can legitimately be active on this deployment.
///
/// # Errors
/// Returns an error if the store update fails.
pub async fn recover_orphaned_runs(store: &dyn RunRecordStore, clock: &dyn Clock) -> Result<u64> {
    let orphaned = store.list_active(None).await?;
    for record in &orphaned {
        tracing::warn!(
            task_name = %record.task_name,
            instance_key = %record.instance_key,
            status = %record.status,
            last_heartbeat_at = ?record.last_heartbeat_at,
            "Recovering orphaned run"
        );
    }

    let stopped = store
        .stop_all_active(INTERRUPTED_MESSAGE, clock.now())
        .await?;
    if stopped > 0 {
        tracing::info!(stopped, "Orphaned runs marked STOPPED");
    }
    Ok(stopped)
}
