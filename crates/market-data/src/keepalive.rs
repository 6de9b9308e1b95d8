use serde_json::Value;
use std::time::Duration;
use trade_engine_data::RunMeta;
use trade_engine_orchestrator::{DistributedLock, TaskLifecycle};

use crate::report::TaskExit;

/// Heartbeat, lock renewal and a forced stop check, run on the keepalive cadence.
///
/// Returns the exit reason when the task has to wind down.
pub(crate) async fn keepalive(
    run: &mut TaskLifecycle,
    lock: &dyn DistributedLock,
    lock_key: &str,
    ttl: Duration,
    counters: &[(&str, u64)],
) -> Option<TaskExit> {
    let meta: RunMeta = counters
        .iter()
        .map(|(name, value)| ((*name).to_string(), Value::from(*value)))
        .collect();

    if let Err(e) = run.heartbeat(None, Some(&meta), true).await {
        return Some(TaskExit::Failed(format!("heartbeat failed: {e}")));
    }

    match lock.renew(lock_key, ttl).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(lock_key, "Lock could not be renewed");
            return Some(TaskExit::LockLost);
        }
        Err(e) => return Some(TaskExit::Failed(format!("lock renewal failed: {e:#}"))),
    }

    match run.should_stop(true).await {
        Ok(true) => Some(TaskExit::StopRequested),
        Ok(false) => None,
        Err(e) => Some(TaskExit::Failed(format!("stop check failed: {e}"))),
    }
}

/// Releases a lock, logging instead of failing.
pub(crate) async fn release(lock: &dyn DistributedLock, lock_key: &str) {
    match lock.release(lock_key).await {
        Ok(true) => tracing::debug!(lock_key, "Lock released"),
        Ok(false) => tracing::debug!(lock_key, "Lock already gone at release"),
        Err(e) => tracing::warn!(lock_key, "Lock release failed: {e:#}"),
    }
}
