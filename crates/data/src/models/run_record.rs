//! Task run records.
//!
//! One record per `(task_name, instance_key)`. A new run always reuses the
//! slot; records are never deleted so the table doubles as an audit log.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Opaque key/value metadata attached to a run.
pub type RunMeta = Map<String, Value>;

/// Lifecycle status of a task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Running,
    StopRequested,
    Stopped,
    Completed,
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::StopRequested => "STOP_REQUESTED",
            Self::Stopped => "STOPPED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Stopped, completed and failed runs no longer own their slot.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "STOP_REQUESTED" => Ok(Self::StopRequested),
            "STOPPED" => Ok(Self::Stopped),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => anyhow::bail!("unknown task status: {other}"),
        }
    }
}

/// Identity of a run slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunKey {
    pub task_name: String,
    pub instance_key: String,
}

impl RunKey {
    pub fn new(task_name: impl Into<String>, instance_key: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            instance_key: instance_key.into(),
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.task_name, self.instance_key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub task_name: String,
    pub instance_key: String,
    pub status: TaskStatus,
    pub external_task_id: Option<String>,
    pub worker_id: Option<String>,
    pub status_message: Option<String>,
    pub meta: RunMeta,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    #[must_use]
    pub fn key(&self) -> RunKey {
        RunKey::new(self.task_name.clone(), self.instance_key.clone())
    }

    /// True while the run still owns its slot (RUNNING or STOP_REQUESTED).
    #[must_use]
    pub const fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// A run is stale when its last heartbeat is older than `threshold`.
    ///
    /// Records that never heartbeated fall back to `started_at`.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        let last_seen = self.last_heartbeat_at.unwrap_or(self.started_at);
        now - last_seen > threshold
    }

    /// Whether a new `start()` may take over this slot.
    #[must_use]
    pub fn can_be_superseded(&self, stale_before: DateTime<Utc>) -> bool {
        !self.is_active() || self.last_heartbeat_at.unwrap_or(self.started_at) < stale_before
    }

    /// Reads a boolean flag out of `meta`.
    #[must_use]
    pub fn meta_flag(&self, name: &str) -> bool {
        self.meta.get(name).and_then(Value::as_bool).unwrap_or(false)
    }
}

/// Fields written by a `start()` call.
#[derive(Debug, Clone)]
pub struct RunStart {
    pub key: RunKey,
    pub external_task_id: Option<String>,
    pub worker_id: Option<String>,
    pub meta: RunMeta,
    pub started_at: DateTime<Utc>,
}

impl RunStart {
    /// The record a successful start produces.
    #[must_use]
    pub fn to_record(&self) -> RunRecord {
        RunRecord {
            task_name: self.key.task_name.clone(),
            instance_key: self.key.instance_key.clone(),
            status: TaskStatus::Running,
            external_task_id: self.external_task_id.clone(),
            worker_id: self.worker_id.clone(),
            status_message: None,
            meta: self.meta.clone(),
            started_at: self.started_at,
            last_heartbeat_at: Some(self.started_at),
            stopped_at: None,
        }
    }
}

/// Result of a conditional start.
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Started(RunRecord),
    /// A live, non-stale run already holds the slot.
    Conflict(RunRecord),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(status: TaskStatus, heartbeat_secs_ago: i64, now: DateTime<Utc>) -> RunRecord {
        RunRecord {
            task_name: "market_data.tick_publisher".to_string(),
            instance_key: "acct:EUR_USD".to_string(),
            status,
            external_task_id: None,
            worker_id: None,
            status_message: None,
            meta: RunMeta::new(),
            started_at: now - Duration::seconds(600),
            last_heartbeat_at: Some(now - Duration::seconds(heartbeat_secs_ago)),
            stopped_at: None,
        }
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            TaskStatus::Running,
            TaskStatus::StopRequested,
            TaskStatus::Stopped,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("PAUSED".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn staleness_uses_heartbeat_age() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let threshold = Duration::seconds(30);

        assert!(!record(TaskStatus::Running, 10, now).is_stale(now, threshold));
        assert!(record(TaskStatus::Running, 31, now).is_stale(now, threshold));
    }

    #[test]
    fn terminal_or_stale_records_can_be_superseded() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let stale_before = now - Duration::seconds(30);

        assert!(!record(TaskStatus::Running, 5, now).can_be_superseded(stale_before));
        assert!(!record(TaskStatus::StopRequested, 5, now).can_be_superseded(stale_before));
        assert!(record(TaskStatus::Running, 45, now).can_be_superseded(stale_before));
        assert!(record(TaskStatus::Failed, 1, now).can_be_superseded(stale_before));
    }
}
