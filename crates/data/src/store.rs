//! Storage seams.
//!
//! Every persistent concern is a trait so the orchestration layer can run
//! against Postgres in production and [`crate::MemoryStore`] in tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use trade_engine_core::{StrategyEvent, Tick};

use crate::models::{
    BrokerAccount, ExecutionSnapshot, ExecutionState, RunKey, RunMeta, RunRecord, RunStart,
    StartOutcome, StrategyEventRecord, TaskStatus,
};

/// Persistence for task run records.
#[async_trait]
pub trait RunRecordStore: Send + Sync {
    /// Atomically claims the slot for `start.key`.
    ///
    /// Succeeds when no record exists, the existing record is terminal, or its
    /// last heartbeat is older than `stale_before`. Otherwise returns the
    /// conflicting record untouched.
    async fn try_start(&self, start: RunStart, stale_before: DateTime<Utc>)
        -> Result<StartOutcome>;

    async fn get(&self, key: &RunKey) -> Result<Option<RunRecord>>;

    /// Refreshes `last_heartbeat_at` of an active run, optionally replacing the
    /// status message and merging `meta_update` into its metadata.
    ///
    /// `started_at` identifies the run that owns the record. Returns false when
    /// the run is no longer active or a newer start has taken the record over.
    async fn heartbeat(
        &self,
        key: &RunKey,
        started_at: DateTime<Utc>,
        at: DateTime<Utc>,
        status_message: Option<&str>,
        meta_update: Option<&RunMeta>,
    ) -> Result<bool>;

    /// Merges `meta_update` into the metadata of an active run.
    async fn merge_meta(&self, key: &RunKey, meta_update: &RunMeta) -> Result<bool>;

    /// Moves a RUNNING record to STOP_REQUESTED. Any other state is left alone.
    async fn request_stop(&self, key: &RunKey, reason: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Writes a terminal status and stamps `stopped_at` and `last_heartbeat_at`.
    /// Returns false when no record of the run started at `started_at` exists.
    async fn mark_stopped(
        &self,
        key: &RunKey,
        started_at: DateTime<Utc>,
        status: TaskStatus,
        message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Records in RUNNING or STOP_REQUESTED, optionally limited to one task name.
    async fn list_active(&self, task_name: Option<&str>) -> Result<Vec<RunRecord>>;

    /// Marks every active record STOPPED. Returns the number of rows touched.
    async fn stop_all_active(&self, message: &str, at: DateTime<Utc>) -> Result<u64>;
}

/// Durable tick storage keyed by `(instrument, timestamp)`.
#[async_trait]
pub trait TickStore: Send + Sync {
    /// Inserts ticks, ignoring duplicates. Returns the number of new rows.
    async fn upsert_batch(&self, ticks: &[Tick]) -> Result<u64>;

    /// Ticks strictly after `after` (if given) and at or before `until`
    /// (if given), ascending by timestamp.
    async fn range(
        &self,
        instrument: &str,
        after: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Tick>>;

    async fn count(&self, instrument: &str) -> Result<u64>;
}

/// Append-only execution snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Appends a snapshot and returns its sequence (previous max + 1).
    async fn append(
        &self,
        execution_id: &str,
        state: &ExecutionState,
        at: DateTime<Utc>,
    ) -> Result<i64>;

    async fn latest(&self, execution_id: &str) -> Result<Option<ExecutionSnapshot>>;
}

/// Append-only strategy event log.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(
        &self,
        execution_id: &str,
        events: &[StrategyEvent],
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn list(&self, execution_id: &str) -> Result<Vec<StrategyEventRecord>>;
}

/// Broker account registry.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Inserts the account. Returns false if it already existed.
    async fn insert(&self, account: &BrokerAccount) -> Result<bool>;

    async fn get(&self, account_id: &str) -> Result<Option<BrokerAccount>>;

    async fn count_live(&self) -> Result<u64>;

    /// Most recently created LIVE account.
    async fn latest_live(&self) -> Result<Option<BrokerAccount>>;
}
