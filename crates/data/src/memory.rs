//! In-process implementation of every store trait.
//!
//! Used by tests and by single-process backtests that do not need Postgres.
//! Each table sits behind its own mutex; no lock is held across an await.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use trade_engine_core::{StrategyEvent, Tick};

use crate::models::{
    BrokerAccount, ExecutionSnapshot, ExecutionState, RunKey, RunMeta, RunRecord, RunStart,
    StartOutcome, StrategyEventRecord, TaskStatus,
};
use crate::store::{AccountStore, EventStore, RunRecordStore, SnapshotStore, TickStore};

#[derive(Default)]
pub struct MemoryStore {
    runs: Mutex<HashMap<RunKey, RunRecord>>,
    ticks: Mutex<HashMap<String, BTreeMap<DateTime<Utc>, Tick>>>,
    snapshots: Mutex<HashMap<String, Vec<ExecutionSnapshot>>>,
    events: Mutex<HashMap<String, Vec<StrategyEventRecord>>>,
    accounts: Mutex<Vec<BrokerAccount>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites a run record as-is. Lets tests fabricate crashed runs.
    pub fn put_run(&self, record: RunRecord) {
        self.runs.lock().insert(record.key(), record);
    }
}

fn merge_into(meta: &mut RunMeta, update: &RunMeta) {
    for (k, v) in update {
        meta.insert(k.clone(), v.clone());
    }
}

#[async_trait]
impl RunRecordStore for MemoryStore {
    async fn try_start(
        &self,
        start: RunStart,
        stale_before: DateTime<Utc>,
    ) -> Result<StartOutcome> {
        let mut runs = self.runs.lock();
        if let Some(existing) = runs.get(&start.key) {
            if !existing.can_be_superseded(stale_before) {
                return Ok(StartOutcome::Conflict(existing.clone()));
            }
        }
        let record = start.to_record();
        runs.insert(start.key, record.clone());
        Ok(StartOutcome::Started(record))
    }

    async fn get(&self, key: &RunKey) -> Result<Option<RunRecord>> {
        Ok(self.runs.lock().get(key).cloned())
    }

    async fn heartbeat(
        &self,
        key: &RunKey,
        started_at: DateTime<Utc>,
        at: DateTime<Utc>,
        status_message: Option<&str>,
        meta_update: Option<&RunMeta>,
    ) -> Result<bool> {
        let mut runs = self.runs.lock();
        let Some(record) = runs
            .get_mut(key)
            .filter(|r| r.is_active() && r.started_at == started_at)
        else {
            return Ok(false);
        };
        record.last_heartbeat_at = Some(at);
        if let Some(message) = status_message {
            record.status_message = Some(message.to_string());
        }
        if let Some(update) = meta_update {
            merge_into(&mut record.meta, update);
        }
        Ok(true)
    }

    async fn merge_meta(&self, key: &RunKey, meta_update: &RunMeta) -> Result<bool> {
        let mut runs = self.runs.lock();
        let Some(record) = runs.get_mut(key).filter(|r| r.is_active()) else {
            return Ok(false);
        };
        merge_into(&mut record.meta, meta_update);
        Ok(true)
    }

    async fn request_stop(&self, key: &RunKey, reason: &str, _at: DateTime<Utc>) -> Result<bool> {
        let mut runs = self.runs.lock();
        match runs.get_mut(key) {
            Some(record) if record.status == TaskStatus::Running => {
                record.status = TaskStatus::StopRequested;
                record.status_message = Some(reason.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_stopped(
        &self,
        key: &RunKey,
        started_at: DateTime<Utc>,
        status: TaskStatus,
        message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut runs = self.runs.lock();
        let Some(record) = runs.get_mut(key).filter(|r| r.started_at == started_at) else {
            return Ok(false);
        };
        record.status = status;
        record.stopped_at = Some(at);
        record.last_heartbeat_at = Some(at);
        if let Some(message) = message {
            record.status_message = Some(message.to_string());
        }
        Ok(true)
    }

    async fn list_active(&self, task_name: Option<&str>) -> Result<Vec<RunRecord>> {
        let runs = self.runs.lock();
        let mut active: Vec<RunRecord> = runs
            .values()
            .filter(|r| r.is_active())
            .filter(|r| task_name.map_or(true, |name| r.task_name == name))
            .cloned()
            .collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(active)
    }

    async fn stop_all_active(&self, message: &str, at: DateTime<Utc>) -> Result<u64> {
        let mut runs = self.runs.lock();
        let mut touched = 0;
        for record in runs.values_mut().filter(|r| r.is_active()) {
            record.status = TaskStatus::Stopped;
            record.status_message = Some(message.to_string());
            record.stopped_at = Some(at);
            touched += 1;
        }
        Ok(touched)
    }
}

#[async_trait]
impl TickStore for MemoryStore {
    async fn upsert_batch(&self, ticks: &[Tick]) -> Result<u64> {
        let mut table = self.ticks.lock();
        let mut inserted = 0;
        for tick in ticks {
            let series = table.entry(tick.instrument.clone()).or_default();
            if !series.contains_key(&tick.timestamp) {
                series.insert(tick.timestamp, tick.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn range(
        &self,
        instrument: &str,
        after: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Tick>> {
        let table = self.ticks.lock();
        let Some(series) = table.get(instrument) else {
            return Ok(Vec::new());
        };
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        let upper = until.map_or(Bound::Unbounded, Bound::Included);
        Ok(series
            .range((lower, upper))
            .take(limit)
            .map(|(_, tick)| tick.clone())
            .collect())
    }

    async fn count(&self, instrument: &str) -> Result<u64> {
        Ok(self
            .ticks
            .lock()
            .get(instrument)
            .map_or(0, |series| series.len() as u64))
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn append(
        &self,
        execution_id: &str,
        state: &ExecutionState,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        let mut snapshots = self.snapshots.lock();
        let history = snapshots.entry(execution_id.to_string()).or_default();
        let sequence = history.last().map_or(1, |s| s.sequence + 1);
        history.push(ExecutionSnapshot {
            execution_id: execution_id.to_string(),
            sequence,
            state: state.clone(),
            created_at: at,
        });
        Ok(sequence)
    }

    async fn latest(&self, execution_id: &str) -> Result<Option<ExecutionSnapshot>> {
        Ok(self
            .snapshots
            .lock()
            .get(execution_id)
            .and_then(|history| history.last().cloned()))
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append(
        &self,
        execution_id: &str,
        events: &[StrategyEvent],
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut table = self.events.lock();
        let log = table.entry(execution_id.to_string()).or_default();
        for event in events {
            let sequence = log.last().map_or(1, |r| r.sequence + 1);
            log.push(StrategyEventRecord {
                execution_id: execution_id.to_string(),
                sequence,
                event: event.clone(),
                created_at: at,
            });
        }
        Ok(())
    }

    async fn list(&self, execution_id: &str) -> Result<Vec<StrategyEventRecord>> {
        Ok(self
            .events
            .lock()
            .get(execution_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn insert(&self, account: &BrokerAccount) -> Result<bool> {
        let mut accounts = self.accounts.lock();
        if accounts.iter().any(|a| a.account_id == account.account_id) {
            return Ok(false);
        }
        accounts.push(account.clone());
        Ok(true)
    }

    async fn get(&self, account_id: &str) -> Result<Option<BrokerAccount>> {
        Ok(self
            .accounts
            .lock()
            .iter()
            .find(|a| a.account_id == account_id)
            .cloned())
    }

    async fn count_live(&self) -> Result<u64> {
        Ok(self.accounts.lock().iter().filter(|a| a.is_live).count() as u64)
    }

    async fn latest_live(&self) -> Result<Option<BrokerAccount>> {
        Ok(self
            .accounts
            .lock()
            .iter()
            .filter(|a| a.is_live)
            .max_by_key(|a| a.created_at)
            .cloned())
    }
}
