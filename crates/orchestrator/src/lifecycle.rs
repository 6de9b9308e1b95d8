//! Task lifecycle registry.
//!
//! Every long-running task owns one run record keyed by
//! `(task_name, instance_key)`. The registry enforces single-instance
//! execution through a conditional start, and hands back a [`TaskLifecycle`]
//! through which the running task heartbeats, polls for stop requests and
//! finally marks itself stopped.
//!
//! Heartbeat writes and stop-flag reads are throttled per handle. Between
//! checks `should_stop()` returns the cached value; `force` bypasses it.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use trade_engine_core::{Clock, LifecycleConfig};
use trade_engine_data::{
    RunKey, RunMeta, RunRecord, RunRecordStore, RunStart, StartOutcome, TaskStatus,
};

/// Meta key carrying the pause flag.
pub const PAUSED_META_KEY: &str = "paused";

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{key} is already running (worker {worker_id:?}, last heartbeat {last_heartbeat_at:?})")]
    AlreadyRunning {
        key: RunKey,
        worker_id: Option<String>,
        last_heartbeat_at: Option<DateTime<Utc>>,
    },

    #[error("{0} is not a terminal status")]
    NonTerminalStatus(TaskStatus),

    #[error("no run record for {0}")]
    NotFound(RunKey),

    #[error("{0} was taken over by a newer run")]
    Superseded(RunKey),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Optional fields recorded by `start()`.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub external_task_id: Option<String>,
    pub worker_id: Option<String>,
    pub meta: RunMeta,
}

/// Entry point for run records, shared by workers and control surfaces.
#[derive(Clone)]
pub struct TaskLifecycleRegistry {
    store: Arc<dyn RunRecordStore>,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
}

impl TaskLifecycleRegistry {
    pub fn new(
        store: Arc<dyn RunRecordStore>,
        clock: Arc<dyn Clock>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn RunRecordStore> {
        &self.store
    }

    #[must_use]
    pub const fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Claims the run slot and returns the handle of the new run.
    ///
    /// Terminal records are superseded. An active record is superseded only
    /// when its heartbeat is older than the stale threshold; otherwise the call
    /// fails with [`LifecycleError::AlreadyRunning`].
    ///
    /// # Errors
    /// `AlreadyRunning` on a live conflict, `Store` on persistence failures.
    pub async fn start(
        &self,
        task_name: &str,
        instance_key: &str,
        options: StartOptions,
    ) -> Result<TaskLifecycle, LifecycleError> {
        let now = self.clock.now();
        let key = RunKey::new(task_name, instance_key);
        let start = RunStart {
            key: key.clone(),
            external_task_id: options.external_task_id,
            worker_id: options.worker_id,
            meta: options.meta,
            started_at: now,
        };

        match self
            .store
            .try_start(
                start,
                now.checked_sub_signed(self.config.stale_after())
                    .unwrap_or(DateTime::<Utc>::MIN_UTC),
            )
            .await?
        {
            StartOutcome::Started(record) => {
                tracing::info!(
                    task_name,
                    instance_key,
                    worker_id = ?record.worker_id,
                    "Task run started"
                );
                Ok(TaskLifecycle::new(self.clone(), record))
            }
            StartOutcome::Conflict(existing) => {
                tracing::warn!(
                    task_name,
                    instance_key,
                    worker_id = ?existing.worker_id,
                    last_heartbeat_at = ?existing.last_heartbeat_at,
                    "Task run already active"
                );
                Err(LifecycleError::AlreadyRunning {
                    key,
                    worker_id: existing.worker_id,
                    last_heartbeat_at: existing.last_heartbeat_at,
                })
            }
        }
    }

    /// Flips RUNNING to STOP_REQUESTED. Returns false when the run is not
    /// RUNNING (already stopping, terminal or unknown).
    ///
    /// # Errors
    /// Returns an error if the store update fails.
    pub async fn request_cancel(
        &self,
        task_name: &str,
        instance_key: &str,
        reason: Option<&str>,
    ) -> Result<bool, LifecycleError> {
        let key = RunKey::new(task_name, instance_key);
        let reason = reason.unwrap_or("cancel requested");
        let flipped = self
            .store
            .request_stop(&key, reason, self.clock.now())
            .await?;

        if flipped {
            tracing::info!(%key, reason, "Stop requested");
        } else {
            tracing::debug!(%key, "Stop request ignored, run is not RUNNING");
        }
        Ok(flipped)
    }

    /// # Errors
    /// Returns an error if the store read fails.
    pub async fn get(
        &self,
        task_name: &str,
        instance_key: &str,
    ) -> Result<Option<RunRecord>, LifecycleError> {
        Ok(self
            .store
            .get(&RunKey::new(task_name, instance_key))
            .await?)
    }

    /// # Errors
    /// Returns an error if the store read fails.
    pub async fn list_active(
        &self,
        task_name: Option<&str>,
    ) -> Result<Vec<RunRecord>, LifecycleError> {
        Ok(self.store.list_active(task_name).await?)
    }

    /// Sets or clears the pause flag of an active run.
    ///
    /// # Errors
    /// `NotFound` when no active run exists for the key.
    pub async fn set_paused(
        &self,
        task_name: &str,
        instance_key: &str,
        paused: bool,
    ) -> Result<(), LifecycleError> {
        let key = RunKey::new(task_name, instance_key);
        let mut update = RunMeta::new();
        update.insert(PAUSED_META_KEY.to_string(), Value::Bool(paused));

        if !self.store.merge_meta(&key, &update).await? {
            return Err(LifecycleError::NotFound(key));
        }
        tracing::info!(%key, paused, "Pause flag updated");
        Ok(())
    }
}

/// Handle owned by a running task.
///
/// The handle remembers the `started_at` of the record it claimed. Writes only
/// apply to that run, so a worker whose run was taken over after going stale
/// can no longer touch the new owner's record.
pub struct TaskLifecycle {
    registry: TaskLifecycleRegistry,
    key: RunKey,
    /// As stored, so it compares equal after the store's timestamp rounding.
    started_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
    last_check: Option<DateTime<Utc>>,
    cached_stop: bool,
    cached_paused: bool,
    superseded: bool,
}

impl TaskLifecycle {
    fn new(registry: TaskLifecycleRegistry, record: RunRecord) -> Self {
        let last_heartbeat = record.last_heartbeat_at.unwrap_or(record.started_at);
        Self {
            registry,
            cached_paused: record.meta_flag(PAUSED_META_KEY),
            key: record.key(),
            started_at: record.started_at,
            last_heartbeat,
            last_check: None,
            cached_stop: false,
            superseded: false,
        }
    }

    #[must_use]
    pub const fn key(&self) -> &RunKey {
        &self.key
    }

    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Whether a newer start took the record over. Set by the stop/pause
    /// refresh and by rejected writes; a superseded run must exit without
    /// writing anything further for its key.
    #[must_use]
    pub const fn is_superseded(&self) -> bool {
        self.superseded
    }

    /// Writes a heartbeat unless one was written within the heartbeat
    /// interval. Returns whether a write happened.
    ///
    /// # Errors
    /// Returns an error if the store update fails.
    pub async fn heartbeat(
        &mut self,
        status_message: Option<&str>,
        meta_update: Option<&RunMeta>,
        force: bool,
    ) -> Result<bool, LifecycleError> {
        let now = self.registry.clock.now();
        if !force && now - self.last_heartbeat < self.registry.config.heartbeat_interval() {
            return Ok(false);
        }

        let written = self
            .registry
            .store
            .heartbeat(&self.key, self.started_at, now, status_message, meta_update)
            .await?;
        self.last_heartbeat = now;

        if !written {
            tracing::warn!(key = %self.key, "Heartbeat skipped, run is no longer active");
            self.cached_stop = true;
            self.last_check = None;
        }
        Ok(written)
    }

    /// Whether the task should wind down.
    ///
    /// True when a stop was requested, or when the run record was moved to a
    /// terminal state or superseded behind this task's back.
    ///
    /// # Errors
    /// Returns an error if the store read fails.
    pub async fn should_stop(&mut self, force: bool) -> Result<bool, LifecycleError> {
        self.refresh(force).await?;
        Ok(self.cached_stop)
    }

    /// Pause flag, refreshed on the same throttle as [`Self::should_stop`].
    ///
    /// # Errors
    /// Returns an error if the store read fails.
    pub async fn is_paused(&mut self, force: bool) -> Result<bool, LifecycleError> {
        self.refresh(force).await?;
        Ok(self.cached_paused)
    }

    async fn refresh(&mut self, force: bool) -> Result<(), LifecycleError> {
        let now = self.registry.clock.now();
        let fresh = self
            .last_check
            .is_some_and(|at| now - at < self.registry.config.stop_check_interval());
        if fresh && !force {
            return Ok(());
        }

        let record = self.registry.store.get(&self.key).await?;
        self.last_check = Some(now);
        match record {
            Some(record) if record.started_at != self.started_at => {
                if !self.superseded {
                    tracing::warn!(
                        key = %self.key,
                        worker_id = ?record.worker_id,
                        "Run was taken over by a newer start"
                    );
                }
                self.superseded = true;
                self.cached_stop = true;
            }
            Some(record) => {
                self.cached_stop =
                    record.status == TaskStatus::StopRequested || record.status.is_terminal();
                self.cached_paused = record.meta_flag(PAUSED_META_KEY);
            }
            None => self.cached_stop = true,
        }
        Ok(())
    }

    /// Writes the terminal status of this run.
    ///
    /// # Errors
    /// `NonTerminalStatus` for RUNNING or STOP_REQUESTED, `Superseded` when a
    /// newer run owns the record, `NotFound` when the record vanished, `Store`
    /// on persistence failures.
    pub async fn mark_stopped(
        &mut self,
        status: TaskStatus,
        status_message: Option<&str>,
    ) -> Result<(), LifecycleError> {
        if !status.is_terminal() {
            return Err(LifecycleError::NonTerminalStatus(status));
        }

        let now = self.registry.clock.now();
        if !self
            .registry
            .store
            .mark_stopped(&self.key, self.started_at, status, status_message, now)
            .await?
        {
            self.cached_stop = true;
            return match self.registry.store.get(&self.key).await? {
                Some(_) => {
                    self.superseded = true;
                    Err(LifecycleError::Superseded(self.key.clone()))
                }
                None => Err(LifecycleError::NotFound(self.key.clone())),
            };
        }

        self.cached_stop = true;
        self.last_heartbeat = now;
        tracing::info!(key = %self.key, %status, message = ?status_message, "Task run stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use trade_engine_core::ManualClock;
    use trade_engine_data::MemoryStore;

    fn registry() -> (TaskLifecycleRegistry, ManualClock, Arc<MemoryStore>) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap());
        let store = Arc::new(MemoryStore::new());
        let registry = TaskLifecycleRegistry::new(
            store.clone(),
            Arc::new(clock.clone()),
            LifecycleConfig::default(),
        );
        (registry, clock, store)
    }

    #[tokio::test]
    async fn second_start_rejected_while_first_is_live() {
        let (registry, clock, _) = registry();
        let _first = registry
            .start("execution.backtest", "exec-1", StartOptions::default())
            .await
            .unwrap();

        clock.advance(Duration::seconds(10));
        let err = registry
            .start("execution.backtest", "exec-1", StartOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LifecycleError::AlreadyRunning { .. }));
    }

    #[tokio::test]
    async fn stale_run_is_taken_over() {
        let (registry, clock, _) = registry();
        let _crashed = registry
            .start("execution.backtest", "exec-1", StartOptions::default())
            .await
            .unwrap();

        clock.advance(Duration::seconds(31));
        let takeover = registry
            .start(
                "execution.backtest",
                "exec-1",
                StartOptions {
                    worker_id: Some("worker-b".to_string()),
                    ..StartOptions::default()
                },
            )
            .await
            .unwrap();

        let record = registry.get("execution.backtest", "exec-1").await.unwrap().unwrap();
        assert_eq!(takeover.key().instance_key, "exec-1");
        assert_eq!(record.worker_id.as_deref(), Some("worker-b"));
        assert_eq!(record.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn taken_over_run_stops_and_cannot_write() {
        let (registry, clock, _) = registry();
        let mut old = registry
            .start(
                "execution.trading",
                "exec-1",
                StartOptions {
                    worker_id: Some("worker-a".to_string()),
                    ..StartOptions::default()
                },
            )
            .await
            .unwrap();

        clock.advance(Duration::seconds(31));
        let new = registry
            .start(
                "execution.trading",
                "exec-1",
                StartOptions {
                    worker_id: Some("worker-b".to_string()),
                    ..StartOptions::default()
                },
            )
            .await
            .unwrap();
        assert_ne!(old.started_at(), new.started_at());

        assert!(old.should_stop(true).await.unwrap());
        assert!(old.is_superseded());

        clock.advance(Duration::seconds(1));
        assert!(!old.heartbeat(Some("still here"), None, true).await.unwrap());
        let err = old
            .mark_stopped(TaskStatus::Completed, Some("done"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LifecycleError::Superseded(_)));

        let record = registry.get("execution.trading", "exec-1").await.unwrap().unwrap();
        assert_eq!(record.worker_id.as_deref(), Some("worker-b"));
        assert_eq!(record.status, TaskStatus::Running);
        assert_eq!(record.last_heartbeat_at, Some(new.started_at()));
        assert!(record.status_message.is_none());
        assert!(record.stopped_at.is_none());
    }

    #[tokio::test]
    async fn rejected_heartbeat_forces_stop() {
        let (registry, clock, _) = registry();
        let mut old = registry
            .start("execution.trading", "exec-2", StartOptions::default())
            .await
            .unwrap();
        assert!(!old.should_stop(false).await.unwrap());

        clock.advance(Duration::seconds(31));
        let _new = registry
            .start("execution.trading", "exec-2", StartOptions::default())
            .await
            .unwrap();

        assert!(!old.heartbeat(None, None, true).await.unwrap());
        assert!(old.should_stop(false).await.unwrap());
        assert!(old.is_superseded());
    }

    #[tokio::test]
    async fn terminal_run_is_superseded_immediately() {
        let (registry, _clock, _) = registry();
        let mut first = registry
            .start("execution.backtest", "exec-1", StartOptions::default())
            .await
            .unwrap();
        first.mark_stopped(TaskStatus::Completed, Some("done")).await.unwrap();

        let second = registry
            .start("execution.backtest", "exec-1", StartOptions::default())
            .await;
        assert!(second.is_ok());
        let record = registry.get("execution.backtest", "exec-1").await.unwrap().unwrap();
        assert!(record.stopped_at.is_none());
        assert!(record.status_message.is_none());
    }

    #[tokio::test]
    async fn should_stop_is_cached_until_forced_or_interval_elapses() {
        let (registry, clock, _) = registry();
        let mut run = registry
            .start("market_data.tick_publisher", "acct:EUR_USD", StartOptions::default())
            .await
            .unwrap();

        assert!(!run.should_stop(false).await.unwrap());
        assert!(registry
            .request_cancel("market_data.tick_publisher", "acct:EUR_USD", None)
            .await
            .unwrap());

        assert!(!run.should_stop(false).await.unwrap());
        assert!(run.should_stop(true).await.unwrap());

        let mut other = registry
            .start("market_data.tick_subscriber", "acct:EUR_USD", StartOptions::default())
            .await
            .unwrap();
        assert!(!other.should_stop(false).await.unwrap());
        registry
            .request_cancel("market_data.tick_subscriber", "acct:EUR_USD", Some("shutdown"))
            .await
            .unwrap();
        clock.advance(Duration::milliseconds(1_001));
        assert!(other.should_stop(false).await.unwrap());
    }

    #[tokio::test]
    async fn request_cancel_is_noop_for_stopped_runs() {
        let (registry, _clock, _) = registry();
        let mut run = registry
            .start("execution.trading", "exec-9", StartOptions::default())
            .await
            .unwrap();
        run.mark_stopped(TaskStatus::Stopped, None).await.unwrap();

        assert!(!registry
            .request_cancel("execution.trading", "exec-9", None)
            .await
            .unwrap());
        let record = registry.get("execution.trading", "exec-9").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Stopped);
    }

    #[tokio::test]
    async fn heartbeat_is_throttled_unless_forced() {
        let (registry, clock, store) = registry();
        let mut run = registry
            .start("execution.trading", "exec-3", StartOptions::default())
            .await
            .unwrap();

        let mut meta = RunMeta::new();
        meta.insert("ticks".to_string(), Value::from(10));

        clock.advance(Duration::seconds(2));
        assert!(!run.heartbeat(Some("early"), Some(&meta), false).await.unwrap());
        assert!(run.heartbeat(Some("forced"), Some(&meta), true).await.unwrap());

        clock.advance(Duration::seconds(5));
        assert!(run.heartbeat(None, None, false).await.unwrap());

        let record = RunRecordStore::get(store.as_ref(), run.key()).await.unwrap().unwrap();
        assert_eq!(record.status_message.as_deref(), Some("forced"));
        assert_eq!(record.meta["ticks"], Value::from(10));
        assert_eq!(record.last_heartbeat_at, Some(clock.now()));
    }

    #[tokio::test]
    async fn mark_stopped_rejects_non_terminal_status() {
        let (registry, _clock, _) = registry();
        let mut run = registry
            .start("execution.trading", "exec-4", StartOptions::default())
            .await
            .unwrap();

        let err = run.mark_stopped(TaskStatus::Running, None).await.err().unwrap();
        assert!(matches!(err, LifecycleError::NonTerminalStatus(TaskStatus::Running)));
    }

    #[tokio::test]
    async fn pause_flag_round_trips_through_meta() {
        let (registry, clock, _) = registry();
        let mut run = registry
            .start("execution.trading", "exec-5", StartOptions::default())
            .await
            .unwrap();

        registry.set_paused("execution.trading", "exec-5", true).await.unwrap();
        assert!(run.is_paused(true).await.unwrap());

        registry.set_paused("execution.trading", "exec-5", false).await.unwrap();
        assert!(run.is_paused(false).await.unwrap());
        clock.advance(Duration::seconds(2));
        assert!(!run.is_paused(false).await.unwrap());

        assert!(matches!(
            registry.set_paused("execution.trading", "missing", true).await,
            Err(LifecycleError::NotFound(_))
        ));
    }
}
