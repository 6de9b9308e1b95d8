//! Drives one strategy over one tick source under a lifecycle-managed run.
//!
//! Per tick the strategy transition runs first, then its events are appended
//! to the event log. Every `snapshot_interval_ticks` the executor writes a
//! snapshot, forces a heartbeat and re-reads the stop flag. In between, each
//! tick and each poll of the pause timer heartbeat on the lifecycle throttle,
//! so a run with sparse or no ticks still looks alive. The poll races the
//! source so stop and pause requests are seen even when the source is idle.
//!
//! A run taken over by another worker exits without writing snapshots,
//! events or a terminal status.
//!
//! A crash leaves the last snapshot in place; the next run of the same
//! execution id restores it and skips every tick up to its
//! `last_tick_timestamp`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use trade_engine_core::{Clock, ExecutorConfig, StrategyEvent};
use trade_engine_data::{EventStore, ExecutionState, RunMeta, SnapshotStore, TaskStatus};
use trade_engine_orchestrator::{
    LifecycleError, StartOptions, TaskLifecycle, TaskLifecycleRegistry,
};
use trade_engine_strategy::{StrategyContext, StrategyEngine, StrategyError, StrategyRegistry};

use crate::request::{ExecutionKind, ExecutionOutcome, ExecutionRequest, StopMode};
use crate::source::TickSource;

enum Exit {
    Exhausted,
    StopRequested,
    Superseded,
    StrategyFailed(StrategyError),
    SourceFailed(anyhow::Error),
}

impl Exit {
    fn stopping(run: &TaskLifecycle) -> Self {
        if run.is_superseded() {
            Self::Superseded
        } else {
            Self::StopRequested
        }
    }
}

struct Progress {
    state: ExecutionState,
    events_emitted: u64,
    ticks_skipped: u64,
    resumed_from: Option<i64>,
    last_sequence: Option<i64>,
}

impl Progress {
    fn new(initial_balance: rust_decimal::Decimal) -> Self {
        Self {
            state: ExecutionState::new(initial_balance),
            events_emitted: 0,
            ticks_skipped: 0,
            resumed_from: None,
            last_sequence: None,
        }
    }

    fn outcome(
        self,
        request: &ExecutionRequest,
        status: TaskStatus,
        message: Option<String>,
    ) -> ExecutionOutcome {
        ExecutionOutcome {
            execution_id: request.execution_id.clone(),
            status,
            message,
            ticks_processed: self.state.ticks_processed,
            ticks_skipped: self.ticks_skipped,
            events_emitted: self.events_emitted,
            resumed_from_sequence: self.resumed_from,
            last_snapshot_sequence: self.last_sequence,
            final_state: self.state,
        }
    }
}

pub struct TaskExecutor {
    strategies: StrategyRegistry,
    lifecycle: TaskLifecycleRegistry,
    snapshots: Arc<dyn SnapshotStore>,
    events: Arc<dyn EventStore>,
    config: ExecutorConfig,
}

impl TaskExecutor {
    pub fn new(
        strategies: StrategyRegistry,
        lifecycle: TaskLifecycleRegistry,
        snapshots: Arc<dyn SnapshotStore>,
        events: Arc<dyn EventStore>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            strategies,
            lifecycle,
            snapshots,
            events,
            config,
        }
    }

    #[must_use]
    pub const fn lifecycle(&self) -> &TaskLifecycleRegistry {
        &self.lifecycle
    }

    #[must_use]
    pub const fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    fn clock(&self) -> &dyn Clock {
        self.lifecycle.clock().as_ref()
    }

    fn poll_period(&self) -> Duration {
        Duration::from_millis(self.config.pause_poll_millis.max(1))
    }

    /// Runs `request` to a terminal status.
    ///
    /// Strategy and source failures end the run as FAILED and are reported in
    /// the outcome, not as an error.
    ///
    /// # Errors
    /// Returns an error if the run slot is held by a live worker, if another
    /// worker took the run over while it was executing, or if the terminal
    /// status cannot be written.
    pub async fn run(
        &self,
        request: &ExecutionRequest,
        source: &mut dyn TickSource,
    ) -> Result<ExecutionOutcome> {
        let mut meta = RunMeta::new();
        meta.insert("strategy_id".to_string(), json!(request.strategy_id));
        meta.insert("instrument".to_string(), json!(request.instrument.instrument));
        meta.insert("stop_mode".to_string(), json!(request.stop_mode));

        let mut run = self
            .lifecycle
            .start(
                request.task_name(),
                &request.execution_id,
                StartOptions {
                    external_task_id: request.external_task_id.clone(),
                    worker_id: request.worker_id.clone(),
                    meta,
                },
            )
            .await?;

        let mut progress = Progress::new(request.initial_balance);
        let ctx = StrategyContext {
            instrument: request.instrument.clone(),
            initial_balance: request.initial_balance,
        };
        let mut engine = match self
            .strategies
            .create(&request.strategy_id, &request.strategy_config, &ctx)
        {
            Ok(engine) => engine,
            Err(e) => {
                let message = e.to_string();
                tracing::error!(execution_id = %request.execution_id, "Strategy rejected: {message}");
                run.mark_stopped(TaskStatus::Failed, Some(&message)).await?;
                return Ok(progress.outcome(request, TaskStatus::Failed, Some(message)));
            }
        };

        let result = self
            .drive(request, &mut run, engine.as_mut(), source, &mut progress)
            .await;

        if matches!(result, Ok(Exit::Superseded)) {
            tracing::warn!(
                execution_id = %request.execution_id,
                ticks_processed = progress.state.ticks_processed,
                "Execution abandoned, run was taken over by another worker"
            );
            return Err(LifecycleError::Superseded(run.key().clone()).into());
        }

        let (status, message) = match result {
            Ok(Exit::Exhausted) => match request.kind {
                ExecutionKind::Backtest => (TaskStatus::Completed, None),
                ExecutionKind::Trading => {
                    (TaskStatus::Failed, Some("tick stream ended".to_string()))
                }
            },
            Ok(Exit::StopRequested | Exit::Superseded) => {
                (TaskStatus::Stopped, Some("stop requested".to_string()))
            }
            Ok(Exit::StrategyFailed(e)) => (TaskStatus::Failed, Some(format!("strategy error: {e}"))),
            Ok(Exit::SourceFailed(e)) => {
                (TaskStatus::Failed, Some(format!("tick source failed: {e:#}")))
            }
            Err(e) => (TaskStatus::Failed, Some(format!("{e:#}"))),
        };

        if let Err(e) = capture(engine.as_ref(), &mut progress.state) {
            tracing::warn!(execution_id = %request.execution_id, "Could not capture final state: {e}");
        }
        run.mark_stopped(status, message.as_deref()).await?;

        tracing::info!(
            execution_id = %request.execution_id,
            %status,
            ticks_processed = progress.state.ticks_processed,
            events_emitted = progress.events_emitted,
            balance = %progress.state.current_balance,
            "Execution finished"
        );
        Ok(progress.outcome(request, status, message))
    }

    async fn drive(
        &self,
        request: &ExecutionRequest,
        run: &mut TaskLifecycle,
        engine: &mut dyn StrategyEngine,
        source: &mut dyn TickSource,
        progress: &mut Progress,
    ) -> Result<Exit> {
        let id = request.execution_id.as_str();
        let now = self.clock().now();

        let opening = match self.snapshots.latest(id).await? {
            Some(snapshot) => {
                if let Err(e) = engine.restore(snapshot.state.strategy_state.clone()) {
                    return Ok(Exit::StrategyFailed(e));
                }
                if let Some(at) = snapshot.state.last_tick_timestamp {
                    source.resume_after(at);
                }
                tracing::info!(
                    execution_id = id,
                    sequence = snapshot.sequence,
                    ticks_processed = snapshot.state.ticks_processed,
                    "Resuming from snapshot"
                );
                progress.resumed_from = Some(snapshot.sequence);
                progress.last_sequence = Some(snapshot.sequence);
                progress.state = snapshot.state;
                engine.on_resume(now)
            }
            None => engine.on_start(now),
        };
        match opening {
            Ok(events) => self.record_events(id, &events, progress).await?,
            Err(e) => return Ok(Exit::StrategyFailed(e)),
        }

        let interval = self.config.snapshot_interval_ticks.max(1);
        let mut since_snapshot = 0_u64;
        let mut poll = tokio::time::interval(self.poll_period());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                biased;
                _ = poll.tick() => {
                    if let Some(exit) = self.keep_alive(run, progress).await? {
                        break exit;
                    }
                    if run.is_paused(false).await? {
                        if let Some(exit) = self.hold_while_paused(id, run, engine, source, progress).await? {
                            break exit;
                        }
                    }
                }
                next = source.next_tick() => {
                    let tick = match next {
                        Ok(Some(tick)) => tick,
                        Ok(None) => break Exit::Exhausted,
                        Err(e) => break Exit::SourceFailed(e),
                    };
                    let events = match engine.on_tick(&tick) {
                        Ok(events) => events,
                        Err(e) => break Exit::StrategyFailed(e),
                    };
                    progress.state.ticks_processed += 1;
                    progress.state.last_tick_timestamp = Some(tick.timestamp);
                    self.record_events(id, &events, progress).await?;

                    since_snapshot += 1;
                    if since_snapshot >= interval {
                        since_snapshot = 0;
                        if !self.checkpoint(id, run, engine, progress).await?
                            || run.should_stop(true).await?
                        {
                            break Exit::stopping(run);
                        }
                    } else if let Some(exit) = self.keep_alive(run, progress).await? {
                        break exit;
                    }
                }
            }
        };

        match exit {
            Exit::Exhausted | Exit::StopRequested => {
                let immediate = matches!(exit, Exit::StopRequested)
                    && request.stop_mode == StopMode::Immediate;
                if !immediate {
                    let at = self.event_time(request, progress);
                    match engine.on_stop(at, request.stop_mode.closes_positions()) {
                        Ok(events) => self.record_events(id, &events, progress).await?,
                        Err(e) => return Ok(Exit::StrategyFailed(e)),
                    }
                    if !self.checkpoint(id, run, engine, progress).await? {
                        return Ok(Exit::Superseded);
                    }
                }
            }
            Exit::SourceFailed(_) => {
                if !self.checkpoint(id, run, engine, progress).await? {
                    return Ok(Exit::Superseded);
                }
            }
            Exit::Superseded | Exit::StrategyFailed(_) => {}
        }
        Ok(exit)
    }

    /// Blocks until the pause flag clears. Live ticks arriving meanwhile are
    /// drained and counted as skipped.
    async fn hold_while_paused(
        &self,
        id: &str,
        run: &mut TaskLifecycle,
        engine: &mut dyn StrategyEngine,
        source: &mut dyn TickSource,
        progress: &mut Progress,
    ) -> Result<Option<Exit>> {
        match engine.on_pause(self.clock().now()) {
            Ok(events) => self.record_events(id, &events, progress).await?,
            Err(e) => return Ok(Some(Exit::StrategyFailed(e))),
        }
        if !run.heartbeat(Some("paused"), None, true).await? && run.should_stop(true).await? {
            return Ok(Some(Exit::stopping(run)));
        }
        tracing::info!(execution_id = id, "Execution paused");

        let period = self.poll_period();
        loop {
            let idle = if source.is_live() {
                match tokio::time::timeout(period, source.next_tick()).await {
                    Ok(Ok(Some(_))) => {
                        progress.ticks_skipped += 1;
                        false
                    }
                    Ok(Ok(None)) => return Ok(Some(Exit::Exhausted)),
                    Ok(Err(e)) => return Ok(Some(Exit::SourceFailed(e))),
                    Err(_) => true,
                }
            } else {
                tokio::time::sleep(period).await;
                true
            };

            if run.should_stop(idle).await? {
                return Ok(Some(Exit::stopping(run)));
            }
            if !run.is_paused(idle).await? {
                break;
            }
            run.heartbeat(Some("paused"), None, false).await?;
        }

        match engine.on_resume(self.clock().now()) {
            Ok(events) => self.record_events(id, &events, progress).await?,
            Err(e) => return Ok(Some(Exit::StrategyFailed(e))),
        }
        tracing::info!(
            execution_id = id,
            ticks_skipped = progress.ticks_skipped,
            "Execution resumed"
        );
        Ok(None)
    }

    /// Throttled heartbeat and stop check, independent of the tick rate.
    async fn keep_alive(
        &self,
        run: &mut TaskLifecycle,
        progress: &Progress,
    ) -> Result<Option<Exit>> {
        let mut meta = RunMeta::new();
        meta.insert(
            "ticks_processed".to_string(),
            json!(progress.state.ticks_processed),
        );
        run.heartbeat(None, Some(&meta), false).await?;
        if run.should_stop(false).await? {
            return Ok(Some(Exit::stopping(run)));
        }
        Ok(None)
    }

    /// Writes a snapshot and forces a heartbeat. Returns false, without
    /// writing, when the run has been taken over.
    async fn checkpoint(
        &self,
        id: &str,
        run: &mut TaskLifecycle,
        engine: &dyn StrategyEngine,
        progress: &mut Progress,
    ) -> Result<bool> {
        run.should_stop(true).await?;
        if run.is_superseded() {
            return Ok(false);
        }
        capture(engine, &mut progress.state)?;
        let sequence = self
            .snapshots
            .append(id, &progress.state, self.clock().now())
            .await?;
        progress.last_sequence = Some(sequence);

        let mut meta = RunMeta::new();
        meta.insert(
            "ticks_processed".to_string(),
            json!(progress.state.ticks_processed),
        );
        meta.insert("snapshot_sequence".to_string(), json!(sequence));
        let message = format!("{} ticks processed", progress.state.ticks_processed);
        run.heartbeat(Some(&message), Some(&meta), true).await?;

        tracing::debug!(
            execution_id = id,
            sequence,
            ticks_processed = progress.state.ticks_processed,
            "Snapshot written"
        );
        Ok(true)
    }

    async fn record_events(
        &self,
        id: &str,
        events: &[StrategyEvent],
        progress: &mut Progress,
    ) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.events.append(id, events, self.clock().now()).await?;
        progress.events_emitted += events.len() as u64;
        for event in events {
            tracing::debug!(execution_id = id, event = event.event_type(), "Strategy event");
        }
        Ok(())
    }

    /// Backtests stamp stop events with simulated time.
    fn event_time(&self, request: &ExecutionRequest, progress: &Progress) -> DateTime<Utc> {
        match (request.kind, progress.state.last_tick_timestamp) {
            (ExecutionKind::Backtest, Some(at)) => at,
            _ => self.clock().now(),
        }
    }
}

fn capture(engine: &dyn StrategyEngine, state: &mut ExecutionState) -> Result<(), StrategyError> {
    state.strategy_state = engine.snapshot_state()?;
    state.current_balance = engine.balance();
    state.open_positions = engine.open_positions();
    state.metrics = engine.metrics();
    Ok(())
}
