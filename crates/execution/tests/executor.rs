use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use trade_engine_core::{
    ExecutorConfig, InstrumentMetadata, LifecycleConfig, ManualClock, PubSub, Tick,
};
use trade_engine_data::{CsvStorage, EventStore, MemoryStore, SnapshotStore, TaskStatus};
use trade_engine_execution::{
    ExecutionKind, ExecutionRequest, LiveTickSource, StopMode, TaskExecutor, TickSource,
    VecTickSource,
};
use trade_engine_market_data::MemoryBus;
use trade_engine_orchestrator::tasks::{BACKTEST_TASK, TRADING_TASK};
use trade_engine_orchestrator::{
    recover_orphaned_runs, LifecycleError, StartOptions, TaskLifecycleRegistry,
    INTERRUPTED_MESSAGE,
};
use trade_engine_strategy::StrategyRegistry;

const INSTRUMENT: &str = "EUR_USD";
const CHANNEL: &str = "ticks:001-live:EUR_USD";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap()
}

fn metadata() -> InstrumentMetadata {
    InstrumentMetadata {
        instrument: INSTRUMENT.to_string(),
        pip_location: -4,
        margin_rate: dec!(0.02),
        display_precision: 5,
    }
}

fn floor_config() -> Value {
    json!({ "entry_signal": { "method": "momentum", "lookback": 1 } })
}

fn tick_at(offset_secs: i64, bid: Decimal) -> Tick {
    Tick::new(INSTRUMENT, t0() + ChronoDuration::seconds(offset_secs), bid, bid + dec!(0.0002))
}

/// Two ticks per one-minute candle, price zig-zagging over 60 pips.
fn zigzag(n: i64) -> Vec<Tick> {
    (0..n)
        .map(|i| {
            let phase = i % 40;
            let pips = if phase < 20 { phase * 3 } else { (40 - phase) * 3 };
            tick_at(i * 30, dec!(1.1000) + Decimal::new(pips, 4))
        })
        .collect()
}

struct World {
    clock: ManualClock,
    store: Arc<MemoryStore>,
    lifecycle: TaskLifecycleRegistry,
    executor: Arc<TaskExecutor>,
}

impl World {
    fn new(snapshot_interval_ticks: u64) -> Self {
        let clock = ManualClock::new(t0());
        let store = Arc::new(MemoryStore::new());
        let lifecycle = TaskLifecycleRegistry::new(
            store.clone(),
            Arc::new(clock.clone()),
            LifecycleConfig::default(),
        );
        let executor = Arc::new(TaskExecutor::new(
            StrategyRegistry::with_defaults(),
            lifecycle.clone(),
            store.clone(),
            store.clone(),
            ExecutorConfig {
                snapshot_interval_ticks,
                ..ExecutorConfig::default()
            },
        ));
        Self {
            clock,
            store,
            lifecycle,
            executor,
        }
    }

    fn backtest(&self, id: &str) -> ExecutionRequest {
        ExecutionRequest::new(id, ExecutionKind::Backtest, "floor", metadata(), dec!(10000))
            .with_config(floor_config())
    }

    fn trading(&self, id: &str, stop_mode: StopMode) -> ExecutionRequest {
        ExecutionRequest::new(id, ExecutionKind::Trading, "floor", metadata(), dec!(10000))
            .with_config(floor_config())
            .with_account("001-live")
            .with_stop_mode(stop_mode)
    }

    async fn status(&self, task_name: &str, id: &str) -> TaskStatus {
        self.lifecycle
            .get(task_name, id)
            .await
            .unwrap()
            .expect("run record")
            .status
    }

    async fn event_types(&self, id: &str) -> Vec<&'static str> {
        EventStore::list(self.store.as_ref(), id)
            .await
            .unwrap()
            .iter()
            .map(|record| record.event.event_type())
            .collect()
    }
}

/// Yields `limit` ticks, then signals and never returns another.
struct StallingSource {
    inner: VecTickSource,
    limit: usize,
    delivered: usize,
    stalled: Arc<Notify>,
}

#[async_trait]
impl TickSource for StallingSource {
    async fn next_tick(&mut self) -> Result<Option<Tick>> {
        if self.delivered == self.limit {
            self.stalled.notify_one();
            std::future::pending::<()>().await;
        }
        self.delivered += 1;
        self.inner.next_tick().await
    }

    fn resume_after(&mut self, timestamp: DateTime<Utc>) {
        self.inner.resume_after(timestamp);
    }
}

/// Live-like source where every tick arrives `gap` of wall time after the
/// previous one. Stalls after the last tick.
struct SparseSource {
    clock: ManualClock,
    gap: ChronoDuration,
    inner: StallingSource,
}

#[async_trait]
impl TickSource for SparseSource {
    async fn next_tick(&mut self) -> Result<Option<Tick>> {
        if self.inner.delivered < self.inner.limit {
            self.clock.advance(self.gap);
        }
        self.inner.next_tick().await
    }

    fn resume_after(&mut self, timestamp: DateTime<Utc>) {
        self.inner.resume_after(timestamp);
    }
}

fn stalling(ticks: Vec<Tick>, stalled: &Arc<Notify>) -> StallingSource {
    StallingSource {
        limit: ticks.len(),
        inner: VecTickSource::new(ticks),
        delivered: 0,
        stalled: stalled.clone(),
    }
}

fn other_worker() -> StartOptions {
    StartOptions {
        worker_id: Some("worker-b".to_string()),
        ..StartOptions::default()
    }
}

async fn publish(bus: &MemoryBus, tick: &Tick) {
    bus.publish(CHANNEL, &tick.to_wire().unwrap()).await.unwrap();
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn backtest_completes_with_periodic_snapshots() {
    let world = World::new(10);
    let request = world.backtest("bt-1");
    let mut source = VecTickSource::new(zigzag(100));

    let outcome = world.executor.run(&request, &mut source).await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Completed);
    assert_eq!(outcome.ticks_processed, 100);
    assert_eq!(outcome.resumed_from_sequence, None);
    // Ten periodic snapshots plus the final one.
    assert_eq!(outcome.last_snapshot_sequence, Some(11));
    assert!(outcome.events_emitted > 0);
    assert_eq!(world.status(BACKTEST_TASK, "bt-1").await, TaskStatus::Completed);

    let latest = SnapshotStore::latest(world.store.as_ref(), "bt-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.sequence, 11);
    assert_eq!(latest.state.ticks_processed, 100);
    assert_eq!(latest.state.last_tick_timestamp, Some(zigzag(100)[99].timestamp));
    assert_eq!(latest.state, outcome.final_state);
    assert_eq!(
        world.event_types("bt-1").await.len() as u64,
        outcome.events_emitted
    );
}

#[tokio::test(start_paused = true)]
async fn crashed_run_resumes_from_last_snapshot() {
    let baseline = {
        let world = World::new(10);
        let mut source = VecTickSource::new(zigzag(100));
        world
            .executor
            .run(&world.backtest("bt-crash"), &mut source)
            .await
            .unwrap()
    };

    let world = World::new(10);
    let stalled = Arc::new(Notify::new());
    let crashed = {
        let executor = world.executor.clone();
        let request = world.backtest("bt-crash");
        let mut source = StallingSource {
            inner: VecTickSource::new(zigzag(100)),
            limit: 75,
            delivered: 0,
            stalled: stalled.clone(),
        };
        tokio::spawn(async move { executor.run(&request, &mut source).await })
    };
    stalled.notified().await;
    crashed.abort();
    assert!(crashed.await.unwrap_err().is_cancelled());

    let latest = SnapshotStore::latest(world.store.as_ref(), "bt-crash")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.sequence, 7);
    assert_eq!(latest.state.ticks_processed, 70);
    assert_eq!(world.status(BACKTEST_TASK, "bt-crash").await, TaskStatus::Running);

    // Worker restart.
    let recovered = recover_orphaned_runs(world.store.as_ref(), &world.clock)
        .await
        .unwrap();
    assert_eq!(recovered, 1);
    let record = world
        .lifecycle
        .get(BACKTEST_TASK, "bt-crash")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, TaskStatus::Stopped);
    assert_eq!(record.status_message.as_deref(), Some(INTERRUPTED_MESSAGE));

    let mut source = VecTickSource::new(zigzag(100));
    let resumed = world
        .executor
        .run(&world.backtest("bt-crash"), &mut source)
        .await
        .unwrap();

    assert_eq!(resumed.status, TaskStatus::Completed);
    assert_eq!(resumed.resumed_from_sequence, Some(7));
    assert_eq!(resumed.ticks_processed, 100);
    assert_eq!(resumed.last_snapshot_sequence, Some(11));
    assert_eq!(resumed.final_state.strategy_state, baseline.final_state.strategy_state);
    assert_eq!(resumed.final_state.current_balance, baseline.final_state.current_balance);
    assert_eq!(resumed.final_state.open_positions, baseline.final_state.open_positions);
}

#[tokio::test(start_paused = true)]
async fn unknown_strategy_fails_before_any_tick() {
    let world = World::new(10);
    let mut request = world.backtest("bt-unknown");
    request.strategy_id = "martingale".to_string();
    let mut source = VecTickSource::new(zigzag(5));

    let outcome = world.executor.run(&request, &mut source).await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Failed);
    assert!(outcome.message.unwrap().contains("martingale"));
    assert_eq!(outcome.ticks_processed, 0);
    assert_eq!(source.remaining(), 5);
    assert_eq!(world.status(BACKTEST_TASK, "bt-unknown").await, TaskStatus::Failed);
    assert!(SnapshotStore::latest(world.store.as_ref(), "bt-unknown")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test(start_paused = true)]
async fn invalid_config_fails_before_any_tick() {
    let world = World::new(10);
    let request = world.backtest("bt-invalid").with_config(json!({ "max_layers": 0 }));
    let mut source = VecTickSource::new(zigzag(5));

    let outcome = world.executor.run(&request, &mut source).await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Failed);
    assert_eq!(source.remaining(), 5);
    let record = world
        .lifecycle
        .get(BACKTEST_TASK, "bt-invalid")
        .await
        .unwrap()
        .unwrap();
    assert!(record
        .status_message
        .unwrap()
        .starts_with("invalid floor config"));
}

#[tokio::test(start_paused = true)]
async fn second_run_of_a_live_execution_is_rejected() {
    let world = World::new(10);
    let bus = MemoryBus::default();
    let request = world.trading("live-dup", StopMode::Graceful);

    let running = {
        let executor = world.executor.clone();
        let request = request.clone();
        let mut source = LiveTickSource::subscribe(&bus, CHANNEL, INSTRUMENT).await.unwrap();
        tokio::spawn(async move { executor.run(&request, &mut source).await })
    };
    settle().await;

    let mut other = VecTickSource::new(Vec::new());
    let err = world.executor.run(&request, &mut other).await.unwrap_err();
    assert!(err.to_string().contains("already running"));

    running.abort();
}

#[tokio::test(start_paused = true)]
async fn graceful_close_flattens_positions_on_stop() {
    let world = World::new(1_000);
    let bus = MemoryBus::default();
    let request = world.trading("live-close", StopMode::GracefulClose);

    let handle = {
        let executor = world.executor.clone();
        let request = request.clone();
        let mut source = LiveTickSource::subscribe(&bus, CHANNEL, INSTRUMENT).await.unwrap();
        tokio::spawn(async move { executor.run(&request, &mut source).await })
    };
    settle().await;

    // Rising closes over two candles trigger a long entry on the third tick.
    for (minute, bid) in [(0, dec!(1.1000)), (1, dec!(1.1005)), (2, dec!(1.1010))] {
        publish(&bus, &tick_at(minute * 60, bid)).await;
    }
    settle().await;
    assert_eq!(world.event_types("live-close").await, vec!["initial_entry"]);

    assert!(world
        .lifecycle
        .request_cancel(TRADING_TASK, "live-close", None)
        .await
        .unwrap());
    world.clock.advance(ChronoDuration::seconds(2));
    tokio::time::sleep(Duration::from_millis(300)).await;

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.status, TaskStatus::Stopped);
    assert_eq!(outcome.ticks_processed, 3);
    assert!(outcome.final_state.open_positions.is_empty());
    // Entered at the 1.1012 ask, closed at the 1.1010 bid.
    assert_eq!(outcome.final_state.current_balance, dec!(9999.8));
    assert_eq!(
        world.event_types("live-close").await,
        vec!["initial_entry", "remove_layer"]
    );
    assert_eq!(world.status(TRADING_TASK, "live-close").await, TaskStatus::Stopped);

    let latest = SnapshotStore::latest(world.store.as_ref(), "live-close")
        .await
        .unwrap()
        .unwrap();
    assert!(latest.state.open_positions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn pause_skips_live_ticks_until_resumed() {
    let world = World::new(1_000);
    let bus = MemoryBus::default();
    let request = world.trading("live-pause", StopMode::Graceful);

    let handle = {
        let executor = world.executor.clone();
        let request = request.clone();
        let mut source = LiveTickSource::subscribe(&bus, CHANNEL, INSTRUMENT).await.unwrap();
        tokio::spawn(async move { executor.run(&request, &mut source).await })
    };
    settle().await;

    let ticks = zigzag(7);
    for tick in &ticks[..3] {
        publish(&bus, tick).await;
    }
    settle().await;

    world
        .lifecycle
        .set_paused(TRADING_TASK, "live-pause", true)
        .await
        .unwrap();
    world.clock.advance(ChronoDuration::seconds(2));
    tokio::time::sleep(Duration::from_millis(300)).await;

    for tick in &ticks[3..5] {
        publish(&bus, tick).await;
    }
    settle().await;

    world
        .lifecycle
        .set_paused(TRADING_TASK, "live-pause", false)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    for tick in &ticks[5..] {
        publish(&bus, tick).await;
    }
    settle().await;

    world
        .lifecycle
        .request_cancel(TRADING_TASK, "live-pause", Some("operator stop"))
        .await
        .unwrap();
    world.clock.advance(ChronoDuration::seconds(2));
    tokio::time::sleep(Duration::from_millis(300)).await;

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.status, TaskStatus::Stopped);
    assert_eq!(outcome.ticks_processed, 5);
    assert_eq!(outcome.ticks_skipped, 2);
    assert_eq!(
        outcome.final_state.last_tick_timestamp,
        Some(ticks[6].timestamp)
    );
}

#[tokio::test(start_paused = true)]
async fn csv_backtest_runs_from_file() {
    let world = World::new(25);
    let file = tempfile::NamedTempFile::new().unwrap();
    let path = file.path().to_str().unwrap().to_string();
    CsvStorage::write_ticks(&path, &zigzag(50)).unwrap();

    let mut source = VecTickSource::from_csv(&path, INSTRUMENT).unwrap();
    assert_eq!(source.remaining(), 50);

    let request = world.backtest("bt-csv").with_stop_mode(StopMode::GracefulClose);
    let outcome = world.executor.run(&request, &mut source).await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Completed);
    assert_eq!(outcome.ticks_processed, 50);
    assert!(outcome.final_state.open_positions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn sparse_and_idle_live_run_keeps_its_slot() {
    // Default snapshot cadence: no checkpoint happens during this test.
    let world = World::new(ExecutorConfig::default().snapshot_interval_ticks);
    let request = world.trading("live-sparse", StopMode::Graceful);
    let stalled = Arc::new(Notify::new());

    let handle = {
        let executor = world.executor.clone();
        let request = request.clone();
        let mut source = SparseSource {
            clock: world.clock.clone(),
            gap: ChronoDuration::seconds(10),
            inner: stalling(zigzag(6), &stalled),
        };
        tokio::spawn(async move { executor.run(&request, &mut source).await })
    };
    stalled.notified().await;

    // Sixty seconds of wall time went by, one tick every ten.
    let record = world.lifecycle.get(TRADING_TASK, "live-sparse").await.unwrap().unwrap();
    assert_eq!(
        record.last_heartbeat_at,
        Some(t0() + ChronoDuration::seconds(60))
    );
    assert_eq!(record.meta["ticks_processed"], json!(6));
    let err = world
        .lifecycle
        .start(TRADING_TASK, "live-sparse", other_worker())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, LifecycleError::AlreadyRunning { .. }));

    // No ticks at all for longer than the stale threshold.
    world.clock.advance(ChronoDuration::seconds(40));
    tokio::time::sleep(Duration::from_millis(300)).await;
    let record = world.lifecycle.get(TRADING_TASK, "live-sparse").await.unwrap().unwrap();
    assert_eq!(
        record.last_heartbeat_at,
        Some(t0() + ChronoDuration::seconds(100))
    );
    assert!(world
        .lifecycle
        .start(TRADING_TASK, "live-sparse", other_worker())
        .await
        .is_err());

    world
        .lifecycle
        .request_cancel(TRADING_TASK, "live-sparse", None)
        .await
        .unwrap();
    world.clock.advance(ChronoDuration::seconds(2));
    tokio::time::sleep(Duration::from_millis(300)).await;
    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.status, TaskStatus::Stopped);
    assert_eq!(outcome.ticks_processed, 6);
}

#[tokio::test(start_paused = true)]
async fn taken_over_execution_exits_without_writing() {
    let world = World::new(1_000);
    let request = world.trading("live-takeover", StopMode::GracefulClose);
    let stalled = Arc::new(Notify::new());

    let handle = {
        let executor = world.executor.clone();
        let request = request.clone();
        let mut source = stalling(zigzag(3), &stalled);
        tokio::spawn(async move { executor.run(&request, &mut source).await })
    };
    stalled.notified().await;
    let events_before = world.event_types("live-takeover").await;

    // The worker looks dead long enough for another one to claim the run.
    world.clock.advance(ChronoDuration::seconds(31));
    let takeover = world
        .lifecycle
        .start(TRADING_TASK, "live-takeover", other_worker())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let err = handle.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("taken over"));

    let record = world
        .lifecycle
        .get(TRADING_TASK, "live-takeover")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, TaskStatus::Running);
    assert_eq!(record.worker_id.as_deref(), Some("worker-b"));
    assert_eq!(record.last_heartbeat_at, Some(takeover.started_at()));
    assert!(SnapshotStore::latest(world.store.as_ref(), "live-takeover")
        .await
        .unwrap()
        .is_none());
    assert_eq!(world.event_types("live-takeover").await, events_before);
}
