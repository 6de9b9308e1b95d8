//! Worker process: recovers orphaned runs, then keeps the tick pipeline alive
//! and serves queued publisher, subscriber, backtest and trading tasks until
//! SIGINT/SIGTERM.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use trade_engine_core::{AppConfig, PubSub, SystemClock};
use trade_engine_data::{BrokerAccount, CsvStorage};
use trade_engine_execution::{ExecutionTaskHandler, TaskExecutor};
use trade_engine_market_data::{
    MemoryBus, PublisherTaskHandler, RedisBus, ReplayGateway, SubscriberTaskHandler,
    TickPublisher, TickSubscriber,
};
use trade_engine_orchestrator::tasks::{
    BACKTEST_TASK, TICK_PUBLISHER_TASK, TICK_SUBSCRIBER_TASK, TRADING_TASK,
};
use trade_engine_orchestrator::{
    process_identity, recover_orphaned_runs, AccountRegistrar, DistributedLock, LocalTaskQueue,
    LockTable, MemoryLock, RedisLock, TaskLifecycleRegistry, TickSupervisor,
};
use trade_engine_strategy::StrategyRegistry;

use crate::context::{load_config, Stores};

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Tick CSV replayed by the market gateway (timestamp,instrument,bid,ask)
    #[arg(long)]
    pub gateway_csv: String,

    /// Delay between replayed ticks, in milliseconds
    #[arg(long, default_value_t = 0)]
    pub pace_millis: u64,

    /// Use in-process store, lock and bus instead of PostgreSQL and Redis
    #[arg(long)]
    pub memory: bool,

    /// Register this LIVE account at start-up
    #[arg(long)]
    pub account: Option<String>,

    /// Seconds to wait for running tasks after a stop request
    #[arg(long, default_value_t = 30)]
    pub drain_secs: u64,
}

/// Runs the worker command.
///
/// # Errors
/// Returns an error if a backend is unreachable or the gateway CSV cannot be read.
pub async fn run_worker(config_path: &str, args: WorkerArgs) -> Result<()> {
    let config = load_config(config_path)?;
    let worker_id = process_identity();
    tracing::info!(%worker_id, memory = args.memory, "Starting worker");

    let (stores, lock, bus) = connect(&config, args.memory).await?;
    let lifecycle = stores.lifecycle(&config);

    let recovered = recover_orphaned_runs(stores.runs.as_ref(), &SystemClock).await?;
    if recovered > 0 {
        tracing::warn!(recovered, "Marked runs orphaned by a previous worker as STOPPED");
    }

    let ticks = CsvStorage::read_ticks(&args.gateway_csv)?;
    tracing::info!(ticks = ticks.len(), path = %args.gateway_csv, "Gateway script loaded");
    let mut gateway = ReplayGateway::new().with_ticks(ticks).hold_open();
    if args.pace_millis > 0 {
        gateway = gateway.with_pacing(Duration::from_millis(args.pace_millis));
    }

    let publisher = Arc::new(TickPublisher::new(
        Arc::new(gateway),
        bus.clone(),
        lock.clone(),
        lifecycle.clone(),
        config.ticks.clone(),
    ));
    let subscriber = Arc::new(TickSubscriber::new(
        bus.clone(),
        stores.ticks.clone(),
        lock.clone(),
        lifecycle.clone(),
        config.ticks.clone(),
    ));
    let executor = Arc::new(TaskExecutor::new(
        StrategyRegistry::with_defaults(),
        lifecycle.clone(),
        stores.snapshots.clone(),
        stores.events.clone(),
        config.executor.clone(),
    ));
    let executions = Arc::new(
        ExecutionTaskHandler::new(executor, stores.ticks.clone(), config.ticks.clone())
            .with_bus(bus.clone()),
    );

    let queue = Arc::new(
        LocalTaskQueue::new()
            .with_handler(
                TICK_PUBLISHER_TASK,
                Arc::new(PublisherTaskHandler::new(publisher)),
            )
            .with_handler(
                TICK_SUBSCRIBER_TASK,
                Arc::new(SubscriberTaskHandler::new(subscriber)),
            )
            .with_handler(BACKTEST_TASK, executions.clone())
            .with_handler(TRADING_TASK, executions),
    );

    let supervisor = Arc::new(TickSupervisor::new(
        stores.accounts.clone(),
        lock,
        queue.clone(),
        config.ticks.clone(),
    ));

    if let Some(account_id) = args.account {
        let registrar =
            AccountRegistrar::new(stores.accounts.clone()).with_hook(supervisor.clone());
        registrar
            .create(BrokerAccount::live(account_id, Utc::now()))
            .await?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor_task = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.run(shutdown_rx).await })
    };

    shutdown_signal().await?;
    tracing::info!("Shutdown requested, stopping supervisor");
    let _ = shutdown_tx.send(true);
    supervisor_task.await.context("Supervisor task panicked")?;

    drain(&lifecycle, &queue, &worker_id, Duration::from_secs(args.drain_secs)).await?;
    tracing::info!("Worker stopped");
    Ok(())
}

async fn connect(
    config: &AppConfig,
    memory: bool,
) -> Result<(Stores, Arc<dyn DistributedLock>, Arc<dyn PubSub>)> {
    if memory {
        let lock = MemoryLock::new(LockTable::new(), Arc::new(SystemClock), process_identity());
        return Ok((Stores::memory(), Arc::new(lock), Arc::new(MemoryBus::default())));
    }
    let stores = Stores::postgres(config).await?;
    let lock = RedisLock::connect(&config.redis.url).await?;
    let bus = RedisBus::connect(&config.redis.url).await?;
    Ok((stores, Arc::new(lock), Arc::new(bus)))
}

/// Asks this worker's active runs to stop, then waits for them.
async fn drain(
    lifecycle: &TaskLifecycleRegistry,
    queue: &LocalTaskQueue,
    worker_id: &str,
    timeout: Duration,
) -> Result<()> {
    for record in lifecycle.list_active(None).await? {
        if record.worker_id.as_deref() != Some(worker_id) {
            continue;
        }
        lifecycle
            .request_cancel(&record.task_name, &record.instance_key, Some("worker shutdown"))
            .await?;
    }

    if tokio::time::timeout(timeout, queue.join_all()).await.is_err() {
        tracing::warn!(
            in_flight = queue.in_flight(),
            "Tasks did not stop in time, aborting"
        );
        queue.abort_all();
    }
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?;
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                tracing::info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        tracing::info!("Received Ctrl+C");
    }
    Ok(())
}
