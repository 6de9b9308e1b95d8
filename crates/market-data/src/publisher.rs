//! Tick publisher task.
//!
//! Streams one account/instrument from the market gateway and republishes
//! every normalized tick on the channel for that pair. Only the holder of the
//! publisher lock streams; everyone else exits immediately.

use anyhow::Result;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::time::{interval_at, Instant};
use trade_engine_core::{MarketGateway, PubSub, TickPipelineConfig};
use trade_engine_orchestrator::tasks::{publisher_lock_key, TICK_PUBLISHER_TASK};
use trade_engine_orchestrator::{
    DistributedLock, LifecycleError, StartOptions, StreamTaskArgs, TaskLifecycle,
    TaskLifecycleRegistry,
};

use crate::keepalive::{keepalive, release};
use crate::report::{PublisherReport, TaskExit};

pub struct TickPublisher {
    gateway: Arc<dyn MarketGateway>,
    bus: Arc<dyn PubSub>,
    lock: Arc<dyn DistributedLock>,
    lifecycle: TaskLifecycleRegistry,
    config: TickPipelineConfig,
}

impl TickPublisher {
    pub fn new(
        gateway: Arc<dyn MarketGateway>,
        bus: Arc<dyn PubSub>,
        lock: Arc<dyn DistributedLock>,
        lifecycle: TaskLifecycleRegistry,
        config: TickPipelineConfig,
    ) -> Self {
        Self {
            gateway,
            bus,
            lock,
            lifecycle,
            config,
        }
    }

    /// Runs until stopped, the stream ends or fails, or the lock is lost.
    ///
    /// Losing the lock race is a normal outcome reported as
    /// [`TaskExit::LockHeld`], not an error.
    ///
    /// # Errors
    /// Returns an error only when the lock store or run store is unreachable
    /// before streaming begins.
    pub async fn run(&self, args: &StreamTaskArgs, options: StartOptions) -> Result<PublisherReport> {
        let lock_key = publisher_lock_key(&args.account_id, &args.instrument);
        if !self.lock.acquire(&lock_key, self.config.lock_ttl()).await? {
            tracing::info!(
                account_id = %args.account_id,
                instrument = %args.instrument,
                holder = self.lock.value(),
                "Publisher lock held elsewhere, exiting"
            );
            return Ok(PublisherReport::new(TaskExit::LockHeld));
        }

        let mut run = match self
            .lifecycle
            .start(TICK_PUBLISHER_TASK, &args.instance_key(), options)
            .await
        {
            Ok(run) => run,
            Err(LifecycleError::AlreadyRunning { .. }) => {
                release(self.lock.as_ref(), &lock_key).await;
                return Ok(PublisherReport::new(TaskExit::AlreadyRunning));
            }
            Err(e) => {
                release(self.lock.as_ref(), &lock_key).await;
                return Err(e.into());
            }
        };

        let mut report = PublisherReport::new(TaskExit::StreamEnded);
        let exit = self.pump(&mut run, args, &lock_key, &mut report).await;
        report.exit = exit;

        match &report.exit {
            TaskExit::Failed(message) => tracing::error!(
                account_id = %args.account_id,
                instrument = %args.instrument,
                "Publisher failed: {message}"
            ),
            exit => tracing::info!(
                account_id = %args.account_id,
                instrument = %args.instrument,
                published = report.published,
                skipped = report.skipped,
                "Publisher exiting: {exit}"
            ),
        }

        let message = report.exit.to_string();
        if run.is_superseded() {
            tracing::warn!(key = %run.key(), "Run was taken over, leaving its record alone");
        } else if let Err(e) = run
            .mark_stopped(report.exit.terminal_status(), Some(&message))
            .await
        {
            tracing::error!("Failed to record publisher stop: {e}");
        }
        if report.exit != TaskExit::LockLost {
            release(self.lock.as_ref(), &lock_key).await;
        }
        Ok(report)
    }

    async fn pump(
        &self,
        run: &mut TaskLifecycle,
        args: &StreamTaskArgs,
        lock_key: &str,
        report: &mut PublisherReport,
    ) -> TaskExit {
        let channel = self.config.channel_name(&args.account_id, &args.instrument);
        let mut stream = match self.gateway.stream(&args.account_id, &args.instrument).await {
            Ok(stream) => stream,
            Err(e) => return TaskExit::Failed(format!("stream open failed: {e:#}")),
        };
        tracing::info!(%channel, "Publisher streaming");

        let period = self.config.keepalive_interval();
        let mut keepalive_timer = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                item = stream.next() => {
                    let raw = match item {
                        None => return TaskExit::StreamEnded,
                        Some(Err(e)) => return TaskExit::Failed(format!("stream error: {e:#}")),
                        Some(Ok(raw)) => raw,
                    };

                    match raw.normalize() {
                        Some(tick) => {
                            let payload = match tick.to_wire() {
                                Ok(payload) => payload,
                                Err(e) => return TaskExit::Failed(format!("encode failed: {e}")),
                            };
                            if let Err(e) = self.bus.publish(&channel, &payload).await {
                                return TaskExit::Failed(format!("publish failed: {e:#}"));
                            }
                            report.published += 1;
                        }
                        None => report.skipped += 1,
                    }

                    match run.should_stop(false).await {
                        Ok(true) => return TaskExit::StopRequested,
                        Ok(false) => {}
                        Err(e) => return TaskExit::Failed(format!("stop check failed: {e}")),
                    }
                }
                _ = keepalive_timer.tick() => {
                    let counters = [("published", report.published), ("skipped", report.skipped)];
                    if let Some(exit) = keepalive(
                        run,
                        self.lock.as_ref(),
                        lock_key,
                        self.config.lock_ttl(),
                        &counters,
                    )
                    .await
                    {
                        return exit;
                    }
                }
            }
        }
    }
}
