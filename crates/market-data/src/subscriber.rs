//! Tick subscriber task.
//!
//! Consumes the tick channel of one account/instrument and persists ticks in
//! batches. Batches flush on size or on a timer, whichever comes first, and
//! once more on the way out before the lock is released. The store upsert is
//! keyed by `(instrument, timestamp)` so redelivered ticks never duplicate.

use anyhow::Result;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::time::{interval_at, Instant};
use trade_engine_core::{PubSub, Tick, TickPipelineConfig};
use trade_engine_data::TickStore;
use trade_engine_orchestrator::tasks::{subscriber_lock_key, TICK_SUBSCRIBER_TASK};
use trade_engine_orchestrator::{
    DistributedLock, LifecycleError, StartOptions, StreamTaskArgs, TaskLifecycle,
    TaskLifecycleRegistry,
};

use crate::keepalive::{keepalive, release};
use crate::report::{SubscriberReport, TaskExit};

/// In-memory batch awaiting persistence.
#[derive(Debug)]
pub struct TickBuffer {
    ticks: Vec<Tick>,
    capacity: usize,
}

impl TickBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ticks: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, tick: Tick) {
        self.ticks.push(tick);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    /// Size-based flush trigger.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.ticks.len() >= self.capacity
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Tick] {
        &self.ticks
    }

    pub fn clear(&mut self) {
        self.ticks.clear();
    }
}

pub struct TickSubscriber {
    bus: Arc<dyn PubSub>,
    store: Arc<dyn TickStore>,
    lock: Arc<dyn DistributedLock>,
    lifecycle: TaskLifecycleRegistry,
    config: TickPipelineConfig,
}

impl TickSubscriber {
    pub fn new(
        bus: Arc<dyn PubSub>,
        store: Arc<dyn TickStore>,
        lock: Arc<dyn DistributedLock>,
        lifecycle: TaskLifecycleRegistry,
        config: TickPipelineConfig,
    ) -> Self {
        Self {
            bus,
            store,
            lock,
            lifecycle,
            config,
        }
    }

    /// Runs until stopped, the subscription ends, a flush fails, or the lock is lost.
    ///
    /// # Errors
    /// Returns an error only when the lock store or run store is unreachable
    /// before consuming begins.
    pub async fn run(
        &self,
        args: &StreamTaskArgs,
        options: StartOptions,
    ) -> Result<SubscriberReport> {
        let lock_key = subscriber_lock_key(&args.account_id, &args.instrument);
        if !self.lock.acquire(&lock_key, self.config.lock_ttl()).await? {
            tracing::info!(
                account_id = %args.account_id,
                instrument = %args.instrument,
                "Subscriber lock held elsewhere, exiting"
            );
            return Ok(SubscriberReport::new(TaskExit::LockHeld));
        }

        let mut run = match self
            .lifecycle
            .start(TICK_SUBSCRIBER_TASK, &args.instance_key(), options)
            .await
        {
            Ok(run) => run,
            Err(LifecycleError::AlreadyRunning { .. }) => {
                release(self.lock.as_ref(), &lock_key).await;
                return Ok(SubscriberReport::new(TaskExit::AlreadyRunning));
            }
            Err(e) => {
                release(self.lock.as_ref(), &lock_key).await;
                return Err(e.into());
            }
        };

        let mut report = SubscriberReport::new(TaskExit::StreamEnded);
        let mut buffer = TickBuffer::new(self.config.flush_batch_size);
        let mut exit = self
            .consume(&mut run, args, &lock_key, &mut buffer, &mut report)
            .await;

        if !buffer.is_empty() {
            if let Err(e) = self.flush(&mut buffer, &mut report).await {
                tracing::error!(pending = buffer.len(), "Final flush failed: {e:#}");
                exit = TaskExit::Failed(format!("final flush failed: {e:#}"));
            }
        }
        report.exit = exit;

        tracing::info!(
            account_id = %args.account_id,
            instrument = %args.instrument,
            received = report.received,
            malformed = report.malformed,
            stored = report.stored,
            "Subscriber exiting: {}",
            report.exit
        );

        let message = report.exit.to_string();
        if run.is_superseded() {
            tracing::warn!(key = %run.key(), "Run was taken over, leaving its record alone");
        } else if let Err(e) = run
            .mark_stopped(report.exit.terminal_status(), Some(&message))
            .await
        {
            tracing::error!("Failed to record subscriber stop: {e}");
        }
        if report.exit != TaskExit::LockLost {
            release(self.lock.as_ref(), &lock_key).await;
        }
        Ok(report)
    }

    async fn consume(
        &self,
        run: &mut TaskLifecycle,
        args: &StreamTaskArgs,
        lock_key: &str,
        buffer: &mut TickBuffer,
        report: &mut SubscriberReport,
    ) -> TaskExit {
        let channel = self.config.channel_name(&args.account_id, &args.instrument);
        let mut messages = match self.bus.subscribe(&channel).await {
            Ok(messages) => messages,
            Err(e) => return TaskExit::Failed(format!("subscribe failed: {e:#}")),
        };
        tracing::info!(%channel, "Subscriber consuming");

        let flush_period = self.config.flush_interval();
        let mut flush_timer = interval_at(Instant::now() + flush_period, flush_period);
        let keepalive_period = self.config.keepalive_interval();
        let mut keepalive_timer = interval_at(Instant::now() + keepalive_period, keepalive_period);

        loop {
            tokio::select! {
                message = messages.next() => {
                    let Some(payload) = message else {
                        return TaskExit::StreamEnded;
                    };
                    report.received += 1;

                    match Tick::from_wire(&payload) {
                        Ok(tick) => buffer.push(tick),
                        Err(e) => {
                            report.malformed += 1;
                            tracing::debug!(%channel, "Dropping malformed tick: {e}");
                        }
                    }

                    if buffer.is_full() {
                        if let Err(e) = self.flush(buffer, report).await {
                            return TaskExit::Failed(format!("flush failed: {e:#}"));
                        }
                    }

                    match run.should_stop(false).await {
                        Ok(true) => return TaskExit::StopRequested,
                        Ok(false) => {}
                        Err(e) => return TaskExit::Failed(format!("stop check failed: {e}")),
                    }
                }
                _ = flush_timer.tick() => {
                    if !buffer.is_empty() {
                        if let Err(e) = self.flush(buffer, report).await {
                            return TaskExit::Failed(format!("flush failed: {e:#}"));
                        }
                    }
                }
                _ = keepalive_timer.tick() => {
                    let counters = [
                        ("received", report.received),
                        ("malformed", report.malformed),
                        ("stored", report.stored),
                    ];
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

    /// Persists the buffer. On failure the buffer is kept intact.
    async fn flush(&self, buffer: &mut TickBuffer, report: &mut SubscriberReport) -> Result<()> {
        let inserted = self.store.upsert_batch(buffer.as_slice()).await?;
        report.flushes += 1;
        report.flushed += buffer.len() as u64;
        report.stored += inserted;
        tracing::debug!(batch = buffer.len(), inserted, "Tick batch flushed");
        buffer.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    #[test]
    fn buffer_reports_full_at_capacity() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut buffer = TickBuffer::new(2);
        buffer.push(Tick::new("EUR_USD", t0, dec!(1.1), dec!(1.2)));
        assert!(!buffer.is_full());
        buffer.push(Tick::new("EUR_USD", t0, dec!(1.1), dec!(1.2)));
        assert!(buffer.is_full());
        buffer.clear();
        assert!(buffer.is_empty());
    }

    #[test]
    fn zero_capacity_flushes_every_tick() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut buffer = TickBuffer::new(0);
        buffer.push(Tick::new("EUR_USD", t0, dec!(1.1), dec!(1.2)));
        assert!(buffer.is_full());
    }
}
