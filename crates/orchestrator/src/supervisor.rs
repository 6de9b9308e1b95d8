//! Tick pipeline supervisor.
//!
//! Each cycle resolves the active broker account and, per configured
//! instrument, enqueues a publisher and a subscriber task unless their locks
//! are held. Running cycles concurrently is harmless: the tasks themselves
//! are gated by the lock, so at most one of each ever streams.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use trade_engine_core::TickPipelineConfig;
use trade_engine_data::{AccountStore, BrokerAccount};

use crate::accounts::AccountCreatedHook;
use crate::lock::DistributedLock;
use crate::queue::{TaskHandle, TaskQueue, TaskRequest};
use crate::tasks::{
    publisher_lock_key, subscriber_lock_key, StreamTaskArgs, TICK_PUBLISHER_TASK,
    TICK_SUBSCRIBER_TASK,
};

/// Outcome of one supervisor cycle.
#[derive(Debug, Clone, Default)]
pub struct SupervisorReport {
    pub account_id: Option<String>,
    pub enqueued: Vec<TaskHandle>,
    /// Lock keys found held, whose tasks were left alone.
    pub already_running: Vec<String>,
}

pub struct TickSupervisor {
    accounts: Arc<dyn AccountStore>,
    lock: Arc<dyn DistributedLock>,
    queue: Arc<dyn TaskQueue>,
    config: TickPipelineConfig,
    cached_account: Mutex<Option<String>>,
}

impl TickSupervisor {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        lock: Arc<dyn DistributedLock>,
        queue: Arc<dyn TaskQueue>,
        config: TickPipelineConfig,
    ) -> Self {
        let cached_account = Mutex::new(config.fallback_account_id.clone());
        Self {
            accounts,
            lock,
            queue,
            config,
            cached_account,
        }
    }

    /// Newest LIVE account, else the last account seen, else the configured fallback.
    async fn resolve_account(&self) -> Result<Option<String>> {
        match self.accounts.latest_live().await {
            Ok(Some(account)) => {
                *self.cached_account.lock() = Some(account.account_id.clone());
                Ok(Some(account.account_id))
            }
            Ok(None) => Ok(self.cached_account.lock().clone()),
            Err(e) => {
                let cached = self.cached_account.lock().clone();
                if cached.is_none() {
                    return Err(e);
                }
                tracing::warn!("Account lookup failed, using cached account: {e:#}");
                Ok(cached)
            }
        }
    }

    /// Runs one supervision pass.
    ///
    /// # Errors
    /// Returns an error if the account lookup, a lock probe or a submission fails.
    pub async fn run_cycle(&self) -> Result<SupervisorReport> {
        let Some(account_id) = self.resolve_account().await? else {
            tracing::debug!("No active broker account, nothing to supervise");
            return Ok(SupervisorReport::default());
        };

        let mut report = SupervisorReport {
            account_id: Some(account_id.clone()),
            ..SupervisorReport::default()
        };

        for instrument in &self.config.instruments {
            let args = StreamTaskArgs::new(account_id.as_str(), instrument.as_str());
            let slots = [
                (TICK_PUBLISHER_TASK, publisher_lock_key(&account_id, instrument)),
                (TICK_SUBSCRIBER_TASK, subscriber_lock_key(&account_id, instrument)),
            ];

            for (task_name, lock_key) in slots {
                if self.lock.is_held(&lock_key).await? {
                    report.already_running.push(lock_key);
                    continue;
                }
                let request = TaskRequest::new(task_name, args.instance_key(), &args)?;
                report.enqueued.push(self.queue.submit(request).await?);
            }
        }

        if !report.enqueued.is_empty() {
            tracing::info!(
                account_id = %account_id,
                enqueued = report.enqueued.len(),
                "Supervisor enqueued tick tasks"
            );
        }
        Ok(report)
    }

    /// Runs cycles on the configured interval until `shutdown` flips to true.
    ///
    /// Cycle errors are logged; the next cycle retries.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.supervisor_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = self.config.supervisor_interval_secs,
            instruments = ?self.config.instruments,
            "Tick supervisor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        tracing::error!("Supervisor cycle failed: {e:#}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Tick supervisor stopped");
    }
}

#[async_trait]
impl AccountCreatedHook for TickSupervisor {
    async fn on_first_live_account(&self, account: &BrokerAccount) -> Result<()> {
        *self.cached_account.lock() = Some(account.account_id.clone());
        let report = self.run_cycle().await?;
        tracing::info!(
            account_id = %account.account_id,
            enqueued = report.enqueued.len(),
            "Tick pipeline bootstrapped for first LIVE account"
        );
        Ok(())
    }
}
