//! Queue handler running backtest and trading tasks.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use trade_engine_core::{PubSub, TickPipelineConfig};
use trade_engine_data::{TaskStatus, TickStore};
use trade_engine_orchestrator::{process_identity, TaskHandler, TaskRequest};
use uuid::Uuid;

use crate::executor::TaskExecutor;
use crate::request::{ExecutionKind, ExecutionRequest};
use crate::source::{HistoricalReplaySource, LiveTickSource, TickSource};

pub struct ExecutionTaskHandler {
    executor: Arc<TaskExecutor>,
    ticks: Arc<dyn TickStore>,
    bus: Option<Arc<dyn PubSub>>,
    pipeline: TickPipelineConfig,
}

impl ExecutionTaskHandler {
    pub fn new(
        executor: Arc<TaskExecutor>,
        ticks: Arc<dyn TickStore>,
        pipeline: TickPipelineConfig,
    ) -> Self {
        Self {
            executor,
            ticks,
            bus: None,
            pipeline,
        }
    }

    /// Enables trading tasks, which read ticks from the live channel.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<dyn PubSub>) -> Self {
        self.bus = Some(bus);
        self
    }

    async fn source(&self, request: &ExecutionRequest) -> Result<Box<dyn TickSource>> {
        let instrument = request.instrument.instrument.as_str();
        match request.kind {
            ExecutionKind::Backtest => Ok(Box::new(
                HistoricalReplaySource::new(
                    self.ticks.clone(),
                    instrument,
                    self.executor.config().replay_page_size,
                )
                .starting_after(request.replay_from)
                .until(request.replay_until),
            )),
            ExecutionKind::Trading => {
                let bus = self
                    .bus
                    .as_ref()
                    .context("Trading tasks need a pub/sub connection")?;
                let account_id = request
                    .account_id
                    .as_deref()
                    .context("Trading tasks need an account_id")?;
                let channel = self.pipeline.channel_name(account_id, instrument);
                let source = LiveTickSource::subscribe(bus.as_ref(), &channel, instrument).await?;
                Ok(Box::new(source))
            }
        }
    }
}

#[async_trait]
impl TaskHandler for ExecutionTaskHandler {
    async fn handle(&self, task_id: Uuid, request: TaskRequest) -> Result<()> {
        let mut execution: ExecutionRequest = serde_json::from_value(request.args.clone())
            .with_context(|| format!("Invalid arguments for {}", request.task_name))?;
        if execution.task_name() != request.task_name {
            anyhow::bail!(
                "{} submitted as {}",
                execution.task_name(),
                request.task_name
            );
        }
        execution.external_task_id.get_or_insert_with(|| task_id.to_string());
        execution.worker_id.get_or_insert_with(process_identity);

        let mut source = self.source(&execution).await?;
        let outcome = self.executor.run(&execution, source.as_mut()).await?;
        if outcome.status == TaskStatus::Failed {
            anyhow::bail!(
                "execution {} failed: {}",
                outcome.execution_id,
                outcome.message.unwrap_or_default()
            );
        }
        Ok(())
    }
}
