//! Queue handlers that run the publisher and subscriber tasks.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use trade_engine_orchestrator::{
    process_identity, StartOptions, StreamTaskArgs, TaskHandler, TaskRequest,
};
use uuid::Uuid;

use crate::publisher::TickPublisher;
use crate::report::TaskExit;
use crate::subscriber::TickSubscriber;

fn start_options(task_id: Uuid) -> StartOptions {
    StartOptions {
        external_task_id: Some(task_id.to_string()),
        worker_id: Some(process_identity()),
        ..StartOptions::default()
    }
}

fn parse_args(request: &TaskRequest) -> Result<StreamTaskArgs> {
    serde_json::from_value(request.args.clone())
        .with_context(|| format!("Invalid arguments for {}", request.task_name))
}

pub struct PublisherTaskHandler {
    publisher: Arc<TickPublisher>,
}

impl PublisherTaskHandler {
    pub fn new(publisher: Arc<TickPublisher>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl TaskHandler for PublisherTaskHandler {
    async fn handle(&self, task_id: Uuid, request: TaskRequest) -> Result<()> {
        let args = parse_args(&request)?;
        let report = self.publisher.run(&args, start_options(task_id)).await?;
        if let TaskExit::Failed(message) = report.exit {
            anyhow::bail!("publisher for {} failed: {message}", args.instance_key());
        }
        Ok(())
    }
}

pub struct SubscriberTaskHandler {
    subscriber: Arc<TickSubscriber>,
}

impl SubscriberTaskHandler {
    pub fn new(subscriber: Arc<TickSubscriber>) -> Self {
        Self { subscriber }
    }
}

#[async_trait]
impl TaskHandler for SubscriberTaskHandler {
    async fn handle(&self, task_id: Uuid, request: TaskRequest) -> Result<()> {
        let args = parse_args(&request)?;
        let report = self.subscriber.run(&args, start_options(task_id)).await?;
        if let TaskExit::Failed(message) = report.exit {
            anyhow::bail!("subscriber for {} failed: {message}", args.instance_key());
        }
        Ok(())
    }
}
