//! Task queue seam.
//!
//! Producers (the tick supervisor, the CLI) submit named tasks; workers run
//! them through registered handlers. Tasks must be idempotent under
//! re-submission of the same instance key: the run record and the lock are
//! what actually gate execution.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_name: String,
    pub instance_key: String,
    pub args: Value,
}

impl TaskRequest {
    /// # Errors
    /// Returns an error if `args` cannot be serialized.
    pub fn new<A: Serialize>(
        task_name: impl Into<String>,
        instance_key: impl Into<String>,
        args: &A,
    ) -> Result<Self> {
        Ok(Self {
            task_name: task_name.into(),
            instance_key: instance_key.into(),
            args: serde_json::to_value(args)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub task_id: Uuid,
    pub task_name: String,
    pub instance_key: String,
    /// True when the submission joined an already in-flight task.
    pub deduplicated: bool,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn submit(&self, request: TaskRequest) -> Result<TaskHandle>;
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task_id: Uuid, request: TaskRequest) -> Result<()>;
}

type InFlight = Arc<Mutex<HashMap<(String, String), Uuid>>>;

/// Runs submitted tasks on the local tokio runtime.
#[derive(Default)]
pub struct LocalTaskQueue {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    in_flight: InFlight,
    spawned: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalTaskQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_handler(mut self, task_name: &str, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(task_name.to_string(), handler);
        self
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Waits for every task spawned so far to finish.
    pub async fn join_all(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.spawned.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Task panicked: {e}");
            }
        }
    }

    /// Aborts every spawned task.
    pub fn abort_all(&self) {
        for handle in self.spawned.lock().drain(..) {
            handle.abort();
        }
        self.in_flight.lock().clear();
    }
}

#[async_trait]
impl TaskQueue for LocalTaskQueue {
    async fn submit(&self, request: TaskRequest) -> Result<TaskHandle> {
        let handler = self
            .handlers
            .get(&request.task_name)
            .cloned()
            .with_context(|| format!("No handler registered for {}", request.task_name))?;

        let slot = (request.task_name.clone(), request.instance_key.clone());
        let task_id = {
            let mut in_flight = self.in_flight.lock();
            if let Some(existing) = in_flight.get(&slot) {
                tracing::debug!(
                    task_name = %request.task_name,
                    instance_key = %request.instance_key,
                    %existing,
                    "Task already in flight"
                );
                return Ok(TaskHandle {
                    task_id: *existing,
                    task_name: request.task_name,
                    instance_key: request.instance_key,
                    deduplicated: true,
                });
            }
            let task_id = Uuid::new_v4();
            in_flight.insert(slot.clone(), task_id);
            task_id
        };

        let handle = TaskHandle {
            task_id,
            task_name: request.task_name.clone(),
            instance_key: request.instance_key.clone(),
            deduplicated: false,
        };

        let in_flight = Arc::clone(&self.in_flight);
        let join = tokio::spawn(async move {
            let task_name = request.task_name.clone();
            let instance_key = request.instance_key.clone();
            if let Err(e) = handler.handle(task_id, request).await {
                tracing::error!(%task_name, %instance_key, %task_id, "Task failed: {e:#}");
            }
            in_flight.lock().remove(&slot);
        });
        self.spawned.lock().push(join);

        tracing::info!(
            task_name = %handle.task_name,
            instance_key = %handle.instance_key,
            task_id = %handle.task_id,
            "Task submitted"
        );
        Ok(handle)
    }
}
