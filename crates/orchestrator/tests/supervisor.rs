use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use trade_engine_core::{ManualClock, TickPipelineConfig};
use trade_engine_data::{AccountStore, BrokerAccount, MemoryStore};
use trade_engine_orchestrator::tasks::{
    publisher_lock_key, TICK_PUBLISHER_TASK, TICK_SUBSCRIBER_TASK,
};
use trade_engine_orchestrator::{
    AccountRegistrar, DistributedLock, LockTable, MemoryLock, StreamTaskArgs, TaskHandle,
    TaskQueue, TaskRequest, TickSupervisor,
};
use uuid::Uuid;

#[derive(Default)]
struct RecordingQueue {
    submitted: Mutex<Vec<TaskRequest>>,
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn submit(&self, request: TaskRequest) -> Result<TaskHandle> {
        let handle = TaskHandle {
            task_id: Uuid::new_v4(),
            task_name: request.task_name.clone(),
            instance_key: request.instance_key.clone(),
            deduplicated: false,
        };
        self.submitted.lock().push(request);
        Ok(handle)
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    queue: Arc<RecordingQueue>,
    other_worker: MemoryLock,
    supervisor: Arc<TickSupervisor>,
}

fn fixture(config: TickPipelineConfig) -> Fixture {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap(),
    ));
    let table = LockTable::new();
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(RecordingQueue::default());
    let supervisor = Arc::new(TickSupervisor::new(
        store.clone(),
        Arc::new(MemoryLock::new(table.clone(), clock.clone(), "supervisor:1")),
        queue.clone(),
        config,
    ));
    Fixture {
        store,
        queue,
        other_worker: MemoryLock::new(table, clock, "worker:2"),
        supervisor,
    }
}

#[tokio::test]
async fn idle_without_any_account() {
    let f = fixture(TickPipelineConfig::default());
    let report = f.supervisor.run_cycle().await.unwrap();
    assert!(report.account_id.is_none());
    assert!(f.queue.submitted.lock().is_empty());
}

#[tokio::test]
async fn enqueues_publisher_and_subscriber_for_newest_live_account() {
    let f = fixture(TickPipelineConfig::default());
    let at = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
    f.store.insert(&BrokerAccount::live("old", at)).await.unwrap();
    f.store
        .insert(&BrokerAccount::live("new", at + chrono::Duration::hours(1)))
        .await
        .unwrap();

    let report = f.supervisor.run_cycle().await.unwrap();
    assert_eq!(report.account_id.as_deref(), Some("new"));

    let submitted = f.queue.submitted.lock().clone();
    let names: Vec<&str> = submitted.iter().map(|r| r.task_name.as_str()).collect();
    assert_eq!(names, vec![TICK_PUBLISHER_TASK, TICK_SUBSCRIBER_TASK]);
    let args: StreamTaskArgs = serde_json::from_value(submitted[0].args.clone()).unwrap();
    assert_eq!(args, StreamTaskArgs::new("new", "EUR_USD"));
    assert_eq!(submitted[0].instance_key, "new:EUR_USD");
}

#[tokio::test]
async fn held_locks_are_left_alone() {
    let f = fixture(TickPipelineConfig::default());
    let at = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
    f.store.insert(&BrokerAccount::live("acct", at)).await.unwrap();

    let key = publisher_lock_key("acct", "EUR_USD");
    assert!(f
        .other_worker
        .acquire(&key, Duration::from_secs(30))
        .await
        .unwrap());

    let report = f.supervisor.run_cycle().await.unwrap();
    assert_eq!(report.already_running, vec![key]);
    assert_eq!(report.enqueued.len(), 1);
    assert_eq!(f.queue.submitted.lock()[0].task_name, TICK_SUBSCRIBER_TASK);
}

#[tokio::test]
async fn falls_back_to_configured_account() {
    let config = TickPipelineConfig {
        fallback_account_id: Some("fallback".to_string()),
        instruments: vec!["EUR_USD".to_string(), "USD_JPY".to_string()],
        ..TickPipelineConfig::default()
    };
    let f = fixture(config);

    let report = f.supervisor.run_cycle().await.unwrap();
    assert_eq!(report.account_id.as_deref(), Some("fallback"));
    assert_eq!(report.enqueued.len(), 4);
}

#[tokio::test]
async fn first_live_account_bootstraps_immediately() {
    let f = fixture(TickPipelineConfig::default());
    let registrar = AccountRegistrar::new(f.store.clone()).with_hook(f.supervisor.clone());
    let at = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();

    registrar.create(BrokerAccount::live("first", at)).await.unwrap();
    assert_eq!(f.queue.submitted.lock().len(), 2);

    registrar.create(BrokerAccount::live("second", at)).await.unwrap();
    assert_eq!(f.queue.submitted.lock().len(), 2);
}
