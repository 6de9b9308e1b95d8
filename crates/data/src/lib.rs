//! Persistence for the trade engine.
//!
//! This crate provides:
//! - Models for task runs, execution snapshots, strategy events and accounts
//! - Store traits used by the orchestration layer
//! - An in-memory store for tests and local backtests
//! - `PostgreSQL` repositories and migrations
//! - CSV import/export of ticks

pub mod csv_storage;
pub mod database;
pub mod memory;
pub mod models;
pub mod repositories;
pub mod store;

pub use csv_storage::CsvStorage;
pub use database::DatabaseClient;
pub use memory::MemoryStore;
pub use models::{
    BrokerAccount, ExecutionSnapshot, ExecutionState, RunKey, RunMeta, RunRecord, RunStart,
    StartOutcome, StrategyEventRecord, TaskStatus,
};
pub use repositories::Repositories;
pub use store::{AccountStore, EventStore, RunRecordStore, SnapshotStore, TickStore};
