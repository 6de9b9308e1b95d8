//! Data models for task runs, executions and accounts.

pub mod account;
pub mod execution;
pub mod run_record;

pub use account::BrokerAccount;
pub use execution::{ExecutionSnapshot, ExecutionState, StrategyEventRecord};
pub use run_record::{RunKey, RunMeta, RunRecord, RunStart, StartOutcome, TaskStatus};
