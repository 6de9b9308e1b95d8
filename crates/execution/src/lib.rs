//! Strategy execution for the trade engine.
//!
//! [`TaskExecutor`] runs a registered strategy over a [`TickSource`]: stored
//! ticks for backtests, the live pub/sub channel for trading. Progress is
//! checkpointed as execution snapshots so an interrupted run resumes where its
//! last snapshot left off.

pub mod executor;
pub mod handler;
pub mod request;
pub mod source;

pub use executor::TaskExecutor;
pub use handler::ExecutionTaskHandler;
pub use request::{ExecutionKind, ExecutionOutcome, ExecutionRequest, StopMode};
pub use source::{HistoricalReplaySource, LiveTickSource, TickSource, VecTickSource};
