//! Coordination layer for the trade engine.
//!
//! - [`lifecycle`]: run records, heartbeats, cooperative cancellation
//! - [`lock`]: distributed TTL locks (Redis and in-memory)
//! - [`queue`]: task submission and local dispatch
//! - [`supervisor`]: keeps one tick publisher and one subscriber alive
//! - [`accounts`]: account creation hook that bootstraps the pipeline
//! - [`recovery`]: start-up cleanup of runs orphaned by a restart

pub mod accounts;
pub mod lifecycle;
pub mod lock;
pub mod queue;
pub mod recovery;
pub mod supervisor;
pub mod tasks;

pub use accounts::{AccountCreatedHook, AccountRegistrar};
pub use lifecycle::{LifecycleError, StartOptions, TaskLifecycle, TaskLifecycleRegistry};
pub use lock::{process_identity, DistributedLock, LockTable, MemoryLock, RedisLock};
pub use queue::{LocalTaskQueue, TaskHandle, TaskHandler, TaskQueue, TaskRequest};
pub use recovery::{recover_orphaned_runs, INTERRUPTED_MESSAGE};
pub use supervisor::{SupervisorReport, TickSupervisor};
pub use tasks::StreamTaskArgs;
