//! `PostgreSQL` implementations of the store traits.
//!
//! Each repository owns a clone of the pool and maps one table.

pub mod account_repo;
pub mod event_repo;
pub mod run_record_repo;
pub mod snapshot_repo;
pub mod tick_repo;

pub use account_repo::AccountRepository;
pub use event_repo::StrategyEventRepository;
pub use run_record_repo::RunRecordRepository;
pub use snapshot_repo::SnapshotRepository;
pub use tick_repo::TickRepository;

use sqlx::PgPool;

/// Creates all repositories from a single database pool.
pub struct Repositories {
    pub runs: RunRecordRepository,
    pub ticks: TickRepository,
    pub snapshots: SnapshotRepository,
    pub events: StrategyEventRepository,
    pub accounts: AccountRepository,
}

impl Repositories {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            runs: RunRecordRepository::new(pool.clone()),
            ticks: TickRepository::new(pool.clone()),
            snapshots: SnapshotRepository::new(pool.clone()),
            events: StrategyEventRepository::new(pool.clone()),
            accounts: AccountRepository::new(pool),
        }
    }
}
