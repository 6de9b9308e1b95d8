//! CLI commands for the trade engine.

pub mod backtest;
pub mod control;
pub mod import_ticks;
pub mod worker;

pub use backtest::{run_backtest, BacktestArgs};
pub use control::{
    run_cancel, run_recover, run_set_paused, run_status, CancelArgs, RunTarget, StatusArgs,
};
pub use import_ticks::{run_import_ticks, ImportTicksArgs};
pub use worker::{run_worker, WorkerArgs};
