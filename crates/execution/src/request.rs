use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use trade_engine_core::InstrumentMetadata;
use trade_engine_data::{ExecutionState, TaskStatus};
use trade_engine_orchestrator::tasks::{BACKTEST_TASK, TRADING_TASK};

/// What happens to open positions when a stop is requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopMode {
    /// Stop at once. No stop hook runs and no final snapshot is written.
    Immediate,
    /// Run the stop hook and snapshot, leaving positions open.
    #[default]
    Graceful,
    /// Run the stop hook with every position closed at the last quote.
    GracefulClose,
}

impl StopMode {
    #[must_use]
    pub const fn closes_positions(self) -> bool {
        matches!(self, Self::GracefulClose)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    Backtest,
    Trading,
}

impl ExecutionKind {
    #[must_use]
    pub const fn task_name(self) -> &'static str {
        match self {
            Self::Backtest => BACKTEST_TASK,
            Self::Trading => TRADING_TASK,
        }
    }
}

/// Arguments of the backtest and trading tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub execution_id: String,
    pub kind: ExecutionKind,
    pub strategy_id: String,
    #[serde(default)]
    pub strategy_config: Value,
    pub instrument: InstrumentMetadata,
    pub initial_balance: Decimal,
    #[serde(default)]
    pub stop_mode: StopMode,
    /// Live channel account. Required for trading.
    #[serde(default)]
    pub account_id: Option<String>,
    /// Backtest window, exclusive start.
    #[serde(default)]
    pub replay_from: Option<DateTime<Utc>>,
    /// Backtest window, inclusive end.
    #[serde(default)]
    pub replay_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub external_task_id: Option<String>,
    #[serde(default)]
    pub worker_id: Option<String>,
}

impl ExecutionRequest {
    pub fn new(
        execution_id: impl Into<String>,
        kind: ExecutionKind,
        strategy_id: impl Into<String>,
        instrument: InstrumentMetadata,
        initial_balance: Decimal,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            kind,
            strategy_id: strategy_id.into(),
            strategy_config: Value::Null,
            instrument,
            initial_balance,
            stop_mode: StopMode::default(),
            account_id: None,
            replay_from: None,
            replay_until: None,
            external_task_id: None,
            worker_id: None,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: Value) -> Self {
        self.strategy_config = config;
        self
    }

    #[must_use]
    pub const fn with_stop_mode(mut self, stop_mode: StopMode) -> Self {
        self.stop_mode = stop_mode;
        self
    }

    #[must_use]
    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    #[must_use]
    pub const fn task_name(&self) -> &'static str {
        self.kind.task_name()
    }
}

/// Summary returned once an execution reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    pub execution_id: String,
    pub status: TaskStatus,
    pub message: Option<String>,
    /// Lifetime count, including ticks processed before a resume.
    pub ticks_processed: u64,
    /// Live ticks drained while paused.
    pub ticks_skipped: u64,
    /// Events emitted by this run only.
    pub events_emitted: u64,
    pub resumed_from_sequence: Option<i64>,
    pub last_snapshot_sequence: Option<i64>,
    pub final_state: ExecutionState,
}
