//! Execution state and its append-only snapshots.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use trade_engine_core::{PositionSummary, StrategyEvent};

/// Everything needed to resume an execution without replaying from tick zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    /// Versioned strategy state as produced by the strategy engine.
    pub strategy_state: Value,
    pub current_balance: Decimal,
    pub open_positions: Vec<PositionSummary>,
    pub ticks_processed: u64,
    pub last_tick_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metrics: BTreeMap<String, Value>,
}

impl ExecutionState {
    #[must_use]
    pub fn new(initial_balance: Decimal) -> Self {
        Self {
            strategy_state: Value::Null,
            current_balance: initial_balance,
            open_positions: Vec::new(),
            ticks_processed: 0,
            last_tick_timestamp: None,
            metrics: BTreeMap::new(),
        }
    }
}

/// Immutable snapshot row keyed by `(execution_id, sequence)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub execution_id: String,
    pub sequence: i64,
    pub state: ExecutionState,
    pub created_at: DateTime<Utc>,
}

/// Persisted strategy event with its per-execution sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyEventRecord {
    pub execution_id: String,
    pub sequence: i64,
    pub event: StrategyEvent,
    pub created_at: DateTime<Utc>,
}
