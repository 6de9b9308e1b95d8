//! The `Strategy` trait.
//!
//! A strategy is a pure state machine: every hook takes the current state by
//! reference and returns the next state together with the events the
//! transition produced. Strategies never touch I/O; persistence, timing and
//! cancellation belong to the executor.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use trade_engine_core::{InstrumentMetadata, PositionSummary, StrategyEvent, Tick};

use crate::error::StrategyError;

/// Static inputs a strategy is built with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyContext {
    pub instrument: InstrumentMetadata,
    pub initial_balance: Decimal,
}

/// Result of one state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<S> {
    pub state: S,
    pub events: Vec<StrategyEvent>,
}

impl<S> Transition<S> {
    #[must_use]
    pub const fn unchanged(state: S) -> Self {
        Self {
            state,
            events: Vec::new(),
        }
    }

    #[must_use]
    pub const fn new(state: S, events: Vec<StrategyEvent>) -> Self {
        Self { state, events }
    }
}

pub trait Strategy: Send + Sync + 'static {
    type State: Clone + Serialize + DeserializeOwned + Send + Sync;

    /// Registry identifier, also written into persisted state.
    const ID: &'static str;

    /// Schema version of `State`. Bump it and extend [`Strategy::migrate`]
    /// whenever the serialized shape changes.
    const STATE_VERSION: u32;

    fn initial_state(&self, ctx: &StrategyContext) -> Self::State;

    fn on_start(
        &self,
        state: &Self::State,
        _at: DateTime<Utc>,
    ) -> Result<Transition<Self::State>, StrategyError> {
        Ok(Transition::unchanged(state.clone()))
    }

    fn on_tick(
        &self,
        state: &Self::State,
        tick: &Tick,
    ) -> Result<Transition<Self::State>, StrategyError>;

    fn on_pause(
        &self,
        state: &Self::State,
        _at: DateTime<Utc>,
    ) -> Result<Transition<Self::State>, StrategyError> {
        Ok(Transition::unchanged(state.clone()))
    }

    fn on_resume(
        &self,
        state: &Self::State,
        _at: DateTime<Utc>,
    ) -> Result<Transition<Self::State>, StrategyError> {
        Ok(Transition::unchanged(state.clone()))
    }

    /// Called once when the execution ends. With `close_all` every open
    /// position is closed at the last known quote.
    fn on_stop(
        &self,
        state: &Self::State,
        at: DateTime<Utc>,
        close_all: bool,
    ) -> Result<Transition<Self::State>, StrategyError>;

    /// Upgrades a serialized state from `from_version` to `from_version + 1`.
    fn migrate(&self, from_version: u32, _state: Value) -> Result<Value, StrategyError> {
        Err(StrategyError::UnsupportedVersion {
            strategy: Self::ID,
            found: from_version,
            current: Self::STATE_VERSION,
        })
    }

    /// Checks a restored state before it is used.
    fn validate_state(&self, _state: &Self::State) -> Result<(), StrategyError> {
        Ok(())
    }

    fn open_positions(&self, state: &Self::State) -> Vec<PositionSummary>;

    /// Cash balance including realized PnL.
    fn balance(&self, state: &Self::State) -> Decimal;

    fn metrics(&self, state: &Self::State) -> BTreeMap<String, Value>;
}
