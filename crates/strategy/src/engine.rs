//! Type-erased strategy runner.
//!
//! The executor drives strategies through [`StrategyEngine`] without knowing
//! their concrete state type. State is persisted as
//! `{"strategy": id, "version": n, "state": {...}}` and migrated forward on
//! restore when the stored version is older than the current one.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use trade_engine_core::{PositionSummary, StrategyEvent, Tick};

use crate::error::StrategyError;
use crate::strategy::{Strategy, StrategyContext, Transition};

/// Envelope written into execution snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub strategy: String,
    pub version: u32,
    pub state: Value,
}

pub trait StrategyEngine: Send + Sync {
    fn strategy_id(&self) -> &'static str;

    fn on_start(&mut self, at: DateTime<Utc>) -> Result<Vec<StrategyEvent>, StrategyError>;

    fn on_tick(&mut self, tick: &Tick) -> Result<Vec<StrategyEvent>, StrategyError>;

    fn on_pause(&mut self, at: DateTime<Utc>) -> Result<Vec<StrategyEvent>, StrategyError>;

    fn on_resume(&mut self, at: DateTime<Utc>) -> Result<Vec<StrategyEvent>, StrategyError>;

    fn on_stop(
        &mut self,
        at: DateTime<Utc>,
        close_all: bool,
    ) -> Result<Vec<StrategyEvent>, StrategyError>;

    /// Current state in its persisted envelope.
    fn snapshot_state(&self) -> Result<Value, StrategyError>;

    /// Replaces the current state with a persisted one.
    fn restore(&mut self, persisted: Value) -> Result<(), StrategyError>;

    fn open_positions(&self) -> Vec<PositionSummary>;

    fn balance(&self) -> Decimal;

    fn metrics(&self) -> BTreeMap<String, Value>;
}

/// Adapts a typed [`Strategy`] to [`StrategyEngine`].
///
/// A failed transition leaves the previous state in place.
pub struct TypedEngine<S: Strategy> {
    strategy: S,
    state: S::State,
}

impl<S: Strategy> TypedEngine<S> {
    pub fn new(strategy: S, ctx: &StrategyContext) -> Self {
        let state = strategy.initial_state(ctx);
        Self { strategy, state }
    }

    #[must_use]
    pub const fn state(&self) -> &S::State {
        &self.state
    }

    fn apply(&mut self, transition: Transition<S::State>) -> Vec<StrategyEvent> {
        self.state = transition.state;
        transition.events
    }
}

impl<S: Strategy> StrategyEngine for TypedEngine<S> {
    fn strategy_id(&self) -> &'static str {
        S::ID
    }

    fn on_start(&mut self, at: DateTime<Utc>) -> Result<Vec<StrategyEvent>, StrategyError> {
        let transition = self.strategy.on_start(&self.state, at)?;
        Ok(self.apply(transition))
    }

    fn on_tick(&mut self, tick: &Tick) -> Result<Vec<StrategyEvent>, StrategyError> {
        let transition = self.strategy.on_tick(&self.state, tick)?;
        Ok(self.apply(transition))
    }

    fn on_pause(&mut self, at: DateTime<Utc>) -> Result<Vec<StrategyEvent>, StrategyError> {
        let transition = self.strategy.on_pause(&self.state, at)?;
        Ok(self.apply(transition))
    }

    fn on_resume(&mut self, at: DateTime<Utc>) -> Result<Vec<StrategyEvent>, StrategyError> {
        let transition = self.strategy.on_resume(&self.state, at)?;
        Ok(self.apply(transition))
    }

    fn on_stop(
        &mut self,
        at: DateTime<Utc>,
        close_all: bool,
    ) -> Result<Vec<StrategyEvent>, StrategyError> {
        let transition = self.strategy.on_stop(&self.state, at, close_all)?;
        Ok(self.apply(transition))
    }

    fn snapshot_state(&self) -> Result<Value, StrategyError> {
        let envelope = PersistedState {
            strategy: S::ID.to_string(),
            version: S::STATE_VERSION,
            state: serde_json::to_value(&self.state)?,
        };
        Ok(serde_json::to_value(envelope)?)
    }

    fn restore(&mut self, persisted: Value) -> Result<(), StrategyError> {
        let envelope: PersistedState =
            serde_json::from_value(persisted).map_err(|e| StrategyError::InvalidState {
                strategy: S::ID,
                message: format!("malformed state envelope: {e}"),
            })?;

        if envelope.strategy != S::ID {
            return Err(StrategyError::StrategyMismatch {
                expected: S::ID,
                found: envelope.strategy,
            });
        }
        if envelope.version > S::STATE_VERSION {
            return Err(StrategyError::UnsupportedVersion {
                strategy: S::ID,
                found: envelope.version,
                current: S::STATE_VERSION,
            });
        }

        let mut version = envelope.version;
        let mut raw = envelope.state;
        while version < S::STATE_VERSION {
            raw = self.strategy.migrate(version, raw)?;
            version += 1;
            tracing::info!(strategy = S::ID, version, "Migrated strategy state");
        }

        let state: S::State =
            serde_json::from_value(raw).map_err(|e| StrategyError::InvalidState {
                strategy: S::ID,
                message: e.to_string(),
            })?;
        self.strategy.validate_state(&state)?;
        self.state = state;
        Ok(())
    }

    fn open_positions(&self) -> Vec<PositionSummary> {
        self.strategy.open_positions(&self.state)
    }

    fn balance(&self) -> Decimal {
        self.strategy.balance(&self.state)
    }

    fn metrics(&self) -> BTreeMap<String, Value> {
        self.strategy.metrics(&self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use trade_engine_core::InstrumentMetadata;

    /// Counts ticks. Version 2 renamed `count` to `ticks`.
    struct Counter;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct CounterState {
        ticks: u64,
        balance: Decimal,
    }

    impl Strategy for Counter {
        type State = CounterState;
        const ID: &'static str = "counter";
        const STATE_VERSION: u32 = 2;

        fn initial_state(&self, ctx: &StrategyContext) -> CounterState {
            CounterState {
                ticks: 0,
                balance: ctx.initial_balance,
            }
        }

        fn on_tick(
            &self,
            state: &CounterState,
            tick: &Tick,
        ) -> Result<Transition<CounterState>, StrategyError> {
            if tick.bid == Decimal::ZERO {
                return Err(StrategyError::InvalidState {
                    strategy: Self::ID,
                    message: "zero bid".to_string(),
                });
            }
            let mut next = state.clone();
            next.ticks += 1;
            Ok(Transition::unchanged(next))
        }

        fn on_stop(
            &self,
            state: &CounterState,
            _at: DateTime<Utc>,
            _close_all: bool,
        ) -> Result<Transition<CounterState>, StrategyError> {
            Ok(Transition::unchanged(state.clone()))
        }

        fn migrate(&self, from_version: u32, mut state: Value) -> Result<Value, StrategyError> {
            match from_version {
                1 => {
                    let count = state["count"].take();
                    state["ticks"] = count;
                    Ok(state)
                }
                other => Err(StrategyError::UnsupportedVersion {
                    strategy: Self::ID,
                    found: other,
                    current: Self::STATE_VERSION,
                }),
            }
        }

        fn open_positions(&self, _state: &CounterState) -> Vec<PositionSummary> {
            Vec::new()
        }

        fn balance(&self, state: &CounterState) -> Decimal {
            state.balance
        }

        fn metrics(&self, state: &CounterState) -> BTreeMap<String, Value> {
            BTreeMap::from([("ticks".to_string(), json!(state.ticks))])
        }
    }

    fn engine() -> TypedEngine<Counter> {
        let ctx = StrategyContext {
            instrument: InstrumentMetadata {
                instrument: "EUR_USD".to_string(),
                pip_location: -4,
                margin_rate: dec!(0.02),
                display_precision: 5,
            },
            initial_balance: dec!(1000),
        };
        TypedEngine::new(Counter, &ctx)
    }

    fn tick(bid: Decimal) -> Tick {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        Tick::new("EUR_USD", at, bid, bid + dec!(0.0002))
    }

    #[test]
    fn snapshot_round_trips_through_restore() {
        let mut original = engine();
        original.on_tick(&tick(dec!(1.1))).unwrap();
        let snapshot = original.snapshot_state().unwrap();
        assert_eq!(snapshot["strategy"], "counter");
        assert_eq!(snapshot["version"], 2);

        let mut fresh = engine();
        fresh.restore(snapshot).unwrap();
        assert_eq!(fresh.state().ticks, 1);
    }

    #[test]
    fn older_versions_are_migrated() {
        let mut engine = engine();
        engine
            .restore(json!({"strategy": "counter", "version": 1, "state": {"count": 7, "balance": "12"}}))
            .unwrap();
        assert_eq!(engine.state().ticks, 7);
        assert_eq!(engine.balance(), dec!(12));
    }

    #[test]
    fn newer_versions_and_foreign_state_are_rejected() {
        let mut engine = engine();
        let newer = json!({"strategy": "counter", "version": 3, "state": {}});
        assert!(matches!(
            engine.restore(newer),
            Err(StrategyError::UnsupportedVersion { found: 3, .. })
        ));

        let foreign = json!({"strategy": "floor", "version": 1, "state": {}});
        assert!(matches!(
            engine.restore(foreign),
            Err(StrategyError::StrategyMismatch { .. })
        ));
    }

    #[test]
    fn failed_transition_keeps_previous_state() {
        let mut engine = engine();
        engine.on_tick(&tick(dec!(1.1))).unwrap();
        assert!(engine.on_tick(&tick(Decimal::ZERO)).is_err());
        assert_eq!(engine.state().ticks, 1);
    }
}
