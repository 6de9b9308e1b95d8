//! Static map from strategy identifier to factory.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::engine::{StrategyEngine, TypedEngine};
use crate::error::StrategyError;
use crate::floor::{FloorConfig, FloorStrategy};
use crate::strategy::{Strategy, StrategyContext};

/// Builds an engine from a JSON config. Fails before any tick is processed.
pub type StrategyFactory =
    fn(&Value, &StrategyContext) -> Result<Box<dyn StrategyEngine>, StrategyError>;

/// Populated once at start-up and injected where strategies are created.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    factories: BTreeMap<&'static str, StrategyFactory>,
}

impl StrategyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in strategy.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new().register(FloorStrategy::ID, build_floor)
    }

    #[must_use]
    pub fn register(mut self, id: &'static str, factory: StrategyFactory) -> Self {
        self.factories.insert(id, factory);
        self
    }

    pub fn ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    /// # Errors
    /// Unknown identifiers and invalid configs are rejected.
    pub fn create(
        &self,
        id: &str,
        config: &Value,
        ctx: &StrategyContext,
    ) -> Result<Box<dyn StrategyEngine>, StrategyError> {
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| StrategyError::UnknownStrategy(id.to_string()))?;
        factory(config, ctx)
    }
}

fn build_floor(
    config: &Value,
    ctx: &StrategyContext,
) -> Result<Box<dyn StrategyEngine>, StrategyError> {
    let config = FloorConfig::from_value(config)?;
    let strategy = FloorStrategy::new(config, ctx.instrument.clone())?;
    Ok(Box::new(TypedEngine::new(strategy, ctx)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use trade_engine_core::InstrumentMetadata;

    fn ctx() -> StrategyContext {
        StrategyContext {
            instrument: InstrumentMetadata {
                instrument: "EUR_USD".to_string(),
                pip_location: -4,
                margin_rate: dec!(0.02),
                display_precision: 5,
            },
            initial_balance: dec!(10000),
        }
    }

    #[test]
    fn defaults_include_floor() {
        let registry = StrategyRegistry::with_defaults();
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["floor"]);
        let engine = registry.create("floor", &json!({}), &ctx()).unwrap();
        assert_eq!(engine.strategy_id(), "floor");
        assert_eq!(engine.balance(), dec!(10000));
    }

    #[test]
    fn unknown_id_fails_fast() {
        let registry = StrategyRegistry::with_defaults();
        let err = registry.create("grid", &json!({}), &ctx()).err().unwrap();
        assert!(matches!(err, StrategyError::UnknownStrategy(id) if id == "grid"));
    }

    #[test]
    fn invalid_config_fails_fast() {
        let registry = StrategyRegistry::with_defaults();
        let err = registry
            .create("floor", &json!({"max_layers": 0}), &ctx())
            .err()
            .unwrap();
        assert!(matches!(err, StrategyError::InvalidConfig { .. }));
    }
}
