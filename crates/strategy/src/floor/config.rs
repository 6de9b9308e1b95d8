use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StrategyError;

use super::FLOOR_ID;

/// How lot sizes grow from one layer to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LotProgression {
    /// Every layer uses the base lot.
    Equal,
    /// `base + increment * n`
    Additive,
    /// `base * factor^n`
    Exponential,
    /// `base / (n + 1)`
    Inverse,
}

/// Direction signal used to open layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum EntrySignal {
    /// Sign of the close-to-close change over `lookback` candles.
    Momentum { lookback: usize },
    /// Fast SMA above slow SMA goes long, below goes short.
    MaCrossover { fast: usize, slow: usize },
    /// Oversold goes long, overbought goes short.
    Rsi {
        period: usize,
        oversold: Decimal,
        overbought: Decimal,
    },
}

impl EntrySignal {
    /// Closed candles needed before the signal can fire.
    #[must_use]
    pub const fn required_candles(&self) -> usize {
        match self {
            Self::Momentum { lookback } => *lookback + 1,
            Self::MaCrossover { slow, .. } => *slow,
            Self::Rsi { period, .. } => *period + 1,
        }
    }
}

impl Default for EntrySignal {
    fn default() -> Self {
        Self::Momentum { lookback: 10 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FloorConfig {
    pub base_lot_size: Decimal,
    pub lot_progression: LotProgression,
    /// Used by [`LotProgression::Additive`].
    pub progression_increment: Decimal,
    /// Used by [`LotProgression::Exponential`].
    pub progression_factor: Decimal,
    pub max_layers: usize,
    pub retracement_pips: Decimal,
    pub max_retracements_per_layer: u32,
    pub take_profit_pips: Decimal,
    pub candle_granularity_secs: i64,
    /// Closed candles kept for signals; grown automatically to cover the
    /// entry signal and the volatility baseline.
    pub candle_window: usize,
    pub entry_signal: EntrySignal,
    /// Margin ratio at which units are force-closed.
    pub margin_closeout_threshold: Decimal,
    /// Protection re-arms once the ratio falls below `threshold * rearm_fraction`.
    pub margin_rearm_fraction: Decimal,
    pub atr_period: usize,
    pub atr_baseline_period: usize,
    /// Lock when `atr >= baseline * lock_multiplier`.
    pub volatility_lock_multiplier: Decimal,
    /// Unlock when `atr <= baseline * unlock_multiplier`.
    pub volatility_unlock_multiplier: Decimal,
}

impl Default for FloorConfig {
    fn default() -> Self {
        Self {
            base_lot_size: Decimal::from(1_000),
            lot_progression: LotProgression::Additive,
            progression_increment: Decimal::from(1_000),
            progression_factor: Decimal::TWO,
            max_layers: 3,
            retracement_pips: Decimal::from(30),
            max_retracements_per_layer: 3,
            take_profit_pips: Decimal::from(25),
            candle_granularity_secs: 60,
            candle_window: 20,
            entry_signal: EntrySignal::default(),
            margin_closeout_threshold: Decimal::new(5, 1),
            margin_rearm_fraction: Decimal::new(9, 1),
            atr_period: 14,
            atr_baseline_period: 50,
            volatility_lock_multiplier: Decimal::TWO,
            volatility_unlock_multiplier: Decimal::new(15, 1),
        }
    }
}

impl FloorConfig {
    /// Parses and validates a JSON config. Missing fields take defaults.
    ///
    /// # Errors
    /// Unknown fields, wrong types and inconsistent values are rejected.
    pub fn from_value(value: &Value) -> Result<Self, StrategyError> {
        let config: Self = if value.is_null() {
            Self::default()
        } else {
            serde_json::from_value(value.clone()).map_err(|e| invalid(e.to_string()))?
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns the first inconsistency found.
    pub fn validate(&self) -> Result<(), StrategyError> {
        if self.base_lot_size <= Decimal::ZERO {
            return Err(invalid("base_lot_size must be positive"));
        }
        if self.max_layers == 0 {
            return Err(invalid("max_layers must be at least 1"));
        }
        if self.retracement_pips <= Decimal::ZERO || self.take_profit_pips <= Decimal::ZERO {
            return Err(invalid("retracement_pips and take_profit_pips must be positive"));
        }
        if self.candle_granularity_secs <= 0 {
            return Err(invalid("candle_granularity_secs must be positive"));
        }
        match self.lot_progression {
            LotProgression::Additive if self.progression_increment < Decimal::ZERO => {
                return Err(invalid("progression_increment must not be negative"));
            }
            LotProgression::Exponential if self.progression_factor <= Decimal::ZERO => {
                return Err(invalid("progression_factor must be positive"));
            }
            _ => {}
        }
        match self.entry_signal {
            EntrySignal::Momentum { lookback } if lookback == 0 => {
                return Err(invalid("momentum lookback must be at least 1"));
            }
            EntrySignal::MaCrossover { fast, slow } if fast == 0 || fast >= slow => {
                return Err(invalid("ma_crossover needs 0 < fast < slow"));
            }
            EntrySignal::Rsi {
                period,
                oversold,
                overbought,
            } if period == 0
                || oversold <= Decimal::ZERO
                || overbought >= Decimal::ONE_HUNDRED
                || oversold >= overbought =>
            {
                return Err(invalid("rsi needs period > 0 and 0 < oversold < overbought < 100"));
            }
            _ => {}
        }
        if self.margin_closeout_threshold <= Decimal::ZERO {
            return Err(invalid("margin_closeout_threshold must be positive"));
        }
        if self.margin_rearm_fraction <= Decimal::ZERO || self.margin_rearm_fraction > Decimal::ONE
        {
            return Err(invalid("margin_rearm_fraction must be in (0, 1]"));
        }
        if self.atr_period == 0 || self.atr_baseline_period < self.atr_period {
            return Err(invalid("atr_baseline_period must be at least atr_period (> 0)"));
        }
        if self.volatility_unlock_multiplier <= Decimal::ZERO
            || self.volatility_unlock_multiplier > self.volatility_lock_multiplier
        {
            return Err(invalid(
                "volatility_unlock_multiplier must be positive and not above the lock multiplier",
            ));
        }
        Ok(())
    }

    /// Lot size for the layer at zero-based position `index`, in whole units.
    #[must_use]
    pub fn lot_size(&self, index: usize) -> Decimal {
        let base = self.base_lot_size;
        let n = Decimal::from(index);
        let size = match self.lot_progression {
            LotProgression::Equal => base,
            LotProgression::Additive => base + self.progression_increment * n,
            LotProgression::Exponential => {
                let mut size = base;
                for _ in 0..index {
                    size *= self.progression_factor;
                }
                size
            }
            LotProgression::Inverse => base / (n + Decimal::ONE),
        };
        size.round_dp(0).max(Decimal::ONE)
    }

    /// Closed candles retained in state.
    #[must_use]
    pub fn retained_candles(&self) -> usize {
        self.candle_window
            .max(self.entry_signal.required_candles())
            .max(self.atr_baseline_period + 1)
    }
}

fn invalid(message: impl Into<String>) -> StrategyError {
    StrategyError::InvalidConfig {
        strategy: FLOOR_ID,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn with_progression(progression: LotProgression) -> FloorConfig {
        FloorConfig {
            lot_progression: progression,
            base_lot_size: dec!(1000),
            progression_increment: dec!(500),
            progression_factor: dec!(2),
            ..FloorConfig::default()
        }
    }

    #[test]
    fn lot_progressions() {
        let equal = with_progression(LotProgression::Equal);
        assert_eq!(equal.lot_size(2), dec!(1000));

        let additive = with_progression(LotProgression::Additive);
        assert_eq!(additive.lot_size(0), dec!(1000));
        assert_eq!(additive.lot_size(2), dec!(2000));

        let exponential = with_progression(LotProgression::Exponential);
        assert_eq!(exponential.lot_size(3), dec!(8000));

        let inverse = with_progression(LotProgression::Inverse);
        assert_eq!(inverse.lot_size(1), dec!(500));
        assert_eq!(inverse.lot_size(2), dec!(333));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config = FloorConfig::from_value(&json!({
            "base_lot_size": "2000",
            "entry_signal": {"method": "rsi", "period": 14, "oversold": "30", "overbought": "70"}
        }))
        .unwrap();
        assert_eq!(config.base_lot_size, dec!(2000));
        assert_eq!(config.max_layers, 3);
        assert_eq!(config.entry_signal.required_candles(), 15);
    }

    #[test]
    fn rejects_unknown_fields_and_bad_values() {
        assert!(FloorConfig::from_value(&json!({"max_layer": 3})).is_err());
        assert!(FloorConfig::from_value(&json!({
            "entry_signal": {"method": "ma_crossover", "fast": 20, "slow": 5}
        }))
        .is_err());
        assert!(FloorConfig::from_value(&json!({"margin_rearm_fraction": "1.5"})).is_err());
    }

    #[test]
    fn retains_enough_candles_for_the_baseline() {
        let config = FloorConfig::default();
        assert_eq!(config.retained_candles(), 51);
    }
}
