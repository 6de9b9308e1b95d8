use crate::position::Direction;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Units closed out of a single layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerClosure {
    pub layer_id: u32,
    pub direction: Direction,
    pub units: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub realized_pnl: Decimal,
    /// True when only part of the layer was closed.
    pub partial: bool,
}

/// Equal-and-opposite position opened against one layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HedgeInstruction {
    /// Layer this hedge neutralizes.
    pub source_layer_id: u32,
    pub direction: Direction,
    pub units: Decimal,
    pub price: Decimal,
}

/// Why a layer was removed outside of take-profit and margin protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// Closed on a GRACEFUL_CLOSE stop.
    StopClose,
    /// Emptied by a partial close that consumed the remaining units.
    Exhausted,
}

/// Audit trail entry emitted by a strategy transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyEvent {
    InitialEntry {
        timestamp: DateTime<Utc>,
        layer_id: u32,
        direction: Direction,
        units: Decimal,
        price: Decimal,
    },
    AddLayer {
        timestamp: DateTime<Utc>,
        layer_id: u32,
        direction: Direction,
        units: Decimal,
        price: Decimal,
        layer_count: usize,
    },
    Retracement {
        timestamp: DateTime<Utc>,
        layer_id: u32,
        retracement_count: u32,
        units_added: Decimal,
        price: Decimal,
        average_entry: Decimal,
    },
    TakeProfit {
        timestamp: DateTime<Utc>,
        closure: LayerClosure,
        pips: Decimal,
    },
    RemoveLayer {
        timestamp: DateTime<Utc>,
        layer_id: u32,
        reason: RemovalReason,
        closure: Option<LayerClosure>,
    },
    MarginProtection {
        timestamp: DateTime<Utc>,
        margin_ratio: Decimal,
        threshold: Decimal,
        units_closed: Decimal,
        closures: Vec<LayerClosure>,
    },
    VolatilityLock {
        timestamp: DateTime<Utc>,
        atr: Decimal,
        baseline_atr: Decimal,
        hedges: Vec<HedgeInstruction>,
    },
    VolatilityUnlock {
        timestamp: DateTime<Utc>,
        atr: Decimal,
        baseline_atr: Decimal,
        hedges_unwound: usize,
        realized_pnl: Decimal,
    },
}

impl StrategyEvent {
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::InitialEntry { timestamp, .. }
            | Self::AddLayer { timestamp, .. }
            | Self::Retracement { timestamp, .. }
            | Self::TakeProfit { timestamp, .. }
            | Self::RemoveLayer { timestamp, .. }
            | Self::MarginProtection { timestamp, .. }
            | Self::VolatilityLock { timestamp, .. }
            | Self::VolatilityUnlock { timestamp, .. } => *timestamp,
        }
    }

    /// Stable name used as the event type column.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::InitialEntry { .. } => "initial_entry",
            Self::AddLayer { .. } => "add_layer",
            Self::Retracement { .. } => "retracement",
            Self::TakeProfit { .. } => "take_profit",
            Self::RemoveLayer { .. } => "remove_layer",
            Self::MarginProtection { .. } => "margin_protection",
            Self::VolatilityLock { .. } => "volatility_lock",
            Self::VolatilityUnlock { .. } => "volatility_unlock",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn serializes_with_type_tag() {
        let event = StrategyEvent::InitialEntry {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            layer_id: 1,
            direction: Direction::Long,
            units: dec!(1000),
            price: dec!(1.1),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "initial_entry");
        assert_eq!(json["direction"], "long");
        assert_eq!(event.event_type(), "initial_entry");

        let back: StrategyEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
