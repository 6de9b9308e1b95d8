use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Side of a position or order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// `+1` for long, `-1` for short.
    #[must_use]
    pub const fn sign(self) -> Decimal {
        match self {
            Self::Long => Decimal::ONE,
            Self::Short => Decimal::NEGATIVE_ONE,
        }
    }

    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }
}

/// Kind of an open position held by a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionKind {
    /// A Floor layer.
    Layer,
    /// A neutralizing hedge paired with a layer.
    Hedge,
}

/// Flattened view of one open position, as stored in execution snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSummary {
    pub position_id: String,
    pub instrument: String,
    pub kind: PositionKind,
    pub direction: Direction,
    pub units: Decimal,
    pub entry_price: Decimal,
    /// Layer this position belongs to (for hedges, the layer it neutralizes).
    pub layer_id: u32,
}

impl PositionSummary {
    /// Signed unit exposure (positive long, negative short).
    #[must_use]
    pub fn signed_units(&self) -> Decimal {
        self.units * self.direction.sign()
    }

    /// Unrealized profit at the given exit price, in quote currency.
    #[must_use]
    pub fn unrealized_pnl(&self, exit_price: Decimal) -> Decimal {
        (exit_price - self.entry_price) * self.signed_units()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn direction_helpers() {
        assert_eq!(Direction::Long.sign(), dec!(1));
        assert_eq!(Direction::Short.sign(), dec!(-1));
        assert_eq!(Direction::Long.opposite(), Direction::Short);
        assert_eq!(Direction::Short.as_str(), "short");
    }

    #[test]
    fn short_position_profits_when_price_falls() {
        let pos = PositionSummary {
            position_id: "layer-1".to_string(),
            instrument: "EUR_USD".to_string(),
            kind: PositionKind::Layer,
            direction: Direction::Short,
            units: dec!(1000),
            entry_price: dec!(1.1000),
            layer_id: 1,
        };

        assert_eq!(pos.signed_units(), dec!(-1000));
        assert_eq!(pos.unrealized_pnl(dec!(1.0990)), dec!(1.0000));
    }
}
