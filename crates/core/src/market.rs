use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Broker metadata for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentMetadata {
    pub instrument: String,
    /// Exponent of the pip: `pip_size = 10^pip_location` (e.g. -4 for EUR_USD, -2 for USD_JPY).
    pub pip_location: i32,
    /// Fraction of notional required as margin (e.g. 0.02 for 50:1).
    pub margin_rate: Decimal,
    #[serde(default)]
    pub display_precision: u32,
}

impl InstrumentMetadata {
    /// Pip size derived from `pip_location`.
    #[must_use]
    pub fn pip_size(&self) -> Decimal {
        pip_size(self.pip_location)
    }
}

/// `10^pip_location` as an exact decimal.
#[must_use]
pub fn pip_size(pip_location: i32) -> Decimal {
    if pip_location < 0 {
        Decimal::new(1, pip_location.unsigned_abs())
    } else {
        let mut size = Decimal::ONE;
        for _ in 0..pip_location {
            size *= Decimal::TEN;
        }
        size
    }
}

/// Point-in-time account figures reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account_id: String,
    pub balance: Decimal,
    pub nav: Decimal,
    pub margin_used: Decimal,
    pub unrealized_pnl: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn pip_size_comes_from_pip_location() {
        assert_eq!(pip_size(-4), dec!(0.0001));
        assert_eq!(pip_size(-2), dec!(0.01));
        assert_eq!(pip_size(0), dec!(1));
        assert_eq!(pip_size(1), dec!(10));
    }

    #[test]
    fn metadata_pip_size_ignores_instrument_name() {
        // A JPY-named instrument with a non-JPY pip location still uses the metadata.
        let meta = InstrumentMetadata {
            instrument: "XAU_JPY".to_string(),
            pip_location: 0,
            margin_rate: dec!(0.05),
            display_precision: 0,
        };
        assert_eq!(meta.pip_size(), dec!(1));
    }
}
