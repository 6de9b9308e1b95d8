use rust_decimal::Decimal;

use super::candles::CandleWindow;

/// Short-horizon ATR and its longer baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolatilityReading {
    pub atr: Decimal,
    pub baseline: Decimal,
}

impl VolatilityReading {
    #[must_use]
    pub fn is_spike(&self, lock_multiplier: Decimal) -> bool {
        self.atr >= self.baseline * lock_multiplier
    }

    #[must_use]
    pub fn has_normalized(&self, unlock_multiplier: Decimal) -> bool {
        self.atr <= self.baseline * unlock_multiplier
    }
}

/// Simple-average ATR over the last `atr_period` true ranges against the
/// average over the last `baseline_period`. `None` until enough candles have
/// closed, or while the baseline is flat.
#[must_use]
pub fn measure(
    candles: &CandleWindow,
    atr_period: usize,
    baseline_period: usize,
) -> Option<VolatilityReading> {
    let ranges = candles.true_ranges();
    if atr_period == 0 || ranges.len() < baseline_period.max(atr_period) {
        return None;
    }
    let baseline = mean(&ranges[ranges.len() - baseline_period..]);
    if baseline.is_zero() {
        return None;
    }
    Some(VolatilityReading {
        atr: mean(&ranges[ranges.len() - atr_period..]),
        baseline,
    })
}

fn mean(values: &[Decimal]) -> Decimal {
    values.iter().sum::<Decimal>() / Decimal::from(values.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn window(closes: &[Decimal]) -> CandleWindow {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
        let mut window = CandleWindow::default();
        for (i, close) in closes.iter().enumerate() {
            window.push(t0 + Duration::minutes(i as i64), *close, 60, 100);
        }
        // Roll the last price into a closed candle.
        window.push(t0 + Duration::minutes(closes.len() as i64), Decimal::ZERO, 60, 100);
        window
    }

    #[test]
    fn needs_a_full_baseline() {
        let candles = window(&[dec!(1.0), dec!(1.1), dec!(1.0)]);
        assert!(measure(&candles, 2, 3).is_none());
        assert!(measure(&candles, 1, 2).is_some());
    }

    #[test]
    fn spike_against_baseline() {
        let candles = window(&[dec!(1.00), dec!(1.01), dec!(1.00), dec!(1.01), dec!(1.05)]);
        let reading = measure(&candles, 1, 4).unwrap();
        assert_eq!(reading.atr, dec!(0.04));
        assert_eq!(reading.baseline, dec!(0.0175));
        assert!(reading.is_spike(dec!(2)));
        assert!(!reading.has_normalized(dec!(1.5)));
    }
}
