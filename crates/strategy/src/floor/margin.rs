//! Margin ratio and forced partial closes.
//!
//! `margin_ratio = units * price * margin_rate / nav`. On a breach the
//! strategy closes enough units to bring the ratio down to 80% of the
//! threshold, never less than 10% of the open units, oldest layer first.

use rust_decimal::Decimal;
use trade_engine_core::LayerClosure;

use super::state::{exit_price, LayerState};

/// Post-close target as a fraction of the threshold.
pub const TARGET_FRACTION: Decimal = Decimal::from_parts(8, 0, 0, false, 1);
/// Smallest forced close as a fraction of open units.
pub const MIN_CLOSE_FRACTION: Decimal = Decimal::from_parts(1, 0, 0, false, 1);

/// Required margin over NAV. A non-positive NAV with open units is an
/// unbounded ratio.
#[must_use]
pub fn margin_ratio(units: Decimal, price: Decimal, margin_rate: Decimal, nav: Decimal) -> Decimal {
    let required = units * price * margin_rate;
    if required.is_zero() {
        return Decimal::ZERO;
    }
    if nav <= Decimal::ZERO {
        return Decimal::MAX;
    }
    required / nav
}

/// Whole units to close so the ratio lands at `TARGET_FRACTION * threshold`.
#[must_use]
pub fn units_to_close(
    total_units: Decimal,
    price: Decimal,
    margin_rate: Decimal,
    nav: Decimal,
    threshold: Decimal,
) -> Decimal {
    let margin_per_unit = price * margin_rate;
    if nav <= Decimal::ZERO || margin_per_unit <= Decimal::ZERO {
        return total_units;
    }
    let keep = threshold * TARGET_FRACTION * nav / margin_per_unit;
    let needed = (total_units - keep).max(total_units * MIN_CLOSE_FRACTION);
    needed.ceil().min(total_units)
}

/// Closes `units` across `layers` in FIFO order, splitting the last layer
/// touched when it holds more than what remains. Emptied layers are removed.
pub fn close_fifo(
    layers: &mut Vec<LayerState>,
    units: Decimal,
    bid: Decimal,
    ask: Decimal,
) -> Vec<LayerClosure> {
    let mut remaining = units;
    let mut closures = Vec::new();
    for layer in layers.iter_mut() {
        if remaining <= Decimal::ZERO {
            break;
        }
        let take = remaining.min(layer.units);
        closures.push(layer.closure(take, exit_price(layer.direction, bid, ask)));
        layer.units -= take;
        remaining -= take;
    }
    layers.retain(|l| l.units > Decimal::ZERO);
    closures
}
