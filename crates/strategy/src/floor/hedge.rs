//! Hedge neutralization for volatility locks.
//!
//! Rather than closing layers at a loss during a volatility spike, every open
//! layer gets an equal-and-opposite hedge tagged with the layer id, which
//! brings net exposure to exactly zero.

use rust_decimal::Decimal;
use trade_engine_core::HedgeInstruction;

use super::state::{entry_price, LayerState};

#[derive(Debug, Clone, Copy, Default)]
pub struct HedgeNeutralizer;

impl HedgeNeutralizer {
    /// One hedge per layer at the current quote.
    #[must_use]
    pub fn neutralize(layers: &[LayerState], bid: Decimal, ask: Decimal) -> Vec<HedgeInstruction> {
        layers
            .iter()
            .map(|layer| {
                let direction = layer.direction.opposite();
                HedgeInstruction {
                    source_layer_id: layer.id,
                    direction,
                    units: layer.units,
                    price: entry_price(direction, bid, ask),
                }
            })
            .collect()
    }
}

/// Signed units across layers and hedges; zero when fully neutralized.
#[must_use]
pub fn compute_net_exposure(layers: &[LayerState], hedges: &[HedgeInstruction]) -> Decimal {
    let layer_units: Decimal = layers.iter().map(LayerState::signed_units).sum();
    let hedge_units: Decimal = hedges.iter().map(|h| h.units * h.direction.sign()).sum();
    layer_units + hedge_units
}
