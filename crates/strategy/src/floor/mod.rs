//! Floor: a layered averaging strategy.
//!
//! A direction signal over closed candles opens the first layer. Adverse
//! moves of `retracement_pips` add to the layer (averaging its entry) up to
//! `max_retracements_per_layer` times; a layer that has exhausted its
//! retracements allows a new layer on the next fresh signal, sized by the lot
//! progression, up to `max_layers`. Each layer closes on its own take-profit.
//!
//! Two protective mechanisms sit on top:
//! - margin protection force-closes units FIFO when the margin ratio breaches
//!   the closeout threshold;
//! - a volatility lock hedges every layer when ATR spikes against its
//!   baseline, freezing the ladder until ATR normalizes and the hedges are
//!   unwound. Margin protection is suspended while locked.

pub mod candles;
pub mod config;
pub mod hedge;
pub mod margin;
pub mod signals;
pub mod state;
pub mod volatility;

pub use config::{EntrySignal, FloorConfig, LotProgression};
pub use hedge::{compute_net_exposure, HedgeNeutralizer};
pub use state::{FloorState, LayerState, Quote, FLOOR_STATE_VERSION};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use trade_engine_core::{
    InstrumentMetadata, PositionKind, PositionSummary, RemovalReason, StrategyEvent, Tick,
};

use crate::error::StrategyError;
use crate::strategy::{Strategy, StrategyContext, Transition};
use state::{entry_price, exit_price};

pub const FLOOR_ID: &str = "floor";

pub struct FloorStrategy {
    config: FloorConfig,
    metadata: InstrumentMetadata,
    pip_size: Decimal,
}

impl FloorStrategy {
    /// # Errors
    /// Rejects invalid configs and instruments without a usable margin rate.
    pub fn new(config: FloorConfig, metadata: InstrumentMetadata) -> Result<Self, StrategyError> {
        config.validate()?;
        if metadata.margin_rate <= Decimal::ZERO {
            return Err(StrategyError::InvalidConfig {
                strategy: FLOOR_ID,
                message: format!("{} has no positive margin rate", metadata.instrument),
            });
        }
        let pip_size = metadata.pip_size();
        Ok(Self {
            config,
            metadata,
            pip_size,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &FloorConfig {
        &self.config
    }

    fn update_volatility(&self, s: &mut FloorState, tick: &Tick, events: &mut Vec<StrategyEvent>) {
        let Some(reading) = volatility::measure(
            &s.candles,
            self.config.atr_period,
            self.config.atr_baseline_period,
        ) else {
            return;
        };

        if !s.volatility_locked && reading.is_spike(self.config.volatility_lock_multiplier) {
            let hedges = HedgeNeutralizer::neutralize(&s.layers, tick.bid, tick.ask);
            tracing::info!(
                atr = %reading.atr,
                baseline = %reading.baseline,
                hedges = hedges.len(),
                "Volatility lock engaged"
            );
            s.hedges.clone_from(&hedges);
            s.volatility_locked = true;
            events.push(StrategyEvent::VolatilityLock {
                timestamp: tick.timestamp,
                atr: reading.atr,
                baseline_atr: reading.baseline,
                hedges,
            });
        } else if s.volatility_locked
            && reading.has_normalized(self.config.volatility_unlock_multiplier)
        {
            let (hedges_unwound, realized_pnl) = unwind_hedges(s, tick.bid, tick.ask);
            tracing::info!(atr = %reading.atr, hedges_unwound, "Volatility lock released");
            events.push(StrategyEvent::VolatilityUnlock {
                timestamp: tick.timestamp,
                atr: reading.atr,
                baseline_atr: reading.baseline,
                hedges_unwound,
                realized_pnl,
            });
        }
    }

    fn take_profits(&self, s: &mut FloorState, tick: &Tick, events: &mut Vec<StrategyEvent>) {
        let mut kept = Vec::with_capacity(s.layers.len());
        for layer in std::mem::take(&mut s.layers) {
            let exit = exit_price(layer.direction, tick.bid, tick.ask);
            let pips = layer.pips(exit, self.pip_size);
            if pips >= self.config.take_profit_pips {
                let closure = layer.closure(layer.units, exit);
                s.book(closure.realized_pnl);
                events.push(StrategyEvent::TakeProfit {
                    timestamp: tick.timestamp,
                    closure,
                    pips,
                });
            } else {
                kept.push(layer);
            }
        }
        s.layers = kept;
    }

    fn retrace(&self, s: &mut FloorState, tick: &Tick, events: &mut Vec<StrategyEvent>) {
        for layer in &mut s.layers {
            if layer.retracement_count >= self.config.max_retracements_per_layer {
                continue;
            }
            let fill = entry_price(layer.direction, tick.bid, tick.ask);
            let adverse_pips = (layer.last_fill_price - fill) * layer.direction.sign() / self.pip_size;
            if adverse_pips < self.config.retracement_pips {
                continue;
            }
            layer.add(layer.lot_size, fill);
            layer.retracement_count += 1;
            events.push(StrategyEvent::Retracement {
                timestamp: tick.timestamp,
                layer_id: layer.id,
                retracement_count: layer.retracement_count,
                units_added: layer.lot_size,
                price: fill,
                average_entry: layer.entry_price,
            });
        }
    }

    fn enter(&self, s: &mut FloorState, tick: &Tick, events: &mut Vec<StrategyEvent>) {
        let can_open = match s.layers.last() {
            None => true,
            Some(newest) => {
                s.layers.len() < self.config.max_layers
                    && newest.retracement_count >= self.config.max_retracements_per_layer
            }
        };
        if !can_open {
            return;
        }
        let Some(direction) = signals::evaluate(&self.config.entry_signal, &s.candles.closes())
        else {
            return;
        };

        let index = s.layers.len();
        let units = self.config.lot_size(index);
        let price = entry_price(direction, tick.bid, tick.ask);
        let layer_id = s.allocate_layer_id();
        s.layers.push(LayerState {
            id: layer_id,
            direction,
            entry_price: price,
            lot_size: units,
            units,
            retracement_count: 0,
            last_fill_price: price,
            opened_at: tick.timestamp,
        });

        events.push(if index == 0 {
            StrategyEvent::InitialEntry {
                timestamp: tick.timestamp,
                layer_id,
                direction,
                units,
                price,
            }
        } else {
            StrategyEvent::AddLayer {
                timestamp: tick.timestamp,
                layer_id,
                direction,
                units,
                price,
                layer_count: s.layers.len(),
            }
        });
    }

    fn protect_margin(&self, s: &mut FloorState, tick: &Tick, events: &mut Vec<StrategyEvent>) {
        let total = s.total_units();
        let threshold = self.config.margin_closeout_threshold;
        let ratio = margin::margin_ratio(total, tick.mid, self.metadata.margin_rate, s.nav);

        if s.margin_protection {
            if ratio < threshold * self.config.margin_rearm_fraction {
                s.margin_protection = false;
            }
            return;
        }
        if total.is_zero() || ratio < threshold {
            return;
        }

        let units = margin::units_to_close(total, tick.mid, self.metadata.margin_rate, s.nav, threshold);
        tracing::warn!(
            margin_ratio = %ratio,
            %threshold,
            units_to_close = %units,
            "Margin threshold breached, closing FIFO"
        );
        let closures = margin::close_fifo(&mut s.layers, units, tick.bid, tick.ask);
        for closure in &closures {
            s.book(closure.realized_pnl);
        }
        let exhausted: Vec<u32> = closures
            .iter()
            .filter(|c| !c.partial)
            .map(|c| c.layer_id)
            .collect();

        s.margin_protection = true;
        s.mark_to_market(tick.mid);
        events.push(StrategyEvent::MarginProtection {
            timestamp: tick.timestamp,
            margin_ratio: ratio,
            threshold,
            units_closed: units,
            closures,
        });
        events.extend(exhausted.into_iter().map(|layer_id| StrategyEvent::RemoveLayer {
            timestamp: tick.timestamp,
            layer_id,
            reason: RemovalReason::Exhausted,
            closure: None,
        }));
    }
}

/// Closes every hedge at the quote. Returns how many and the PnL booked.
fn unwind_hedges(s: &mut FloorState, bid: Decimal, ask: Decimal) -> (usize, Decimal) {
    let hedges = std::mem::take(&mut s.hedges);
    let mut realized = Decimal::ZERO;
    for hedge in &hedges {
        let exit = exit_price(hedge.direction, bid, ask);
        let pnl = (exit - hedge.price) * hedge.units * hedge.direction.sign();
        s.book(pnl);
        realized += pnl;
    }
    s.volatility_locked = false;
    (hedges.len(), realized)
}

impl Strategy for FloorStrategy {
    type State = FloorState;
    const ID: &'static str = FLOOR_ID;
    const STATE_VERSION: u32 = FLOOR_STATE_VERSION;

    fn initial_state(&self, ctx: &StrategyContext) -> FloorState {
        FloorState::new(ctx.initial_balance)
    }

    fn on_start(
        &self,
        state: &FloorState,
        _at: DateTime<Utc>,
    ) -> Result<Transition<FloorState>, StrategyError> {
        let mut next = state.clone();
        next.paused = false;
        Ok(Transition::unchanged(next))
    }

    fn on_tick(
        &self,
        state: &FloorState,
        tick: &Tick,
    ) -> Result<Transition<FloorState>, StrategyError> {
        if tick.instrument != self.metadata.instrument {
            return Err(StrategyError::InstrumentMismatch {
                expected: self.metadata.instrument.clone(),
                found: tick.instrument.clone(),
            });
        }

        let mut s = state.clone();
        let mut events = Vec::new();
        s.last_quote = Some(Quote {
            timestamp: tick.timestamp,
            bid: tick.bid,
            ask: tick.ask,
        });
        let candle_closed = s.candles.push(
            tick.timestamp,
            tick.mid,
            self.config.candle_granularity_secs,
            self.config.retained_candles(),
        );

        if !s.paused {
            if candle_closed {
                self.update_volatility(&mut s, tick, &mut events);
            }
            if !s.volatility_locked {
                self.take_profits(&mut s, tick, &mut events);
                self.retrace(&mut s, tick, &mut events);
                if candle_closed {
                    self.enter(&mut s, tick, &mut events);
                }
            }
        }

        s.mark_to_market(tick.mid);
        if !s.paused && !s.volatility_locked {
            self.protect_margin(&mut s, tick, &mut events);
        }
        Ok(Transition::new(s, events))
    }

    fn on_pause(
        &self,
        state: &FloorState,
        _at: DateTime<Utc>,
    ) -> Result<Transition<FloorState>, StrategyError> {
        let mut next = state.clone();
        next.paused = true;
        Ok(Transition::unchanged(next))
    }

    fn on_resume(
        &self,
        state: &FloorState,
        _at: DateTime<Utc>,
    ) -> Result<Transition<FloorState>, StrategyError> {
        let mut next = state.clone();
        next.paused = false;
        Ok(Transition::unchanged(next))
    }

    fn on_stop(
        &self,
        state: &FloorState,
        at: DateTime<Utc>,
        close_all: bool,
    ) -> Result<Transition<FloorState>, StrategyError> {
        let mut s = state.clone();
        if !close_all || (s.layers.is_empty() && s.hedges.is_empty()) {
            return Ok(Transition::unchanged(s));
        }
        let Some(quote) = s.last_quote else {
            return Err(StrategyError::InvalidState {
                strategy: FLOOR_ID,
                message: "open positions but no quote to close them at".to_string(),
            });
        };

        let mut events = Vec::new();
        if !s.hedges.is_empty() {
            let reading = volatility::measure(
                &s.candles,
                self.config.atr_period,
                self.config.atr_baseline_period,
            );
            let (hedges_unwound, realized_pnl) = unwind_hedges(&mut s, quote.bid, quote.ask);
            events.push(StrategyEvent::VolatilityUnlock {
                timestamp: at,
                atr: reading.map_or(Decimal::ZERO, |r| r.atr),
                baseline_atr: reading.map_or(Decimal::ZERO, |r| r.baseline),
                hedges_unwound,
                realized_pnl,
            });
        }
        s.volatility_locked = false;

        for layer in std::mem::take(&mut s.layers) {
            let closure = layer.closure(layer.units, exit_price(layer.direction, quote.bid, quote.ask));
            s.book(closure.realized_pnl);
            events.push(StrategyEvent::RemoveLayer {
                timestamp: at,
                layer_id: layer.id,
                reason: RemovalReason::StopClose,
                closure: Some(closure),
            });
        }
        s.mark_to_market(quote.mid());
        Ok(Transition::new(s, events))
    }

    fn validate_state(&self, state: &FloorState) -> Result<(), StrategyError> {
        let invalid = |message: String| StrategyError::InvalidState {
            strategy: FLOOR_ID,
            message,
        };
        let mut seen = HashSet::new();
        for layer in &state.layers {
            if layer.units <= Decimal::ZERO || layer.lot_size <= Decimal::ZERO {
                return Err(invalid(format!("layer {} has non-positive size", layer.id)));
            }
            if !seen.insert(layer.id) || layer.id >= state.next_layer_id {
                return Err(invalid(format!("layer id {} is duplicated or unallocated", layer.id)));
            }
        }
        if !state.volatility_locked && !state.hedges.is_empty() {
            return Err(invalid("hedges present without a volatility lock".to_string()));
        }
        Ok(())
    }

    fn open_positions(&self, state: &FloorState) -> Vec<PositionSummary> {
        let layers = state.layers.iter().map(|layer| PositionSummary {
            position_id: format!("layer-{}", layer.id),
            instrument: self.metadata.instrument.clone(),
            kind: PositionKind::Layer,
            direction: layer.direction,
            units: layer.units,
            entry_price: layer.entry_price,
            layer_id: layer.id,
        });
        let hedges = state.hedges.iter().map(|hedge| PositionSummary {
            position_id: format!("hedge-{}", hedge.source_layer_id),
            instrument: self.metadata.instrument.clone(),
            kind: PositionKind::Hedge,
            direction: hedge.direction,
            units: hedge.units,
            entry_price: hedge.price,
            layer_id: hedge.source_layer_id,
        });
        layers.chain(hedges).collect()
    }

    fn balance(&self, state: &FloorState) -> Decimal {
        state.balance
    }

    fn metrics(&self, state: &FloorState) -> BTreeMap<String, Value> {
        BTreeMap::from([
            ("layers".to_string(), json!(state.layers.len())),
            ("hedges".to_string(), json!(state.hedges.len())),
            ("total_units".to_string(), json!(state.total_units())),
            ("net_exposure".to_string(), json!(compute_net_exposure(&state.layers, &state.hedges))),
            ("nav".to_string(), json!(state.nav)),
            ("realized_pnl".to_string(), json!(state.realized_pnl)),
            ("closed_trades".to_string(), json!(state.closed_trades)),
            ("volatility_locked".to_string(), json!(state.volatility_locked)),
            ("margin_protection".to_string(), json!(state.margin_protection)),
        ])
    }
}
