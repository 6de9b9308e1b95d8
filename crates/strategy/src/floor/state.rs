use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use trade_engine_core::{Direction, HedgeInstruction, LayerClosure};

use super::candles::CandleWindow;

pub const FLOOR_STATE_VERSION: u32 = 1;

/// Price a new position in `direction` fills at: longs buy the ask, shorts sell the bid.
#[must_use]
pub const fn entry_price(direction: Direction, bid: Decimal, ask: Decimal) -> Decimal {
    match direction {
        Direction::Long => ask,
        Direction::Short => bid,
    }
}

/// Price a position in `direction` closes at: longs sell the bid, shorts buy the ask.
#[must_use]
pub const fn exit_price(direction: Direction, bid: Decimal, ask: Decimal) -> Decimal {
    match direction {
        Direction::Long => bid,
        Direction::Short => ask,
    }
}

/// One rung of the Floor ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerState {
    pub id: u32,
    pub direction: Direction,
    /// Volume-weighted entry across the initial fill and all retracement adds.
    pub entry_price: Decimal,
    /// Units added per fill (initial entry and each retracement).
    pub lot_size: Decimal,
    /// Units currently open; partial margin closes reduce it.
    pub units: Decimal,
    pub retracement_count: u32,
    /// Reference for the next retracement distance.
    pub last_fill_price: Decimal,
    pub opened_at: DateTime<Utc>,
}

impl LayerState {
    #[must_use]
    pub fn signed_units(&self) -> Decimal {
        self.units * self.direction.sign()
    }

    /// Direction-adjusted move from entry to `exit`, in pips.
    #[must_use]
    pub fn pips(&self, exit: Decimal, pip_size: Decimal) -> Decimal {
        (exit - self.entry_price) * self.direction.sign() / pip_size
    }

    #[must_use]
    pub fn unrealized_pnl(&self, mark: Decimal) -> Decimal {
        (mark - self.entry_price) * self.signed_units()
    }

    #[must_use]
    pub fn closure(&self, units: Decimal, exit: Decimal) -> LayerClosure {
        LayerClosure {
            layer_id: self.id,
            direction: self.direction,
            units,
            entry_price: self.entry_price,
            exit_price: exit,
            realized_pnl: (exit - self.entry_price) * units * self.direction.sign(),
            partial: units < self.units,
        }
    }

    /// Adds `units` at `price`, re-averaging the entry.
    pub fn add(&mut self, units: Decimal, price: Decimal) {
        let total = self.units + units;
        self.entry_price = (self.entry_price * self.units + price * units) / total;
        self.units = total;
        self.last_fill_price = price;
    }
}

/// Last quote seen, used to close positions outside of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub timestamp: DateTime<Utc>,
    pub bid: Decimal,
    pub ask: Decimal,
}

impl Quote {
    #[must_use]
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloorState {
    /// Open layers, oldest first. Margin closes consume them in this order.
    pub layers: Vec<LayerState>,
    /// One hedge per layer while volatility-locked, empty otherwise.
    pub hedges: Vec<HedgeInstruction>,
    pub candles: CandleWindow,
    pub volatility_locked: bool,
    /// Set when a margin close fired; cleared once the ratio re-arms.
    pub margin_protection: bool,
    pub paused: bool,
    pub balance: Decimal,
    /// Balance plus unrealized PnL at mid.
    pub nav: Decimal,
    pub realized_pnl: Decimal,
    pub closed_trades: u64,
    pub next_layer_id: u32,
    pub last_quote: Option<Quote>,
}

impl FloorState {
    #[must_use]
    pub fn new(balance: Decimal) -> Self {
        Self {
            layers: Vec::new(),
            hedges: Vec::new(),
            candles: CandleWindow::default(),
            volatility_locked: false,
            margin_protection: false,
            paused: false,
            balance,
            nav: balance,
            realized_pnl: Decimal::ZERO,
            closed_trades: 0,
            next_layer_id: 1,
            last_quote: None,
        }
    }

    #[must_use]
    pub fn total_units(&self) -> Decimal {
        self.layers.iter().map(|l| l.units).sum()
    }

    pub fn book(&mut self, realized: Decimal) {
        self.balance += realized;
        self.realized_pnl += realized;
        self.closed_trades += 1;
    }

    pub fn mark_to_market(&mut self, mark: Decimal) {
        let layers: Decimal = self.layers.iter().map(|l| l.unrealized_pnl(mark)).sum();
        let hedges: Decimal = self
            .hedges
            .iter()
            .map(|h| (mark - h.price) * h.units * h.direction.sign())
            .sum();
        self.nav = self.balance + layers + hedges;
    }

    pub fn allocate_layer_id(&mut self) -> u32 {
        let id = self.next_layer_id;
        self.next_layer_id += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn layer(direction: Direction) -> LayerState {
        LayerState {
            id: 1,
            direction,
            entry_price: dec!(1.1000),
            lot_size: dec!(1000),
            units: dec!(1000),
            retracement_count: 0,
            last_fill_price: dec!(1.1000),
            opened_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn fills_cross_the_spread() {
        assert_eq!(entry_price(Direction::Long, dec!(1.1), dec!(1.2)), dec!(1.2));
        assert_eq!(exit_price(Direction::Long, dec!(1.1), dec!(1.2)), dec!(1.1));
        assert_eq!(entry_price(Direction::Short, dec!(1.1), dec!(1.2)), dec!(1.1));
        assert_eq!(exit_price(Direction::Short, dec!(1.1), dec!(1.2)), dec!(1.2));
    }

    #[test]
    fn adding_re_averages_entry() {
        let mut l = layer(Direction::Long);
        l.add(dec!(1000), dec!(1.0970));
        assert_eq!(l.units, dec!(2000));
        assert_eq!(l.entry_price, dec!(1.0985));
        assert_eq!(l.last_fill_price, dec!(1.0970));
    }

    #[test]
    fn short_pips_are_direction_adjusted() {
        let l = layer(Direction::Short);
        assert_eq!(l.pips(dec!(1.0975), dec!(0.0001)), dec!(25));
        let closure = l.closure(dec!(400), dec!(1.0975));
        assert_eq!(closure.realized_pnl, dec!(1.0000));
        assert!(closure.partial);
    }
}
