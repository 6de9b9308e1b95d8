//! Entry direction signals over candle closes.
//!
//! All signals return `None` until enough closed candles exist.

use rust_decimal::Decimal;
use std::cmp::Ordering;
use trade_engine_core::Direction;

use super::config::EntrySignal;

#[must_use]
pub fn evaluate(signal: &EntrySignal, closes: &[Decimal]) -> Option<Direction> {
    if closes.len() < signal.required_candles() {
        return None;
    }
    match *signal {
        EntrySignal::Momentum { lookback } => momentum(closes, lookback),
        EntrySignal::MaCrossover { fast, slow } => ma_crossover(closes, fast, slow),
        EntrySignal::Rsi {
            period,
            oversold,
            overbought,
        } => {
            let value = rsi(closes, period)?;
            if value <= oversold {
                Some(Direction::Long)
            } else if value >= overbought {
                Some(Direction::Short)
            } else {
                None
            }
        }
    }
}

fn momentum(closes: &[Decimal], lookback: usize) -> Option<Direction> {
    let last = *closes.last()?;
    let reference = closes[closes.len() - 1 - lookback];
    direction_of(last.cmp(&reference))
}

fn ma_crossover(closes: &[Decimal], fast: usize, slow: usize) -> Option<Direction> {
    let fast_ma = sma(&closes[closes.len() - fast..]);
    let slow_ma = sma(&closes[closes.len() - slow..]);
    direction_of(fast_ma.cmp(&slow_ma))
}

const fn direction_of(ordering: Ordering) -> Option<Direction> {
    match ordering {
        Ordering::Greater => Some(Direction::Long),
        Ordering::Less => Some(Direction::Short),
        Ordering::Equal => None,
    }
}

fn sma(prices: &[Decimal]) -> Decimal {
    let sum: Decimal = prices.iter().sum();
    sum / Decimal::from(prices.len())
}

/// Cutler's RSI (simple averages) over the last `period` changes.
#[must_use]
pub fn rsi(closes: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }
    let window = &closes[closes.len() - period - 1..];
    let (gains, losses) = window
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .fold((Decimal::ZERO, Decimal::ZERO), |(g, l), change| {
            if change > Decimal::ZERO {
                (g + change, l)
            } else {
                (g, l - change)
            }
        });

    if losses.is_zero() {
        return Some(if gains.is_zero() {
            Decimal::from(50)
        } else {
            Decimal::ONE_HUNDRED
        });
    }
    let rs = gains / losses;
    Some(Decimal::ONE_HUNDRED - Decimal::ONE_HUNDRED / (Decimal::ONE + rs))
}
