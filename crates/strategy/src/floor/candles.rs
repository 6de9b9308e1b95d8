//! Mid-price candles built from ticks.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub start: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

impl Candle {
    fn opened(start: DateTime<Utc>, price: Decimal) -> Self {
        Self {
            start,
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }

    fn update(&mut self, price: Decimal) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
    }

    /// True range against the previous candle's close.
    #[must_use]
    pub fn true_range(&self, previous_close: Decimal) -> Decimal {
        (self.high - self.low)
            .max((self.high - previous_close).abs())
            .max((self.low - previous_close).abs())
    }
}

/// Rolling window of closed candles plus the one currently forming.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleWindow {
    pub closed: VecDeque<Candle>,
    pub forming: Option<Candle>,
}

impl CandleWindow {
    /// Adds a price at `at`. Returns true when this tick closed a candle.
    ///
    /// Ticks older than the forming candle are folded into it.
    pub fn push(
        &mut self,
        at: DateTime<Utc>,
        price: Decimal,
        granularity_secs: i64,
        capacity: usize,
    ) -> bool {
        let bucket = bucket_start(at, granularity_secs);
        match self.forming.as_mut() {
            Some(candle) if bucket <= candle.start => {
                candle.update(price);
                return false;
            }
            Some(_) => {}
            None => {
                self.forming = Some(Candle::opened(bucket, price));
                return false;
            }
        }

        if let Some(done) = self.forming.replace(Candle::opened(bucket, price)) {
            self.closed.push_back(done);
        }
        while self.closed.len() > capacity {
            self.closed.pop_front();
        }
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.closed.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.closed.is_empty()
    }

    /// Closes of the closed candles, oldest first.
    #[must_use]
    pub fn closes(&self) -> Vec<Decimal> {
        self.closed.iter().map(|c| c.close).collect()
    }

    /// True ranges of the closed candles that have a predecessor, oldest first.
    #[must_use]
    pub fn true_ranges(&self) -> Vec<Decimal> {
        self.closed
            .iter()
            .zip(self.closed.iter().skip(1))
            .map(|(prev, candle)| candle.true_range(prev.close))
            .collect()
    }
}

fn bucket_start(at: DateTime<Utc>, granularity_secs: i64) -> DateTime<Utc> {
    let secs = at.timestamp();
    let start = secs - secs.rem_euclid(granularity_secs);
    Utc.timestamp_opt(start, 0).single().unwrap_or(at)
}
