//! Price tick model and its pub/sub wire format.
//!
//! Wire format (one JSON object per message):
//! ```json
//! {
//!   "instrument": "EUR_USD",
//!   "timestamp": "2024-03-01T12:00:00.250Z",
//!   "bid": "1.08412",
//!   "ask": "1.08425",
//!   "mid": "1.084185"
//! }
//! ```
//! Prices are always decimal strings so no precision is lost in transit.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while decoding a tick from the wire.
#[derive(Debug, Error)]
pub enum TickParseError {
    /// Payload is not valid JSON or misses a required field.
    #[error("malformed tick payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Quote values are not usable (non-positive or crossed book).
    #[error("invalid quote for {instrument}: bid={bid} ask={ask}")]
    InvalidQuote {
        instrument: String,
        bid: Decimal,
        ask: Decimal,
    },

    /// Instrument is empty.
    #[error("tick has an empty instrument")]
    EmptyInstrument,
}

/// A single top-of-book quote.
///
/// Immutable once built; `(instrument, timestamp)` is its identity in the tick store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    pub instrument: String,
    #[serde(with = "iso_z")]
    pub timestamp: DateTime<Utc>,
    #[serde(with = "rust_decimal::serde::str")]
    pub bid: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub ask: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub mid: Decimal,
}

impl Tick {
    /// Builds a tick, deriving `mid` from bid and ask.
    #[must_use]
    pub fn new(
        instrument: impl Into<String>,
        timestamp: DateTime<Utc>,
        bid: Decimal,
        ask: Decimal,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            timestamp,
            bid,
            ask,
            mid: (bid + ask) / Decimal::TWO,
        }
    }

    /// Bid/ask spread.
    #[must_use]
    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }

    /// Encodes the tick as wire JSON.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_wire(&self) -> Result<String, TickParseError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes and validates a wire message.
    ///
    /// # Errors
    /// Returns [`TickParseError`] for malformed JSON, missing fields, unparsable
    /// decimals or timestamps, and unusable quotes.
    pub fn from_wire(payload: &str) -> Result<Self, TickParseError> {
        let tick: Self = serde_json::from_str(payload)?;
        tick.validate()?;
        Ok(tick)
    }

    fn validate(&self) -> Result<(), TickParseError> {
        if self.instrument.trim().is_empty() {
            return Err(TickParseError::EmptyInstrument);
        }
        if self.bid <= Decimal::ZERO || self.ask <= Decimal::ZERO || self.bid > self.ask {
            return Err(TickParseError::InvalidQuote {
                instrument: self.instrument.clone(),
                bid: self.bid,
                ask: self.ask,
            });
        }
        Ok(())
    }
}

/// A message as it arrives from the broker's price stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawTick {
    /// A price update. Either side may be absent on thin books.
    Price {
        instrument: String,
        time: DateTime<Utc>,
        bid: Option<Decimal>,
        ask: Option<Decimal>,
    },
    /// Keep-alive emitted by the stream while no prices flow.
    Heartbeat { time: DateTime<Utc> },
}

impl RawTick {
    /// Normalizes a raw message into a [`Tick`].
    ///
    /// Heartbeats and one-sided quotes yield `None`.
    #[must_use]
    pub fn normalize(&self) -> Option<Tick> {
        match self {
            Self::Price {
                instrument,
                time,
                bid: Some(bid),
                ask: Some(ask),
            } if *bid > Decimal::ZERO && *ask >= *bid => {
                Some(Tick::new(instrument.clone(), *time, *bid, *ask))
            }
            _ => None,
        }
    }
}

/// RFC 3339 timestamps that always use the `Z` suffix.
pub mod iso_z {
    use chrono::{DateTime, ParseError, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// RFC 3339 with a `Z` suffix and only as many fractional digits as needed.
    #[must_use]
    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }

    /// # Errors
    /// Fails when the string is not RFC 3339.
    pub fn parse(raw: &str) -> Result<DateTime<Utc>, ParseError> {
        DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc))
    }

    /// # Errors
    /// Never fails for valid timestamps.
    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format(ts))
    }

    /// # Errors
    /// Fails when the string is not RFC 3339.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }
}
