//! Replay market gateway.
//!
//! Serves a fixed tick script per instrument as if it were a broker price
//! stream. Used by the CLI worker (ticks from CSV) and by tests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Duration;
use trade_engine_core::{AccountSnapshot, InstrumentMetadata, MarketGateway, RawTick, Tick};

#[derive(Default)]
pub struct ReplayGateway {
    scripts: HashMap<String, Vec<RawTick>>,
    metadata: HashMap<String, InstrumentMetadata>,
    accounts: HashMap<String, AccountSnapshot>,
    pacing: Option<Duration>,
    hold_open: bool,
    stream_error: Option<String>,
}

impl ReplayGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw messages to an instrument's script.
    #[must_use]
    pub fn with_raw(mut self, instrument: &str, raw: Vec<RawTick>) -> Self {
        self.scripts
            .entry(instrument.to_string())
            .or_default()
            .extend(raw);
        self
    }

    /// Appends ticks, grouped by their instrument.
    #[must_use]
    pub fn with_ticks(mut self, ticks: Vec<Tick>) -> Self {
        for tick in ticks {
            self.scripts
                .entry(tick.instrument.clone())
                .or_default()
                .push(RawTick::Price {
                    instrument: tick.instrument,
                    time: tick.timestamp,
                    bid: Some(tick.bid),
                    ask: Some(tick.ask),
                });
        }
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: InstrumentMetadata) -> Self {
        self.metadata.insert(metadata.instrument.clone(), metadata);
        self
    }

    #[must_use]
    pub fn with_account(mut self, snapshot: AccountSnapshot) -> Self {
        self.accounts.insert(snapshot.account_id.clone(), snapshot);
        self
    }

    /// Sleeps between messages.
    #[must_use]
    pub const fn with_pacing(mut self, delay: Duration) -> Self {
        self.pacing = Some(delay);
        self
    }

    /// Keeps the stream open after the script is exhausted, like a quiet market.
    #[must_use]
    pub const fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// Ends the script with a stream error, like a dropped connection.
    #[must_use]
    pub fn fail_after_script(mut self, message: impl Into<String>) -> Self {
        self.stream_error = Some(message.into());
        self
    }
}

#[async_trait]
impl MarketGateway for ReplayGateway {
    async fn stream(
        &self,
        account_id: &str,
        instrument: &str,
    ) -> Result<BoxStream<'static, Result<RawTick>>> {
        let script = self.scripts.get(instrument).cloned().unwrap_or_default();
        tracing::info!(
            account_id,
            instrument,
            messages = script.len(),
            "Opening replay price stream"
        );

        let pacing = self.pacing;
        let mut messages = stream::iter(script)
            .then(move |raw| async move {
                if let Some(delay) = pacing {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, anyhow::Error>(raw)
            })
            .boxed();

        if let Some(error) = self.stream_error.clone() {
            messages = messages
                .chain(stream::once(async move { Err(anyhow::anyhow!(error)) }))
                .boxed();
        }
        if self.hold_open {
            messages = messages.chain(stream::pending()).boxed();
        }
        Ok(messages)
    }

    async fn instrument_metadata(&self, instrument: &str) -> Result<InstrumentMetadata> {
        self.metadata
            .get(instrument)
            .cloned()
            .with_context(|| format!("No metadata for instrument {instrument}"))
    }

    async fn account_snapshot(&self, account_id: &str) -> Result<AccountSnapshot> {
        if let Some(snapshot) = self.accounts.get(account_id) {
            return Ok(snapshot.clone());
        }
        Ok(AccountSnapshot {
            account_id: account_id.to_string(),
            balance: Decimal::ZERO,
            nav: Decimal::ZERO,
            margin_used: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
        })
    }
}
