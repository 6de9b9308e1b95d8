//! Tick sources feeding the executor.
//!
//! `next_tick` must be cancel-safe: the executor races it against its
//! stop/pause poll and drops the future when the poll wins.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use trade_engine_core::{PubSub, Tick};
use trade_engine_data::{CsvStorage, TickStore};

#[async_trait]
pub trait TickSource: Send {
    /// Next tick in timestamp order, `None` once the source is exhausted.
    async fn next_tick(&mut self) -> Result<Option<Tick>>;

    /// Skips every tick at or before `timestamp`. Called once before the
    /// first `next_tick` when resuming from a snapshot.
    fn resume_after(&mut self, timestamp: DateTime<Utc>);

    /// Live sources keep flowing while an execution is paused; their ticks are
    /// drained and skipped. Replay sources simply wait.
    fn is_live(&self) -> bool {
        false
    }
}

/// Pages ticks out of a [`TickStore`].
pub struct HistoricalReplaySource {
    store: Arc<dyn TickStore>,
    instrument: String,
    after: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    page_size: usize,
    buffer: VecDeque<Tick>,
    exhausted: bool,
}

impl HistoricalReplaySource {
    pub fn new(
        store: Arc<dyn TickStore>,
        instrument: impl Into<String>,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            instrument: instrument.into(),
            after: None,
            until: None,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Replays only ticks strictly after `from`.
    #[must_use]
    pub fn starting_after(mut self, from: Option<DateTime<Utc>>) -> Self {
        self.after = from;
        self
    }

    /// Replays only ticks at or before `until`.
    #[must_use]
    pub fn until(mut self, until: Option<DateTime<Utc>>) -> Self {
        self.until = until;
        self
    }
}

#[async_trait]
impl TickSource for HistoricalReplaySource {
    async fn next_tick(&mut self) -> Result<Option<Tick>> {
        if self.buffer.is_empty() && !self.exhausted {
            let page = self
                .store
                .range(&self.instrument, self.after, self.until, self.page_size)
                .await?;
            self.exhausted = page.len() < self.page_size;
            if let Some(last) = page.last() {
                self.after = Some(last.timestamp);
            }
            self.buffer.extend(page);
        }
        Ok(self.buffer.pop_front())
    }

    fn resume_after(&mut self, timestamp: DateTime<Utc>) {
        self.buffer.retain(|t| t.timestamp > timestamp);
        if self.after.map_or(true, |after| after < timestamp) {
            self.after = Some(timestamp);
        }
    }
}

/// In-memory tick list, used for CSV backtests and tests.
#[derive(Debug, Default)]
pub struct VecTickSource {
    ticks: VecDeque<Tick>,
}

impl VecTickSource {
    /// Sorts `ticks` by timestamp.
    #[must_use]
    pub fn new(mut ticks: Vec<Tick>) -> Self {
        ticks.sort_by_key(|t| t.timestamp);
        Self {
            ticks: ticks.into(),
        }
    }

    /// Loads `path` and keeps the rows for `instrument`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_csv(path: &str, instrument: &str) -> Result<Self> {
        let ticks = CsvStorage::read_ticks(path)?
            .into_iter()
            .filter(|t| t.instrument == instrument)
            .collect();
        Ok(Self::new(ticks))
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.ticks.len()
    }
}

#[async_trait]
impl TickSource for VecTickSource {
    async fn next_tick(&mut self) -> Result<Option<Tick>> {
        Ok(self.ticks.pop_front())
    }

    fn resume_after(&mut self, timestamp: DateTime<Utc>) {
        self.ticks.retain(|t| t.timestamp > timestamp);
    }
}

/// Ticks arriving on a pub/sub channel.
///
/// Malformed payloads and ticks not newer than the last one delivered are
/// dropped. The source ends when the subscription ends.
pub struct LiveTickSource {
    stream: BoxStream<'static, String>,
    instrument: String,
    after: Option<DateTime<Utc>>,
    malformed: u64,
}

impl LiveTickSource {
    pub fn new(stream: BoxStream<'static, String>, instrument: impl Into<String>) -> Self {
        Self {
            stream,
            instrument: instrument.into(),
            after: None,
            malformed: 0,
        }
    }

    /// # Errors
    /// Returns an error if the subscription cannot be established.
    pub async fn subscribe(bus: &dyn PubSub, channel: &str, instrument: &str) -> Result<Self> {
        let stream = bus.subscribe(channel).await?;
        tracing::info!(channel, instrument, "Live tick source subscribed");
        Ok(Self::new(stream, instrument))
    }

    #[must_use]
    pub const fn malformed(&self) -> u64 {
        self.malformed
    }
}

#[async_trait]
impl TickSource for LiveTickSource {
    async fn next_tick(&mut self) -> Result<Option<Tick>> {
        while let Some(payload) = self.stream.next().await {
            let tick = match Tick::from_wire(&payload) {
                Ok(tick) if tick.instrument == self.instrument => tick,
                Ok(tick) => {
                    tracing::debug!(instrument = %tick.instrument, "Ignoring tick for another instrument");
                    continue;
                }
                Err(e) => {
                    self.malformed += 1;
                    tracing::warn!("Dropping malformed tick message: {e}");
                    continue;
                }
            };
            if self.after.is_some_and(|after| tick.timestamp <= after) {
                continue;
            }
            self.after = Some(tick.timestamp);
            return Ok(Some(tick));
        }
        Ok(None)
    }

    fn resume_after(&mut self, timestamp: DateTime<Utc>) {
        self.after = Some(timestamp);
    }

    fn is_live(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use trade_engine_data::MemoryStore;

    fn ticks(n: i64) -> Vec<Tick> {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        (0..n)
            .map(|i| Tick::new("EUR_USD", t0 + Duration::seconds(i), dec!(1.1000), dec!(1.1002)))
            .collect()
    }

    async fn drain(source: &mut dyn TickSource) -> Vec<Tick> {
        let mut out = Vec::new();
        while let Some(tick) = source.next_tick().await.unwrap() {
            out.push(tick);
        }
        out
    }

    #[tokio::test]
    async fn replay_pages_through_the_store() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_batch(&ticks(25)).await.unwrap();

        let mut source = HistoricalReplaySource::new(store, "EUR_USD", 10);
        let replayed = drain(&mut source).await;
        assert_eq!(replayed, ticks(25));
    }

    #[tokio::test]
    async fn replay_resumes_after_timestamp() {
        let store = Arc::new(MemoryStore::new());
        let all = ticks(12);
        store.upsert_batch(&all).await.unwrap();

        let mut source = HistoricalReplaySource::new(store, "EUR_USD", 5).until(Some(all[9].timestamp));
        source.resume_after(all[6].timestamp);
        let replayed = drain(&mut source).await;
        assert_eq!(replayed, all[7..=9].to_vec());
    }

    #[tokio::test]
    async fn vec_source_skips_already_processed_ticks() {
        let all = ticks(5);
        let mut reversed = all.clone();
        reversed.reverse();
        let mut source = VecTickSource::new(reversed);
        source.resume_after(all[2].timestamp);
        assert_eq!(drain(&mut source).await, all[3..].to_vec());
    }

    #[tokio::test]
    async fn live_source_drops_malformed_and_stale_messages() {
        let all = ticks(3);
        let messages = vec![
            all[1].to_wire().unwrap(),
            "{not json".to_string(),
            all[0].to_wire().unwrap(),
            all[2].to_wire().unwrap(),
        ];
        let mut source = LiveTickSource::new(futures_util::stream::iter(messages).boxed(), "EUR_USD");
        assert!(source.is_live());

        let received = drain(&mut source).await;
        assert_eq!(received, vec![all[1].clone(), all[2].clone()]);
        assert_eq!(source.malformed(), 1);
    }
}
