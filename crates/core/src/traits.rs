use crate::market::{AccountSnapshot, InstrumentMetadata};
use crate::tick::RawTick;
use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Broker client surface used by the engine.
///
/// The stream ends (or yields an error) when the connection drops; callers do
/// not reconnect themselves.
#[async_trait]
pub trait MarketGateway: Send + Sync {
    async fn stream(
        &self,
        account_id: &str,
        instrument: &str,
    ) -> Result<BoxStream<'static, Result<RawTick>>>;

    async fn instrument_metadata(&self, instrument: &str) -> Result<InstrumentMetadata>;

    async fn account_snapshot(&self, account_id: &str) -> Result<AccountSnapshot>;
}

/// Message bus with per-channel ordering.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;

    /// Subscribes to a channel. The stream ends when the subscription is lost.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>>;
}
