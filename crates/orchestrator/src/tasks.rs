//! Task names, instance keys and lock keys shared by producers and workers.

use serde::{Deserialize, Serialize};

pub const TICK_PUBLISHER_TASK: &str = "market_data.tick_publisher";
pub const TICK_SUBSCRIBER_TASK: &str = "market_data.tick_subscriber";
pub const BACKTEST_TASK: &str = "execution.backtest";
pub const TRADING_TASK: &str = "execution.trading";

/// Instance key of per-account, per-instrument stream tasks.
#[must_use]
pub fn stream_instance_key(account_id: &str, instrument: &str) -> String {
    format!("{account_id}:{instrument}")
}

#[must_use]
pub fn publisher_lock_key(account_id: &str, instrument: &str) -> String {
    format!("tick-publisher:{account_id}:{instrument}")
}

#[must_use]
pub fn subscriber_lock_key(account_id: &str, instrument: &str) -> String {
    format!("tick-subscriber:{account_id}:{instrument}")
}

/// Arguments of the publisher and subscriber tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamTaskArgs {
    pub account_id: String,
    pub instrument: String,
}

impl StreamTaskArgs {
    pub fn new(account_id: impl Into<String>, instrument: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            instrument: instrument.into(),
        }
    }

    #[must_use]
    pub fn instance_key(&self) -> String {
        stream_instance_key(&self.account_id, &self.instrument)
    }
}
