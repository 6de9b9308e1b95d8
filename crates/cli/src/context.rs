//! Backends shared by the commands.

use anyhow::Result;
use clap::Args;
use rust_decimal::Decimal;
use std::sync::Arc;
use trade_engine_core::{AppConfig, ConfigLoader, InstrumentMetadata, SystemClock};
use trade_engine_data::{
    AccountStore, DatabaseClient, EventStore, MemoryStore, Repositories, RunRecordStore,
    SnapshotStore, TickStore,
};
use trade_engine_orchestrator::TaskLifecycleRegistry;

/// Loads configuration, logging where it came from.
pub fn load_config(path: &str) -> Result<AppConfig> {
    let config = ConfigLoader::load_from(path)?;
    tracing::debug!(path, instruments = ?config.ticks.instruments, "Configuration loaded");
    Ok(config)
}

pub struct Stores {
    pub runs: Arc<dyn RunRecordStore>,
    pub ticks: Arc<dyn TickStore>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub events: Arc<dyn EventStore>,
    pub accounts: Arc<dyn AccountStore>,
}

impl Stores {
    /// Process-local stores; nothing survives the process.
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            runs: store.clone(),
            ticks: store.clone(),
            snapshots: store.clone(),
            events: store.clone(),
            accounts: store,
        }
    }

    /// # Errors
    /// Returns an error if the database is unreachable or a migration fails.
    pub async fn postgres(config: &AppConfig) -> Result<Self> {
        let database = DatabaseClient::connect(&config.database).await?;
        let Repositories {
            runs,
            ticks,
            snapshots,
            events,
            accounts,
        } = database.repositories();
        Ok(Self {
            runs: Arc::new(runs),
            ticks: Arc::new(ticks),
            snapshots: Arc::new(snapshots),
            events: Arc::new(events),
            accounts: Arc::new(accounts),
        })
    }

    pub fn lifecycle(&self, config: &AppConfig) -> TaskLifecycleRegistry {
        TaskLifecycleRegistry::new(
            self.runs.clone(),
            Arc::new(SystemClock),
            config.lifecycle.clone(),
        )
    }
}

/// Broker metadata of the traded instrument.
#[derive(Args, Debug, Clone)]
pub struct InstrumentArgs {
    /// Instrument to trade (e.g., "EUR_USD")
    #[arg(long, default_value = "EUR_USD")]
    pub instrument: String,

    /// Pip exponent: -4 for most pairs, -2 for JPY crosses
    #[arg(long, default_value_t = -4, allow_hyphen_values = true)]
    pub pip_location: i32,

    /// Margin fraction of notional (0.02 is 50:1 leverage)
    #[arg(long, default_value = "0.02")]
    pub margin_rate: Decimal,

    #[arg(long, default_value_t = 5)]
    pub display_precision: u32,
}

impl InstrumentArgs {
    pub fn metadata(&self) -> InstrumentMetadata {
        InstrumentMetadata {
            instrument: self.instrument.clone(),
            pip_location: self.pip_location,
            margin_rate: self.margin_rate,
            display_precision: self.display_precision,
        }
    }
}
