//! Loads a tick CSV into the tick store.

use anyhow::Result;
use clap::Args;
use trade_engine_data::{CsvStorage, TickStore};

use crate::context::{load_config, Stores};

#[derive(Args, Debug, Clone)]
pub struct ImportTicksArgs {
    /// Tick CSV (timestamp,instrument,bid,ask)
    #[arg(short, long)]
    pub file: String,

    /// Only import rows for this instrument
    #[arg(long)]
    pub instrument: Option<String>,
}

/// Upserts the file in batches; rows already stored are skipped.
///
/// # Errors
/// Returns an error if the file cannot be parsed or a batch fails to write.
pub async fn run_import_ticks(config_path: &str, args: ImportTicksArgs) -> Result<()> {
    let config = load_config(config_path)?;
    let mut ticks = CsvStorage::read_ticks(&args.file)?;
    if let Some(instrument) = &args.instrument {
        ticks.retain(|t| &t.instrument == instrument);
    }

    let stores = Stores::postgres(&config).await?;
    let batch_size = config.ticks.flush_batch_size.max(1);
    let mut inserted = 0;
    for (index, batch) in ticks.chunks(batch_size).enumerate() {
        inserted += stores.ticks.upsert_batch(batch).await?;
        tracing::debug!(batch = index + 1, rows = batch.len(), "Imported tick batch");
    }

    tracing::info!(file = %args.file, rows = ticks.len(), inserted, "Tick import finished");
    println!(
        "Imported {inserted} new tick(s) from {} row(s)",
        ticks.len()
    );
    Ok(())
}
