//! Backtest CLI command.
//!
//! With `--data` the ticks come from a CSV file and all state lives in memory.
//! Without it the ticks are replayed from the database and the run is recorded
//! there, so it can be cancelled, paused and resumed like any other task.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, ValueEnum};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use trade_engine_data::{EventStore, TaskStatus};
use trade_engine_execution::{
    ExecutionKind, ExecutionOutcome, ExecutionRequest, HistoricalReplaySource, StopMode,
    TaskExecutor, TickSource, VecTickSource,
};
use trade_engine_orchestrator::process_identity;
use trade_engine_strategy::StrategyRegistry;

use crate::context::{load_config, InstrumentArgs, Stores};

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum StopModeArg {
    Immediate,
    Graceful,
    GracefulClose,
}

impl From<StopModeArg> for StopMode {
    fn from(arg: StopModeArg) -> Self {
        match arg {
            StopModeArg::Immediate => Self::Immediate,
            StopModeArg::Graceful => Self::Graceful,
            StopModeArg::GracefulClose => Self::GracefulClose,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct BacktestArgs {
    /// Tick CSV (timestamp,instrument,bid,ask). Omit to replay stored ticks
    #[arg(short, long)]
    pub data: Option<String>,

    /// Registered strategy id
    #[arg(short, long, default_value = "floor")]
    pub strategy: String,

    /// Strategy configuration: inline JSON, or @path to a JSON file
    #[arg(long)]
    pub strategy_config: Option<String>,

    #[arg(long, default_value = "10000")]
    pub balance: Decimal,

    /// What happens to open positions when the run ends
    #[arg(long, value_enum, default_value = "graceful-close")]
    pub stop_mode: StopModeArg,

    /// Reuse an id to resume an interrupted database-backed run
    #[arg(long)]
    pub execution_id: Option<String>,

    /// Replay stored ticks after this time (RFC 3339)
    #[arg(long)]
    pub from: Option<DateTime<Utc>>,

    /// Replay stored ticks up to this time (RFC 3339)
    #[arg(long)]
    pub until: Option<DateTime<Utc>>,

    #[command(flatten)]
    pub instrument: InstrumentArgs,
}

/// Runs the backtest command and prints a JSON summary.
///
/// # Errors
/// Returns an error if inputs cannot be loaded or the run fails.
pub async fn run_backtest(config_path: &str, args: BacktestArgs) -> Result<()> {
    let config = load_config(config_path)?;
    let metadata = args.instrument.metadata();

    let mut request = ExecutionRequest::new(
        args.execution_id
            .clone()
            .unwrap_or_else(|| format!("backtest-{}", uuid::Uuid::new_v4())),
        ExecutionKind::Backtest,
        &args.strategy,
        metadata.clone(),
        args.balance,
    )
    .with_config(parse_strategy_config(args.strategy_config.as_deref())?)
    .with_stop_mode(args.stop_mode.into());
    request.replay_from = args.from;
    request.replay_until = args.until;
    request.worker_id = Some(process_identity());

    let (stores, mut source): (Stores, Box<dyn TickSource>) = match &args.data {
        Some(path) => {
            let source = VecTickSource::from_csv(path, &metadata.instrument)?;
            tracing::info!(path, ticks = source.remaining(), "Loaded backtest ticks");
            let source: Box<dyn TickSource> = Box::new(source);
            (Stores::memory(), source)
        }
        None => {
            let stores = Stores::postgres(&config).await?;
            let source = HistoricalReplaySource::new(
                stores.ticks.clone(),
                &metadata.instrument,
                config.executor.replay_page_size,
            )
            .starting_after(args.from)
            .until(args.until);
            let source: Box<dyn TickSource> = Box::new(source);
            (stores, source)
        }
    };

    let executor = TaskExecutor::new(
        StrategyRegistry::with_defaults(),
        stores.lifecycle(&config),
        stores.snapshots.clone(),
        stores.events.clone(),
        config.executor.clone(),
    );

    tracing::info!(
        execution_id = %request.execution_id,
        strategy = %request.strategy_id,
        instrument = %metadata.instrument,
        "Running backtest"
    );
    let outcome = executor.run(&request, source.as_mut()).await?;

    let mut event_counts = BTreeMap::new();
    for record in stores.events.list(&request.execution_id).await? {
        *event_counts.entry(record.event.event_type()).or_insert(0_u64) += 1;
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&summary(&outcome, &event_counts))?
    );

    if outcome.status == TaskStatus::Failed {
        anyhow::bail!(
            "backtest failed: {}",
            outcome.message.unwrap_or_default()
        );
    }
    Ok(())
}

fn parse_strategy_config(raw: Option<&str>) -> Result<Value> {
    let Some(raw) = raw else {
        return Ok(Value::Null);
    };
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read strategy config: {path}"))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).context("Strategy config is not valid JSON")
}

fn summary(outcome: &ExecutionOutcome, event_counts: &BTreeMap<&str, u64>) -> Value {
    let state = &outcome.final_state;
    json!({
        "execution_id": outcome.execution_id,
        "status": outcome.status,
        "message": outcome.message,
        "ticks_processed": outcome.ticks_processed,
        "events_emitted": outcome.events_emitted,
        "events": event_counts,
        "resumed_from_sequence": outcome.resumed_from_sequence,
        "last_tick_timestamp": state.last_tick_timestamp,
        "final_balance": state.current_balance,
        "open_positions": state.open_positions,
        "metrics": state.metrics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_config_accepts_inline_json() {
        let value = parse_strategy_config(Some(r#"{"max_layers": 2}"#)).unwrap();
        assert_eq!(value["max_layers"], 2);
        assert_eq!(parse_strategy_config(None).unwrap(), Value::Null);
        assert!(parse_strategy_config(Some("{oops")).is_err());
    }
}
