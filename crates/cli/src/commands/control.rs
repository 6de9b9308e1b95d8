//! Run-record control commands: cancel, pause, resume, status, recover.
//!
//! All of them act on the database; workers notice the change at their next
//! stop/pause check.

use anyhow::Result;
use chrono::Utc;
use clap::Args;
use trade_engine_core::SystemClock;
use trade_engine_data::RunRecord;
use trade_engine_orchestrator::lifecycle::PAUSED_META_KEY;
use trade_engine_orchestrator::recover_orphaned_runs;

use crate::context::{load_config, Stores};

/// Identifies one run record.
#[derive(Args, Debug, Clone)]
pub struct RunTarget {
    /// Task name (e.g., "execution.trading", "market_data.tick_publisher")
    pub task_name: String,

    /// Instance key (execution id, or "{account}:{instrument}" for stream tasks)
    pub instance_key: String,
}

#[derive(Args, Debug, Clone)]
pub struct CancelArgs {
    #[command(flatten)]
    pub target: RunTarget,

    /// Recorded as the run's status message
    #[arg(long)]
    pub reason: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// Only runs of this task
    #[arg(long)]
    pub task: Option<String>,

    /// Show one run (requires --task) as JSON, including terminal ones
    #[arg(long, requires = "task")]
    pub key: Option<String>,
}

/// # Errors
/// Returns an error if the database is unreachable.
pub async fn run_cancel(config_path: &str, args: CancelArgs) -> Result<()> {
    let config = load_config(config_path)?;
    let lifecycle = Stores::postgres(&config).await?.lifecycle(&config);
    let RunTarget {
        task_name,
        instance_key,
    } = &args.target;

    if lifecycle
        .request_cancel(task_name, instance_key, args.reason.as_deref())
        .await?
    {
        println!("Stop requested for {task_name}:{instance_key}");
    } else {
        println!("{task_name}:{instance_key} is not running");
    }
    Ok(())
}

/// # Errors
/// Returns an error if the database is unreachable or no active run matches.
pub async fn run_set_paused(config_path: &str, target: RunTarget, paused: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let lifecycle = Stores::postgres(&config).await?.lifecycle(&config);
    lifecycle
        .set_paused(&target.task_name, &target.instance_key, paused)
        .await?;
    let verb = if paused { "Paused" } else { "Resumed" };
    println!("{verb} {}:{}", target.task_name, target.instance_key);
    Ok(())
}

/// # Errors
/// Returns an error if the database is unreachable.
pub async fn run_status(config_path: &str, args: StatusArgs) -> Result<()> {
    let config = load_config(config_path)?;
    let lifecycle = Stores::postgres(&config).await?.lifecycle(&config);

    if let (Some(task), Some(key)) = (&args.task, &args.key) {
        match lifecycle.get(task, key).await? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => println!("No run record for {task}:{key}"),
        }
        return Ok(());
    }

    let records = lifecycle.list_active(args.task.as_deref()).await?;
    if records.is_empty() {
        println!("No active runs");
        return Ok(());
    }
    println!(
        "{:<30} {:<36} {:<15} {:<24} {:>8}  MESSAGE",
        "TASK", "INSTANCE", "STATUS", "WORKER", "AGE(s)"
    );
    for record in &records {
        println!("{}", status_line(record));
    }
    Ok(())
}

fn status_line(record: &RunRecord) -> String {
    let last_seen = record.last_heartbeat_at.unwrap_or(record.started_at);
    let paused = if record.meta_flag(PAUSED_META_KEY) {
        " (paused)"
    } else {
        ""
    };
    format!(
        "{:<30} {:<36} {:<15} {:<24} {:>8}  {}{paused}",
        record.task_name,
        record.instance_key,
        record.status.as_str(),
        record.worker_id.as_deref().unwrap_or("-"),
        (Utc::now() - last_seen).num_seconds(),
        record.status_message.as_deref().unwrap_or(""),
    )
}

/// Marks every active run STOPPED. Only safe while no worker is running.
///
/// # Errors
/// Returns an error if the database is unreachable.
pub async fn run_recover(config_path: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let stores = Stores::postgres(&config).await?;
    let recovered = recover_orphaned_runs(stores.runs.as_ref(), &SystemClock).await?;
    println!("Recovered {recovered} orphaned run(s)");
    Ok(())
}
