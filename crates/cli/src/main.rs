use clap::{Parser, Subcommand};

mod commands;
mod context;

use commands::{BacktestArgs, CancelArgs, ImportTicksArgs, RunTarget, StatusArgs, WorkerArgs};

#[derive(Parser)]
#[command(name = "trade-engine")]
#[command(about = "Tick distribution and strategy execution engine", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, global = true, default_value = "config/Config.toml")]
    config: String,

    /// Optional log file path (logs to file instead of stderr)
    #[arg(long, global = true)]
    log_file: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a worker: tick supervisor, publisher/subscriber and execution tasks
    Worker(WorkerArgs),
    /// Run a backtest and print a JSON summary
    Backtest(BacktestArgs),
    /// Request a cooperative stop of a running task
    Cancel(CancelArgs),
    /// Pause a running execution
    Pause(RunTarget),
    /// Resume a paused execution
    Resume(RunTarget),
    /// Show active runs, or one run in detail
    Status(StatusArgs),
    /// Mark runs orphaned by a dead worker as STOPPED
    Recover,
    /// Load a tick CSV into the database
    ImportTicks(ImportTicksArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref())?;

    let config = cli.config.as_str();
    match cli.command {
        Commands::Worker(args) => commands::run_worker(config, args).await?,
        Commands::Backtest(args) => commands::run_backtest(config, args).await?,
        Commands::Cancel(args) => commands::run_cancel(config, args).await?,
        Commands::Pause(target) => commands::run_set_paused(config, target, true).await?,
        Commands::Resume(target) => commands::run_set_paused(config, target, false).await?,
        Commands::Status(args) => commands::run_status(config, args).await?,
        Commands::Recover => commands::run_recover(config).await?,
        Commands::ImportTicks(args) => commands::run_import_ticks(config, args).await?,
    }

    Ok(())
}

fn init_logging(log_file: Option<&str>) -> anyhow::Result<()> {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}
