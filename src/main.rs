//! barsim - main entry point
//!
//! One subcommand: `run`, which loads a run configuration, builds the
//! simulation runner and drives it across the requested schedule. Exit
//! code is non-zero on stuck-order or invalid-transition errors.

use anyhow::{Context, Result};
use barsim::config::Config;
use barsim::runner::{SimRunner, StrategyRegistry};
use barsim::types::BarTime;
use chrono::DateTime;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "barsim")]
#[command(about = "Bar-driven trading simulation engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a simulation across a bar schedule
    Run {
        /// Start datetime (ISO-8601, e.g. 2024-01-02T09:30:00Z)
        #[arg(long)]
        start: String,

        /// End datetime (ISO-8601)
        #[arg(long)]
        end: String,

        /// Bar frequency (e.g. 1min, 15min, 1h, 1D)
        #[arg(long, default_value = "1min")]
        freq: String,

        /// Source name used for logs and persisted snapshots
        #[arg(long, default_value = "simulation")]
        source: String,

        /// Path to the run configuration file
        #[arg(short, long, default_value = "configs/run.json")]
        config: String,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(true);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    Ok(())
}

fn parse_datetime(s: &str) -> Result<BarTime> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.to_utc())
        .with_context(|| format!("invalid datetime: {s}"))
}

fn run(start: String, end: String, freq: String, source: String, config_path: String) -> Result<()> {
    let start = parse_datetime(&start)?;
    let end = parse_datetime(&end)?;

    let mut config = if std::path::Path::new(&config_path).exists() {
        Config::from_file(&config_path)?
    } else {
        info!(config = %config_path, "config file not found, using defaults");
        Config::default()
    };
    config.source = source;

    let registry = StrategyRegistry::with_builtins();
    let runner = SimRunner::from_config(&config, &registry)?;
    let processor = runner.run(start, end, &freq)?;

    println!(
        "run complete: {} orders ({} open, {} closed), {} position rows",
        processor.oms().open_count() + processor.oms().closed_count(),
        processor.oms().open_count(),
        processor.oms().closed_count(),
        processor.positions().positions_table().len(),
    );
    for row in processor.positions().positions_table() {
        println!(
            "  {} {} {} position={} trade_pnl={:.2} net_pnl={:.2}",
            row.strategy_id, row.product_type, row.symbol, row.current_position,
            row.trade_pnl, row.net_pnl,
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose, "run")?;

    match cli.command {
        Commands::Run {
            start,
            end,
            freq,
            source,
            config,
        } => run(start, end, freq, source, config),
    }
}
