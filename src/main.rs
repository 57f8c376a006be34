use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use log::info;
use reversion_engine::commands::{backtest, inputs::RunInputs, market_data_snapshot, optimize};
use reversion_engine::config::SearchSettings;
use std::path::PathBuf;

const DEFAULT_MARKET_DATA_FILE: &str = "data/market-data.bin";

#[derive(Parser)]
#[command(name = "reversion-engine")]
#[command(about = "Mean-reversion portfolio backtester and parameter search")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct DataArgs {
    /// Market data file (.bin snapshot or .csv)
    #[arg(long = "data-file", value_name = "PATH")]
    data_file: Option<PathBuf>,
    /// Comma separated symbols to keep (defaults to all)
    #[arg(long, value_delimiter = ',')]
    symbols: Vec<String>,
    /// JSON object of parameter overrides
    #[arg(long = "params", value_name = "PATH")]
    params_file: Option<PathBuf>,
    /// Single parameter override, e.g. --set threshold=0.03 (repeatable)
    #[arg(long = "set", value_name = "NAME=VALUE")]
    overrides: Vec<String>,
    /// JSON object of symbol to sector
    #[arg(long = "sectors", value_name = "PATH")]
    sectors_file: Option<PathBuf>,
}

impl DataArgs {
    fn into_inputs(self) -> RunInputs {
        RunInputs {
            data_file: self
                .data_file
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MARKET_DATA_FILE)),
            symbols: self.symbols,
            params_file: self.params_file,
            overrides: self.overrides,
            sectors_file: self.sectors_file,
        }
    }
}

#[derive(Args, Clone)]
struct SearchArgs {
    /// JSON object of parameter name to candidate values
    #[arg(long = "grid", value_name = "PATH")]
    grid_file: PathBuf,
    /// Number of results to print
    #[arg(long, default_value_t = 10)]
    top: usize,
    /// Write results to this file (.json or .csv)
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,
    /// Worker threads (overrides MAX_WORKERS)
    #[arg(long)]
    workers: Option<usize>,
    /// Hide the progress bar
    #[arg(long)]
    no_progress: bool,
}

impl SearchArgs {
    fn settings(&self) -> Result<SearchSettings> {
        let mut settings = SearchSettings::from_env()?;
        if let Some(workers) = self.workers {
            if workers == 0 {
                return Err(anyhow!("--workers must be at least 1"));
            }
            settings.max_workers = workers;
        }
        if self.no_progress {
            settings.show_progress = false;
        }
        Ok(settings)
    }

    fn options(&self) -> optimize::SearchOptions {
        optimize::SearchOptions {
            grid_file: self.grid_file.clone(),
            top_n: self.top,
            output: self.output.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single backtest
    Backtest {
        #[command(flatten)]
        data: DataArgs,
        /// First trading day (YYYY-MM-DD); earlier bars only warm up indicators
        #[arg(long, value_parser = parse_date)]
        start: Option<DateTime<Utc>>,
        /// Directory for report.json, trades.csv and equity.csv
        #[arg(long, value_name = "DIR")]
        output_dir: Option<PathBuf>,
    },
    /// Exhaustive search over a parameter grid
    GridSearch {
        #[command(flatten)]
        data: DataArgs,
        #[command(flatten)]
        search: SearchArgs,
    },
    /// Genetic search over per-parameter value lists
    Genetic {
        #[command(flatten)]
        data: DataArgs,
        #[command(flatten)]
        search: SearchArgs,
        /// Random seed (overrides GENETIC_SEED)
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Rolling train/test grid search
    WalkForward {
        #[command(flatten)]
        data: DataArgs,
        #[command(flatten)]
        search: SearchArgs,
    },
    /// Convert a CSV of bars into a binary snapshot
    Snapshot {
        /// Source CSV with symbol,timestamp,open,high,low,close,volume
        #[arg(long, value_name = "PATH")]
        input: PathBuf,
        /// Destination snapshot file
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

fn parse_date(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Ok(timestamp.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("invalid date '{}', expected YYYY-MM-DD", raw))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting reversion-engine. Backtests are not predictions; results depend on the data supplied.");

    match cli.command {
        Commands::Backtest {
            data,
            start,
            output_dir,
        } => {
            backtest::run(&data.into_inputs(), start, output_dir.as_deref())?;
        }
        Commands::GridSearch { data, search } => {
            let settings = search.settings()?;
            optimize::grid_search(&data.into_inputs(), settings, &search.options())?;
        }
        Commands::Genetic { data, search, seed } => {
            let mut settings = search.settings()?;
            if let Some(seed) = seed {
                settings.genetic_seed = seed;
            }
            optimize::genetic(&data.into_inputs(), settings, &search.options())?;
        }
        Commands::WalkForward { data, search } => {
            let settings = search.settings()?;
            optimize::walk_forward(&data.into_inputs(), settings, &search.options())?;
        }
        Commands::Snapshot { input, output } => {
            let output = output.unwrap_or_else(|| PathBuf::from(DEFAULT_MARKET_DATA_FILE));
            market_data_snapshot::run(&input, &output)?;
        }
    }

    Ok(())
}
