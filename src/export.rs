//! CSV and JSON artifacts for search results and single runs.

use crate::models::{EquityPoint, OptimizationResult, PerformanceMetrics, Trade};
use crate::walk_forward::WalkForwardResult;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;

const METRIC_COLUMNS: [&str; 12] = [
    "total_return",
    "total_return_pct",
    "sharpe_ratio",
    "max_drawdown",
    "total_trades",
    "winning_trades",
    "losing_trades",
    "win_rate",
    "avg_win",
    "avg_loss",
    "profit_factor",
    "final_equity",
];

fn metric_cells(metrics: &PerformanceMetrics) -> Vec<String> {
    vec![
        format!("{:.2}", metrics.total_return),
        format!("{:.6}", metrics.total_return_pct),
        format!("{:.6}", metrics.sharpe_ratio),
        format!("{:.6}", metrics.max_drawdown),
        metrics.total_trades.to_string(),
        metrics.winning_trades.to_string(),
        metrics.losing_trades.to_string(),
        format!("{:.6}", metrics.win_rate),
        format!("{:.2}", metrics.avg_win),
        format!("{:.2}", metrics.avg_loss),
        format!("{:.6}", metrics.profit_factor),
        format!("{:.2}", metrics.final_equity),
    ]
}

/// Parameter names in column order, the union across all results.
fn parameter_columns<'a, I>(parameter_sets: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a std::collections::BTreeMap<String, f64>>,
{
    let names: BTreeSet<&String> = parameter_sets
        .into_iter()
        .flat_map(|parameters| parameters.keys())
        .collect();
    names.into_iter().cloned().collect()
}

fn parameter_cells(
    columns: &[String],
    parameters: &std::collections::BTreeMap<String, f64>,
) -> Vec<String> {
    columns
        .iter()
        .map(|name| {
            parameters
                .get(name)
                .map(|value| value.to_string())
                .unwrap_or_default()
        })
        .collect()
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<String> {
    let data = writer.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

/// One row per result: rank, parameters in name order, metrics, penalty and score.
pub fn export_results_csv(results: &[OptimizationResult]) -> Result<String> {
    let columns = parameter_columns(results.iter().map(|result| &result.parameters));
    let mut writer = csv::Writer::from_writer(vec![]);

    let mut header = vec!["rank".to_string()];
    header.extend(columns.iter().cloned());
    header.extend(METRIC_COLUMNS.iter().map(|name| name.to_string()));
    header.push("penalty_factor".to_string());
    header.push("score".to_string());
    writer.write_record(&header)?;

    for (rank, result) in results.iter().enumerate() {
        let mut row = vec![(rank + 1).to_string()];
        row.extend(parameter_cells(&columns, &result.parameters));
        row.extend(metric_cells(&result.metrics));
        row.push(format!("{:.4}", result.penalty_factor));
        row.push(format!("{:.6}", result.score));
        writer.write_record(&row)?;
    }

    finish(writer)
}

pub fn export_walk_forward_csv(results: &[WalkForwardResult]) -> Result<String> {
    let columns = parameter_columns(results.iter().map(|result| &result.best_parameters));
    let mut writer = csv::Writer::from_writer(vec![]);

    let mut header: Vec<String> = [
        "window",
        "train_start",
        "train_end",
        "test_start",
        "test_end",
        "in_sample_score",
        "out_of_sample_score",
    ]
    .iter()
    .map(|name| name.to_string())
    .collect();
    header.extend(columns.iter().cloned());
    header.extend(METRIC_COLUMNS.iter().map(|name| name.to_string()));
    writer.write_record(&header)?;

    for result in results {
        let mut row = vec![
            (result.window_index + 1).to_string(),
            result.train_start.to_rfc3339(),
            result.train_end.to_rfc3339(),
            result.test_start.to_rfc3339(),
            result.test_end.to_rfc3339(),
            format!("{:.6}", result.in_sample_score),
            format!("{:.6}", result.out_of_sample.score),
        ];
        row.extend(parameter_cells(&columns, &result.best_parameters));
        row.extend(metric_cells(&result.out_of_sample.metrics));
        writer.write_record(&row)?;
    }

    finish(writer)
}

pub fn export_trades_csv(trades: &[Trade]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(vec![]);
    writer.write_record([
        "symbol",
        "side",
        "quantity",
        "entry_time",
        "entry_price",
        "exit_time",
        "exit_price",
        "pnl",
        "pnl_pct",
        "leverage",
        "exit_reason",
    ])?;

    for trade in trades {
        writer.write_record([
            trade.symbol.clone(),
            trade.side.as_str().to_string(),
            format!("{:.6}", trade.quantity),
            trade.entry_time.to_rfc3339(),
            format!("{:.6}", trade.entry_price),
            trade.exit_time.to_rfc3339(),
            format!("{:.6}", trade.exit_price),
            format!("{:.2}", trade.pnl),
            format!("{:.6}", trade.pnl_pct),
            format!("{:.2}", trade.leverage),
            trade.exit_reason.as_str().to_string(),
        ])?;
    }

    finish(writer)
}

pub fn export_equity_csv(equity_curve: &[EquityPoint]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(vec![]);
    writer.write_record(["timestamp", "total_equity", "cash", "open_positions"])?;
    for point in equity_curve {
        writer.write_record([
            point.timestamp.to_rfc3339(),
            format!("{:.2}", point.total_equity),
            format!("{:.2}", point.cash),
            point.open_positions.to_string(),
        ])?;
    }
    finish(writer)
}

/// Pretty JSON. Non-finite floats (an infinite profit factor) serialize as `null`.
pub fn export_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).context("failed to serialize results to JSON")
}

/// Writes `contents` to `path`, creating parent directories.
pub fn write_output<P: AsRef<Path>>(path: P, contents: &str) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
    }
    std::fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))
}

pub fn is_json_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Picks CSV or JSON by the file extension; anything but `.json` is CSV.
pub fn save_results<P: AsRef<Path>>(path: P, results: &[OptimizationResult]) -> Result<()> {
    let path = path.as_ref();
    let contents = if is_json_path(path) {
        export_json(results)?
    } else {
        export_results_csv(results)?
    };
    write_output(path, &contents)
}
