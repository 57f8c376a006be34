use crate::commands::inputs::RunInputs;
use crate::engine::Engine;
use crate::export::{export_equity_csv, export_json, export_trades_csv, write_output};
use crate::models::BacktestReport;
use crate::param_utils::format_parameters;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use log::info;
use std::path::Path;

pub fn run(
    inputs: &RunInputs,
    trading_start: Option<DateTime<Utc>>,
    output_dir: Option<&Path>,
) -> Result<BacktestReport> {
    let data = inputs.market_data()?;
    let params = inputs.parameter_set()?;
    info!(
        "Backtesting {} with {}",
        params.signal_variant.as_str(),
        format_parameters(&params.to_parameters())
    );

    let mut engine = Engine::new(params)?;
    if let Some(sector_map) = inputs.sector_map()? {
        engine = engine.with_sector_map(sector_map);
    }
    let report = engine.backtest_from(data.bars(), trading_start)?;
    print_report(&report);

    if let Some(dir) = output_dir {
        if dir.exists() && !dir.is_dir() {
            return Err(anyhow!("{} exists and is not a directory", dir.display()));
        }
        write_output(dir.join("report.json"), &export_json(&report)?)?;
        write_output(dir.join("trades.csv"), &export_trades_csv(&report.trades)?)?;
        write_output(dir.join("equity.csv"), &export_equity_csv(&report.equity_curve)?)?;
        info!("Backtest artifacts written to {}", dir.display());
    }

    Ok(report)
}

pub fn print_report(report: &BacktestReport) {
    let metrics = &report.metrics;
    println!("\n=== BACKTEST RESULTS ===\n");
    println!("  Initial Balance: {:.2}", report.initial_balance);
    println!("  Final Equity: {:.2}", report.final_equity);
    println!(
        "  Total Return: {:.2} ({:.2}%)",
        metrics.total_return,
        metrics.total_return_pct * 100.0
    );
    println!("  Sharpe Ratio: {:.4}", metrics.sharpe_ratio);
    println!(
        "  Max Drawdown: {:.2}% ({:.2})",
        metrics.max_drawdown * 100.0,
        metrics.max_drawdown_amount
    );
    println!(
        "  Trades: {} ({} wins, {} losses, win rate {:.2}%)",
        metrics.total_trades,
        metrics.winning_trades,
        metrics.losing_trades,
        metrics.win_rate * 100.0
    );
    println!(
        "  Avg Win: {:.2}  Avg Loss: {:.2}  Profit Factor: {:.3}",
        metrics.avg_win, metrics.avg_loss, metrics.profit_factor
    );
    println!(
        "  Avg Holding Period: {:.1}h",
        metrics.avg_holding_period_hours
    );
    println!(
        "  Final Leverage: {:.2} (streaks: {} wins, {} losses)",
        report.risk_state.current_leverage,
        report.risk_state.winning_streak,
        report.risk_state.losing_streak
    );
    if report.vetoed_entries > 0 || report.skipped_steps > 0 {
        println!(
            "  Vetoed Entries: {}  Skipped Steps: {}",
            report.vetoed_entries, report.skipped_steps
        );
    }
    if report.numerical_blowup {
        println!("  WARNING: numerical blow-up detected; returns were reset");
    }
    if report.penalty_factor < 1.0 {
        println!("  Penalty Factor: {:.2}", report.penalty_factor);
    }
    println!();
}
