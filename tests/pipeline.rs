use anyhow::Result;
use chrono::{Duration, TimeZone, Utc};
use reversion_engine::commands::{backtest, inputs::RunInputs, market_data_snapshot, optimize};
use reversion_engine::config::{ParameterSet, SearchSettings, SignalVariant};
use reversion_engine::data_context::MarketData;
use reversion_engine::engine::Engine;
use reversion_engine::export::export_results_csv;
use reversion_engine::genetic::{GeneticConfig, GeneticOptimizer};
use reversion_engine::optimizer::{OptimizationEngine, OptimizationSummary};
use reversion_engine::optimizer_status::OptimizerStatus;
use reversion_engine::param_utils::ParameterGrid;
use reversion_engine::walk_forward::{WalkForwardConfig, WalkForwardOptimizer};
use std::f64::consts::PI;
use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;

const TOTAL_DAYS: usize = 200;
const SYMBOLS: [(&str, f64, f64); 3] = [("AAA", 100.0, 6.0), ("BBB", 50.0, 2.5), ("CCC", 250.0, 12.0)];

fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn quiet_settings() -> SearchSettings {
    SearchSettings {
        max_workers: 2,
        show_progress: false,
        genetic_population: 8,
        genetic_generations: 3,
        walk_forward_train_days: 60,
        walk_forward_test_days: 30,
        walk_forward_step_days: 30,
        ..SearchSettings::default()
    }
}

/// Mean-reverting closes: a slow cycle plus a faster wobble around `base`.
fn close_at(day: usize, base: f64, amplitude: f64) -> f64 {
    let t = day as f64;
    base + amplitude * (2.0 * PI * t / 23.0).sin() + amplitude * 0.3 * (2.0 * PI * t / 7.0).cos()
}

fn write_market_csv(dir: &Path) -> Result<PathBuf> {
    let start = Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).unwrap();
    let mut csv = String::from("symbol,timestamp,open,high,low,close,volume\n");
    for day in 0..TOTAL_DAYS {
        let date = (start + Duration::days(day as i64)).format("%Y-%m-%d");
        for (symbol, base, amplitude) in SYMBOLS {
            let close = close_at(day, base, amplitude);
            let open = if day == 0 { close } else { close_at(day - 1, base, amplitude) };
            writeln!(
                csv,
                "{},{},{:.4},{:.4},{:.4},{:.4},{}",
                symbol.to_lowercase(),
                date,
                open,
                open.max(close) * 1.002,
                open.min(close) * 0.998,
                close,
                10_000 + day * 10
            )?;
        }
    }
    let path = dir.join("bars.csv");
    fs::write(&path, csv)?;
    Ok(path)
}

fn search_grid() -> ParameterGrid {
    let mut grid = ParameterGrid::new();
    grid.insert("lookback_window".to_string(), vec![10.0, 20.0]);
    grid.insert("threshold".to_string(), vec![0.01, 0.03]);
    grid.insert("stop_loss_pct".to_string(), vec![0.03, 0.06]);
    grid
}

#[test]
fn csv_snapshot_and_backtest_round_trip() -> Result<()> {
    ensure_test_env();
    let dir = tempfile::tempdir()?;
    let csv_path = write_market_csv(dir.path())?;
    let snapshot_path = dir.path().join("snapshots/market.bin");

    let converted = market_data_snapshot::run(&csv_path, &snapshot_path)?;
    assert_eq!(converted.symbols(), ["AAA", "BBB", "CCC"]);
    assert_eq!(converted.timestamps().len(), TOTAL_DAYS);

    let loaded = MarketData::load_from_file(&snapshot_path)?;
    assert_eq!(loaded.fingerprint(), converted.fingerprint());
    assert_eq!(loaded.bars(), converted.bars());

    let engine = Engine::new(ParameterSet::default())?;
    let report = engine.backtest(loaded.bars())?;
    assert!(!report.trades.is_empty());
    assert_eq!(report.equity_curve.len(), TOTAL_DAYS);
    let realized: f64 = report.trades.iter().map(|trade| trade.pnl).sum();
    assert!((report.initial_balance + realized - report.final_equity).abs() < 1e-6);
    assert_eq!(
        report.metrics.winning_trades + report.metrics.losing_trades,
        report.metrics.total_trades
    );
    Ok(())
}

#[test]
fn backtest_command_writes_artifacts() -> Result<()> {
    ensure_test_env();
    let dir = tempfile::tempdir()?;
    let csv_path = write_market_csv(dir.path())?;
    let output_dir = dir.path().join("run");

    let inputs = RunInputs {
        data_file: csv_path,
        symbols: vec!["aaa".to_string(), "BBB".to_string()],
        overrides: vec!["signal_variant=1".to_string(), "z_score_threshold=1.5".to_string()],
        ..RunInputs::default()
    };
    assert_eq!(inputs.parameter_set()?.signal_variant, SignalVariant::ZScore);

    let report = backtest::run(&inputs, None, Some(&output_dir))?;
    assert!(report.trades.iter().all(|trade| trade.symbol != "CCC"));

    let trades_csv = fs::read_to_string(output_dir.join("trades.csv"))?;
    assert_eq!(trades_csv.lines().count(), report.trades.len() + 1);
    let equity_csv = fs::read_to_string(output_dir.join("equity.csv"))?;
    assert_eq!(equity_csv.lines().count(), report.equity_curve.len() + 1);
    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(output_dir.join("report.json"))?)?;
    assert_eq!(json["trades"].as_array().map(|trades| trades.len()), Some(report.trades.len()));
    Ok(())
}

#[test]
fn grid_search_ranks_every_combination() -> Result<()> {
    ensure_test_env();
    let dir = tempfile::tempdir()?;
    let data = MarketData::load_csv(write_market_csv(dir.path())?)?;
    let engine = OptimizationEngine::new(data, ParameterSet::default(), quiet_settings())?;

    let results = engine.grid_search(&search_grid())?;
    assert_eq!(results.len(), 8);
    assert!(results.windows(2).all(|pair| pair[0].score >= pair[1].score));
    for result in &results {
        assert!(result.score.is_finite());
        assert!(result.score <= 1.0 + 1e-9);
        assert!((0.0..=1.0).contains(&result.metrics.win_rate));
        assert!((0.0..=1.0).contains(&result.metrics.max_drawdown));
    }

    let summary = OptimizationSummary::from_results(&results).expect("summary");
    assert_eq!(summary.total_evaluated, 8);
    assert_eq!(summary.best_parameters, results[0].parameters);

    let csv = export_results_csv(&results)?;
    assert_eq!(csv.lines().count(), 9);
    assert!(csv
        .lines()
        .next()
        .unwrap_or_default()
        .starts_with("rank,lookback_window,stop_loss_pct,threshold,"));

    let rerun = engine.grid_search(&search_grid())?;
    assert_eq!(rerun, results);
    assert_eq!(engine.cache().hits(), 8);
    Ok(())
}

#[test]
fn optimize_command_saves_json_results() -> Result<()> {
    ensure_test_env();
    let dir = tempfile::tempdir()?;
    let csv_path = write_market_csv(dir.path())?;
    let grid_path = dir.path().join("grid.json");
    fs::write(&grid_path, serde_json::to_string(&search_grid())?)?;
    let output = dir.path().join("out/results.json");

    let inputs = RunInputs {
        data_file: csv_path,
        ..RunInputs::default()
    };
    let options = optimize::SearchOptions {
        grid_file: grid_path,
        top_n: 3,
        output: Some(output.clone()),
    };
    let results = optimize::grid_search(&inputs, quiet_settings(), &options)?;

    let saved: serde_json::Value = serde_json::from_str(&fs::read_to_string(&output)?)?;
    assert_eq!(saved.as_array().map(|rows| rows.len()), Some(results.len()));
    Ok(())
}

#[test]
fn genetic_search_is_reproducible_for_a_seed() -> Result<()> {
    ensure_test_env();
    let dir = tempfile::tempdir()?;
    let data = MarketData::load_csv(write_market_csv(dir.path())?)?;
    let settings = quiet_settings();

    let run = |seed: u64| -> Result<Vec<_>> {
        let engine =
            OptimizationEngine::new(data.clone(), ParameterSet::default(), settings.clone())?;
        let config = GeneticConfig {
            seed,
            ..GeneticConfig::from_settings(&settings)
        };
        Ok(GeneticOptimizer::new(&engine, config)?.run(&search_grid())?)
    };

    let first = run(7)?;
    let second = run(7)?;
    assert!(!first.is_empty());
    assert_eq!(first, second);
    let grid = search_grid();
    for result in &first {
        for (name, value) in &result.parameters {
            assert!(grid[name].contains(value));
        }
    }
    Ok(())
}

#[test]
fn walk_forward_scores_each_test_window() -> Result<()> {
    ensure_test_env();
    let dir = tempfile::tempdir()?;
    let data = MarketData::load_csv(write_market_csv(dir.path())?)?;
    let settings = quiet_settings();
    let engine = OptimizationEngine::new(data, ParameterSet::default(), settings.clone())?;
    let optimizer = WalkForwardOptimizer::new(&engine, WalkForwardConfig::from_settings(&settings))?;

    let windows = optimizer.windows();
    assert_eq!(windows.len(), 5);
    let results = optimizer.run(&search_grid())?;
    assert_eq!(results.len(), windows.len());
    for result in &results {
        assert!(result.test_start >= result.train_end);
        assert!(result.out_of_sample.score.is_finite());
    }
    Ok(())
}

#[test]
fn cancelled_search_returns_nothing() -> Result<()> {
    ensure_test_env();
    let dir = tempfile::tempdir()?;
    let data = MarketData::load_csv(write_market_csv(dir.path())?)?;
    let status = OptimizerStatus::new();
    status.cancel();
    let engine = OptimizationEngine::new(data, ParameterSet::default(), quiet_settings())?
        .with_status(status.clone());

    assert!(engine.grid_search(&search_grid())?.is_empty());
    assert!(status.snapshot().cancelled);
    Ok(())
}
