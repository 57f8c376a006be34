use crate::commands::inputs::{load_grid, RunInputs};
use crate::config::SearchSettings;
use crate::export::{export_json, export_walk_forward_csv, is_json_path, save_results, write_output};
use crate::genetic::{GeneticConfig, GeneticOptimizer};
use crate::models::OptimizationResult;
use crate::optimizer::{print_results, OptimizationEngine, OptimizationSummary};
use crate::param_utils::{format_parameters, grid_size};
use crate::walk_forward::{WalkForwardConfig, WalkForwardOptimizer, WalkForwardResult};
use anyhow::Result;
use log::{info, warn};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub grid_file: PathBuf,
    pub top_n: usize,
    pub output: Option<PathBuf>,
}

fn build_engine(inputs: &RunInputs, settings: SearchSettings) -> Result<OptimizationEngine> {
    let data = inputs.market_data()?;
    let base_params = inputs.parameter_set()?;
    let mut engine = OptimizationEngine::new(data, base_params, settings)?;
    if let Some(sector_map) = inputs.sector_map()? {
        engine = engine.with_sector_map(sector_map);
    }
    Ok(engine)
}

fn report(results: &[OptimizationResult], options: &SearchOptions) -> Result<()> {
    if results.is_empty() {
        warn!("No successful backtests; nothing to report");
        return Ok(());
    }
    print_results(results, options.top_n);
    if let Some(summary) = OptimizationSummary::from_results(results) {
        info!(
            "Run {}: {} evaluated, best score {:.4}, average {:.4}, best drawdown {:.2}%",
            summary.run_id,
            summary.total_evaluated,
            summary.best_score,
            summary.average_score,
            summary.min_drawdown * 100.0
        );
    }
    if let Some(path) = &options.output {
        save_results(path, results)?;
        info!("Results written to {}", path.display());
    }
    Ok(())
}

pub fn grid_search(
    inputs: &RunInputs,
    settings: SearchSettings,
    options: &SearchOptions,
) -> Result<Vec<OptimizationResult>> {
    let grid = load_grid(&options.grid_file)?;
    info!(
        "Grid search over {} combinations from {}",
        grid_size(&grid),
        options.grid_file.display()
    );
    let engine = build_engine(inputs, settings)?;
    let results = engine.grid_search(&grid)?;
    report(&results, options)?;
    Ok(results)
}

pub fn genetic(
    inputs: &RunInputs,
    settings: SearchSettings,
    options: &SearchOptions,
) -> Result<Vec<OptimizationResult>> {
    let ranges = load_grid(&options.grid_file)?;
    let config = GeneticConfig::from_settings(&settings);
    let engine = build_engine(inputs, settings)?;
    let optimizer = GeneticOptimizer::new(&engine, config)?;
    let results = optimizer.run(&ranges)?;
    info!(
        "Genetic search finished; {} cache hits across generations",
        engine.cache().hits()
    );
    report(&results, options)?;
    Ok(results)
}

pub fn walk_forward(
    inputs: &RunInputs,
    settings: SearchSettings,
    options: &SearchOptions,
) -> Result<Vec<WalkForwardResult>> {
    let grid = load_grid(&options.grid_file)?;
    let config = WalkForwardConfig::from_settings(&settings);
    let engine = build_engine(inputs, settings)?;
    let optimizer = WalkForwardOptimizer::new(&engine, config)?;
    let results = optimizer.run(&grid)?;

    print_walk_forward(&results, options.top_n);
    if let Some(path) = &options.output {
        save_walk_forward(path, &results)?;
        info!("Walk-forward results written to {}", path.display());
    }
    Ok(results)
}

fn save_walk_forward(path: &Path, results: &[WalkForwardResult]) -> Result<()> {
    let contents = if is_json_path(path) {
        export_json(results)?
    } else {
        export_walk_forward_csv(results)?
    };
    write_output(path, &contents)
}

pub fn print_walk_forward(results: &[WalkForwardResult], top_n: usize) {
    println!(
        "\n=== WALK-FORWARD WINDOWS ({} scored) ===\n",
        results.len()
    );
    for result in results.iter().take(top_n) {
        println!(
            "Window {}: train {} - {}, test {} - {}",
            result.window_index + 1,
            result.train_start.format("%Y-%m-%d"),
            result.train_end.format("%Y-%m-%d"),
            result.test_start.format("%Y-%m-%d"),
            result.test_end.format("%Y-%m-%d")
        );
        println!(
            "  In-sample Score: {:.4}  Out-of-sample Score: {:.4}",
            result.in_sample_score, result.out_of_sample.score
        );
        println!(
            "  Out-of-sample Return: {:.2}%  Max Drawdown: {:.2}%",
            result.out_of_sample.metrics.total_return_pct * 100.0,
            result.out_of_sample.metrics.max_drawdown * 100.0
        );
        println!("  Parameters: {}", format_parameters(&result.best_parameters));
        println!();
    }
    if !results.is_empty() {
        let average = results
            .iter()
            .map(|result| result.out_of_sample.score)
            .sum::<f64>()
            / results.len() as f64;
        println!("Average out-of-sample score: {:.4}\n", average);
    }
}
