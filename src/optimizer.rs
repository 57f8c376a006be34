use crate::cache::ResultCache;
use crate::config::{ConfigError, ParameterSet, SearchSettings};
use crate::data_context::MarketData;
use crate::engine::Engine;
use crate::models::{Bar, BacktestTask, BacktestTaskResult, OptimizationResult, PerformanceMetrics};
use crate::optimizer_status::OptimizerStatus;
use crate::param_utils::{expand_grid, format_parameters, ParameterGrid};
use anyhow::Result;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use uuid::Uuid;

pub(crate) const CANCELLED_TASK_ERROR: &str = "cancelled before start";

/// Weights and caps of the composite ranking score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub sharpe_ratio: f64,
    pub total_return: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub max_drawdown: f64,
    pub sharpe_cap: f64,
    pub return_cap: f64,
    pub profit_factor_cap: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            sharpe_ratio: 0.3,
            total_return: 0.25,
            win_rate: 0.2,
            profit_factor: 0.15,
            max_drawdown: 0.1,
            sharpe_cap: 2.0,
            return_cap: 0.5,
            profit_factor_cap: 3.0,
        }
    }
}

/// Weighted blend of capped Sharpe, return, win rate, profit factor and `1 - drawdown`.
pub fn composite_score(metrics: &PerformanceMetrics, weights: &ScoreWeights) -> f64 {
    let sharpe_score = (metrics.sharpe_ratio / weights.sharpe_cap).min(1.0);
    let return_score = (metrics.total_return_pct / weights.return_cap).min(1.0);
    let profit_score = (metrics.profit_factor / weights.profit_factor_cap).min(1.0);
    let drawdown_score = 1.0 - metrics.max_drawdown;

    let score = weights.sharpe_ratio * sharpe_score
        + weights.total_return * return_score
        + weights.win_rate * metrics.win_rate
        + weights.profit_factor * profit_score
        + weights.max_drawdown * drawdown_score;
    if score.is_finite() {
        score
    } else {
        0.0
    }
}

/// Best score first; equal scores prefer the shallower drawdown. Stable otherwise.
pub fn sort_results(results: &mut [OptimizationResult]) {
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.metrics.max_drawdown.total_cmp(&b.metrics.max_drawdown))
    });
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationSummary {
    pub run_id: Uuid,
    pub total_evaluated: usize,
    pub best_score: f64,
    pub average_score: f64,
    pub best_return_pct: f64,
    pub best_sharpe: f64,
    pub min_drawdown: f64,
    pub average_drawdown: f64,
    pub best_parameters: BTreeMap<String, f64>,
}

impl OptimizationSummary {
    /// `results` are expected best-first, as every search returns them.
    pub fn from_results(results: &[OptimizationResult]) -> Option<Self> {
        let best = results.first()?;
        let count = results.len() as f64;
        Some(Self {
            run_id: Uuid::new_v4(),
            total_evaluated: results.len(),
            best_score: best.score,
            average_score: results.iter().map(|r| r.score).sum::<f64>() / count,
            best_return_pct: results
                .iter()
                .map(|r| r.metrics.total_return_pct)
                .fold(f64::NEG_INFINITY, f64::max),
            best_sharpe: results
                .iter()
                .map(|r| r.metrics.sharpe_ratio)
                .fold(f64::NEG_INFINITY, f64::max),
            min_drawdown: results
                .iter()
                .map(|r| r.metrics.max_drawdown)
                .fold(f64::INFINITY, f64::min),
            average_drawdown: results.iter().map(|r| r.metrics.max_drawdown).sum::<f64>() / count,
            best_parameters: best.parameters.clone(),
        })
    }
}

/// Everything a worker thread needs to run one task on its own.
#[derive(Clone)]
struct WorkerContext {
    bars: Arc<Vec<Bar>>,
    base_params: ParameterSet,
    sector_map: Option<Arc<HashMap<String, String>>>,
    weights: ScoreWeights,
    cache: ResultCache,
    scope: String,
    trading_start: Option<DateTime<Utc>>,
}

pub struct OptimizationEngine {
    data: MarketData,
    base_params: ParameterSet,
    settings: SearchSettings,
    weights: ScoreWeights,
    cache: ResultCache,
    status: OptimizerStatus,
    sector_map: Option<Arc<HashMap<String, String>>>,
}

impl OptimizationEngine {
    pub fn new(
        data: MarketData,
        base_params: ParameterSet,
        settings: SearchSettings,
    ) -> Result<Self, ConfigError> {
        base_params.validate()?;
        if settings.max_workers == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "MAX_WORKERS".to_string(),
                value: "0".to_string(),
                reason: "must be >= 1".to_string(),
            });
        }
        Ok(Self {
            data,
            base_params,
            settings,
            weights: ScoreWeights::default(),
            cache: ResultCache::new(),
            status: OptimizerStatus::new(),
            sector_map: None,
        })
    }

    pub fn with_weights(mut self, weights: ScoreWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_status(mut self, status: OptimizerStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_sector_map(mut self, sector_map: HashMap<String, String>) -> Self {
        self.sector_map = Some(Arc::new(sector_map));
        self
    }

    pub fn data(&self) -> &MarketData {
        &self.data
    }

    pub fn base_params(&self) -> &ParameterSet {
        &self.base_params
    }

    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    pub fn status(&self) -> &OptimizerStatus {
        &self.status
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// The base parameter set with `overrides` applied and validated.
    pub fn resolve_parameters(
        &self,
        overrides: &BTreeMap<String, f64>,
    ) -> Result<ParameterSet, ConfigError> {
        self.base_params.clone().with_overrides(overrides)
    }

    /// Every combination of the grid, each checked against the base parameters.
    pub fn expand_valid_grid(
        &self,
        grid: &ParameterGrid,
    ) -> Result<Vec<BTreeMap<String, f64>>, ConfigError> {
        let combinations = expand_grid(grid);
        if combinations.is_empty() {
            return Err(ConfigError::EmptyGrid);
        }
        for combination in &combinations {
            self.resolve_parameters(combination)?;
        }
        Ok(combinations)
    }

    /// Scores every combination of the grid. Invalid combinations fail before any run starts.
    pub fn grid_search(&self, grid: &ParameterGrid) -> Result<Vec<OptimizationResult>, ConfigError> {
        let combinations = self.expand_valid_grid(grid)?;

        self.status.set_phase("Grid search");
        info!(
            "Grid search over {} parameters ({} combinations)",
            grid.len(),
            combinations.len()
        );
        let results = self.run_parallel_backtests(&self.data, &combinations, None);
        if let Some(best) = results.first() {
            info!(
                "Grid search best score {:.4} with [{}]",
                best.score,
                format_parameters(&best.parameters)
            );
        }
        Ok(results)
    }

    /// Runs every variation and returns the successful ones, best first.
    pub fn run_parallel_backtests(
        &self,
        data: &MarketData,
        variations: &[BTreeMap<String, f64>],
        trading_start: Option<DateTime<Utc>>,
    ) -> Vec<OptimizationResult> {
        let mut results: Vec<OptimizationResult> = self
            .run_tasks(data, variations, trading_start)
            .into_iter()
            .filter_map(|task_result| task_result.result)
            .collect();
        sort_results(&mut results);
        results
    }

    /// One result per variation, in variation order. Failed or skipped runs carry an error.
    pub(crate) fn run_tasks(
        &self,
        data: &MarketData,
        variations: &[BTreeMap<String, f64>],
        trading_start: Option<DateTime<Utc>>,
    ) -> Vec<BacktestTaskResult> {
        if variations.is_empty() {
            return Vec::new();
        }

        let task_count = variations.len();
        let num_workers = std::cmp::min(task_count, std::cmp::max(1, self.settings.max_workers));
        info!(
            "Running {} backtests on {} worker threads",
            task_count, num_workers
        );

        let context = WorkerContext {
            bars: data.bars_arc(),
            base_params: self.base_params.clone(),
            sector_map: self.sector_map.clone(),
            weights: self.weights,
            cache: self.cache.clone(),
            scope: cache_scope(data, trading_start),
            trading_start,
        };

        let (tx, rx): (Sender<BacktestTask>, Receiver<BacktestTask>) = bounded(task_count);
        let (result_tx, result_rx): (Sender<BacktestTaskResult>, Receiver<BacktestTaskResult>) =
            bounded(task_count);

        let mut handles = Vec::new();
        for _worker_id in 0..num_workers {
            let rx = rx.clone();
            let result_tx = result_tx.clone();
            let context = context.clone();
            let status = self.status.clone();

            let handle = thread::spawn(move || {
                while let Ok(task) = rx.recv() {
                    let result = if status.is_cancelled() {
                        BacktestTaskResult {
                            task_id: task.id,
                            result: None,
                            error: Some(CANCELLED_TASK_ERROR.to_string()),
                        }
                    } else {
                        Self::run_single_task(&context, &task)
                    };

                    if result_tx.send(result).is_err() {
                        break;
                    }
                }
            });
            handles.push(handle);
        }
        drop(result_tx);

        for (id, parameters) in variations.iter().enumerate() {
            let task = BacktestTask {
                id,
                parameters: parameters.clone(),
            };
            if tx.send(task).is_err() {
                warn!("All backtest workers exited before task {} was queued", id);
                break;
            }
        }
        drop(tx);

        let pb = if self.settings.show_progress {
            ProgressBar::new(task_count as u64)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        let mut task_results = Vec::with_capacity(task_count);
        let mut failed = 0;
        let mut skipped = 0;
        while task_results.len() < task_count {
            match result_rx.recv_timeout(std::time::Duration::from_millis(200)) {
                Ok(result) => {
                    match (&result.result, &result.error) {
                        (Some(opt_result), _) => self.status.record_score(opt_result.score),
                        (None, Some(error)) if error == CANCELLED_TASK_ERROR => skipped += 1,
                        (None, _) => failed += 1,
                    }
                    task_results.push(result);
                    pb.set_position(task_results.len() as u64);
                    self.status
                        .set_progress(task_count, task_results.len(), failed);
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    warn!("Result channel closed unexpectedly. Some results may be lost.");
                    break;
                }
            }
        }

        if failed > 0 || skipped > 0 {
            warn!(
                "Backtesting completed with {} failed and {} skipped runs",
                failed, skipped
            );
            pb.finish_with_message("Backtesting completed with errors");
        } else {
            pb.finish_with_message("Backtesting completed");
        }

        for handle in handles {
            if handle.join().is_err() {
                warn!("A backtest worker thread panicked");
            }
        }

        task_results.sort_by_key(|result| result.task_id);
        task_results
    }

    /// Scores one parameter set synchronously, bypassing the worker pool.
    pub fn evaluate(
        &self,
        data: &MarketData,
        parameters: &BTreeMap<String, f64>,
        trading_start: Option<DateTime<Utc>>,
    ) -> Result<OptimizationResult> {
        let context = WorkerContext {
            bars: data.bars_arc(),
            base_params: self.base_params.clone(),
            sector_map: self.sector_map.clone(),
            weights: self.weights,
            cache: self.cache.clone(),
            scope: cache_scope(data, trading_start),
            trading_start,
        };
        Self::run_single_backtest(&context, parameters)
    }

    fn run_single_task(context: &WorkerContext, task: &BacktestTask) -> BacktestTaskResult {
        if let Some(cached_result) = context.cache.check_cache(&context.scope, &task.parameters) {
            return BacktestTaskResult {
                task_id: task.id,
                result: Some(cached_result),
                error: None,
            };
        }

        let start_time = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            Self::run_single_backtest(context, &task.parameters)
        }));
        let duration = start_time.elapsed();

        match outcome {
            Ok(Ok(result)) => {
                log::debug!(
                    "Task {} finished in {:.2}s. Score: {:.4}, Return: {:.2}%, Max DD: {:.2}%, Params: [{}]",
                    task.id,
                    duration.as_secs_f64(),
                    result.score,
                    result.metrics.total_return_pct * 100.0,
                    result.metrics.max_drawdown * 100.0,
                    format_parameters(&task.parameters)
                );
                context.cache.store_cache(&context.scope, &result);
                BacktestTaskResult {
                    task_id: task.id,
                    result: Some(result),
                    error: None,
                }
            }
            Ok(Err(error)) => {
                warn!(
                    "Task {} failed after {:.2}s: {:#} [{}]",
                    task.id,
                    duration.as_secs_f64(),
                    error,
                    format_parameters(&task.parameters)
                );
                BacktestTaskResult {
                    task_id: task.id,
                    result: None,
                    error: Some(format!("{:#}", error)),
                }
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!("Task {} panicked: {}", task.id, message);
                BacktestTaskResult {
                    task_id: task.id,
                    result: None,
                    error: Some(format!("panicked: {}", message)),
                }
            }
        }
    }

    fn run_single_backtest(
        context: &WorkerContext,
        parameters: &BTreeMap<String, f64>,
    ) -> Result<OptimizationResult> {
        let params = context.base_params.clone().with_overrides(parameters)?;
        let mut engine = Engine::new(params)?;
        if let Some(sector_map) = &context.sector_map {
            engine = engine.with_sector_map(sector_map.as_ref().clone());
        }
        let report = engine.backtest_from(context.bars.as_slice(), context.trading_start)?;
        let score = composite_score(&report.metrics, &context.weights) * report.penalty_factor;

        Ok(OptimizationResult {
            parameters: parameters.clone(),
            metrics: report.metrics,
            score,
            penalty_factor: report.penalty_factor,
        })
    }
}

/// Cached results are only reused for the same bars and the same trading start.
fn cache_scope(data: &MarketData, trading_start: Option<DateTime<Utc>>) -> String {
    match trading_start {
        Some(start) => format!("{}@{}", data.fingerprint(), start.timestamp()),
        None => data.fingerprint(),
    }
}

pub fn print_results(results: &[OptimizationResult], top_n: usize) {
    println!(
        "\n=== TOP {} PARAMETER SETS ===\n",
        std::cmp::min(top_n, results.len())
    );

    for (i, result) in results.iter().take(top_n).enumerate() {
        println!("Rank {}:", i + 1);
        println!("  Score: {:.4}", result.score);
        println!("  Total Return: {:.2}%", result.metrics.total_return_pct * 100.0);
        println!("  Sharpe Ratio: {:.4}", result.metrics.sharpe_ratio);
        println!("  Max Drawdown: {:.2}%", result.metrics.max_drawdown * 100.0);
        println!(
            "  Win Rate: {:.2}% over {} trades",
            result.metrics.win_rate * 100.0,
            result.metrics.total_trades
        );
        if result.penalty_factor < 1.0 {
            println!("  Penalty Factor: {:.2}", result.penalty_factor);
        }
        println!("  Parameters: {}", format_parameters(&result.parameters));
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::{bars_from_closes, oscillating_closes};

    fn quiet_settings() -> SearchSettings {
        SearchSettings {
            max_workers: 2,
            show_progress: false,
            ..SearchSettings::default()
        }
    }

    fn market() -> MarketData {
        let mut bars = bars_from_closes("AAA", &oscillating_closes(120, 5.0));
        bars.extend(bars_from_closes("BBB", &oscillating_closes(120, 3.0)));
        MarketData::from_bars(bars)
    }

    fn metrics(sharpe: f64, return_pct: f64, win_rate: f64, pf: f64, dd: f64) -> PerformanceMetrics {
        PerformanceMetrics {
            sharpe_ratio: sharpe,
            total_return_pct: return_pct,
            win_rate,
            profit_factor: pf,
            max_drawdown: dd,
            ..PerformanceMetrics::default()
        }
    }

    #[test]
    fn composite_score_caps_each_component() {
        let weights = ScoreWeights::default();
        let capped = composite_score(&metrics(5.0, 2.0, 1.0, f64::INFINITY, 0.0), &weights);
        assert!((capped - 1.0).abs() < 1e-12);

        let partial = composite_score(&metrics(1.0, 0.1, 0.5, 1.5, 0.2), &weights);
        let expected = 0.3 * 0.5 + 0.25 * 0.2 + 0.2 * 0.5 + 0.15 * 0.5 + 0.1 * 0.8;
        assert!((partial - expected).abs() < 1e-12);

        let losing = composite_score(&metrics(-1.0, -0.2, 0.0, 0.0, 0.3), &weights);
        assert!(losing < 0.1);
    }

    #[test]
    fn sort_prefers_lower_drawdown_on_ties() {
        let make = |score: f64, dd: f64| OptimizationResult {
            parameters: BTreeMap::new(),
            metrics: metrics(0.0, 0.0, 0.0, 0.0, dd),
            score,
            penalty_factor: 1.0,
        };
        let mut results = vec![make(0.2, 0.1), make(0.5, 0.3), make(0.5, 0.1)];
        sort_results(&mut results);
        assert_eq!(results[0].metrics.max_drawdown, 0.1);
        assert_eq!(results[0].score, 0.5);
        assert_eq!(results[1].metrics.max_drawdown, 0.3);
        assert_eq!(results[2].score, 0.2);
    }

    #[test]
    fn grid_search_scores_every_combination() {
        let engine =
            OptimizationEngine::new(market(), ParameterSet::default(), quiet_settings()).unwrap();
        let mut grid = ParameterGrid::new();
        grid.insert("lookback_window".to_string(), vec![10.0, 15.0, 20.0]);
        grid.insert("threshold".to_string(), vec![0.01, 0.02, 0.03]);

        let results = engine.grid_search(&grid).unwrap();
        assert_eq!(results.len(), 9);
        assert!(results.windows(2).all(|pair| pair[0].score >= pair[1].score));
        assert_eq!(engine.status().snapshot().completed_runs, 9);

        let again = engine.grid_search(&grid).unwrap();
        assert_eq!(engine.cache().hits(), 9);
        assert_eq!(
            again.iter().map(|r| r.score).collect::<Vec<_>>(),
            results.iter().map(|r| r.score).collect::<Vec<_>>()
        );

        let summary = OptimizationSummary::from_results(&results).unwrap();
        assert_eq!(summary.total_evaluated, 9);
        assert_eq!(summary.best_score, results[0].score);
        assert!(summary.min_drawdown <= summary.average_drawdown);
    }

    #[test]
    fn grid_search_rejects_bad_grids_before_running() {
        let engine =
            OptimizationEngine::new(market(), ParameterSet::default(), quiet_settings()).unwrap();
        assert_eq!(engine.grid_search(&ParameterGrid::new()), Err(ConfigError::EmptyGrid));

        let mut grid = ParameterGrid::new();
        grid.insert("threshold".to_string(), vec![0.01, -0.5]);
        assert!(matches!(
            engine.grid_search(&grid),
            Err(ConfigError::InvalidValue { .. })
        ));
        grid.insert("not_a_parameter".to_string(), vec![1.0]);
        assert!(matches!(
            engine.grid_search(&grid),
            Err(ConfigError::UnknownParameter(_))
        ));
        assert_eq!(engine.status().snapshot().total_runs, 0);
    }

    #[test]
    fn failed_runs_are_excluded() {
        let data = market();
        let engine =
            OptimizationEngine::new(data.clone(), ParameterSet::default(), quiet_settings())
                .unwrap();
        let variations = vec![BTreeMap::new(), BTreeMap::new()];
        let too_late = data.end().unwrap() + chrono::Duration::days(30);

        let results = engine.run_parallel_backtests(&data, &variations, Some(too_late));
        assert!(results.is_empty());
        let raw = engine.run_tasks(&data, &variations, Some(too_late));
        assert_eq!(raw.len(), 2);
        assert!(raw.iter().all(|r| r.result.is_none() && r.error.is_some()));
    }

    #[test]
    fn cancelled_search_skips_queued_runs() {
        let engine =
            OptimizationEngine::new(market(), ParameterSet::default(), quiet_settings()).unwrap();
        engine.status().cancel();
        let mut grid = ParameterGrid::new();
        grid.insert("lookback_window".to_string(), vec![10.0, 20.0]);
        let results = engine.grid_search(&grid).unwrap();
        assert!(results.is_empty());
        assert_eq!(engine.status().snapshot().failed_runs, 0);
    }
}
