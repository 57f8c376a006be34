use crate::config::{ConfigError, SearchSettings};
use crate::models::OptimizationResult;
use crate::optimizer::OptimizationEngine;
use crate::param_utils::{format_parameters, ParameterGrid};
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkForwardConfig {
    pub train_days: i64,
    pub test_days: i64,
    pub step_days: i64,
}

impl WalkForwardConfig {
    pub fn from_settings(settings: &SearchSettings) -> Self {
        Self {
            train_days: settings.walk_forward_train_days,
            test_days: settings.walk_forward_test_days,
            step_days: settings.walk_forward_step_days,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("WALK_FORWARD_TRAIN_DAYS", self.train_days),
            ("WALK_FORWARD_TEST_DAYS", self.test_days),
            ("WALK_FORWARD_STEP_DAYS", self.step_days),
        ] {
            if value < 1 {
                return Err(ConfigError::InvalidSetting {
                    key: key.to_string(),
                    value: value.to_string(),
                    reason: "must be >= 1".to_string(),
                });
            }
        }
        Ok(())
    }
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self::from_settings(&SearchSettings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkForwardWindow {
    pub index: usize,
    pub train_start: DateTime<Utc>,
    pub train_end: DateTime<Utc>,
    pub test_start: DateTime<Utc>,
    pub test_end: DateTime<Utc>,
}

/// Train `[start, start + train)` then test `[train_end, min(train_end + test, end))`,
/// advancing by `step` while the train window ends before `end`.
pub fn generate_windows(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    config: &WalkForwardConfig,
) -> Vec<WalkForwardWindow> {
    let mut windows = Vec::new();
    if config.train_days < 1 || config.test_days < 1 || config.step_days < 1 {
        return windows;
    }

    let train = Duration::days(config.train_days);
    let test = Duration::days(config.test_days);
    let step = Duration::days(config.step_days);
    let mut current_start = start;

    while current_start + train < end {
        let train_end = current_start + train;
        let test_end = std::cmp::min(train_end + test, end);
        if test_end > train_end {
            windows.push(WalkForwardWindow {
                index: windows.len(),
                train_start: current_start,
                train_end,
                test_start: train_end,
                test_end,
            });
        }
        current_start += step;
    }

    windows
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalkForwardResult {
    pub window_index: usize,
    pub train_start: DateTime<Utc>,
    pub train_end: DateTime<Utc>,
    pub test_start: DateTime<Utc>,
    pub test_end: DateTime<Utc>,
    pub in_sample_score: f64,
    pub best_parameters: BTreeMap<String, f64>,
    pub out_of_sample: OptimizationResult,
}

/// Grid-searches each train window and reports the winner's score on the following test window.
pub struct WalkForwardOptimizer<'a> {
    engine: &'a OptimizationEngine,
    config: WalkForwardConfig,
}

impl<'a> WalkForwardOptimizer<'a> {
    pub fn new(
        engine: &'a OptimizationEngine,
        config: WalkForwardConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { engine, config })
    }

    pub fn windows(&self) -> Vec<WalkForwardWindow> {
        let data = self.engine.data();
        match (data.start(), data.end()) {
            // Exclusive end just past the last bar so it lands in the final test window.
            (Some(start), Some(last)) => {
                generate_windows(start, last + Duration::seconds(1), &self.config)
            }
            _ => Vec::new(),
        }
    }

    /// Out-of-sample results, best score first.
    pub fn run(&self, grid: &ParameterGrid) -> Result<Vec<WalkForwardResult>, ConfigError> {
        let combinations = self.engine.expand_valid_grid(grid)?;
        let data = self.engine.data();
        let status = self.engine.status();
        let windows = self.windows();
        info!(
            "Starting walk-forward search over {} windows ({} combinations each)",
            windows.len(),
            combinations.len()
        );

        let mut results = Vec::new();
        for window in &windows {
            if status.is_cancelled() {
                warn!("Walk-forward search cancelled before window {}", window.index + 1);
                break;
            }
            status.set_phase(format!(
                "Walk-forward window {}/{}",
                window.index + 1,
                windows.len()
            ));

            let train_data = data.slice(window.train_start, window.train_end);
            if !train_data.has_data() {
                warn!("Window {} has no training bars; skipping", window.index + 1);
                continue;
            }
            let train_results = self
                .engine
                .run_parallel_backtests(&train_data, &combinations, None);
            let Some(best) = train_results.first() else {
                warn!("Window {} produced no training results", window.index + 1);
                continue;
            };

            let evaluation_data = data.slice(window.train_start, window.test_end);
            let has_test_bars = evaluation_data
                .timestamps()
                .iter()
                .any(|timestamp| *timestamp >= window.test_start);
            if !has_test_bars {
                warn!("Window {} has no test bars; skipping", window.index + 1);
                continue;
            }

            match self
                .engine
                .evaluate(&evaluation_data, &best.parameters, Some(window.test_start))
            {
                Ok(out_of_sample) => {
                    info!(
                        "Window {}: in-sample {:.4}, out-of-sample {:.4} [{}]",
                        window.index + 1,
                        best.score,
                        out_of_sample.score,
                        format_parameters(&best.parameters)
                    );
                    results.push(WalkForwardResult {
                        window_index: window.index,
                        train_start: window.train_start,
                        train_end: window.train_end,
                        test_start: window.test_start,
                        test_end: window.test_end,
                        in_sample_score: best.score,
                        best_parameters: best.parameters.clone(),
                        out_of_sample,
                    });
                }
                Err(error) => {
                    warn!(
                        "Window {} out-of-sample run failed: {:#}",
                        window.index + 1,
                        error
                    );
                }
            }
        }

        results.sort_by(|a, b| b.out_of_sample.score.total_cmp(&a.out_of_sample.score));
        info!(
            "Walk-forward search completed with {} windows scored",
            results.len()
        );
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParameterSet;
    use crate::data_context::MarketData;
    use crate::strategy::test_support::{bars_from_closes, oscillating_closes};
    use chrono::TimeZone;

    fn day(offset: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(offset)
    }

    fn config(train: i64, test: i64, step: i64) -> WalkForwardConfig {
        WalkForwardConfig {
            train_days: train,
            test_days: test,
            step_days: step,
        }
    }

    #[test]
    fn windows_advance_by_step_and_clip_to_end() {
        let windows = generate_windows(day(0), day(100), &config(60, 30, 20));
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].train_start, day(0));
        assert_eq!(windows[0].train_end, day(60));
        assert_eq!(windows[0].test_start, day(60));
        assert_eq!(windows[0].test_end, day(90));
        assert_eq!(windows[1].train_start, day(20));
        assert_eq!(windows[1].test_end, day(100));
        assert_eq!(windows[1].index, 1);
    }

    #[test]
    fn no_windows_when_range_is_too_short() {
        assert!(generate_windows(day(0), day(60), &config(60, 10, 10)).is_empty());
        assert!(generate_windows(day(0), day(100), &config(0, 10, 10)).is_empty());
    }

    #[test]
    fn reports_out_of_sample_scores_per_window() {
        let settings = SearchSettings {
            max_workers: 2,
            show_progress: false,
            ..SearchSettings::default()
        };
        let data = MarketData::from_bars(bars_from_closes("AAA", &oscillating_closes(150, 5.0)));
        let engine = OptimizationEngine::new(data, ParameterSet::default(), settings).unwrap();
        let optimizer = WalkForwardOptimizer::new(&engine, config(60, 30, 30)).unwrap();

        let mut grid = ParameterGrid::new();
        grid.insert("lookback_window".to_string(), vec![5.0, 10.0]);
        grid.insert("threshold".to_string(), vec![0.01, 0.02]);

        let windows = optimizer.windows();
        assert_eq!(windows.len(), 3);
        let results = optimizer.run(&grid).unwrap();
        assert_eq!(results.len(), windows.len());
        for result in &results {
            assert_eq!(result.out_of_sample.parameters, result.best_parameters);
            assert!(result.test_start >= result.train_end);
            assert!(grid["lookback_window"].contains(&result.best_parameters["lookback_window"]));
        }
        assert!(results
            .windows(2)
            .all(|pair| pair[0].out_of_sample.score >= pair[1].out_of_sample.score));
    }

    #[test]
    fn rejects_non_positive_window_lengths() {
        let data = MarketData::from_bars(bars_from_closes("AAA", &[100.0; 10]));
        let engine =
            OptimizationEngine::new(data, ParameterSet::default(), SearchSettings::default())
                .unwrap();
        assert!(WalkForwardOptimizer::new(&engine, config(10, 0, 5)).is_err());
    }
}
