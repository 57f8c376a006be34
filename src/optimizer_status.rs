use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Shared progress of a parameter search plus its cancellation flag.
#[derive(Clone, Default)]
pub struct OptimizerStatus {
    inner: Arc<Mutex<OptimizerStatusData>>,
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
struct OptimizerStatusData {
    phase: String,
    total_runs: usize,
    completed_runs: usize,
    failed_runs: usize,
    best_score: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OptimizerStatusSnapshot {
    pub phase: String,
    pub total_runs: usize,
    pub completed_runs: usize,
    pub failed_runs: usize,
    pub best_score: Option<f64>,
    pub cancelled: bool,
}

impl OptimizerStatus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(OptimizerStatusData {
                phase: "Initializing".to_string(),
                ..Default::default()
            })),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_phase<S: Into<String>>(&self, phase: S) {
        if let Ok(mut data) = self.inner.lock() {
            data.phase = phase.into();
        }
    }

    pub fn set_progress(&self, total_runs: usize, completed_runs: usize, failed_runs: usize) {
        if let Ok(mut data) = self.inner.lock() {
            data.total_runs = total_runs;
            data.completed_runs = completed_runs;
            data.failed_runs = failed_runs;
        }
    }

    /// Keeps the highest score seen so far.
    pub fn record_score(&self, score: f64) {
        if !score.is_finite() {
            return;
        }
        if let Ok(mut data) = self.inner.lock() {
            data.best_score = Some(data.best_score.map_or(score, |best| best.max(score)));
        }
    }

    /// Stops scheduling further runs. Runs already in flight finish normally.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> OptimizerStatusSnapshot {
        let cancelled = self.is_cancelled();
        if let Ok(data) = self.inner.lock() {
            OptimizerStatusSnapshot {
                phase: data.phase.clone(),
                total_runs: data.total_runs,
                completed_runs: data.completed_runs,
                failed_runs: data.failed_runs,
                best_score: data.best_score,
                cancelled,
            }
        } else {
            OptimizerStatusSnapshot {
                phase: "Status unavailable".to_string(),
                total_runs: 0,
                completed_runs: 0,
                failed_runs: 0,
                best_score: None,
                cancelled,
            }
        }
    }
}
