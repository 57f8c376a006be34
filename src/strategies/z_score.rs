use crate::config::ParameterSet;
use crate::models::*;
use crate::strategy_utils::{SignalReading, SignalShaping};

/// Trades closes that sit more than `z_score_threshold` deviations from the rolling mean.
pub struct ZScoreStrategy {
    lookback_window: usize,
    z_threshold: f64,
    shaping: SignalShaping,
}

impl ZScoreStrategy {
    pub fn new(params: &ParameterSet) -> Self {
        Self {
            lookback_window: params.lookback_window,
            z_threshold: params.z_score_threshold,
            shaping: SignalShaping::from_params(params),
        }
    }
}

impl super::Strategy for ZScoreStrategy {
    fn name(&self) -> &'static str {
        "z_score"
    }

    fn min_history(&self) -> usize {
        self.lookback_window
    }

    fn shaping(&self) -> &SignalShaping {
        &self.shaping
    }

    fn read_bar(&self, bar: &Bar) -> Option<SignalReading> {
        let z_score = bar.z_score.filter(|z| z.is_finite())?;
        let mut metadata = vec![("z_score", z_score), ("z_score_threshold", self.z_threshold)];
        if let Some(moving_average) = bar.moving_average {
            metadata.push(("moving_average", moving_average));
        }

        let action = if z_score < -self.z_threshold {
            SignalAction::Buy
        } else if z_score > self.z_threshold {
            SignalAction::Sell
        } else {
            return Some(SignalReading::hold(metadata));
        };

        Some(SignalReading {
            action,
            excess: z_score.abs() / self.z_threshold,
            metadata,
        })
    }
}
