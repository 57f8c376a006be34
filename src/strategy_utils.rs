use crate::config::ParameterSet;
use crate::models::{Bar, Signal, SignalAction, SignalStrength};
use std::collections::BTreeMap;

/// What one indicator test says about a single bar.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalReading {
    pub action: SignalAction,
    /// How far the reading is past its trigger level, in multiples of the threshold.
    pub excess: f64,
    pub metadata: Vec<(&'static str, f64)>,
}

impl SignalReading {
    pub fn hold(metadata: Vec<(&'static str, f64)>) -> Self {
        Self {
            action: SignalAction::Hold,
            excess: 0.0,
            metadata,
        }
    }
}

/// Confirmation and strength-tier settings shared by every variant.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalShaping {
    pub confirmation_period: usize,
    pub confirmation_ratio: f64,
    pub medium_multiple: f64,
    pub strong_multiple: f64,
}

impl SignalShaping {
    pub fn from_params(params: &ParameterSet) -> Self {
        Self {
            confirmation_period: params.confirmation_period.max(1),
            confirmation_ratio: params.confirmation_ratio,
            medium_multiple: params.medium_signal_multiple,
            strong_multiple: params.strong_signal_multiple,
        }
    }

    /// Trailing bars (current one included) that must agree before a signal is emitted:
    /// `period × ratio` rounded down, at least one.
    pub fn required_confirmations(&self) -> usize {
        let required = (self.confirmation_period as f64 * self.confirmation_ratio).floor() as usize;
        required.clamp(1, self.confirmation_period)
    }

    pub fn classify_strength(&self, excess: f64) -> SignalStrength {
        if excess >= self.strong_multiple {
            SignalStrength::Strong
        } else if excess >= self.medium_multiple {
            SignalStrength::Medium
        } else {
            SignalStrength::Weak
        }
    }
}

pub fn confidence_from_excess(excess: f64) -> f64 {
    if excess.is_finite() {
        excess.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub fn build_signal(
    strategy: &str,
    symbol: &str,
    bar: &Bar,
    action: SignalAction,
    strength: SignalStrength,
    confidence: f64,
    metadata: &[(&'static str, f64)],
) -> Signal {
    Signal {
        symbol: symbol.to_string(),
        timestamp: bar.timestamp,
        action,
        strength,
        price: bar.close,
        confidence,
        strategy: strategy.to_string(),
        metadata: metadata
            .iter()
            .map(|(key, value)| (key.to_string(), *value))
            .collect::<BTreeMap<_, _>>(),
    }
}

/// Create a hold signal for `bar`
pub fn hold_signal(strategy: &str, symbol: &str, bar: &Bar, metadata: &[(&'static str, f64)]) -> Signal {
    build_signal(
        strategy,
        symbol,
        bar,
        SignalAction::Hold,
        SignalStrength::Weak,
        0.0,
        metadata,
    )
}

/// Counts how many of the trailing `period` readings agree with `action`.
pub fn count_confirmations<F>(history: &[Bar], period: usize, action: SignalAction, read: F) -> usize
where
    F: Fn(&Bar) -> Option<SignalReading>,
{
    let start = history.len().saturating_sub(period);
    history[start..]
        .iter()
        .filter(|bar| read(bar).map(|reading| reading.action == action).unwrap_or(false))
        .count()
}
