use crate::config::ParameterSet;
use crate::models::*;
use crate::strategy_utils::{SignalReading, SignalShaping};

/// Buys closes below the lower band and sells closes above the upper band.
pub struct BollingerStrategy {
    period: usize,
    shaping: SignalShaping,
}

impl BollingerStrategy {
    pub fn new(params: &ParameterSet) -> Self {
        Self {
            period: params.bollinger_period,
            shaping: SignalShaping::from_params(params),
        }
    }
}

impl super::Strategy for BollingerStrategy {
    fn name(&self) -> &'static str {
        "bollinger"
    }

    fn min_history(&self) -> usize {
        self.period
    }

    fn shaping(&self) -> &SignalShaping {
        &self.shaping
    }

    fn read_bar(&self, bar: &Bar) -> Option<SignalReading> {
        let (Some(upper), Some(middle), Some(lower)) =
            (bar.bollinger_upper, bar.bollinger_middle, bar.bollinger_lower)
        else {
            return None;
        };
        let metadata = vec![
            ("bollinger_upper", upper),
            ("bollinger_middle", middle),
            ("bollinger_lower", lower),
        ];

        // A zero-width band means a flat window; nothing to revert from.
        if upper - lower <= f64::EPSILON {
            return Some(SignalReading::hold(metadata));
        }

        if bar.close < lower {
            return Some(SignalReading {
                action: SignalAction::Buy,
                excess: (middle - bar.close) / (middle - lower),
                metadata,
            });
        }

        if bar.close > upper {
            return Some(SignalReading {
                action: SignalAction::Sell,
                excess: (bar.close - middle) / (upper - middle),
                metadata,
            });
        }

        Some(SignalReading::hold(metadata))
    }
}
