use crate::config::ParameterSet;
use crate::models::*;
use crate::strategy_utils::{SignalReading, SignalShaping};

pub struct RsiStrategy {
    period: usize,
    oversold_level: f64,
    overbought_level: f64,
    shaping: SignalShaping,
}

impl RsiStrategy {
    pub fn new(params: &ParameterSet) -> Self {
        Self {
            period: params.rsi_period,
            oversold_level: params.rsi_oversold,
            overbought_level: params.rsi_overbought,
            shaping: SignalShaping::from_params(params),
        }
    }
}

impl super::Strategy for RsiStrategy {
    fn name(&self) -> &'static str {
        "rsi"
    }

    fn min_history(&self) -> usize {
        self.period + 1
    }

    fn shaping(&self) -> &SignalShaping {
        &self.shaping
    }

    fn read_bar(&self, bar: &Bar) -> Option<SignalReading> {
        let current_rsi = bar.rsi.filter(|value| value.is_finite())?;
        let metadata = vec![
            ("rsi", current_rsi),
            ("rsi_oversold", self.oversold_level),
            ("rsi_overbought", self.overbought_level),
        ];

        // Excess is measured against the gap between each level and the neutral 50.
        if current_rsi < self.oversold_level {
            let band = (50.0 - self.oversold_level).max(f64::EPSILON);
            return Some(SignalReading {
                action: SignalAction::Buy,
                excess: (50.0 - current_rsi) / band,
                metadata,
            });
        }

        if current_rsi > self.overbought_level {
            let band = (self.overbought_level - 50.0).max(f64::EPSILON);
            return Some(SignalReading {
                action: SignalAction::Sell,
                excess: (current_rsi - 50.0) / band,
                metadata,
            });
        }

        Some(SignalReading::hold(metadata))
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{ParameterSet, SignalVariant};
    use crate::models::{SignalAction, SignalStrength};
    use crate::strategy::create_strategy;
    use crate::strategy::test_support::enriched;

    fn params() -> ParameterSet {
        ParameterSet {
            signal_variant: SignalVariant::Rsi,
            ..ParameterSet::default()
        }
    }

    #[test]
    fn steady_decline_is_oversold() {
        let params = params();
        let closes: Vec<f64> = (0..30).map(|i| 200.0 - i as f64).collect();
        let bars = enriched("AAA", &closes, &params);
        let signal = create_strategy(&params).evaluate("AAA", &bars).unwrap();
        assert_eq!(signal.action, SignalAction::Buy);
        assert_eq!(signal.strength, SignalStrength::Strong);
        assert!(signal.metadata["rsi"] < 30.0);
    }

    #[test]
    fn steady_rise_is_overbought() {
        let params = params();
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let bars = enriched("AAA", &closes, &params);
        let signal = create_strategy(&params).evaluate("AAA", &bars).unwrap();
        assert_eq!(signal.action, SignalAction::Sell);
    }
}
