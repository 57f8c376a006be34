use crate::config::ParameterSet;
use crate::models::*;
use crate::strategy_utils::{SignalReading, SignalShaping};

/// Trades the distance of the close from its moving average.
pub struct MeanReversionStrategy {
    lookback_window: usize,
    threshold: f64,
    shaping: SignalShaping,
}

impl MeanReversionStrategy {
    pub fn new(params: &ParameterSet) -> Self {
        Self {
            lookback_window: params.lookback_window,
            threshold: params.threshold,
            shaping: SignalShaping::from_params(params),
        }
    }
}

impl super::Strategy for MeanReversionStrategy {
    fn name(&self) -> &'static str {
        "mean_reversion"
    }

    fn min_history(&self) -> usize {
        self.lookback_window
    }

    fn shaping(&self) -> &SignalShaping {
        &self.shaping
    }

    fn read_bar(&self, bar: &Bar) -> Option<SignalReading> {
        let moving_average = bar.moving_average?;
        if !moving_average.is_finite() || moving_average <= 0.0 || !bar.close.is_finite() {
            return None;
        }

        let price_distance = (bar.close - moving_average).abs() / moving_average;
        let metadata = vec![
            ("moving_average", moving_average),
            ("threshold", self.threshold),
            ("lookback_window", self.lookback_window as f64),
            ("price_distance", price_distance),
        ];

        let action = if bar.close < moving_average * (1.0 - self.threshold) {
            SignalAction::Buy
        } else if bar.close > moving_average * (1.0 + self.threshold) {
            SignalAction::Sell
        } else {
            return Some(SignalReading::hold(metadata));
        };

        Some(SignalReading {
            action,
            excess: price_distance / self.threshold,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::MeanReversionStrategy;
    use crate::config::ParameterSet;
    use crate::models::{SignalAction, SignalStrength};
    use crate::strategy::test_support::enriched;
    use crate::strategy::{create_strategy, Strategy};

    #[test]
    fn flat_series_never_signals() {
        let params = ParameterSet::default();
        let bars = enriched("AAA", &[50.0; 60], &params);
        let strategy = create_strategy(&params);
        for end in 1..=bars.len() {
            if let Some(signal) = strategy.evaluate("AAA", &bars[..end]) {
                assert_eq!(signal.action, SignalAction::Hold);
            }
        }
    }

    #[test]
    fn five_percent_drop_is_a_strong_buy() {
        let params = ParameterSet::default();
        let mut closes = vec![100.0; 25];
        closes.push(95.0);
        let bars = enriched("AAA", &closes, &params);

        let signal = create_strategy(&params).evaluate("AAA", &bars).unwrap();
        assert_eq!(signal.action, SignalAction::Buy);
        assert_eq!(signal.strength, SignalStrength::Strong);
        assert!((signal.confidence - 1.0).abs() < 1e-12);
        assert!((signal.price - 95.0).abs() < 1e-12);
        assert_eq!(signal.strategy, "mean_reversion");
        assert!((signal.metadata["moving_average"] - 99.75).abs() < 1e-9);
        assert!((signal.metadata["lookback_window"] - 20.0).abs() < 1e-12);
    }

    #[test]
    fn rally_above_band_is_a_sell() {
        let params = ParameterSet::default();
        let mut closes = vec![100.0; 25];
        closes.push(101.6);
        let bars = enriched("AAA", &closes, &params);
        let signal = MeanReversionStrategy::new(&params)
            .evaluate("AAA", &bars)
            .unwrap();
        assert_eq!(signal.action, SignalAction::Sell);
        assert_eq!(signal.strength, SignalStrength::Medium);
    }
}
