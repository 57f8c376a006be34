use crate::config::{ParameterSet, SignalVariant};
use crate::models::*;
use crate::strategy_utils::{
    build_signal, confidence_from_excess, count_confirmations, hold_signal, SignalReading,
    SignalShaping,
};

pub trait Strategy {
    fn name(&self) -> &'static str;

    /// Bars required before the indicator column can be trusted.
    fn min_history(&self) -> usize;

    fn shaping(&self) -> &SignalShaping;

    /// Classifies a single bar. `None` means its indicator columns are missing.
    fn read_bar(&self, bar: &Bar) -> Option<SignalReading>;

    /// Signal for the last bar of `history`, or `None` when there is not enough data.
    fn evaluate(&self, symbol: &str, history: &[Bar]) -> Option<Signal> {
        let shaping = self.shaping();
        let required = self.min_history().max(shaping.confirmation_period);
        if history.len() < required {
            return None;
        }
        let bar = history.last()?;
        let reading = self.read_bar(bar)?;
        if !reading.action.is_actionable() {
            return Some(hold_signal(self.name(), symbol, bar, &reading.metadata));
        }

        let confirmations = count_confirmations(
            history,
            shaping.confirmation_period,
            reading.action,
            |candidate| self.read_bar(candidate),
        );
        if confirmations < shaping.required_confirmations() {
            return Some(hold_signal(self.name(), symbol, bar, &reading.metadata));
        }

        Some(build_signal(
            self.name(),
            symbol,
            bar,
            reading.action,
            shaping.classify_strength(reading.excess),
            confidence_from_excess(reading.excess),
            &reading.metadata,
        ))
    }
}

#[path = "strategies/mean_reversion.rs"]
pub mod mean_reversion;

pub use mean_reversion::MeanReversionStrategy;

#[path = "strategies/z_score.rs"]
pub mod z_score;

pub use z_score::ZScoreStrategy;

#[path = "strategies/rsi.rs"]
pub mod rsi;

pub use rsi::RsiStrategy;

#[path = "strategies/bollinger.rs"]
pub mod bollinger;

pub use bollinger::BollingerStrategy;

pub fn create_strategy(params: &ParameterSet) -> Box<dyn Strategy + Send + Sync> {
    match params.signal_variant {
        SignalVariant::MeanReversion => Box::new(MeanReversionStrategy::new(params)),
        SignalVariant::ZScore => Box::new(ZScoreStrategy::new(params)),
        SignalVariant::Rsi => Box::new(RsiStrategy::new(params)),
        SignalVariant::Bollinger => Box::new(BollingerStrategy::new(params)),
    }
}
