use crate::config::ParameterSet;
use crate::models::{RiskState, Signal, Trade};

pub const PRICE_EPSILON: f64 = 1e-6;
pub const NEUTRAL_KELLY_FACTOR: f64 = 0.5;
pub const KELLY_FLOOR: f64 = 0.1;
pub const KELLY_CEILING: f64 = 0.9;

#[derive(Debug, Clone, PartialEq)]
pub struct PositionAllocation {
    pub quantity: f64,
    pub trade_value: f64,
    pub leverage: f64,
    pub kelly_factor: f64,
    pub compounding_factor: f64,
    pub performance_multiplier: f64,
}

#[derive(Debug, PartialEq)]
pub enum PositionSizingOutcome {
    Sized(PositionAllocation),
    TooSmall,
    InvalidInput { reason: &'static str },
}

pub struct PositionSizingParams<'a> {
    pub signal: &'a Signal,
    pub equity: f64,
    pub risk_state: &'a RiskState,
    pub trade_history: &'a [Trade],
    /// Per-period Sharpe of the run so far, once enough returns have been observed.
    pub running_sharpe: Option<f64>,
    pub params: &'a ParameterSet,
}

/// Converts a signal into a unit quantity: equity × fraction × confidence, then the Kelly,
/// leverage, compounding and performance multipliers in that order.
pub fn determine_position_size(sizing: PositionSizingParams) -> PositionSizingOutcome {
    let PositionSizingParams {
        signal,
        equity,
        risk_state,
        trade_history,
        running_sharpe,
        params,
    } = sizing;

    let price = signal.price;
    if !price.is_finite() || price <= PRICE_EPSILON {
        return PositionSizingOutcome::InvalidInput {
            reason: "non-positive price",
        };
    }
    if !equity.is_finite() || equity <= 0.0 {
        return PositionSizingOutcome::InvalidInput {
            reason: "non-positive equity",
        };
    }

    let confidence = if signal.confidence.is_finite() {
        signal.confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let mut trade_value = equity * params.position_size_fraction * confidence;

    let kelly = if params.kelly_enabled {
        kelly_factor(&signal.symbol, trade_history, params.kelly_min_trades) * params.kelly_fraction
    } else {
        1.0
    };
    trade_value *= kelly;

    let leverage = effective_leverage(risk_state, params);
    trade_value *= leverage;

    let compounding = if params.risk_compounding_enabled {
        compounding_factor(equity, params.initial_balance, params.profit_multiplier_cap)
    } else {
        1.0
    };
    trade_value *= compounding;

    let performance = if params.performance_sizing_enabled {
        performance_multiplier(running_sharpe, params)
    } else {
        1.0
    };
    trade_value *= performance;

    if !trade_value.is_finite() || trade_value <= 0.0 {
        return PositionSizingOutcome::TooSmall;
    }

    let quantity = trade_value / price;
    if !quantity.is_finite() || quantity <= 0.0 {
        return PositionSizingOutcome::TooSmall;
    }

    PositionSizingOutcome::Sized(PositionAllocation {
        quantity,
        trade_value,
        leverage,
        kelly_factor: kelly,
        compounding_factor: compounding,
        performance_multiplier: performance,
    })
}

/// Scales the base risk multiplier up by 10% while the running Sharpe beats the threshold
/// and down by 10% while it is negative, within the configured bounds.
pub fn performance_multiplier(running_sharpe: Option<f64>, params: &ParameterSet) -> f64 {
    let base = params.risk_multiplier;
    match running_sharpe.filter(|sharpe| sharpe.is_finite()) {
        Some(sharpe) if sharpe > params.sharpe_threshold => {
            (base * 1.1).min(params.max_risk_multiplier)
        }
        Some(sharpe) if sharpe < 0.0 => (base * 0.9).max(params.min_risk_multiplier),
        _ => base,
    }
}

/// Kelly fraction from the symbol's own closed trades, clamped to [0.1, 0.9].
/// Falls back to 0.5 until `min_trades` trades exist or when there are no wins or no losses.
pub fn kelly_factor(symbol: &str, trades: &[Trade], min_trades: usize) -> f64 {
    let pnls: Vec<f64> = trades
        .iter()
        .filter(|trade| trade.symbol == symbol && trade.pnl.is_finite())
        .map(|trade| trade.pnl)
        .collect();
    if pnls.len() < min_trades.max(1) {
        return NEUTRAL_KELLY_FACTOR;
    }

    let wins: Vec<f64> = pnls.iter().copied().filter(|pnl| *pnl > 0.0).collect();
    let losses: Vec<f64> = pnls.iter().copied().filter(|pnl| *pnl < 0.0).collect();
    if wins.is_empty() || losses.is_empty() {
        return NEUTRAL_KELLY_FACTOR;
    }

    let win_rate = wins.len() as f64 / pnls.len() as f64;
    let avg_win = wins.iter().sum::<f64>() / wins.len() as f64;
    let avg_loss = losses.iter().map(|loss| loss.abs()).sum::<f64>() / losses.len() as f64;
    if avg_loss <= 0.0 || avg_win <= 0.0 {
        return NEUTRAL_KELLY_FACTOR;
    }

    let payoff = avg_win / avg_loss;
    let fraction = (win_rate * payoff - (1.0 - win_rate)) / payoff;
    if !fraction.is_finite() {
        return NEUTRAL_KELLY_FACTOR;
    }
    fraction.clamp(KELLY_FLOOR, KELLY_CEILING)
}

/// Grows size with accumulated profit, bounded by `cap`. Neutral at or below the initial balance.
pub fn compounding_factor(equity: f64, initial_balance: f64, cap: f64) -> f64 {
    if !equity.is_finite() || initial_balance <= 0.0 || equity <= initial_balance {
        return 1.0;
    }
    (equity / initial_balance).min(cap).max(1.0)
}

pub fn effective_leverage(risk_state: &RiskState, params: &ParameterSet) -> f64 {
    if params.dynamic_leverage_enabled {
        risk_state.current_leverage
    } else {
        params.base_leverage
    }
}

/// Updates streak counters and leverage after a trade closes. Zero P&L counts as a loss.
pub fn apply_trade_outcome(risk_state: &mut RiskState, pnl: f64, params: &ParameterSet) {
    let is_win = pnl.is_finite() && pnl > 0.0;
    if is_win {
        risk_state.winning_streak += 1;
        risk_state.losing_streak = 0;
    } else {
        risk_state.losing_streak += 1;
        risk_state.winning_streak = 0;
    }

    if !params.dynamic_leverage_enabled {
        risk_state.current_leverage = params.base_leverage;
        return;
    }

    let base = params.base_leverage;
    risk_state.current_leverage = if is_win
        && risk_state.winning_streak >= params.winning_streak_threshold
    {
        let steps = streak_steps(
            risk_state.winning_streak,
            params.winning_streak_threshold,
            params.max_leverage_steps,
        );
        (base + steps * params.leverage_step).min(params.max_leverage)
    } else if !is_win && risk_state.losing_streak >= params.losing_streak_threshold {
        let steps = streak_steps(
            risk_state.losing_streak,
            params.losing_streak_threshold,
            params.max_leverage_steps,
        );
        (base - steps * params.leverage_step).max(1.0)
    } else {
        base
    };
}

fn streak_steps(streak: u32, threshold: u32, max_steps: usize) -> f64 {
    let steps = (streak + 1).saturating_sub(threshold) as usize;
    steps.min(max_steps) as f64
}
