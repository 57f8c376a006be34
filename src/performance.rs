use crate::models::*;
use statrs::statistics::Statistics;

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    /// Summarizes one run. Empty curves or trade logs give all-zero metrics.
    pub fn calculate_performance(
        equity_curve: &[EquityPoint],
        trades: &[Trade],
        initial_equity: f64,
        periods_per_year: f64,
    ) -> PerformanceMetrics {
        if equity_curve.is_empty() || trades.is_empty() {
            return PerformanceMetrics::default();
        }

        let final_equity = equity_curve
            .last()
            .map(|point| point.total_equity)
            .filter(|value| value.is_finite())
            .unwrap_or(initial_equity);
        let total_return = final_equity - initial_equity;
        let total_return_pct = if initial_equity > 0.0 {
            total_return / initial_equity
        } else {
            0.0
        };

        let sharpe_ratio = Self::calculate_sharpe_ratio(equity_curve, periods_per_year);
        let (max_drawdown, max_drawdown_amount) = Self::calculate_max_drawdown(equity_curve);

        let pnls: Vec<f64> = trades
            .iter()
            .map(|trade| if trade.pnl.is_finite() { trade.pnl } else { 0.0 })
            .collect();
        let wins: Vec<f64> = pnls.iter().copied().filter(|pnl| *pnl > 0.0).collect();
        let losses: Vec<f64> = pnls.iter().copied().filter(|pnl| *pnl < 0.0).collect();

        // Break-even trades count as losing trades but stay out of the loss average.
        let total_trades = pnls.len();
        let winning_trades = wins.len();
        let losing_trades = total_trades - winning_trades;
        let win_rate = winning_trades as f64 / total_trades as f64;

        let avg_win = Self::average(&wins);
        let avg_loss = Self::average(&losses).abs();
        let profit_factor = if avg_loss > 0.0 {
            avg_win / avg_loss
        } else {
            f64::INFINITY
        };

        let best_trade = pnls.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let worst_trade = pnls.iter().copied().fold(f64::INFINITY, f64::min);

        let holding_hours: Vec<f64> = trades
            .iter()
            .map(|trade| (trade.exit_time - trade.entry_time).num_seconds() as f64 / 3600.0)
            .collect();

        PerformanceMetrics {
            total_return,
            total_return_pct,
            sharpe_ratio,
            max_drawdown,
            max_drawdown_amount,
            total_trades,
            winning_trades,
            losing_trades,
            win_rate,
            avg_win,
            avg_loss,
            profit_factor,
            best_trade,
            worst_trade,
            avg_holding_period_hours: Self::average(&holding_hours),
            final_equity,
        }
    }

    fn average(values: &[f64]) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;

        for value in values.iter().copied() {
            if value.is_finite() {
                sum += value;
                count += 1;
            }
        }

        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    /// Annualized `mean / std` of the curve's period-over-period returns.
    pub fn calculate_sharpe_ratio(equity_curve: &[EquityPoint], periods_per_year: f64) -> f64 {
        if equity_curve.len() < 3 {
            return 0.0;
        }

        let returns: Vec<f64> = equity_curve
            .windows(2)
            .map(|window| {
                let prev_value = window[0].total_equity;
                let curr_value = window[1].total_equity;
                if prev_value > 0.0 {
                    (curr_value - prev_value) / prev_value
                } else {
                    0.0
                }
            })
            .filter(|value| value.is_finite())
            .collect();

        if returns.len() < 2 {
            return 0.0;
        }

        let mean_return = returns.iter().mean();
        let std_dev = returns.iter().std_dev();
        if !std_dev.is_finite() || std_dev == 0.0 {
            return 0.0;
        }

        let sharpe = mean_return / std_dev * periods_per_year.sqrt();
        if sharpe.is_finite() {
            sharpe
        } else {
            0.0
        }
    }

    /// Largest decline from the running peak, as (fraction of the peak, amount).
    pub fn calculate_max_drawdown(equity_curve: &[EquityPoint]) -> (f64, f64) {
        let Some(first) = equity_curve.first() else {
            return (0.0, 0.0);
        };

        let mut peak_value = first.total_equity;
        let mut max_drawdown = 0.0;
        let mut max_drawdown_amount = 0.0;

        for point in equity_curve {
            let value = point.total_equity;
            if !value.is_finite() {
                continue;
            }
            if value > peak_value {
                peak_value = value;
                continue;
            }
            let amount = peak_value - value;
            if amount > max_drawdown_amount {
                max_drawdown_amount = amount;
            }
            if peak_value > 0.0 {
                let drawdown = amount / peak_value;
                if drawdown > max_drawdown {
                    max_drawdown = drawdown;
                }
            }
        }

        (max_drawdown, max_drawdown_amount)
    }
}
