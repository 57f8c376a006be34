use crate::models::{EquityPoint, ExitReason, Position, Trade};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Account state for one simulation run.
///
/// `cash` is the settled balance: realized P&L is credited to it on close. Opening a
/// position reserves its entry notional, so `available_cash` is what new entries can use,
/// while `total_equity` is `cash` plus the unrealized P&L of every open position.
#[derive(Debug, Clone)]
pub struct Portfolio {
    pub initial_balance: f64,
    pub cash: f64,
    pub reserved_cash: f64,
    pub positions: BTreeMap<String, Position>,
    pub realized_pnl: f64,
    pub peak_equity: f64,
    pub max_drawdown: f64,
    peak_cash: f64,
    returns: RunningReturns,
}

#[derive(Debug, Clone, Default)]
struct RunningReturns {
    last_equity: Option<f64>,
    count: usize,
    mean: f64,
    m2: f64,
}

impl RunningReturns {
    fn push(&mut self, equity: f64) {
        if let Some(previous) = self.last_equity {
            if previous != 0.0 {
                let period_return = (equity - previous) / previous;
                if period_return.is_finite() {
                    self.count += 1;
                    let delta = period_return - self.mean;
                    self.mean += delta / self.count as f64;
                    self.m2 += delta * (period_return - self.mean);
                }
            }
        }
        self.last_equity = Some(equity);
    }

    fn sharpe(&self, periods_per_year: f64) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        let std_dev = (self.m2 / (self.count - 1) as f64).sqrt();
        if std_dev == 0.0 || !std_dev.is_finite() {
            return 0.0;
        }
        self.mean / std_dev * periods_per_year.sqrt()
    }
}

impl Portfolio {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            initial_balance,
            cash: initial_balance,
            reserved_cash: 0.0,
            positions: BTreeMap::new(),
            realized_pnl: 0.0,
            peak_equity: initial_balance,
            max_drawdown: 0.0,
            peak_cash: initial_balance,
            returns: RunningReturns::default(),
        }
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn available_cash(&self) -> f64 {
        self.cash - self.reserved_cash
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.positions
            .values()
            .map(|position| position.unrealized_pnl)
            .filter(|pnl| pnl.is_finite())
            .sum()
    }

    pub fn total_equity(&self) -> f64 {
        self.cash + self.unrealized_pnl()
    }

    pub fn gross_exposure(&self) -> f64 {
        self.positions
            .values()
            .map(|position| position.market_value().abs())
            .filter(|value| value.is_finite())
            .sum()
    }

    /// Drawdown of the settled balance from its own peak.
    pub fn realized_drawdown(&self) -> f64 {
        if self.peak_cash <= 0.0 {
            return 0.0;
        }
        ((self.peak_cash - self.cash) / self.peak_cash).max(0.0)
    }

    pub fn running_sharpe(&self, periods_per_year: f64) -> f64 {
        self.returns.sharpe(periods_per_year)
    }

    /// Unannualized running Sharpe, available once `min_returns` period returns are recorded.
    pub fn sizing_sharpe(&self, min_returns: usize) -> Option<f64> {
        (self.returns.count >= min_returns.max(2)).then(|| self.returns.sharpe(1.0))
    }

    pub fn open_position(&mut self, position: Position) -> Result<()> {
        if self.positions.contains_key(&position.symbol) {
            return Err(anyhow!(
                "Position for {} is already open",
                position.symbol
            ));
        }
        let notional = position.entry_notional();
        if !notional.is_finite() || notional <= 0.0 {
            return Err(anyhow!(
                "Refusing position for {} with notional {}",
                position.symbol,
                notional
            ));
        }
        self.reserved_cash += notional;
        self.positions.insert(position.symbol.clone(), position);
        Ok(())
    }

    pub fn mark_to_market(&mut self, symbol: &str, price: f64) {
        if let Some(position) = self.positions.get_mut(symbol) {
            position.mark(price);
        }
    }

    pub fn close_position(
        &mut self,
        symbol: &str,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        exit_reason: ExitReason,
    ) -> Option<Trade> {
        let position = self.positions.remove(symbol)?;
        let pnl = position.pnl_at(exit_price);
        let notional = position.entry_notional();
        let pnl_pct = if notional != 0.0 { pnl / notional } else { 0.0 };

        self.reserved_cash = (self.reserved_cash - notional).max(0.0);
        if self.positions.is_empty() {
            self.reserved_cash = 0.0;
        }
        self.cash += pnl;
        self.realized_pnl += pnl;
        if self.cash > self.peak_cash {
            self.peak_cash = self.cash;
        }

        Some(Trade {
            symbol: position.symbol,
            side: position.side,
            quantity: position.quantity,
            entry_price: position.entry_price,
            exit_price,
            entry_time: position.entry_time,
            exit_time,
            pnl,
            pnl_pct: if pnl_pct.is_finite() { pnl_pct } else { 0.0 },
            exit_reason,
            leverage: position.leverage,
        })
    }

    /// Appends-ready equity row; also advances the drawdown and Sharpe trackers.
    pub fn record_equity(&mut self, timestamp: DateTime<Utc>) -> EquityPoint {
        let total_equity = self.total_equity();
        if total_equity > self.peak_equity {
            self.peak_equity = total_equity;
        }
        if self.peak_equity > 0.0 {
            let drawdown = (self.peak_equity - total_equity) / self.peak_equity;
            if drawdown.is_finite() && drawdown > self.max_drawdown {
                self.max_drawdown = drawdown;
            }
        }
        self.returns.push(total_equity);

        EquityPoint {
            timestamp,
            total_equity,
            cash: self.cash,
            open_positions: self.positions.len(),
        }
    }
}
