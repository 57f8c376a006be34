use crate::config::ParameterSet;
use crate::models::{ExitReason, Position, PositionSide};
use crate::portfolio::Portfolio;
use crate::trading_rules::PRICE_EPSILON;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

const TECHNOLOGY_SYMBOLS: [&str; 5] = ["AAPL", "MSFT", "GOOGL", "AMZN", "TSLA"];

/// Relative slack when comparing a close against a stop or take-profit level.
pub const LEVEL_TOLERANCE: f64 = 1e-9;

/// Static symbol → sector table used for the exposure caps.
pub fn default_sector_map() -> HashMap<String, String> {
    TECHNOLOGY_SYMBOLS
        .iter()
        .map(|symbol| (symbol.to_string(), "technology".to_string()))
        .collect()
}

/// Why an entry was refused. Vetoes are policy outcomes, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskVeto {
    DrawdownLimit { drawdown: f64, limit: f64 },
    PositionAlreadyOpen,
    MaxPositions { open: usize, limit: usize },
    PositionTooLarge { value: f64, limit: f64 },
    CashReserve { remaining: f64, required: f64 },
    SectorExposure { sector: String, exposure: f64, limit: f64 },
    CorrelatedPositions { sector: String, open: usize, limit: usize },
    InvalidOrder,
}

impl RiskVeto {
    pub fn reason(&self) -> &'static str {
        match self {
            RiskVeto::DrawdownLimit { .. } => "max_drawdown",
            RiskVeto::PositionAlreadyOpen => "position_open",
            RiskVeto::MaxPositions { .. } => "max_positions",
            RiskVeto::PositionTooLarge { .. } => "max_portfolio_risk",
            RiskVeto::CashReserve { .. } => "cash_reserve",
            RiskVeto::SectorExposure { .. } => "sector_exposure",
            RiskVeto::CorrelatedPositions { .. } => "correlation",
            RiskVeto::InvalidOrder => "invalid_order",
        }
    }
}

impl fmt::Display for RiskVeto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskVeto::DrawdownLimit { drawdown, limit } => {
                write!(f, "drawdown {:.4} exceeds limit {:.4}", drawdown, limit)
            }
            RiskVeto::PositionAlreadyOpen => write!(f, "position already open"),
            RiskVeto::MaxPositions { open, limit } => {
                write!(f, "{} open positions (limit {})", open, limit)
            }
            RiskVeto::PositionTooLarge { value, limit } => {
                write!(f, "position value {:.2} above limit {:.2}", value, limit)
            }
            RiskVeto::CashReserve {
                remaining,
                required,
            } => write!(
                f,
                "cash after entry {:.2} below reserve {:.2}",
                remaining, required
            ),
            RiskVeto::SectorExposure {
                sector,
                exposure,
                limit,
            } => write!(
                f,
                "{} exposure {:.2} above limit {:.2}",
                sector, exposure, limit
            ),
            RiskVeto::CorrelatedPositions {
                sector,
                open,
                limit,
            } => write!(f, "{} has {} open positions (limit {})", sector, open, limit),
            RiskVeto::InvalidOrder => write!(f, "non-finite or non-positive order"),
        }
    }
}

/// Portfolio-wide limits found breached after a bar, reported but not enforced.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskLimitBreach {
    Drawdown { drawdown: f64, limit: f64 },
    SectorExposure { sector: String, exposure: f64, limit: f64 },
    Leverage { leverage: f64, limit: f64 },
}

#[derive(Debug, Clone)]
pub struct RiskManager {
    max_drawdown_pct: f64,
    max_positions: usize,
    max_portfolio_risk_pct: f64,
    min_cash_reserve_pct: f64,
    max_sector_exposure_pct: f64,
    max_correlated_positions: usize,
    max_leverage: f64,
    sector_map: HashMap<String, String>,
}

impl RiskManager {
    pub fn new(params: &ParameterSet) -> Self {
        Self {
            max_drawdown_pct: params.max_drawdown_pct,
            max_positions: params.max_positions,
            max_portfolio_risk_pct: params.max_portfolio_risk_pct,
            min_cash_reserve_pct: params.min_cash_reserve_pct,
            max_sector_exposure_pct: params.max_sector_exposure_pct,
            max_correlated_positions: params.max_correlated_positions,
            max_leverage: params.max_leverage,
            sector_map: default_sector_map(),
        }
    }

    pub fn with_sector_map(mut self, sector_map: HashMap<String, String>) -> Self {
        self.sector_map = sector_map;
        self
    }

    pub fn sector_of(&self, symbol: &str) -> Option<&str> {
        self.sector_map.get(symbol).map(String::as_str)
    }

    /// True when every limit allows opening `quantity` of `symbol` at `price`.
    pub fn permits(&self, symbol: &str, quantity: f64, price: f64, portfolio: &Portfolio) -> bool {
        self.check_limits(symbol, quantity, price, portfolio).is_ok()
    }

    /// Runs the entry checks in order and returns the first one that fails.
    pub fn check_limits(
        &self,
        symbol: &str,
        quantity: f64,
        price: f64,
        portfolio: &Portfolio,
    ) -> Result<(), RiskVeto> {
        let value = quantity * price;
        if !value.is_finite() || value <= 0.0 || price <= PRICE_EPSILON {
            return Err(RiskVeto::InvalidOrder);
        }

        let drawdown = portfolio.realized_drawdown();
        if drawdown > self.max_drawdown_pct {
            return Err(RiskVeto::DrawdownLimit {
                drawdown,
                limit: self.max_drawdown_pct,
            });
        }

        if portfolio.has_position(symbol) {
            return Err(RiskVeto::PositionAlreadyOpen);
        }

        let open = portfolio.open_position_count();
        if open >= self.max_positions {
            return Err(RiskVeto::MaxPositions {
                open,
                limit: self.max_positions,
            });
        }

        let equity = portfolio.total_equity();
        let value_limit = equity * self.max_portfolio_risk_pct;
        if value > value_limit + PRICE_EPSILON {
            return Err(RiskVeto::PositionTooLarge {
                value,
                limit: value_limit,
            });
        }

        let remaining = portfolio.available_cash() - value;
        let required = equity * self.min_cash_reserve_pct;
        if remaining + PRICE_EPSILON < required {
            return Err(RiskVeto::CashReserve {
                remaining,
                required,
            });
        }

        if let Some(sector) = self.sector_of(symbol) {
            let (sector_value, sector_count) = self.sector_usage(sector, portfolio);
            if sector_count >= self.max_correlated_positions {
                return Err(RiskVeto::CorrelatedPositions {
                    sector: sector.to_string(),
                    open: sector_count,
                    limit: self.max_correlated_positions,
                });
            }
            let exposure = sector_value + value;
            let limit = equity * self.max_sector_exposure_pct;
            if exposure > limit + PRICE_EPSILON {
                return Err(RiskVeto::SectorExposure {
                    sector: sector.to_string(),
                    exposure,
                    limit,
                });
            }
        }

        Ok(())
    }

    fn sector_usage(&self, sector: &str, portfolio: &Portfolio) -> (f64, usize) {
        portfolio
            .positions
            .values()
            .filter(|position| self.sector_of(&position.symbol) == Some(sector))
            .fold((0.0, 0), |(value, count), position| {
                (value + position.market_value().abs(), count + 1)
            })
    }

    /// Portfolio-level limits currently breached.
    pub fn check_risk_limits(&self, portfolio: &Portfolio) -> Vec<RiskLimitBreach> {
        let mut breaches = Vec::new();
        let equity = portfolio.total_equity();

        let drawdown = if portfolio.peak_equity > 0.0 {
            (portfolio.peak_equity - equity) / portfolio.peak_equity
        } else {
            0.0
        };
        if drawdown > self.max_drawdown_pct {
            breaches.push(RiskLimitBreach::Drawdown {
                drawdown,
                limit: self.max_drawdown_pct,
            });
        }

        if equity > 0.0 {
            let mut sector_values: BTreeMap<&str, f64> = BTreeMap::new();
            for position in portfolio.positions.values() {
                if let Some(sector) = self.sector_of(&position.symbol) {
                    *sector_values.entry(sector).or_insert(0.0) += position.market_value().abs();
                }
            }
            for (sector, value) in sector_values {
                let exposure = value / equity;
                if exposure > self.max_sector_exposure_pct {
                    breaches.push(RiskLimitBreach::SectorExposure {
                        sector: sector.to_string(),
                        exposure,
                        limit: self.max_sector_exposure_pct,
                    });
                }
            }

            let leverage = portfolio.gross_exposure() / equity;
            if leverage > self.max_leverage {
                breaches.push(RiskLimitBreach::Leverage {
                    leverage,
                    limit: self.max_leverage,
                });
            }
        }

        breaches
    }
}

/// Stop-loss and take-profit levels around the entry; shorts mirror longs.
pub fn stop_take(entry_price: f64, side: PositionSide, params: &ParameterSet) -> (f64, f64) {
    match side {
        PositionSide::Long => (
            entry_price * (1.0 - params.stop_loss_pct),
            entry_price * (1.0 + params.take_profit_pct),
        ),
        PositionSide::Short => (
            entry_price * (1.0 + params.stop_loss_pct),
            entry_price * (1.0 - params.take_profit_pct),
        ),
    }
}

fn at_or_above(price: f64, level: f64) -> bool {
    price >= level - LEVEL_TOLERANCE * level.abs()
}

fn at_or_below(price: f64, level: f64) -> bool {
    price <= level + LEVEL_TOLERANCE * level.abs()
}

/// Inclusive level check; the stop wins if both levels are somehow crossed.
pub fn exit_trigger(position: &Position, price: f64) -> Option<ExitReason> {
    if !price.is_finite() {
        return None;
    }
    match position.side {
        PositionSide::Long => {
            if at_or_below(price, position.stop_loss) {
                Some(ExitReason::StopLoss)
            } else if at_or_above(price, position.take_profit) {
                Some(ExitReason::TakeProfit)
            } else {
                None
            }
        }
        PositionSide::Short => {
            if at_or_above(price, position.stop_loss) {
                Some(ExitReason::StopLoss)
            } else if at_or_below(price, position.take_profit) {
                Some(ExitReason::TakeProfit)
            } else {
                None
            }
        }
    }
}
