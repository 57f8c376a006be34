use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// One OHLCV sample plus the indicator columns derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub moving_average: Option<f64>,
    #[serde(default)]
    pub std_dev: Option<f64>,
    #[serde(default)]
    pub z_score: Option<f64>,
    #[serde(default)]
    pub rsi: Option<f64>,
    #[serde(default)]
    pub bollinger_upper: Option<f64>,
    #[serde(default)]
    pub bollinger_middle: Option<f64>,
    #[serde(default)]
    pub bollinger_lower: Option<f64>,
}

impl Bar {
    pub fn new(
        symbol: &str,
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            moving_average: None,
            std_dev: None,
            z_score: None,
            rsi: None,
            bollinger_upper: None,
            bollinger_middle: None,
            bollinger_lower: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "buy",
            SignalAction::Sell => "sell",
            SignalAction::Hold => "hold",
        }
    }

    pub fn is_actionable(&self) -> bool {
        !matches!(self, SignalAction::Hold)
    }
}

impl FromStr for SignalAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(SignalAction::Buy),
            "sell" => Ok(SignalAction::Sell),
            "hold" => Ok(SignalAction::Hold),
            other => Err(anyhow!("Unknown signal action '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStrength {
    Weak,
    Medium,
    Strong,
}

impl SignalStrength {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStrength::Weak => "weak",
            SignalStrength::Medium => "medium",
            SignalStrength::Strong => "strong",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub action: SignalAction,
    pub strength: SignalStrength,
    pub price: f64,
    pub confidence: f64,
    pub strategy: String,
    /// Indicator values that produced the signal, keyed by name.
    pub metadata: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn from_action(action: SignalAction) -> Option<Self> {
        match action {
            SignalAction::Buy => Some(PositionSide::Long),
            SignalAction::Sell => Some(PositionSide::Short),
            SignalAction::Hold => None,
        }
    }

    /// The signal action that would unwind a position on this side.
    pub fn opposing_action(&self) -> SignalAction {
        match self {
            PositionSide::Long => SignalAction::Sell,
            PositionSide::Short => SignalAction::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub leverage: f64,
    pub winning_streak_at_entry: u32,
    pub losing_streak_at_entry: u32,
}

impl Position {
    /// Signed profit of the position if it were closed at `price`. Non-finite results are 0.
    pub fn pnl_at(&self, price: f64) -> f64 {
        let pnl = match self.side {
            PositionSide::Long => (price - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - price) * self.quantity,
        };
        if pnl.is_finite() {
            pnl
        } else {
            0.0
        }
    }

    pub fn mark(&mut self, price: f64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        self.current_price = price;
        self.unrealized_pnl = self.pnl_at(price);
    }

    pub fn entry_notional(&self) -> f64 {
        self.entry_price * self.quantity
    }

    pub fn market_value(&self) -> f64 {
        self.current_price * self.quantity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    SignalReversal,
    StopLoss,
    TakeProfit,
    EndOfRun,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::SignalReversal => "signal_reversal",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::EndOfRun => "end_of_run",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub exit_reason: ExitReason,
    pub leverage: f64,
}

impl Trade {
    pub fn is_win(&self) -> bool {
        self.pnl > 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub total_equity: f64,
    pub cash: f64,
    pub open_positions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskState {
    pub winning_streak: u32,
    pub losing_streak: u32,
    pub current_leverage: f64,
}

impl RiskState {
    pub fn new(base_leverage: f64) -> Self {
        Self {
            winning_streak: 0,
            losing_streak: 0,
            current_leverage: base_leverage,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub total_return: f64,
    pub total_return_pct: f64,
    pub sharpe_ratio: f64,
    /// Largest peak-to-trough decline as a positive fraction of the peak.
    pub max_drawdown: f64,
    pub max_drawdown_amount: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub profit_factor: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
    pub avg_holding_period_hours: f64,
    pub final_equity: f64,
}

/// Everything one simulation run produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestReport {
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub metrics: PerformanceMetrics,
    pub initial_balance: f64,
    pub final_equity: f64,
    pub risk_state: RiskState,
    /// Multiplier applied to the composite score; 1.0 unless a safety clamp fired.
    pub penalty_factor: f64,
    pub numerical_blowup: bool,
    pub skipped_steps: usize,
    pub vetoed_entries: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationResult {
    pub parameters: BTreeMap<String, f64>,
    pub metrics: PerformanceMetrics,
    pub score: f64,
    pub penalty_factor: f64,
}

#[derive(Debug, Clone)]
pub struct BacktestTask {
    pub id: usize,
    pub parameters: BTreeMap<String, f64>,
}

#[derive(Debug, Clone)]
pub struct BacktestTaskResult {
    pub task_id: usize,
    pub result: Option<OptimizationResult>,
    pub error: Option<String>,
}
