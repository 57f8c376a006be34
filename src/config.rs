use crate::param_utils::{binary_param_value, coerce_binary_param, require_count, require_finite};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_MAX_WORKERS_CAP: usize = 8;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Unknown parameter '{0}'")]
    UnknownParameter(String),
    #[error("Parameter {name} must be {expected} (value: {value})")]
    InvalidValue {
        name: String,
        value: f64,
        expected: String,
    },
    #[error("Unknown signal variant '{0}'")]
    UnknownVariant(String),
    #[error("Parameter grid is empty")]
    EmptyGrid,
    #[error("Setting {key} {reason} (value: {value})")]
    InvalidSetting {
        key: String,
        value: String,
        reason: String,
    },
}

/// Which indicator test the signal generator applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalVariant {
    MeanReversion,
    ZScore,
    Rsi,
    Bollinger,
}

impl SignalVariant {
    pub fn code(&self) -> f64 {
        match self {
            SignalVariant::MeanReversion => 0.0,
            SignalVariant::ZScore => 1.0,
            SignalVariant::Rsi => 2.0,
            SignalVariant::Bollinger => 3.0,
        }
    }

    pub fn from_code(value: f64) -> Result<Self, ConfigError> {
        if !value.is_finite() {
            return Err(ConfigError::UnknownVariant(value.to_string()));
        }
        match value.round() as i64 {
            0 => Ok(SignalVariant::MeanReversion),
            1 => Ok(SignalVariant::ZScore),
            2 => Ok(SignalVariant::Rsi),
            3 => Ok(SignalVariant::Bollinger),
            _ => Err(ConfigError::UnknownVariant(value.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalVariant::MeanReversion => "mean_reversion",
            SignalVariant::ZScore => "z_score",
            SignalVariant::Rsi => "rsi",
            SignalVariant::Bollinger => "bollinger",
        }
    }
}

impl fmt::Display for SignalVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalVariant {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mean_reversion" | "ma" => Ok(SignalVariant::MeanReversion),
            "z_score" | "zscore" => Ok(SignalVariant::ZScore),
            "rsi" => Ok(SignalVariant::Rsi),
            "bollinger" => Ok(SignalVariant::Bollinger),
            other => Err(ConfigError::UnknownVariant(other.to_string())),
        }
    }
}

/// Every tunable of one simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    // Signal generation
    pub signal_variant: SignalVariant,
    pub lookback_window: usize,
    pub threshold: f64,
    pub z_score_threshold: f64,
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub bollinger_period: usize,
    pub bollinger_std: f64,
    pub confirmation_period: usize,
    pub confirmation_ratio: f64,
    pub medium_signal_multiple: f64,
    pub strong_signal_multiple: f64,
    pub allow_short: bool,

    // Position sizing
    pub initial_balance: f64,
    pub position_size_fraction: f64,
    pub kelly_enabled: bool,
    pub kelly_fraction: f64,
    pub kelly_min_trades: usize,
    pub dynamic_leverage_enabled: bool,
    pub base_leverage: f64,
    pub max_leverage: f64,
    pub leverage_step: f64,
    pub max_leverage_steps: usize,
    pub winning_streak_threshold: u32,
    pub losing_streak_threshold: u32,
    pub risk_compounding_enabled: bool,
    pub profit_multiplier_cap: f64,
    pub performance_sizing_enabled: bool,
    pub performance_lookback: usize,
    pub sharpe_threshold: f64,
    pub risk_multiplier: f64,
    pub min_risk_multiplier: f64,
    pub max_risk_multiplier: f64,

    // Risk limits
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub max_positions: usize,
    pub max_drawdown_pct: f64,
    pub max_portfolio_risk_pct: f64,
    pub min_cash_reserve_pct: f64,
    pub max_sector_exposure_pct: f64,
    pub max_correlated_positions: usize,
    pub exit_on_reversal: bool,

    // Numeric safety
    pub blowup_multiple: f64,
    pub blowup_penalty: f64,
    pub margin_call_ratio: f64,
    pub margin_call_penalty: f64,
    pub drawdown_warning_ratio: f64,
    pub drawdown_warning_penalty: f64,
    pub max_position_equity_ratio: f64,

    pub periods_per_year: f64,
}

impl Default for ParameterSet {
    fn default() -> Self {
        Self {
            signal_variant: SignalVariant::MeanReversion,
            lookback_window: 20,
            threshold: 0.01,
            z_score_threshold: 2.0,
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            bollinger_period: 20,
            bollinger_std: 2.0,
            confirmation_period: 1,
            confirmation_ratio: 1.0,
            medium_signal_multiple: 1.5,
            strong_signal_multiple: 2.0,
            allow_short: true,

            initial_balance: 100_000.0,
            position_size_fraction: 0.02,
            kelly_enabled: false,
            kelly_fraction: 0.25,
            kelly_min_trades: 10,
            dynamic_leverage_enabled: true,
            base_leverage: 1.0,
            max_leverage: 5.0,
            leverage_step: 1.0,
            max_leverage_steps: 2,
            winning_streak_threshold: 3,
            losing_streak_threshold: 2,
            risk_compounding_enabled: false,
            profit_multiplier_cap: 2.0,
            performance_sizing_enabled: false,
            performance_lookback: 20,
            sharpe_threshold: 1.0,
            risk_multiplier: 1.0,
            min_risk_multiplier: 0.5,
            max_risk_multiplier: 2.0,

            stop_loss_pct: 0.05,
            take_profit_pct: 0.10,
            max_positions: 10,
            max_drawdown_pct: 0.20,
            max_portfolio_risk_pct: 0.5,
            min_cash_reserve_pct: 0.1,
            max_sector_exposure_pct: 0.3,
            max_correlated_positions: 3,
            exit_on_reversal: true,

            blowup_multiple: 10.0,
            blowup_penalty: 0.1,
            margin_call_ratio: 0.5,
            margin_call_penalty: 0.5,
            drawdown_warning_ratio: 0.8,
            drawdown_warning_penalty: 0.8,
            max_position_equity_ratio: 1.0,

            periods_per_year: 252.0,
        }
    }
}

pub const PARAMETER_NAMES: [&str; 51] = [
    "signal_variant",
    "lookback_window",
    "threshold",
    "z_score_threshold",
    "rsi_period",
    "rsi_oversold",
    "rsi_overbought",
    "bollinger_period",
    "bollinger_std",
    "confirmation_period",
    "confirmation_ratio",
    "medium_signal_multiple",
    "strong_signal_multiple",
    "allow_short",
    "initial_balance",
    "position_size_fraction",
    "kelly_enabled",
    "kelly_fraction",
    "kelly_min_trades",
    "dynamic_leverage_enabled",
    "base_leverage",
    "max_leverage",
    "leverage_step",
    "max_leverage_steps",
    "winning_streak_threshold",
    "losing_streak_threshold",
    "risk_compounding_enabled",
    "profit_multiplier_cap",
    "performance_sizing_enabled",
    "performance_lookback",
    "sharpe_threshold",
    "risk_multiplier",
    "min_risk_multiplier",
    "max_risk_multiplier",
    "stop_loss_pct",
    "take_profit_pct",
    "max_positions",
    "max_drawdown_pct",
    "max_portfolio_risk_pct",
    "min_cash_reserve_pct",
    "max_sector_exposure_pct",
    "max_correlated_positions",
    "exit_on_reversal",
    "blowup_multiple",
    "blowup_penalty",
    "margin_call_ratio",
    "margin_call_penalty",
    "drawdown_warning_ratio",
    "drawdown_warning_penalty",
    "max_position_equity_ratio",
    "periods_per_year",
];

impl ParameterSet {
    /// Builds a parameter set from defaults plus every entry of `parameters`, then validates it.
    pub fn from_parameters(parameters: &HashMap<String, f64>) -> Result<Self, ConfigError> {
        let mut sorted: Vec<_> = parameters.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        let mut params = Self::default();
        for (name, value) in sorted {
            params.apply_override(name, *value)?;
        }
        params.validate()?;
        Ok(params)
    }

    pub fn with_override(mut self, name: &str, value: f64) -> Result<Self, ConfigError> {
        self.apply_override(name, value)?;
        Ok(self)
    }

    /// Applies every override in key order and validates the result.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, f64>) -> Result<Self, ConfigError> {
        for (name, value) in overrides {
            self.apply_override(name, *value)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Sets one tunable by name. Domain checks happen in `validate`.
    pub fn apply_override(&mut self, name: &str, value: f64) -> Result<(), ConfigError> {
        match name {
            "signal_variant" => self.signal_variant = SignalVariant::from_code(value)?,
            "lookback_window" => self.lookback_window = require_count(name, value, 1)?,
            "threshold" => self.threshold = require_finite(name, value)?,
            "z_score_threshold" => self.z_score_threshold = require_finite(name, value)?,
            "rsi_period" => self.rsi_period = require_count(name, value, 1)?,
            "rsi_oversold" => self.rsi_oversold = require_finite(name, value)?,
            "rsi_overbought" => self.rsi_overbought = require_finite(name, value)?,
            "bollinger_period" => self.bollinger_period = require_count(name, value, 1)?,
            "bollinger_std" => self.bollinger_std = require_finite(name, value)?,
            "confirmation_period" => self.confirmation_period = require_count(name, value, 1)?,
            "confirmation_ratio" => self.confirmation_ratio = require_finite(name, value)?,
            "medium_signal_multiple" => {
                self.medium_signal_multiple = require_finite(name, value)?
            }
            "strong_signal_multiple" => {
                self.strong_signal_multiple = require_finite(name, value)?
            }
            "allow_short" => self.allow_short = coerce_binary_param(value),
            "initial_balance" => self.initial_balance = require_finite(name, value)?,
            "position_size_fraction" => {
                self.position_size_fraction = require_finite(name, value)?
            }
            "kelly_enabled" => self.kelly_enabled = coerce_binary_param(value),
            "kelly_fraction" => self.kelly_fraction = require_finite(name, value)?,
            "kelly_min_trades" => self.kelly_min_trades = require_count(name, value, 1)?,
            "dynamic_leverage_enabled" => {
                self.dynamic_leverage_enabled = coerce_binary_param(value)
            }
            "base_leverage" => self.base_leverage = require_finite(name, value)?,
            "max_leverage" => self.max_leverage = require_finite(name, value)?,
            "leverage_step" => self.leverage_step = require_finite(name, value)?,
            "max_leverage_steps" => self.max_leverage_steps = require_count(name, value, 1)?,
            "winning_streak_threshold" => {
                self.winning_streak_threshold = require_count(name, value, 1)? as u32
            }
            "losing_streak_threshold" => {
                self.losing_streak_threshold = require_count(name, value, 1)? as u32
            }
            "risk_compounding_enabled" => {
                self.risk_compounding_enabled = coerce_binary_param(value)
            }
            "profit_multiplier_cap" => self.profit_multiplier_cap = require_finite(name, value)?,
            "performance_sizing_enabled" => {
                self.performance_sizing_enabled = coerce_binary_param(value)
            }
            "performance_lookback" => self.performance_lookback = require_count(name, value, 2)?,
            "sharpe_threshold" => self.sharpe_threshold = require_finite(name, value)?,
            "risk_multiplier" => self.risk_multiplier = require_finite(name, value)?,
            "min_risk_multiplier" => self.min_risk_multiplier = require_finite(name, value)?,
            "max_risk_multiplier" => self.max_risk_multiplier = require_finite(name, value)?,
            "stop_loss_pct" => self.stop_loss_pct = require_finite(name, value)?,
            "take_profit_pct" => self.take_profit_pct = require_finite(name, value)?,
            "max_positions" => self.max_positions = require_count(name, value, 1)?,
            "max_drawdown_pct" => self.max_drawdown_pct = require_finite(name, value)?,
            "max_portfolio_risk_pct" => {
                self.max_portfolio_risk_pct = require_finite(name, value)?
            }
            "min_cash_reserve_pct" => self.min_cash_reserve_pct = require_finite(name, value)?,
            "max_sector_exposure_pct" => {
                self.max_sector_exposure_pct = require_finite(name, value)?
            }
            "max_correlated_positions" => {
                self.max_correlated_positions = require_count(name, value, 1)?
            }
            "exit_on_reversal" => self.exit_on_reversal = coerce_binary_param(value),
            "blowup_multiple" => self.blowup_multiple = require_finite(name, value)?,
            "blowup_penalty" => self.blowup_penalty = require_finite(name, value)?,
            "margin_call_ratio" => self.margin_call_ratio = require_finite(name, value)?,
            "margin_call_penalty" => self.margin_call_penalty = require_finite(name, value)?,
            "drawdown_warning_ratio" => {
                self.drawdown_warning_ratio = require_finite(name, value)?
            }
            "drawdown_warning_penalty" => {
                self.drawdown_warning_penalty = require_finite(name, value)?
            }
            "max_position_equity_ratio" => {
                self.max_position_equity_ratio = require_finite(name, value)?
            }
            "periods_per_year" => self.periods_per_year = require_finite(name, value)?,
            other => return Err(ConfigError::UnknownParameter(other.to_string())),
        }
        Ok(())
    }

    /// The full parameter map, with flags as 0/1 and the variant as its numeric code.
    pub fn to_parameters(&self) -> BTreeMap<String, f64> {
        let entries: [(&str, f64); 51] = [
            ("signal_variant", self.signal_variant.code()),
            ("lookback_window", self.lookback_window as f64),
            ("threshold", self.threshold),
            ("z_score_threshold", self.z_score_threshold),
            ("rsi_period", self.rsi_period as f64),
            ("rsi_oversold", self.rsi_oversold),
            ("rsi_overbought", self.rsi_overbought),
            ("bollinger_period", self.bollinger_period as f64),
            ("bollinger_std", self.bollinger_std),
            ("confirmation_period", self.confirmation_period as f64),
            ("confirmation_ratio", self.confirmation_ratio),
            ("medium_signal_multiple", self.medium_signal_multiple),
            ("strong_signal_multiple", self.strong_signal_multiple),
            ("allow_short", binary_param_value(self.allow_short)),
            ("initial_balance", self.initial_balance),
            ("position_size_fraction", self.position_size_fraction),
            ("kelly_enabled", binary_param_value(self.kelly_enabled)),
            ("kelly_fraction", self.kelly_fraction),
            ("kelly_min_trades", self.kelly_min_trades as f64),
            (
                "dynamic_leverage_enabled",
                binary_param_value(self.dynamic_leverage_enabled),
            ),
            ("base_leverage", self.base_leverage),
            ("max_leverage", self.max_leverage),
            ("leverage_step", self.leverage_step),
            ("max_leverage_steps", self.max_leverage_steps as f64),
            (
                "winning_streak_threshold",
                self.winning_streak_threshold as f64,
            ),
            ("losing_streak_threshold", self.losing_streak_threshold as f64),
            (
                "risk_compounding_enabled",
                binary_param_value(self.risk_compounding_enabled),
            ),
            ("profit_multiplier_cap", self.profit_multiplier_cap),
            (
                "performance_sizing_enabled",
                binary_param_value(self.performance_sizing_enabled),
            ),
            ("performance_lookback", self.performance_lookback as f64),
            ("sharpe_threshold", self.sharpe_threshold),
            ("risk_multiplier", self.risk_multiplier),
            ("min_risk_multiplier", self.min_risk_multiplier),
            ("max_risk_multiplier", self.max_risk_multiplier),
            ("stop_loss_pct", self.stop_loss_pct),
            ("take_profit_pct", self.take_profit_pct),
            ("max_positions", self.max_positions as f64),
            ("max_drawdown_pct", self.max_drawdown_pct),
            ("max_portfolio_risk_pct", self.max_portfolio_risk_pct),
            ("min_cash_reserve_pct", self.min_cash_reserve_pct),
            ("max_sector_exposure_pct", self.max_sector_exposure_pct),
            (
                "max_correlated_positions",
                self.max_correlated_positions as f64,
            ),
            ("exit_on_reversal", binary_param_value(self.exit_on_reversal)),
            ("blowup_multiple", self.blowup_multiple),
            ("blowup_penalty", self.blowup_penalty),
            ("margin_call_ratio", self.margin_call_ratio),
            ("margin_call_penalty", self.margin_call_penalty),
            ("drawdown_warning_ratio", self.drawdown_warning_ratio),
            ("drawdown_warning_penalty", self.drawdown_warning_penalty),
            ("max_position_equity_ratio", self.max_position_equity_ratio),
            ("periods_per_year", self.periods_per_year),
        ];
        entries
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect()
    }

    /// Longest indicator window the configured variant depends on.
    pub fn required_history(&self) -> usize {
        let window = match self.signal_variant {
            SignalVariant::MeanReversion | SignalVariant::ZScore => self.lookback_window,
            SignalVariant::Rsi => self.rsi_period + 1,
            SignalVariant::Bollinger => self.bollinger_period,
        };
        window.max(self.confirmation_period)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_positive("threshold", self.threshold)?;
        ensure_positive("z_score_threshold", self.z_score_threshold)?;
        ensure_positive("bollinger_std", self.bollinger_std)?;
        ensure_range("rsi_oversold", self.rsi_oversold, 0.0, 100.0)?;
        ensure_range("rsi_overbought", self.rsi_overbought, 0.0, 100.0)?;
        if self.rsi_oversold >= self.rsi_overbought {
            return Err(invalid(
                "rsi_oversold",
                self.rsi_oversold,
                format!("below rsi_overbought ({})", self.rsi_overbought),
            ));
        }
        ensure_fraction("confirmation_ratio", self.confirmation_ratio)?;
        ensure_positive("medium_signal_multiple", self.medium_signal_multiple)?;
        if self.strong_signal_multiple < self.medium_signal_multiple {
            return Err(invalid(
                "strong_signal_multiple",
                self.strong_signal_multiple,
                format!(">= medium_signal_multiple ({})", self.medium_signal_multiple),
            ));
        }

        ensure_positive("initial_balance", self.initial_balance)?;
        ensure_fraction("position_size_fraction", self.position_size_fraction)?;
        ensure_fraction("kelly_fraction", self.kelly_fraction)?;
        if self.base_leverage < 1.0 {
            return Err(invalid("base_leverage", self.base_leverage, ">= 1".to_string()));
        }
        if self.max_leverage < self.base_leverage {
            return Err(invalid(
                "max_leverage",
                self.max_leverage,
                format!(">= base_leverage ({})", self.base_leverage),
            ));
        }
        ensure_positive("leverage_step", self.leverage_step)?;
        ensure_positive("profit_multiplier_cap", self.profit_multiplier_cap)?;
        ensure_positive("min_risk_multiplier", self.min_risk_multiplier)?;
        if self.max_risk_multiplier < self.min_risk_multiplier {
            return Err(invalid(
                "max_risk_multiplier",
                self.max_risk_multiplier,
                format!(">= min_risk_multiplier ({})", self.min_risk_multiplier),
            ));
        }
        if self.risk_multiplier < self.min_risk_multiplier
            || self.risk_multiplier > self.max_risk_multiplier
        {
            return Err(invalid(
                "risk_multiplier",
                self.risk_multiplier,
                format!(
                    "in [{}, {}]",
                    self.min_risk_multiplier, self.max_risk_multiplier
                ),
            ));
        }

        ensure_fraction("stop_loss_pct", self.stop_loss_pct)?;
        ensure_positive("take_profit_pct", self.take_profit_pct)?;
        ensure_fraction("max_drawdown_pct", self.max_drawdown_pct)?;
        ensure_fraction("max_portfolio_risk_pct", self.max_portfolio_risk_pct)?;
        ensure_fraction("min_cash_reserve_pct", self.min_cash_reserve_pct)?;
        ensure_fraction("max_sector_exposure_pct", self.max_sector_exposure_pct)?;

        if self.blowup_multiple <= 1.0 {
            return Err(invalid(
                "blowup_multiple",
                self.blowup_multiple,
                "> 1".to_string(),
            ));
        }
        ensure_fraction("blowup_penalty", self.blowup_penalty)?;
        ensure_fraction("margin_call_ratio", self.margin_call_ratio)?;
        ensure_fraction("margin_call_penalty", self.margin_call_penalty)?;
        ensure_fraction("drawdown_warning_ratio", self.drawdown_warning_ratio)?;
        ensure_fraction("drawdown_warning_penalty", self.drawdown_warning_penalty)?;
        ensure_positive("max_position_equity_ratio", self.max_position_equity_ratio)?;
        if self.max_position_equity_ratio < self.max_portfolio_risk_pct {
            return Err(invalid(
                "max_position_equity_ratio",
                self.max_position_equity_ratio,
                format!(">= max_portfolio_risk_pct ({})", self.max_portfolio_risk_pct),
            ));
        }
        ensure_positive("periods_per_year", self.periods_per_year)?;
        Ok(())
    }
}

fn invalid(name: &str, value: f64, expected: String) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        value,
        expected,
    }
}

fn ensure_positive(name: &str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(invalid(name, value, "> 0".to_string()));
    }
    Ok(())
}

fn ensure_fraction(name: &str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value <= 0.0 || value > 1.0 {
        return Err(invalid(name, value, "in (0, 1]".to_string()));
    }
    Ok(())
}

fn ensure_range(name: &str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value <= min || value >= max {
        return Err(invalid(name, value, format!("in ({}, {})", min, max)));
    }
    Ok(())
}

pub fn default_max_workers() -> usize {
    std::cmp::min(std::cmp::max(1, num_cpus::get()), DEFAULT_MAX_WORKERS_CAP)
}

/// Process-level knobs for the parameter searches, read from settings (env vars in the binary).
#[derive(Debug, Clone, PartialEq)]
pub struct SearchSettings {
    pub max_workers: usize,
    pub show_progress: bool,
    pub genetic_seed: u64,
    pub genetic_population: usize,
    pub genetic_generations: usize,
    pub genetic_mutation_rate: f64,
    pub walk_forward_train_days: i64,
    pub walk_forward_test_days: i64,
    pub walk_forward_step_days: i64,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            show_progress: true,
            genetic_seed: 42,
            genetic_population: 50,
            genetic_generations: 20,
            genetic_mutation_rate: 0.1,
            walk_forward_train_days: 252,
            walk_forward_test_days: 63,
            walk_forward_step_days: 63,
        }
    }
}

impl SearchSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_workers: setting_usize(settings, "MAX_WORKERS", defaults.max_workers, 1)?,
            show_progress: setting_bool(settings, "SHOW_PROGRESS", defaults.show_progress)?,
            genetic_seed: setting_usize(settings, "GENETIC_SEED", defaults.genetic_seed as usize, 0)?
                as u64,
            genetic_population: setting_usize(
                settings,
                "GENETIC_POPULATION",
                defaults.genetic_population,
                2,
            )?,
            genetic_generations: setting_usize(
                settings,
                "GENETIC_GENERATIONS",
                defaults.genetic_generations,
                1,
            )?,
            genetic_mutation_rate: setting_f64(
                settings,
                "GENETIC_MUTATION_RATE",
                defaults.genetic_mutation_rate,
                0.0,
                1.0,
            )?,
            walk_forward_train_days: setting_usize(
                settings,
                "WALK_FORWARD_TRAIN_DAYS",
                defaults.walk_forward_train_days as usize,
                1,
            )? as i64,
            walk_forward_test_days: setting_usize(
                settings,
                "WALK_FORWARD_TEST_DAYS",
                defaults.walk_forward_test_days as usize,
                1,
            )? as i64,
            walk_forward_step_days: setting_usize(
                settings,
                "WALK_FORWARD_STEP_DAYS",
                defaults.walk_forward_step_days as usize,
                1,
            )? as i64,
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let settings: HashMap<String, String> = std::env::vars().collect();
        Self::from_settings_map(&settings)
    }
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn setting_error(key: &str, raw: &str, reason: String) -> ConfigError {
    ConfigError::InvalidSetting {
        key: key.to_string(),
        value: raw.to_string(),
        reason,
    }
}

fn setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: f64,
    max: f64,
) -> Result<f64, ConfigError> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| setting_error(key, raw, "must be a number".to_string()))?;
    if !value.is_finite() {
        return Err(setting_error(key, raw, "must be finite".to_string()));
    }
    if value < min {
        return Err(setting_error(key, raw, format!("must be >= {}", min)));
    }
    if value > max {
        return Err(setting_error(key, raw, format!("must be <= {}", max)));
    }
    Ok(value)
}

fn setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize, ConfigError> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| setting_error(key, raw, "must be a number".to_string()))?;
    if !value.is_finite() {
        return Err(setting_error(key, raw, "must be finite".to_string()));
    }
    if value.fract() != 0.0 {
        return Err(setting_error(key, raw, "must be an integer".to_string()));
    }
    if value < min as f64 {
        return Err(setting_error(key, raw, format!("must be >= {}", min)));
    }
    Ok(value as usize)
}

fn setting_bool(
    settings: &HashMap<String, String>,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(setting_error(key, raw, "must be a boolean".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let params = ParameterSet::default();
        assert!(params.validate().is_ok());
        assert_eq!(params.lookback_window, 20);
        assert!((params.position_size_fraction - 0.02).abs() < 1e-12);
        assert!(!params.kelly_enabled);
    }

    #[test]
    fn with_override_rejects_unknown_key() {
        let err = ParameterSet::default()
            .with_override("lookback_windw", 10.0)
            .unwrap_err();
        assert_eq!(err, ConfigError::UnknownParameter("lookback_windw".to_string()));
    }

    #[test]
    fn with_overrides_rejects_non_positive_threshold() {
        let mut overrides = BTreeMap::new();
        overrides.insert("threshold".to_string(), 0.0);
        let err = ParameterSet::default().with_overrides(&overrides).unwrap_err();
        match err {
            ConfigError::InvalidValue { name, .. } => assert_eq!(name, "threshold"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn percentages_must_be_fractions() {
        let params = ParameterSet::default()
            .with_override("stop_loss_pct", 1.5)
            .unwrap();
        assert!(params.validate().is_err());
    }

    #[test]
    fn leverage_bounds_are_ordered() {
        let params = ParameterSet::default()
            .with_override("max_leverage", 0.5)
            .unwrap();
        assert!(params.validate().is_err());
    }

    #[test]
    fn plausibility_guard_stays_above_portfolio_risk_limit() {
        let params = ParameterSet::default();
        assert!(params.max_position_equity_ratio > params.max_portfolio_risk_pct);
        assert!(ParameterSet::default()
            .with_override("max_position_equity_ratio", 0.3)
            .unwrap()
            .validate()
            .is_err());
    }

    #[test]
    fn risk_multiplier_must_sit_inside_its_bounds() {
        assert!(ParameterSet::default()
            .with_override("risk_multiplier", 3.0)
            .unwrap()
            .validate()
            .is_err());
        assert!(ParameterSet::default()
            .with_override("max_risk_multiplier", 0.4)
            .unwrap()
            .validate()
            .is_err());
    }

    #[test]
    fn round_trips_through_parameter_map() {
        let params = ParameterSet::default()
            .with_override("signal_variant", 2.0)
            .unwrap()
            .with_override("kelly_enabled", 1.0)
            .unwrap()
            .with_override("lookback_window", 30.0)
            .unwrap();
        assert_eq!(params.signal_variant, SignalVariant::Rsi);

        let map: HashMap<String, f64> = params.to_parameters().into_iter().collect();
        let rebuilt = ParameterSet::from_parameters(&map).unwrap();
        assert_eq!(rebuilt, params);
    }

    #[test]
    fn every_listed_name_is_accepted() {
        let defaults = ParameterSet::default().to_parameters();
        for name in PARAMETER_NAMES {
            let value = defaults[name];
            assert!(
                ParameterSet::default().with_override(name, value).is_ok(),
                "{} rejected",
                name
            );
        }
    }

    #[test]
    fn unknown_variant_code_is_rejected() {
        assert!(matches!(
            ParameterSet::default().with_override("signal_variant", 9.0),
            Err(ConfigError::UnknownVariant(_))
        ));
        assert_eq!("bollinger".parse::<SignalVariant>().unwrap(), SignalVariant::Bollinger);
    }

    #[test]
    fn search_settings_read_overrides_and_reject_garbage() {
        let mut settings = HashMap::new();
        settings.insert("MAX_WORKERS".to_string(), "3".to_string());
        settings.insert("GENETIC_SEED".to_string(), "7".to_string());
        settings.insert("SHOW_PROGRESS".to_string(), "false".to_string());
        let parsed = SearchSettings::from_settings_map(&settings).unwrap();
        assert_eq!(parsed.max_workers, 3);
        assert_eq!(parsed.genetic_seed, 7);
        assert!(!parsed.show_progress);
        assert_eq!(parsed.genetic_population, 50);

        settings.insert("GENETIC_MUTATION_RATE".to_string(), "1.5".to_string());
        assert!(SearchSettings::from_settings_map(&settings).is_err());
    }

    #[test]
    fn default_worker_count_is_capped() {
        let workers = default_max_workers();
        assert!(workers >= 1);
        assert!(workers <= DEFAULT_MAX_WORKERS_CAP);
    }
}
