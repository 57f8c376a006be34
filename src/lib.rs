pub mod cache;
pub mod candle_utils;
pub mod config;
pub mod data_context;
pub mod engine;
pub mod execution;
pub mod export;
pub mod genetic;
pub mod indicators;
pub mod models;
pub mod optimizer;
pub mod optimizer_status;
pub mod param_utils;
pub mod performance;
pub mod portfolio;
pub mod risk;
pub mod strategy;
pub mod strategy_utils;
pub mod trading_rules;
pub mod walk_forward;

pub mod commands {
    pub mod backtest;
    pub mod inputs;
    pub mod market_data_snapshot;
    pub mod optimize;
}
