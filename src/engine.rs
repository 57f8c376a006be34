use crate::candle_utils::{group_bars_by_symbol, unique_timestamps};
use crate::config::{ConfigError, ParameterSet};
use crate::execution::{ExecutionVenue, OrderRequest, SimulatedExecution};
use crate::indicators::{IndicatorSource, RollingIndicators};
use crate::models::*;
use crate::performance::PerformanceCalculator;
use crate::portfolio::Portfolio;
use crate::risk::{exit_trigger, stop_take, RiskManager};
use crate::strategy::{create_strategy, Strategy};
use crate::trading_rules::{
    apply_trade_outcome, determine_position_size, PositionSizingOutcome, PositionSizingParams,
    PRICE_EPSILON,
};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, PartialEq)]
enum EntrySignalOutcome {
    Executed,
    Skipped {
        reason: &'static str,
        details: Option<String>,
    },
}

/// Mutable state of one run. Never shared across runs.
struct SimulationState {
    portfolio: Portfolio,
    risk_state: RiskState,
    trades: Vec<Trade>,
    equity_curve: Vec<EquityPoint>,
    last_seen: BTreeMap<String, (f64, DateTime<Utc>)>,
    skipped_steps: usize,
    vetoed_entries: usize,
}

impl SimulationState {
    fn new(params: &ParameterSet) -> Self {
        Self {
            portfolio: Portfolio::new(params.initial_balance),
            risk_state: RiskState::new(params.base_leverage),
            trades: Vec::new(),
            equity_curve: Vec::new(),
            last_seen: BTreeMap::new(),
            skipped_steps: 0,
            vetoed_entries: 0,
        }
    }
}

pub struct Engine {
    pub params: ParameterSet,
    risk_manager: RiskManager,
    indicator_source: Arc<dyn IndicatorSource>,
}

impl Engine {
    pub fn new(params: ParameterSet) -> Result<Self, ConfigError> {
        params.validate()?;
        let risk_manager = RiskManager::new(&params);
        Ok(Self {
            params,
            risk_manager,
            indicator_source: Arc::new(RollingIndicators),
        })
    }

    // Construct an Engine configured from a parameter map.
    pub fn from_parameters(parameters: &HashMap<String, f64>) -> Result<Self, ConfigError> {
        Self::new(ParameterSet::from_parameters(parameters)?)
    }

    pub fn with_sector_map(mut self, sector_map: HashMap<String, String>) -> Self {
        self.risk_manager = self.risk_manager.with_sector_map(sector_map);
        self
    }

    pub fn with_indicator_source(mut self, source: Arc<dyn IndicatorSource>) -> Self {
        self.indicator_source = source;
        self
    }

    pub fn backtest(&self, bars: &[Bar]) -> Result<BacktestReport> {
        self.backtest_from(bars, None)
    }

    /// Bars before `trading_start` only warm up indicators; no trading or equity rows.
    pub fn backtest_from(
        &self,
        bars: &[Bar],
        trading_start: Option<DateTime<Utc>>,
    ) -> Result<BacktestReport> {
        let mut venue = SimulatedExecution::new();
        self.backtest_with_venue(bars, trading_start, &mut venue)
    }

    pub fn backtest_with_venue(
        &self,
        bars: &[Bar],
        trading_start: Option<DateTime<Utc>>,
        venue: &mut dyn ExecutionVenue,
    ) -> Result<BacktestReport> {
        let params = &self.params;
        let timestamps = unique_timestamps(bars);
        let trading_start_index = match trading_start {
            Some(start) => {
                let index = timestamps.partition_point(|timestamp| *timestamp < start);
                if !timestamps.is_empty() && index >= timestamps.len() {
                    return Err(anyhow!(
                        "Trading start {} is after the last bar ({})",
                        start,
                        timestamps[timestamps.len() - 1]
                    ));
                }
                index
            }
            None => 0,
        };

        let bars_by_symbol: BTreeMap<String, Vec<Bar>> = group_bars_by_symbol(bars)
            .into_iter()
            .map(|(symbol, symbol_bars)| {
                let enriched = self.indicator_source.add_indicators(&symbol_bars, params);
                (symbol, enriched)
            })
            .collect();
        for (symbol, symbol_bars) in &bars_by_symbol {
            if symbol_bars.windows(2).any(|pair| pair[0].timestamp >= pair[1].timestamp) {
                return Err(anyhow!("Indicator source reordered bars for {}", symbol));
            }
        }

        let strategy = create_strategy(params);
        let mut state = SimulationState::new(params);
        self.run_backtest_loop(
            strategy.as_ref(),
            &bars_by_symbol,
            &timestamps,
            trading_start_index,
            &mut state,
            venue,
        );
        self.force_liquidation(&mut state, venue);

        Ok(self.build_report(state))
    }

    fn run_backtest_loop(
        &self,
        strategy: &dyn Strategy,
        bars_by_symbol: &BTreeMap<String, Vec<Bar>>,
        timestamps: &[DateTime<Utc>],
        trading_start_index: usize,
        state: &mut SimulationState,
        venue: &mut dyn ExecutionVenue,
    ) {
        let mut cursors: BTreeMap<&str, usize> = bars_by_symbol
            .keys()
            .map(|symbol| (symbol.as_str(), 0))
            .collect();

        for (timestamp_index, &current_time) in timestamps.iter().enumerate() {
            let mut current: Vec<(&str, usize)> = Vec::new();
            for (symbol, symbol_bars) in bars_by_symbol {
                let Some(cursor) = cursors.get_mut(symbol.as_str()) else {
                    continue;
                };
                while *cursor < symbol_bars.len() && symbol_bars[*cursor].timestamp < current_time
                {
                    *cursor += 1;
                }
                if *cursor < symbol_bars.len() && symbol_bars[*cursor].timestamp == current_time {
                    current.push((symbol.as_str(), *cursor));
                }
            }

            if timestamp_index < trading_start_index {
                continue;
            }

            let mut tradable: Vec<(&str, usize)> = Vec::with_capacity(current.len());
            for (symbol, index) in current {
                let price = bars_by_symbol[symbol][index].close;
                if !price.is_finite() || price <= PRICE_EPSILON {
                    warn!(
                        "Skipping {} at {}: invalid close {}",
                        symbol, current_time, price
                    );
                    state.skipped_steps += 1;
                    continue;
                }
                state
                    .last_seen
                    .insert(symbol.to_string(), (price, current_time));
                state.portfolio.mark_to_market(symbol, price);
                tradable.push((symbol, index));
            }

            // Exits first so freed slots and cash are visible to entries on the same bar.
            for &(symbol, index) in &tradable {
                let price = bars_by_symbol[symbol][index].close;
                let trigger = state
                    .portfolio
                    .positions
                    .get(symbol)
                    .and_then(|position| exit_trigger(position, price));
                if let Some(reason) = trigger {
                    self.close_position(state, venue, symbol, price, current_time, reason);
                }
            }

            for &(symbol, index) in &tradable {
                let history = &bars_by_symbol[symbol][..=index];
                let Some(signal) = strategy.evaluate(symbol, history) else {
                    continue;
                };
                if !signal.action.is_actionable() {
                    continue;
                }

                if self.params.exit_on_reversal {
                    let reversed = state
                        .portfolio
                        .positions
                        .get(symbol)
                        .map(|position| position.side.opposing_action() == signal.action)
                        .unwrap_or(false);
                    if reversed {
                        self.close_position(
                            state,
                            venue,
                            symbol,
                            signal.price,
                            current_time,
                            ExitReason::SignalReversal,
                        );
                    }
                }

                if state.portfolio.has_position(symbol) {
                    continue;
                }
                if let EntrySignalOutcome::Skipped { reason, details } =
                    self.execute_entry_signal(state, venue, &signal)
                {
                    debug!(
                        "Entry for {} at {} skipped: {}{}",
                        symbol,
                        current_time,
                        reason,
                        details.map(|d| format!(" ({})", d)).unwrap_or_default()
                    );
                }
            }

            let breaches = self.risk_manager.check_risk_limits(&state.portfolio);
            if !breaches.is_empty() {
                debug!("Risk limits breached at {}: {:?}", current_time, breaches);
            }

            let point = state.portfolio.record_equity(current_time);
            state.equity_curve.push(point);
        }
    }

    fn execute_entry_signal(
        &self,
        state: &mut SimulationState,
        venue: &mut dyn ExecutionVenue,
        signal: &Signal,
    ) -> EntrySignalOutcome {
        let params = &self.params;
        let Some(side) = PositionSide::from_action(signal.action) else {
            return EntrySignalOutcome::Skipped {
                reason: "hold",
                details: None,
            };
        };
        if side == PositionSide::Short && !params.allow_short {
            return EntrySignalOutcome::Skipped {
                reason: "shorting_disabled",
                details: None,
            };
        }

        let equity = state.portfolio.total_equity();
        let allocation = match determine_position_size(PositionSizingParams {
            signal,
            equity,
            risk_state: &state.risk_state,
            trade_history: &state.trades,
            running_sharpe: state.portfolio.sizing_sharpe(params.performance_lookback),
            params,
        }) {
            PositionSizingOutcome::Sized(allocation) => allocation,
            PositionSizingOutcome::TooSmall => {
                return EntrySignalOutcome::Skipped {
                    reason: "size_too_small",
                    details: None,
                };
            }
            PositionSizingOutcome::InvalidInput { reason } => {
                state.skipped_steps += 1;
                return EntrySignalOutcome::Skipped {
                    reason: "invalid_sizing_input",
                    details: Some(reason.to_string()),
                };
            }
        };

        if allocation.trade_value > equity * params.max_position_equity_ratio {
            state.skipped_steps += 1;
            return EntrySignalOutcome::Skipped {
                reason: "implausible_size",
                details: Some(format!(
                    "value {:.2} vs equity {:.2}",
                    allocation.trade_value, equity
                )),
            };
        }

        if let Err(veto) = self.risk_manager.check_limits(
            &signal.symbol,
            allocation.quantity,
            signal.price,
            &state.portfolio,
        ) {
            state.vetoed_entries += 1;
            return EntrySignalOutcome::Skipped {
                reason: veto.reason(),
                details: Some(veto.to_string()),
            };
        }

        let (stop_loss, take_profit) = stop_take(signal.price, side, params);
        let request = OrderRequest {
            symbol: signal.symbol.clone(),
            side,
            quantity: allocation.quantity,
            price: signal.price,
            stop_loss,
            take_profit,
        };
        let fill = match venue.place_order(&request) {
            Ok(fill) => fill,
            Err(err) => {
                return EntrySignalOutcome::Skipped {
                    reason: "execution_rejected",
                    details: Some(err.to_string()),
                };
            }
        };
        let (stop_loss, take_profit) = if (fill.price - signal.price).abs() > PRICE_EPSILON {
            stop_take(fill.price, side, params)
        } else {
            (stop_loss, take_profit)
        };

        let position = Position {
            symbol: signal.symbol.clone(),
            side,
            quantity: fill.quantity,
            entry_price: fill.price,
            entry_time: signal.timestamp,
            current_price: fill.price,
            unrealized_pnl: 0.0,
            stop_loss,
            take_profit,
            leverage: allocation.leverage,
            winning_streak_at_entry: state.risk_state.winning_streak,
            losing_streak_at_entry: state.risk_state.losing_streak,
        };
        match state.portfolio.open_position(position) {
            Ok(()) => EntrySignalOutcome::Executed,
            Err(err) => {
                state.skipped_steps += 1;
                EntrySignalOutcome::Skipped {
                    reason: "portfolio_rejected",
                    details: Some(err.to_string()),
                }
            }
        }
    }

    fn close_position(
        &self,
        state: &mut SimulationState,
        venue: &mut dyn ExecutionVenue,
        symbol: &str,
        price: f64,
        exit_time: DateTime<Utc>,
        reason: ExitReason,
    ) {
        let Some((side, quantity)) = state
            .portfolio
            .positions
            .get(symbol)
            .map(|position| (position.side, position.quantity))
        else {
            return;
        };

        let fill = match venue.close_position(symbol, side, quantity, price) {
            Ok(fill) => fill,
            Err(err) => {
                warn!(
                    "Close of {} ({}) failed, keeping position open: {}",
                    symbol,
                    reason.as_str(),
                    err
                );
                return;
            }
        };

        if let Some(trade) = state
            .portfolio
            .close_position(symbol, fill.price, exit_time, reason)
        {
            apply_trade_outcome(&mut state.risk_state, trade.pnl, &self.params);
            state.trades.push(trade);
        }
    }

    /// Closes everything still open at each symbol's last known price.
    fn force_liquidation(&self, state: &mut SimulationState, venue: &mut dyn ExecutionVenue) {
        let open_symbols: Vec<String> = state.portfolio.positions.keys().cloned().collect();
        for symbol in open_symbols {
            let Some((price, seen_at)) = state.last_seen.get(&symbol).copied() else {
                continue;
            };
            self.close_position(state, venue, &symbol, price, seen_at, ExitReason::EndOfRun);
        }
    }

    fn build_report(&self, state: SimulationState) -> BacktestReport {
        let params = &self.params;
        let initial_balance = params.initial_balance;
        let SimulationState {
            portfolio,
            risk_state,
            trades,
            equity_curve,
            skipped_steps,
            vetoed_entries,
            ..
        } = state;

        let raw_final_equity = portfolio.total_equity();
        debug!(
            "Run finished with {} trades, equity {:.2}, running Sharpe {:.4}",
            trades.len(),
            raw_final_equity,
            portfolio.running_sharpe(params.periods_per_year)
        );
        let mut metrics = PerformanceCalculator::calculate_performance(
            &equity_curve,
            &trades,
            initial_balance,
            params.periods_per_year,
        );

        let numerical_blowup = !raw_final_equity.is_finite()
            || raw_final_equity.abs() > params.blowup_multiple * initial_balance;
        let (final_equity, penalty_factor) = if numerical_blowup {
            warn!(
                "Final equity {:.2} exceeds {}x initial balance; resetting to {:.2}",
                raw_final_equity, params.blowup_multiple, initial_balance
            );
            (initial_balance, params.blowup_penalty)
        } else if raw_final_equity < initial_balance * params.margin_call_ratio {
            (raw_final_equity, params.margin_call_penalty)
        } else if raw_final_equity < initial_balance * params.drawdown_warning_ratio {
            (raw_final_equity, params.drawdown_warning_penalty)
        } else {
            (raw_final_equity, 1.0)
        };

        if numerical_blowup {
            metrics.total_return = 0.0;
            metrics.total_return_pct = 0.0;
            metrics.final_equity = initial_balance;
        }

        BacktestReport {
            trades,
            equity_curve,
            metrics,
            initial_balance,
            final_equity,
            risk_state,
            penalty_factor,
            numerical_blowup,
            skipped_steps,
            vetoed_entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ExecutionError, Fill};
    use chrono::{Duration, TimeZone};

    fn create_date(days_offset: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(days_offset)
    }

    fn generate_bars(symbol: &str, prices: &[f64]) -> Vec<Bar> {
        prices
            .iter()
            .enumerate()
            .map(|(i, &price)| {
                Bar::new(
                    symbol,
                    create_date(i as i64),
                    price,
                    price,
                    price,
                    price,
                    10_000.0,
                )
            })
            .collect()
    }

    fn engine() -> Engine {
        Engine::new(ParameterSet::default()).unwrap()
    }

    struct RejectingVenue;

    impl ExecutionVenue for RejectingVenue {
        fn place_order(&mut self, request: &OrderRequest) -> Result<Fill, ExecutionError> {
            Err(ExecutionError::Rejected {
                symbol: request.symbol.clone(),
                reason: "market closed".to_string(),
            })
        }

        fn close_position(
            &mut self,
            symbol: &str,
            _side: PositionSide,
            _quantity: f64,
            _price: f64,
        ) -> Result<Fill, ExecutionError> {
            Err(ExecutionError::Rejected {
                symbol: symbol.to_string(),
                reason: "market closed".to_string(),
            })
        }
    }

    #[test]
    fn test_backtest_constant_price() {
        let bars = generate_bars("AAA", &[100.0; 80]);
        let report = engine().backtest(&bars).unwrap();
        assert!(report.trades.is_empty());
        assert_eq!(report.equity_curve.len(), 80);
        assert!(report
            .equity_curve
            .iter()
            .all(|point| (point.total_equity - 100_000.0).abs() < 1e-9));
        assert_eq!(report.metrics.total_trades, 0);
        assert_eq!(report.metrics.sharpe_ratio, 0.0);
        assert_eq!(report.metrics.max_drawdown, 0.0);
        assert_eq!(report.penalty_factor, 1.0);
    }

    #[test]
    fn test_empty_bars_produce_empty_report() {
        let report = engine().backtest(&[]).unwrap();
        assert!(report.trades.is_empty());
        assert!(report.equity_curve.is_empty());
        assert_eq!(report.metrics, PerformanceMetrics::default());
        assert_eq!(report.final_equity, 100_000.0);
    }

    #[test]
    fn test_stop_loss_closes_long_at_bar_close() {
        let mut prices = vec![110.0; 25];
        prices.push(100.0);
        prices.push(94.0);
        let bars = generate_bars("AAA", &prices);
        let report = engine().backtest(&bars).unwrap();

        let first = &report.trades[0];
        assert_eq!(first.side, PositionSide::Long);
        assert!((first.entry_price - 100.0).abs() < 1e-9);
        assert!((first.quantity - 100_000.0 * 0.02 / 100.0).abs() < 1e-9);
        assert!((first.exit_price - 94.0).abs() < 1e-9);
        assert_eq!(first.exit_reason, ExitReason::StopLoss);
        assert!((first.pnl - (94.0 - 100.0) * 20.0).abs() < 1e-9);
        assert_eq!(first.exit_time, create_date(26));
    }

    #[test]
    fn test_take_profit_and_end_of_run_close() {
        let mut prices = vec![110.0; 25];
        prices.push(100.0);
        prices.push(104.0);
        prices.push(111.0);
        let mut params = ParameterSet::default();
        params.exit_on_reversal = false;
        params.allow_short = false;
        let report = Engine::new(params).unwrap().backtest(&generate_bars("AAA", &prices)).unwrap();

        assert_eq!(report.trades[0].exit_reason, ExitReason::TakeProfit);
        assert!((report.trades[0].exit_price - 111.0).abs() < 1e-9);
        assert_eq!(report.risk_state.winning_streak, 1);
    }

    #[test]
    fn test_take_profit_fires_on_close_exactly_at_level() {
        let mut prices = vec![110.0; 25];
        prices.push(100.0);
        prices.push(105.0);
        prices.push(110.0);
        prices.push(110.0);
        let mut params = ParameterSet::default();
        params.exit_on_reversal = false;
        params.allow_short = false;
        let report = Engine::new(params).unwrap().backtest(&generate_bars("AAA", &prices)).unwrap();

        let first = &report.trades[0];
        assert_eq!(first.exit_reason, ExitReason::TakeProfit);
        assert!((first.exit_price - 110.0).abs() < 1e-9);
        assert_eq!(first.exit_time, create_date(27));
    }

    #[test]
    fn test_open_position_is_force_closed_at_last_price() {
        let mut prices = vec![110.0; 25];
        prices.push(100.0);
        prices.push(101.0);
        let mut params = ParameterSet::default();
        params.exit_on_reversal = false;
        params.allow_short = false;
        let report = Engine::new(params).unwrap().backtest(&generate_bars("AAA", &prices)).unwrap();

        let last = report.trades.last().unwrap();
        assert_eq!(last.exit_reason, ExitReason::EndOfRun);
        assert!((last.exit_price - 101.0).abs() < 1e-9);
        assert_eq!(last.exit_time, create_date(26));
        let final_point = report.equity_curve.last().unwrap();
        assert!((final_point.total_equity - report.final_equity).abs() < 1e-6);
    }

    #[test]
    fn test_signal_reversal_closes_and_flips() {
        let mut prices = vec![100.0; 25];
        prices.push(96.0);
        prices.push(104.0);
        let report = engine().backtest(&generate_bars("AAA", &prices)).unwrap();

        let reversal = report
            .trades
            .iter()
            .find(|trade| trade.exit_reason == ExitReason::SignalReversal)
            .expect("reversal trade missing");
        assert_eq!(reversal.side, PositionSide::Long);
        assert!((reversal.exit_price - 104.0).abs() < 1e-9);
        let flipped = report.trades.last().unwrap();
        assert_eq!(flipped.side, PositionSide::Short);
        assert_eq!(flipped.exit_reason, ExitReason::EndOfRun);
    }

    #[test]
    fn test_equity_identity_holds_every_bar() {
        let prices: Vec<f64> = (0..120)
            .map(|i| 100.0 + 6.0 * ((i as f64) * 0.45).sin())
            .collect();
        let mut bars = generate_bars("AAA", &prices);
        bars.extend(generate_bars(
            "BBB",
            &prices.iter().map(|p| 200.0 - p).collect::<Vec<_>>(),
        ));

        let params = ParameterSet::default();
        let engine = Engine::new(params).unwrap();
        let report = engine.backtest(&bars).unwrap();
        assert!(!report.trades.is_empty());
        for point in &report.equity_curve {
            assert!(point.total_equity.is_finite());
            assert!(point.open_positions <= 2);
        }
        let realized: f64 = report.trades.iter().map(|trade| trade.pnl).sum();
        let last = report.equity_curve.last().unwrap();
        assert!((100_000.0 + realized - report.final_equity).abs() < 1e-6);
        assert!((last.total_equity - report.final_equity).abs() < 1e-6);
    }

    #[test]
    fn test_backtest_is_deterministic() {
        let prices: Vec<f64> = (0..150)
            .map(|i| 50.0 + 3.0 * ((i as f64) * 0.3).sin() + (i % 7) as f64 * 0.1)
            .collect();
        let bars = generate_bars("AAA", &prices);
        let engine = engine();
        let first = engine.backtest(&bars).unwrap();
        let second = engine.backtest(&bars).unwrap();
        assert_eq!(first.trades, second.trades);
        assert_eq!(first.equity_curve, second.equity_curve);
    }

    #[test]
    fn test_missing_bars_are_skipped_not_filled() {
        let mut bars = generate_bars("AAA", &[100.0; 30]);
        let mut sparse = generate_bars("BBB", &[50.0; 30]);
        sparse.retain(|bar| bar.timestamp.timestamp() % (3 * 86_400) == 0);
        let sparse_len = sparse.len();
        bars.extend(sparse);

        let report = engine().backtest(&bars).unwrap();
        assert_eq!(report.equity_curve.len(), 30);
        assert!(sparse_len < 30);
        assert!(report
            .equity_curve
            .windows(2)
            .all(|pair| pair[0].timestamp < pair[1].timestamp));
    }

    #[test]
    fn test_trading_start_skips_warmup_rows() {
        let mut prices = vec![110.0; 25];
        prices.push(100.0);
        prices.push(94.0);
        let bars = generate_bars("AAA", &prices);
        let report = engine().backtest_from(&bars, Some(create_date(25))).unwrap();
        assert_eq!(report.equity_curve.len(), 2);
        assert_eq!(report.trades[0].exit_reason, ExitReason::StopLoss);

        assert!(engine().backtest_from(&bars, Some(create_date(400))).is_err());
    }

    #[test]
    fn test_rejecting_venue_never_opens_positions() {
        let mut prices = vec![110.0; 25];
        prices.push(100.0);
        let bars = generate_bars("AAA", &prices);
        let mut venue = RejectingVenue;
        let report = engine()
            .backtest_with_venue(&bars, None, &mut venue)
            .unwrap();
        assert!(report.trades.is_empty());
    }

    #[test]
    fn test_invalid_prices_are_skipped() {
        let mut prices = vec![100.0; 30];
        prices[10] = f64::NAN;
        prices[11] = -5.0;
        let report = engine().backtest(&generate_bars("AAA", &prices)).unwrap();
        assert_eq!(report.skipped_steps, 2);
        assert!(report
            .equity_curve
            .iter()
            .all(|point| point.total_equity.is_finite()));
    }

    #[test]
    fn test_trading_resumes_after_invalid_bar_leaves_window() {
        let prices: Vec<f64> = (0..200)
            .map(|i| 100.0 + 6.0 * ((i as f64) * 0.45).sin())
            .collect();
        let mut damaged = prices.clone();
        damaged[30] = f64::NAN;

        let clean = engine().backtest(&generate_bars("AAA", &prices)).unwrap();
        let report = engine().backtest(&generate_bars("AAA", &damaged)).unwrap();
        assert_eq!(report.skipped_steps, 1);

        let late_entries = |report: &BacktestReport| {
            report
                .trades
                .iter()
                .filter(|trade| trade.entry_time > create_date(60))
                .count()
        };
        assert!(late_entries(&clean) > 0);
        assert!(late_entries(&report) > 0);
        assert!(!report
            .trades
            .iter()
            .any(|trade| trade.entry_time > create_date(30) && trade.entry_time < create_date(50)));
    }

    #[test]
    fn test_oversized_entry_is_a_policy_veto() {
        let mut params = ParameterSet::default();
        params.position_size_fraction = 0.8;
        let mut prices = vec![110.0; 25];
        prices.push(100.0);
        prices.push(101.0);
        let report = Engine::new(params).unwrap().backtest(&generate_bars("AAA", &prices)).unwrap();

        assert!(report.trades.is_empty());
        assert!(report.vetoed_entries >= 1);
        assert_eq!(report.skipped_steps, 0);
    }

    #[test]
    fn test_performance_sizing_scales_entries_by_running_sharpe() {
        let prices: Vec<f64> = (0..160)
            .map(|i| 100.0 + 6.0 * ((i as f64) * 0.45).sin())
            .collect();
        let mut params = ParameterSet::default();
        params.performance_sizing_enabled = true;
        params.performance_lookback = 20;
        params.sharpe_threshold = -1e9;
        params.risk_multiplier = 1.5;
        let report = Engine::new(params.clone())
            .unwrap()
            .backtest(&generate_bars("AAA", &prices))
            .unwrap();

        let applied_multiplier = |trade: &Trade| {
            let equity = report
                .equity_curve
                .iter()
                .find(|point| point.timestamp == trade.entry_time)
                .map(|point| point.total_equity)
                .unwrap();
            trade.quantity * trade.entry_price
                / (trade.leverage * params.position_size_fraction * equity)
        };

        // Too few recorded returns for the first entry, so the base multiplier applies.
        assert!((applied_multiplier(&report.trades[0]) - 1.5).abs() < 1e-6);
        let late: Vec<&Trade> = report
            .trades
            .iter()
            .filter(|trade| trade.entry_time > create_date(40))
            .collect();
        assert!(!late.is_empty());
        for trade in late {
            assert!((applied_multiplier(trade) - 1.65).abs() < 1e-6);
        }
    }

    #[test]
    fn test_blowup_resets_to_initial_balance() {
        let mut params = ParameterSet::default();
        params.blowup_multiple = 1.0001;
        params.position_size_fraction = 0.5;
        params.max_position_equity_ratio = 1.0;
        params.max_portfolio_risk_pct = 1.0;
        params.min_cash_reserve_pct = 0.01;
        params.take_profit_pct = 1.0;
        params.exit_on_reversal = false;
        let mut prices = vec![110.0; 25];
        prices.push(100.0);
        prices.push(180.0);
        let report = Engine::new(params.clone())
            .unwrap()
            .backtest(&generate_bars("AAA", &prices))
            .unwrap();

        assert!(report.numerical_blowup);
        assert_eq!(report.final_equity, params.initial_balance);
        assert_eq!(report.metrics.total_return, 0.0);
        assert!((report.penalty_factor - params.blowup_penalty).abs() < 1e-12);
    }

    #[test]
    fn test_max_positions_caps_concurrent_entries() {
        let mut params = ParameterSet::default();
        params.max_positions = 1;
        params.exit_on_reversal = false;
        let mut bars = Vec::new();
        for symbol in ["AAA", "BBB", "CCC"] {
            let mut prices = vec![110.0; 25];
            prices.push(100.0);
            prices.push(101.0);
            bars.extend(generate_bars(symbol, &prices));
        }
        let report = Engine::new(params).unwrap().backtest(&bars).unwrap();
        assert!(report.equity_curve.iter().all(|point| point.open_positions <= 1));
        assert!(report.vetoed_entries >= 2);
    }

    #[test]
    fn test_invalid_parameters_are_rejected_up_front() {
        let mut parameters = HashMap::new();
        parameters.insert("threshold".to_string(), -1.0);
        assert!(Engine::from_parameters(&parameters).is_err());
        parameters.insert("threshold".to_string(), 0.02);
        parameters.insert("unknown".to_string(), 1.0);
        assert!(matches!(
            Engine::from_parameters(&parameters),
            Err(ConfigError::UnknownParameter(_))
        ));
    }

    #[test]
    fn test_precomputed_indicators_match_rolling() {
        let prices: Vec<f64> = (0..90)
            .map(|i| 100.0 + 5.0 * ((i as f64) * 0.45).sin())
            .collect();
        let bars = generate_bars("AAA", &prices);
        let params = ParameterSet::default();
        let enriched = crate::indicators::add_indicators(&bars, &params);

        let rolling = engine().backtest(&bars).unwrap();
        let precomputed = engine()
            .with_indicator_source(Arc::new(crate::indicators::PrecomputedIndicators))
            .backtest(&enriched)
            .unwrap();
        assert!(!rolling.trades.is_empty());
        assert_eq!(rolling.trades, precomputed.trades);

        let missing = engine()
            .with_indicator_source(Arc::new(crate::indicators::PrecomputedIndicators))
            .backtest(&bars)
            .unwrap();
        assert!(missing.trades.is_empty());
    }
}
