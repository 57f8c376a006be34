use crate::config::ParameterSet;
use crate::models::Bar;

/// Simple moving average; `None` until `period` prices are available and for every
/// window holding a non-finite price.
pub fn calculate_sma(prices: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut sma_values = vec![None; prices.len()];
    if period == 0 || prices.len() < period {
        return sma_values;
    }

    let mut window_sum = 0.0;
    let mut invalid_in_window = 0usize;
    for i in 0..prices.len() {
        if prices[i].is_finite() {
            window_sum += prices[i];
        } else {
            invalid_in_window += 1;
        }
        if i >= period {
            let leaving = prices[i - period];
            if leaving.is_finite() {
                window_sum -= leaving;
            } else {
                invalid_in_window -= 1;
            }
        }
        if i + 1 >= period && invalid_in_window == 0 {
            sma_values[i] = Some(window_sum / period as f64);
        }
    }

    sma_values
}

/// Rolling sample standard deviation over `period` prices.
pub fn calculate_rolling_std(prices: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut std_values = vec![None; prices.len()];
    if period < 2 || prices.len() < period {
        return std_values;
    }

    for i in (period - 1)..prices.len() {
        let window = &prices[i + 1 - period..=i];
        if window.iter().any(|price| !price.is_finite()) {
            continue;
        }
        let mean = window.iter().sum::<f64>() / period as f64;
        let variance =
            window.iter().map(|&val| (val - mean).powi(2)).sum::<f64>() / (period - 1) as f64;
        std_values[i] = Some(variance.sqrt());
    }

    std_values
}

/// Distance of each price from its mean in standard deviations. Flat windows yield 0.
pub fn calculate_z_scores(
    prices: &[f64],
    means: &[Option<f64>],
    std_devs: &[Option<f64>],
) -> Vec<Option<f64>> {
    prices
        .iter()
        .zip(means.iter().zip(std_devs.iter()))
        .map(|(&price, (mean, std_dev))| match (mean, std_dev) {
            _ if !price.is_finite() => None,
            (Some(mean), Some(std_dev)) if *std_dev > 0.0 => Some((price - mean) / std_dev),
            (Some(_), Some(_)) => Some(0.0),
            _ => None,
        })
        .collect()
}

fn rsi_from_avgs(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        if avg_gain == 0.0 {
            50.0
        } else {
            100.0
        }
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

/// Wilder-smoothed RSI; `None` for the first `period` prices. Moves into or out of a
/// non-finite price count as flat.
pub fn calculate_rsi(prices: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut rsi_values = vec![None; prices.len()];
    if period == 0 || prices.len() < period + 1 {
        return rsi_values;
    }

    let mut sum_gain = 0.0f64;
    let mut sum_loss = 0.0f64;
    for i in 1..=period {
        let delta = prices[i] - prices[i - 1];
        if delta > 0.0 {
            sum_gain += delta;
        } else if delta < 0.0 {
            sum_loss += -delta;
        }
    }

    let mut avg_gain = sum_gain / period as f64;
    let mut avg_loss = sum_loss / period as f64;
    rsi_values[period] = Some(rsi_from_avgs(avg_gain, avg_loss));

    for i in (period + 1)..prices.len() {
        let delta = prices[i] - prices[i - 1];
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { -delta } else { 0.0 };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        rsi_values[i] = Some(rsi_from_avgs(avg_gain, avg_loss));
    }

    rsi_values
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerBand {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

pub fn calculate_bollinger_bands(
    prices: &[f64],
    period: usize,
    std_multiplier: f64,
) -> Vec<Option<BollingerBand>> {
    let mut bands = vec![None; prices.len()];
    if period == 0 || prices.len() < period {
        return bands;
    }
    let middle = calculate_sma(prices, period);

    for i in (period - 1)..prices.len() {
        let Some(mean) = middle[i] else {
            continue;
        };
        let window = &prices[i + 1 - period..=i];
        let variance = window.iter().map(|&val| (val - mean).powi(2)).sum::<f64>() / period as f64;
        let standard_deviation = variance.sqrt();

        bands[i] = Some(BollingerBand {
            upper: mean + std_multiplier * standard_deviation,
            middle: mean,
            lower: mean - std_multiplier * standard_deviation,
        });
    }

    bands
}

/// Fills the indicator columns of one symbol's ordered bars using the configured windows.
pub fn add_indicators(bars: &[Bar], params: &ParameterSet) -> Vec<Bar> {
    let closes: Vec<f64> = bars.iter().map(|bar| bar.close).collect();
    let moving_averages = calculate_sma(&closes, params.lookback_window);
    let std_devs = calculate_rolling_std(&closes, params.lookback_window);
    let z_scores = calculate_z_scores(&closes, &moving_averages, &std_devs);
    let rsi_values = calculate_rsi(&closes, params.rsi_period);
    let bands = calculate_bollinger_bands(&closes, params.bollinger_period, params.bollinger_std);

    bars.iter()
        .enumerate()
        .map(|(i, bar)| {
            let mut enriched = bar.clone();
            enriched.moving_average = moving_averages[i];
            enriched.std_dev = std_devs[i];
            enriched.z_score = z_scores[i];
            enriched.rsi = rsi_values[i];
            enriched.bollinger_upper = bands[i].map(|band| band.upper);
            enriched.bollinger_middle = bands[i].map(|band| band.middle);
            enriched.bollinger_lower = bands[i].map(|band| band.lower);
            enriched
        })
        .collect()
}

/// Source of the indicator columns the signal generator reads.
pub trait IndicatorSource: Send + Sync {
    fn add_indicators(&self, bars: &[Bar], params: &ParameterSet) -> Vec<Bar>;
}

/// Recomputes every column from closes with the run's windows.
#[derive(Debug, Clone, Copy, Default)]
pub struct RollingIndicators;

impl IndicatorSource for RollingIndicators {
    fn add_indicators(&self, bars: &[Bar], params: &ParameterSet) -> Vec<Bar> {
        add_indicators(bars, params)
    }
}

/// Trusts the columns already present on the bars.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrecomputedIndicators;

impl IndicatorSource for PrecomputedIndicators {
    fn add_indicators(&self, bars: &[Bar], _params: &ParameterSet) -> Vec<Bar> {
        bars.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn sma_is_none_until_window_fills() {
        let values = calculate_sma(&[1.0, 2.0, 3.0, 4.0], 3);
        assert_eq!(values[0], None);
        assert_eq!(values[1], None);
        assert!((values[2].unwrap() - 2.0).abs() < 1e-12);
        assert!((values[3].unwrap() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn sma_recovers_once_invalid_price_leaves_window() {
        let mut prices: Vec<f64> = (0..12).map(|i| 10.0 + i as f64).collect();
        prices[4] = f64::NAN;
        let values = calculate_sma(&prices, 3);
        assert!((values[3].unwrap() - 12.0).abs() < 1e-12);
        assert_eq!(values[4], None);
        assert_eq!(values[5], None);
        assert_eq!(values[6], None);
        assert!((values[7].unwrap() - 16.0).abs() < 1e-12);
        assert!((values[11].unwrap() - 20.0).abs() < 1e-12);
    }

    #[test]
    fn derived_indicators_skip_only_windows_with_invalid_prices() {
        let mut prices: Vec<f64> = (0..40).map(|i| 100.0 + (i as f64 * 0.7).sin()).collect();
        prices[10] = f64::NAN;
        let means = calculate_sma(&prices, 5);
        let stds = calculate_rolling_std(&prices, 5);
        let z = calculate_z_scores(&prices, &means, &stds);
        let bands = calculate_bollinger_bands(&prices, 5, 2.0);
        let rsi = calculate_rsi(&prices, 5);

        for i in 10..15 {
            assert_eq!(stds[i], None);
            assert_eq!(z[i], None);
            assert_eq!(bands[i], None);
        }
        assert!(z[15].unwrap().is_finite());
        assert!(bands[15].unwrap().lower.is_finite());
        assert!(rsi[39].unwrap().is_finite());
    }

    #[test]
    fn rolling_std_matches_sample_definition() {
        let values = calculate_rolling_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0], 8);
        // Sample variance of the classic example is 32 / 7.
        assert!((values[7].unwrap() - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn flat_series_has_zero_z_score() {
        let prices = vec![10.0; 6];
        let means = calculate_sma(&prices, 3);
        let stds = calculate_rolling_std(&prices, 3);
        let z = calculate_z_scores(&prices, &means, &stds);
        assert_eq!(z[1], None);
        assert_eq!(z[5], Some(0.0));
    }

    #[test]
    fn rsi_saturates_on_monotonic_rise() {
        let prices: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let rsi = calculate_rsi(&prices, 14);
        assert_eq!(rsi[13], None);
        assert!((rsi[19].unwrap() - 100.0).abs() < 1e-12);
    }

    #[test]
    fn bollinger_bands_bracket_the_mean() {
        let prices = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let bands = calculate_bollinger_bands(&prices, 5, 2.0);
        let band = bands[4].unwrap();
        assert!((band.middle - 3.0).abs() < 1e-12);
        assert!((band.upper - (3.0 + 2.0 * 2.0f64.sqrt())).abs() < 1e-12);
        assert!((band.lower - (3.0 - 2.0 * 2.0f64.sqrt())).abs() < 1e-12);
    }

    #[test]
    fn add_indicators_fills_columns_in_place_order() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let bars: Vec<Bar> = (0..25)
            .map(|i| {
                let price = 100.0 + (i % 5) as f64;
                Bar::new("AAA", base + Duration::days(i), price, price, price, price, 1_000.0)
            })
            .collect();
        let params = ParameterSet::default();
        let enriched = add_indicators(&bars, &params);
        assert_eq!(enriched.len(), bars.len());
        assert!(enriched[18].moving_average.is_none());
        assert!(enriched[19].moving_average.is_some());
        assert!(enriched[19].bollinger_lower.is_some());
        assert!(enriched[14].rsi.is_some());
        assert_eq!(enriched[24].timestamp, bars[24].timestamp);
    }
}
