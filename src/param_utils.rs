use crate::config::ConfigError;
use std::collections::BTreeMap;

pub type ParameterGrid = BTreeMap<String, Vec<f64>>;

pub fn coerce_binary_param(value: f64) -> bool {
    value.is_finite() && value >= 0.5
}

pub fn binary_param_value(flag: bool) -> f64 {
    if flag {
        1.0
    } else {
        0.0
    }
}

/// Rounds a raw value into a count, rejecting anything non-finite or below `min`.
pub fn require_count(name: &str, value: f64, min: usize) -> Result<usize, ConfigError> {
    if !value.is_finite() || value.round() < min as f64 {
        return Err(ConfigError::InvalidValue {
            name: name.to_string(),
            value,
            expected: format!("an integer >= {}", min),
        });
    }
    Ok(value.round() as usize)
}

pub fn require_finite(name: &str, value: f64) -> Result<f64, ConfigError> {
    if !value.is_finite() {
        return Err(ConfigError::InvalidValue {
            name: name.to_string(),
            value,
            expected: "a finite number".to_string(),
        });
    }
    Ok(value)
}

/// Stable key for a set of parameter values.
pub fn parameter_signature(parameters: &BTreeMap<String, f64>) -> String {
    parameters
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(";")
}

/// Compact `key: value` rendering for log lines.
pub fn format_parameters(parameters: &BTreeMap<String, f64>) -> String {
    parameters
        .iter()
        .map(|(key, value)| {
            let formatted_value = format!("{:.4}", value);
            let trimmed_value = formatted_value.trim_end_matches('0').trim_end_matches('.');
            let cleaned_value = if trimmed_value.is_empty() || trimmed_value == "-0" {
                "0"
            } else {
                trimmed_value
            };
            format!("{}: {}", key, cleaned_value)
        })
        .collect::<Vec<String>>()
        .join(", ")
}

/// Cartesian product of every per-parameter value list, in key order.
pub fn expand_grid(grid: &ParameterGrid) -> Vec<BTreeMap<String, f64>> {
    if grid.is_empty() || grid.values().any(|values| values.is_empty()) {
        return Vec::new();
    }

    let mut combinations = vec![BTreeMap::new()];
    for (key, values) in grid {
        let mut next = Vec::with_capacity(combinations.len() * values.len());
        for combination in &combinations {
            for value in values {
                let mut extended = combination.clone();
                extended.insert(key.clone(), *value);
                next.push(extended);
            }
        }
        combinations = next;
    }
    combinations
}

pub fn grid_size(grid: &ParameterGrid) -> usize {
    if grid.is_empty() {
        return 0;
    }
    grid.values().map(|values| values.len()).product()
}
