use crate::models::Bar;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// Groups bars by symbol, each group sorted by timestamp. Duplicate timestamps keep the last bar.
pub fn group_bars_by_symbol(bars: &[Bar]) -> BTreeMap<String, Vec<Bar>> {
    let mut grouped: BTreeMap<String, Vec<Bar>> = BTreeMap::new();
    for bar in bars {
        grouped.entry(bar.symbol.clone()).or_default().push(bar.clone());
    }

    for values in grouped.values_mut() {
        values.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        let mut deduped: Vec<Bar> = Vec::with_capacity(values.len());
        for bar in values.drain(..) {
            match deduped.last_mut() {
                Some(last) if last.timestamp == bar.timestamp => *last = bar,
                _ => deduped.push(bar),
            }
        }
        *values = deduped;
    }

    grouped.retain(|_, values| !values.is_empty());
    grouped
}

/// Strictly increasing union of every symbol's timestamps.
pub fn unique_timestamps(bars: &[Bar]) -> Vec<DateTime<Utc>> {
    bars.iter()
        .map(|bar| bar.timestamp)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn unique_symbols(bars: &[Bar]) -> Vec<String> {
    bars.iter()
        .map(|bar| bar.symbol.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Normalizes a symbol string by trimming whitespace and uppercasing.
pub fn normalize_symbol(value: &str) -> Option<String> {
    let normalized = value.trim().to_uppercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}
