use crate::candle_utils::{normalize_symbol, unique_symbols, unique_timestamps};
use crate::models::Bar;
use anyhow::{anyhow, Context, Result};
use chrono::prelude::*;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

const MARKET_DATA_SNAPSHOT_VERSION: u32 = 1;

/// Source of historical bars for a symbol.
pub trait MarketDataProvider {
    /// Bars for `symbol` with `start <= timestamp < end`, oldest first.
    fn get_history(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>>;
}

#[derive(Serialize, Deserialize)]
struct MarketDataSnapshot {
    version: u32,
    generated_at: DateTime<Utc>,
    symbols: Vec<String>,
    bars: Vec<Bar>,
}

#[derive(Debug, Deserialize)]
struct BarRecord {
    symbol: String,
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

/// Bars resident in memory for a whole run or search. Cheap to clone.
#[derive(Clone, Debug)]
pub struct MarketData {
    bars: Arc<Vec<Bar>>,
    symbols: Arc<Vec<String>>,
    timestamps: Arc<Vec<DateTime<Utc>>>,
}

impl MarketData {
    pub fn from_bars(mut bars: Vec<Bar>) -> Self {
        bars.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        let symbols = unique_symbols(&bars);
        let timestamps = unique_timestamps(&bars);
        Self {
            bars: Arc::new(bars),
            symbols: Arc::new(symbols),
            timestamps: Arc::new(timestamps),
        }
    }

    pub fn has_data(&self) -> bool {
        !self.bars.is_empty()
    }

    pub fn bars(&self) -> &[Bar] {
        self.bars.as_slice()
    }

    pub fn bars_arc(&self) -> Arc<Vec<Bar>> {
        Arc::clone(&self.bars)
    }

    pub fn symbols(&self) -> &[String] {
        self.symbols.as_slice()
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        self.timestamps.as_slice()
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.timestamps.first().copied()
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.timestamps.last().copied()
    }

    /// Identifies the bar window, used to scope cached results.
    pub fn fingerprint(&self) -> String {
        match (self.start(), self.end()) {
            (Some(start), Some(end)) => format!(
                "{}..{}:{}x{}",
                start.timestamp(),
                end.timestamp(),
                self.symbols.len(),
                self.bars.len()
            ),
            _ => "empty".to_string(),
        }
    }

    /// Bars with `start <= timestamp < end`.
    pub fn slice(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let bars = self
            .bars
            .iter()
            .filter(|bar| bar.timestamp >= start && bar.timestamp < end)
            .cloned()
            .collect();
        Self::from_bars(bars)
    }

    pub fn restrict_to_symbols(&self, symbols: &[String]) -> Result<Self> {
        let bars: Vec<Bar> = self
            .bars
            .iter()
            .filter(|bar| symbols.contains(&bar.symbol))
            .cloned()
            .collect();
        if bars.is_empty() {
            return Err(anyhow!(
                "No bars remain after restricting to symbols {:?}",
                symbols
            ));
        }
        Ok(Self::from_bars(bars))
    }

    /// Reads `symbol,timestamp,open,high,low,close,volume` rows. Timestamps are RFC 3339
    /// or plain `YYYY-MM-DD` dates (midnight UTC).
    pub fn load_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open market data CSV at {}", path.display()))?;
        let mut reader = csv::Reader::from_reader(BufReader::new(file));

        let mut bars = Vec::new();
        for (index, record) in reader.deserialize::<BarRecord>().enumerate() {
            let line = index + 2;
            let record =
                record.with_context(|| format!("Invalid CSV row at line {}", line))?;
            let symbol = normalize_symbol(&record.symbol)
                .ok_or_else(|| anyhow!("Empty symbol at line {}", line))?;
            let timestamp = parse_timestamp(&record.timestamp)
                .with_context(|| format!("Invalid timestamp at line {}", line))?;
            bars.push(Bar::new(
                &symbol,
                timestamp,
                record.open,
                record.high,
                record.low,
                record.close,
                record.volume,
            ));
        }

        if bars.is_empty() {
            return Err(anyhow!("Market data CSV {} has no rows", path.display()));
        }
        let data = Self::from_bars(bars);
        info!(
            "Loaded {} bars for {} symbols from {}",
            data.bars.len(),
            data.symbols.len(),
            path.display()
        );
        Ok(data)
    }

    pub fn load_snapshot<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| {
            format!("Failed to open market data snapshot at {}", path.display())
        })?;
        let reader = BufReader::new(file);
        let snapshot: MarketDataSnapshot =
            bincode::deserialize_from(reader).context("Snapshot decode failed")?;

        if snapshot.version != MARKET_DATA_SNAPSHOT_VERSION {
            return Err(anyhow!(
                "Market data snapshot version mismatch (found {}, expected {})",
                snapshot.version,
                MARKET_DATA_SNAPSHOT_VERSION
            ));
        }
        if snapshot.bars.is_empty() {
            return Err(anyhow!("Market data snapshot has no usable bars"));
        }

        let data = Self::from_bars(snapshot.bars);
        if data.symbols.as_slice() != snapshot.symbols.as_slice() {
            return Err(anyhow!(
                "Market data snapshot symbol list does not match its bars"
            ));
        }
        Ok(data)
    }

    pub fn save_snapshot<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create snapshot directory {}", parent.display())
                })?;
            }
        }

        let file = File::create(path).with_context(|| {
            format!(
                "Unable to create market data snapshot at {}",
                path.display()
            )
        })?;
        let mut writer = BufWriter::new(file);
        let snapshot = MarketDataSnapshot {
            version: MARKET_DATA_SNAPSHOT_VERSION,
            generated_at: Utc::now(),
            symbols: self.symbols.as_ref().clone(),
            bars: self.bars.as_ref().clone(),
        };
        bincode::serialize_into(&mut writer, &snapshot)
            .context("Failed to serialize market data snapshot")?;
        writer
            .flush()
            .context("Failed to flush market data snapshot to disk")?;
        Ok(())
    }

    /// Picks the loader from the extension: `.csv` or a bincode snapshot otherwise.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let is_csv = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("csv"))
            .unwrap_or(false);
        if is_csv {
            Self::load_csv(path)
        } else {
            Self::load_snapshot(path)
        }
    }
}

impl MarketDataProvider for MarketData {
    fn get_history(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>> {
        if start > end {
            return Err(anyhow!(
                "Invalid history range for {}: {} is after {}",
                symbol,
                start,
                end
            ));
        }
        Ok(self
            .bars
            .iter()
            .filter(|bar| bar.symbol == symbol && bar.timestamp >= start && bar.timestamp < end)
            .cloned()
            .collect())
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&parsed));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("Unrecognized timestamp '{}'", raw))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow!("Invalid date '{}'", raw))?;
    Ok(Utc.from_utc_datetime(&midnight))
}
