use crate::config::ParameterSet;
use crate::data_context::MarketData;
use crate::param_utils::ParameterGrid;
use anyhow::{anyhow, Context, Result};
use log::info;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

/// Where the data, parameters and sector map of a command come from.
#[derive(Debug, Clone, Default)]
pub struct RunInputs {
    pub data_file: PathBuf,
    pub symbols: Vec<String>,
    pub params_file: Option<PathBuf>,
    pub overrides: Vec<String>,
    pub sectors_file: Option<PathBuf>,
}

impl RunInputs {
    pub fn market_data(&self) -> Result<MarketData> {
        load_market_data(&self.data_file, &self.symbols)
    }

    pub fn parameter_set(&self) -> Result<ParameterSet> {
        let mut overrides = match &self.params_file {
            Some(path) => load_parameter_file(path)?,
            None => BTreeMap::new(),
        };
        for assignment in &self.overrides {
            let (name, value) = parse_assignment(assignment)?;
            overrides.insert(name, value);
        }
        Ok(ParameterSet::default().with_overrides(&overrides)?)
    }

    pub fn sector_map(&self) -> Result<Option<HashMap<String, String>>> {
        self.sectors_file
            .as_deref()
            .map(load_sector_map)
            .transpose()
    }
}

pub fn ensure_market_data_file(path: &Path) -> Result<()> {
    if path.is_file() {
        return Ok(());
    }

    Err(anyhow!(
        "Market data file not found at {}. Convert a CSV export with `snapshot` or pass --data.",
        path.display()
    ))
}

pub fn load_market_data(path: &Path, symbols: &[String]) -> Result<MarketData> {
    ensure_market_data_file(path)?;
    let data = MarketData::load_from_file(path)?;
    let data = if symbols.is_empty() {
        data
    } else {
        let normalized: Vec<String> = symbols
            .iter()
            .map(|symbol| symbol.trim().to_uppercase())
            .filter(|symbol| !symbol.is_empty())
            .collect();
        data.restrict_to_symbols(&normalized)?
    };
    if !data.has_data() {
        return Err(anyhow!("No bars found in {}", path.display()));
    }
    info!(
        "Loaded {} bars for {} symbols ({})",
        data.bars().len(),
        data.symbols().len(),
        data.fingerprint()
    );
    Ok(data)
}

/// Parses `name=value`.
pub fn parse_assignment(raw: &str) -> Result<(String, f64)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("Expected name=value, got '{}'", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("Missing parameter name in '{}'", raw));
    }
    let value: f64 = value
        .trim()
        .parse()
        .with_context(|| format!("Invalid number in '{}'", raw))?;
    Ok((name.to_string(), value))
}

/// JSON object of parameter name to number.
pub fn load_parameter_file(path: &Path) -> Result<BTreeMap<String, f64>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read parameters from {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse parameters in {}", path.display()))
}

/// JSON object of parameter name to the list of candidate values.
pub fn load_grid(path: &Path) -> Result<ParameterGrid> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read parameter grid from {}", path.display()))?;
    let grid: ParameterGrid = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse parameter grid in {}", path.display()))?;
    if grid.is_empty() {
        return Err(anyhow!("Parameter grid in {} is empty", path.display()));
    }
    Ok(grid)
}

/// JSON object of symbol to sector name.
pub fn load_sector_map(path: &Path) -> Result<HashMap<String, String>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read sector map from {}", path.display()))?;
    let map: HashMap<String, String> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse sector map in {}", path.display()))?;
    Ok(map
        .into_iter()
        .map(|(symbol, sector)| (symbol.trim().to_uppercase(), sector))
        .collect())
}
