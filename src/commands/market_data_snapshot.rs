use crate::commands::inputs::ensure_market_data_file;
use crate::data_context::MarketData;
use anyhow::{anyhow, Result};
use log::info;
use std::path::Path;

/// Converts a CSV (or existing snapshot) into a binary market data snapshot.
pub fn run(input_path: &Path, output_path: &Path) -> Result<MarketData> {
    ensure_market_data_file(input_path)?;
    info!(
        "Generating market data snapshot at {} from {}",
        output_path.display(),
        input_path.display()
    );

    let market_data = MarketData::load_from_file(input_path)?;
    if !market_data.has_data() {
        return Err(anyhow!("No bars found in {}", input_path.display()));
    }

    market_data.save_snapshot(output_path)?;
    info!(
        "Market data snapshot successfully written to {} ({})",
        output_path.display(),
        market_data.fingerprint()
    );

    Ok(market_data)
}
