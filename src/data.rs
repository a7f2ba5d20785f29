//! CSV bar ingestion
//!
//! Loads OHLCV bar files into a `SimMarketData` for simulation runs. Files
//! are named `<SYMBOL>_<frequency>.csv` (e.g. `AAPL_1min.csv`) with a
//! `datetime,open,high,low,close,volume` header. Empty cells become absent
//! bar fields.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use tracing::info;

use crate::market_data::SimMarketData;
use crate::types::{Bar, ProductType, Symbol};

#[derive(Debug, Deserialize)]
struct BarRecord {
    datetime: String,
    open: Option<Decimal>,
    high: Option<Decimal>,
    low: Option<Decimal>,
    close: Option<Decimal>,
    volume: Option<Decimal>,
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc());
    }
    bail!("unparseable datetime: {value}")
}

/// Load one CSV bar file
pub fn load_bars(path: impl AsRef<Path>) -> Result<Vec<Bar>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open bar file: {}", path.display()))?;

    let mut bars = Vec::new();
    for record in reader.deserialize() {
        let record: BarRecord =
            record.with_context(|| format!("Bad record in {}", path.display()))?;
        bars.push(Bar {
            datetime: parse_datetime(&record.datetime)?,
            open: record.open,
            high: record.high,
            low: record.low,
            close: record.close,
            volume: record.volume,
        });
    }
    Ok(bars)
}

/// Load every `<SYMBOL>_<frequency>.csv` in a directory into a sim feed
pub fn load_directory(data_dir: impl AsRef<Path>, product_type: ProductType) -> Result<SimMarketData> {
    let data_dir = data_dir.as_ref();
    let mut market_data = SimMarketData::new();

    for entry in std::fs::read_dir(data_dir)
        .with_context(|| format!("Failed to read data directory: {}", data_dir.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("csv") {
            continue;
        }
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .context("non-utf8 file name")?;
        let Some((symbol, frequency)) = stem.rsplit_once('_') else {
            bail!("bar file name must be <SYMBOL>_<frequency>.csv: {stem}");
        };

        let bars = load_bars(&path)?;
        info!(symbol, frequency, count = bars.len(), "loaded bar file");
        market_data.load_series(product_type, Symbol::new(symbol), frequency, bars);
    }
    Ok(market_data)
}
