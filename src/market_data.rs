//! Market data facade
//!
//! The engine only consumes this interface; ingestion lives behind it. The
//! bartime is the engine's logical clock: assigning it advances "now" and
//! may never regress. `SimMarketData` serves pre-loaded series for
//! simulation, exposing only the bars at or before the current bartime.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::errors::{EngineError, EngineResult};
use crate::types::{Bar, ProductType, Symbol};

pub trait MarketData {
    /// Register symbols for a (product_type, frequency). Registration is
    /// idempotent.
    fn add_symbols(&mut self, product_type: ProductType, symbols: &[Symbol], frequency: &str);

    /// Pull the data for the current bartime into view. A None symbol list
    /// means all registered symbols for the product type.
    fn update(
        &mut self,
        product_type: ProductType,
        frequency: &str,
        symbols: Option<&[Symbol]>,
    ) -> EngineResult<()>;

    /// Extend a coarser series (e.g. "1D") through the current bartime as
    /// part of the end-of-day process.
    fn extend(&mut self, product_type: ProductType, frequency: &str) -> EngineResult<()>;

    /// The bar at an exact datetime, if one was observed
    fn bar(
        &self,
        product_type: ProductType,
        symbol: &Symbol,
        frequency: &str,
        datetime: DateTime<Utc>,
    ) -> Option<Bar>;

    /// The bar at the current bartime
    fn current_bar(&self, product_type: ProductType, symbol: &Symbol, frequency: &str)
        -> Option<Bar>;

    /// The most recent bar at or before the current bartime that has a close
    fn last_valid_bar(
        &self,
        product_type: ProductType,
        symbol: &Symbol,
        frequency: &str,
    ) -> Option<Bar>;

    /// All bars at or before the current bartime, oldest first
    fn view(&self, product_type: ProductType, symbol: &Symbol, frequency: &str) -> Vec<Bar>;

    fn bartime(&self) -> DateTime<Utc>;

    /// Advance the logical clock. Assigning an earlier time is an error.
    fn set_bartime(&mut self, bartime: DateTime<Utc>) -> EngineResult<()>;
}

type SeriesKey = (ProductType, Symbol, String);

/// In-memory market data for simulation. Series are loaded up front; the
/// engine's view of them is truncated at the current bartime.
#[derive(Default)]
pub struct SimMarketData {
    series: HashMap<SeriesKey, Vec<Bar>>,
    registered: BTreeSet<SeriesKey>,
    bartime: Option<DateTime<Utc>>,
}

impl SimMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a full bar series for an instrument. Bars are sorted by
    /// datetime; a second load for the same key replaces the first.
    pub fn load_series(
        &mut self,
        product_type: ProductType,
        symbol: Symbol,
        frequency: &str,
        mut bars: Vec<Bar>,
    ) {
        bars.sort_by_key(|b| b.datetime);
        debug!(%product_type, %symbol, frequency, count = bars.len(), "series loaded");
        self.series
            .insert((product_type, symbol, frequency.to_string()), bars);
    }

    /// Registered (product_type, symbol, frequency) tuples
    pub fn registered(&self) -> impl Iterator<Item = &SeriesKey> {
        self.registered.iter()
    }

    /// Every datetime in a loaded series, regardless of the bartime. Used
    /// by runners to build their bartime schedule.
    pub fn datetimes(
        &self,
        product_type: ProductType,
        symbol: &Symbol,
        frequency: &str,
    ) -> Vec<DateTime<Utc>> {
        self.series(product_type, symbol, frequency)
            .map(|bars| bars.iter().map(|b| b.datetime).collect())
            .unwrap_or_default()
    }

    fn series(&self, product_type: ProductType, symbol: &Symbol, frequency: &str) -> Option<&[Bar]> {
        self.series
            .get(&(product_type, symbol.clone(), frequency.to_string()))
            .map(|v| v.as_slice())
    }
}

impl MarketData for SimMarketData {
    fn add_symbols(&mut self, product_type: ProductType, symbols: &[Symbol], frequency: &str) {
        for symbol in symbols {
            self.registered
                .insert((product_type, symbol.clone(), frequency.to_string()));
        }
    }

    fn update(
        &mut self,
        product_type: ProductType,
        frequency: &str,
        _symbols: Option<&[Symbol]>,
    ) -> EngineResult<()> {
        // the sim feed has no true I/O; visibility follows the bartime
        debug!(%product_type, frequency, "market data update");
        Ok(())
    }

    fn extend(&mut self, product_type: ProductType, frequency: &str) -> EngineResult<()> {
        debug!(%product_type, frequency, "market data extend");
        Ok(())
    }

    fn bar(
        &self,
        product_type: ProductType,
        symbol: &Symbol,
        frequency: &str,
        datetime: DateTime<Utc>,
    ) -> Option<Bar> {
        let bars = self.series(product_type, symbol, frequency)?;
        bars.binary_search_by_key(&datetime, |b| b.datetime)
            .ok()
            .map(|i| bars[i].clone())
    }

    fn current_bar(
        &self,
        product_type: ProductType,
        symbol: &Symbol,
        frequency: &str,
    ) -> Option<Bar> {
        // the bar whose period covers the current bartime: exact bartime for
        // the live frequency, today's bar for "1D"
        let bartime = self.bartime();
        let bars = self.series(product_type, symbol, frequency)?;
        let candidate = bars.iter().rev().find(|b| b.datetime <= bartime)?;
        match crate::types::parse_frequency(frequency) {
            Some(duration) => (bartime < candidate.datetime + duration).then(|| candidate.clone()),
            None => (candidate.datetime == bartime).then(|| candidate.clone()),
        }
    }

    fn last_valid_bar(
        &self,
        product_type: ProductType,
        symbol: &Symbol,
        frequency: &str,
    ) -> Option<Bar> {
        let bartime = self.bartime();
        let bars = self.series(product_type, symbol, frequency)?;
        bars.iter()
            .rev()
            .find(|b| b.datetime <= bartime && b.is_valid())
            .cloned()
    }

    fn view(&self, product_type: ProductType, symbol: &Symbol, frequency: &str) -> Vec<Bar> {
        let bartime = self.bartime();
        self.series(product_type, symbol, frequency)
            .map(|bars| {
                bars.iter()
                    .take_while(|b| b.datetime <= bartime)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn bartime(&self) -> DateTime<Utc> {
        self.bartime
            .expect("FATAL: bartime accessed before first assignment")
    }

    fn set_bartime(&mut self, bartime: DateTime<Utc>) -> EngineResult<()> {
        if let Some(current) = self.bartime {
            if bartime < current {
                return Err(EngineError::BartimeRegression {
                    current,
                    requested: bartime,
                });
            }
        }
        self.bartime = Some(bartime);
        Ok(())
    }
}
