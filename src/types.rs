//! Core data types used across the trading engine

use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Instrument symbol using Arc<str> for cheap cloning
///
/// Symbols are cloned on every order, trade, and position row. Arc<str>
/// keeps those clones O(1) instead of re-allocating the name each time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] Arc<str>);

/// Custom serde for Arc<str>
mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol::new(s)
    }
}

/// Product type of an instrument
///
/// Market state, commissions, and calendars are all keyed per product type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductType {
    Stock,
    Future,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Stock => "stock",
            ProductType::Future => "future",
        }
    }
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProductType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stock" => Ok(ProductType::Stock),
            "future" => Ok(ProductType::Future),
            other => Err(format!("unknown product type: {other}")),
        }
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    /// Side implied by the sign of a trade-to-do quantity
    pub fn from_signed(quantity: Decimal) -> Self {
        if quantity.is_sign_negative() {
            Side::Sell
        } else {
            Side::Buy
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" | "b" => Ok(Side::Buy),
            "sell" | "s" => Ok(Side::Sell),
            other => Err(format!("buy_sell value must be buy, sell, b or s: {other}")),
        }
    }
}

/// OHLCV bar for one (product_type, symbol, frequency)
///
/// Any numeric field may be absent, e.g. a bar inside a trading halt carries
/// a datetime but no prices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub datetime: chrono::DateTime<chrono::Utc>,
    pub open: Option<Decimal>,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    pub close: Option<Decimal>,
    pub volume: Option<Decimal>,
}

impl Bar {
    pub fn new(
        datetime: chrono::DateTime<chrono::Utc>,
        open: Option<Decimal>,
        high: Option<Decimal>,
        low: Option<Decimal>,
        close: Option<Decimal>,
        volume: Option<Decimal>,
    ) -> Self {
        Self {
            datetime,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// A bar with a datetime and no data, the shape returned for a bartime
    /// with no observation.
    pub fn empty(datetime: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            datetime,
            open: None,
            high: None,
            low: None,
            close: None,
            volume: None,
        }
    }

    /// True when the close is present, the minimum for a bar to price against
    pub fn is_valid(&self) -> bool {
        self.close.is_some()
    }
}

/// Parse a frequency string in standard form ("1min", "5min", "1h", "1D")
/// into a duration. Returns None for unrecognized forms.
pub fn parse_frequency(frequency: &str) -> Option<Duration> {
    let frequency = frequency.trim();
    if let Some(n) = frequency.strip_suffix("min") {
        return n.parse::<i64>().ok().map(Duration::minutes);
    }
    if let Some(n) = frequency.strip_suffix('h') {
        return n.parse::<i64>().ok().map(Duration::hours);
    }
    if let Some(n) = frequency.strip_suffix('D') {
        return n.parse::<i64>().ok().map(Duration::days);
    }
    if let Some(n) = frequency.strip_suffix('s') {
        return n.parse::<i64>().ok().map(Duration::seconds);
    }
    None
}

/// The daily frequency name used for prior-close and end-of-day data
pub const DAILY_FREQUENCY: &str = "1D";
