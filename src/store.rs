//! Persistence facade for orders and positions
//!
//! The engine persists three things: flattened order snapshots at EOD and
//! stop, full position snapshots at EOD and stop, and long-form position
//! rows that seed the next day's begin-of-day load. `SqliteStore` is the
//! production backend; `MemoryStore` is the in-process double used by tests.

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::engine::order::OrderSnapshotRow;
use crate::engine::position_manager::PositionSnapshotRow;
use crate::errors::StoreError;
use crate::types::{ProductType, Symbol};

/// Long-form position row: one (strategy, instrument) position at a datetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub strategy_id: String,
    pub product_type: ProductType,
    pub symbol: Symbol,
    pub datetime: DateTime<Utc>,
    pub position: Decimal,
}

/// Persistence backend consumed by the OrderManager and PositionManager.
///
/// Datetimes are UTC; backends that cannot hold sub-second precision
/// truncate to whole seconds at this boundary.
pub trait Store {
    fn insert_orders(
        &self,
        source: &str,
        datetime: DateTime<Utc>,
        orders: &[OrderSnapshotRow],
    ) -> Result<(), StoreError>;

    fn insert_positions_snapshot(
        &self,
        source: &str,
        datetime: DateTime<Utc>,
        positions: &[PositionSnapshotRow],
    ) -> Result<(), StoreError>;

    fn insert_positions(&self, source: &str, rows: &[PositionRecord]) -> Result<(), StoreError>;

    fn positions(
        &self,
        source: &str,
        datetime: Option<DateTime<Utc>>,
    ) -> Result<Vec<PositionRecord>, StoreError>;

    fn max_datetime(&self, source: &str) -> Result<Option<DateTime<Utc>>, StoreError>;
}

// =============================================================================
// SQLite backend
// =============================================================================

/// SQLite-backed store. Snapshot tables hold one JSON document per
/// (source, datetime); the position table is long-form typed columns.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn datetime_to_db(ts: DateTime<Utc>) -> String {
    // second precision at the persistence boundary
    ts.trunc_subsecs(0).format(DATETIME_FORMAT).to_string()
}

fn datetime_from_db(s: &str) -> Result<DateTime<Utc>, StoreError> {
    chrono::NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| StoreError::InvalidValue(format!("bad datetime {s}: {e}")))
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_tables()?;
        info!(path = %db_path.as_ref().display(), "sqlite store initialized");
        Ok(store)
    }

    /// In-memory database, handy for simulations that do not keep state
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS orders (
                source TEXT NOT NULL,
                datetime TEXT NOT NULL,
                json TEXT NOT NULL,
                PRIMARY KEY (source, datetime)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS positions_snapshot (
                source TEXT NOT NULL,
                datetime TEXT NOT NULL,
                json TEXT NOT NULL,
                PRIMARY KEY (source, datetime)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS position (
                source TEXT NOT NULL,
                strategy TEXT NOT NULL,
                product_type TEXT NOT NULL,
                symbol TEXT NOT NULL,
                datetime TEXT NOT NULL,
                position TEXT NOT NULL,
                PRIMARY KEY (source, strategy, product_type, symbol, datetime)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_position_source_datetime
             ON position(source, datetime)",
            [],
        )?;
        debug!("store schema created/verified");
        Ok(())
    }

    fn insert_json(
        &self,
        table: &str,
        source: &str,
        datetime: DateTime<Utc>,
        json: String,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!("INSERT OR REPLACE INTO {table} (source, datetime, json) VALUES (?1, ?2, ?3)"),
            params![source, datetime_to_db(datetime), json],
        )?;
        Ok(())
    }
}

impl Store for SqliteStore {
    fn insert_orders(
        &self,
        source: &str,
        datetime: DateTime<Utc>,
        orders: &[OrderSnapshotRow],
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(orders)?;
        self.insert_json("orders", source, datetime, json)?;
        debug!(source, count = orders.len(), "orders snapshot saved");
        Ok(())
    }

    fn insert_positions_snapshot(
        &self,
        source: &str,
        datetime: DateTime<Utc>,
        positions: &[PositionSnapshotRow],
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(positions)?;
        self.insert_json("positions_snapshot", source, datetime, json)?;
        debug!(source, count = positions.len(), "positions snapshot saved");
        Ok(())
    }

    fn insert_positions(&self, source: &str, rows: &[PositionRecord]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for row in rows {
            tx.execute(
                "INSERT OR REPLACE INTO position
                 (source, strategy, product_type, symbol, datetime, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    source,
                    row.strategy_id,
                    row.product_type.as_str(),
                    row.symbol.as_str(),
                    datetime_to_db(row.datetime),
                    row.position.to_string(),
                ],
            )?;
        }
        tx.commit()?;
        debug!(source, count = rows.len(), "positions saved");
        Ok(())
    }

    fn positions(
        &self,
        source: &str,
        datetime: Option<DateTime<Utc>>,
    ) -> Result<Vec<PositionRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut query = "SELECT strategy, product_type, symbol, datetime, position
             FROM position WHERE source = ?1"
            .to_string();
        if datetime.is_some() {
            query.push_str(" AND datetime = ?2");
        }
        query.push_str(" ORDER BY strategy, product_type, symbol");

        let mut stmt = conn.prepare(&query)?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(String, String, String, String, String)> {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
            ))
        };
        let raw: Vec<_> = match datetime {
            Some(ts) => stmt
                .query_map(params![source, datetime_to_db(ts)], map_row)?
                .collect::<Result<_, _>>()?,
            None => stmt
                .query_map(params![source], map_row)?
                .collect::<Result<_, _>>()?,
        };

        raw.into_iter()
            .map(|(strategy, product_type, symbol, dt, position)| {
                Ok(PositionRecord {
                    strategy_id: strategy,
                    product_type: product_type
                        .parse()
                        .map_err(StoreError::InvalidValue)?,
                    symbol: Symbol::new(symbol),
                    datetime: datetime_from_db(&dt)?,
                    position: position
                        .parse()
                        .map_err(|e| StoreError::InvalidValue(format!("bad position: {e}")))?,
                })
            })
            .collect()
    }

    fn max_datetime(&self, source: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let result: Option<String> = conn.query_row(
            "SELECT MAX(datetime) FROM position WHERE source = ?1",
            params![source],
            |row| row.get(0),
        )?;
        result.map(|s| datetime_from_db(&s)).transpose()
    }
}

// =============================================================================
// In-memory backend
// =============================================================================

/// In-memory store used by unit and scenario tests
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    orders: HashMap<String, Vec<(DateTime<Utc>, Vec<OrderSnapshotRow>)>>,
    snapshots: HashMap<String, Vec<(DateTime<Utc>, Vec<PositionSnapshotRow>)>>,
    positions: HashMap<String, Vec<PositionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All persisted order snapshots for a source, oldest first
    pub fn order_snapshots(&self, source: &str) -> Vec<(DateTime<Utc>, Vec<OrderSnapshotRow>)> {
        self.inner
            .lock()
            .unwrap()
            .orders
            .get(source)
            .cloned()
            .unwrap_or_default()
    }

    /// All persisted position snapshots for a source, oldest first
    pub fn position_snapshots(
        &self,
        source: &str,
    ) -> Vec<(DateTime<Utc>, Vec<PositionSnapshotRow>)> {
        self.inner
            .lock()
            .unwrap()
            .snapshots
            .get(source)
            .cloned()
            .unwrap_or_default()
    }
}

impl Store for MemoryStore {
    fn insert_orders(
        &self,
        source: &str,
        datetime: DateTime<Utc>,
        orders: &[OrderSnapshotRow],
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .orders
            .entry(source.to_string())
            .or_default()
            .push((datetime, orders.to_vec()));
        Ok(())
    }

    fn insert_positions_snapshot(
        &self,
        source: &str,
        datetime: DateTime<Utc>,
        positions: &[PositionSnapshotRow],
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .snapshots
            .entry(source.to_string())
            .or_default()
            .push((datetime, positions.to_vec()));
        Ok(())
    }

    fn insert_positions(&self, source: &str, rows: &[PositionRecord]) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .positions
            .entry(source.to_string())
            .or_default()
            .extend(rows.iter().cloned());
        Ok(())
    }

    fn positions(
        &self,
        source: &str,
        datetime: Option<DateTime<Utc>>,
    ) -> Result<Vec<PositionRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<PositionRecord> = inner
            .positions
            .get(source)
            .map(|rows| {
                rows.iter()
                    .filter(|r| datetime.map_or(true, |ts| r.datetime == ts))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| {
            (&a.strategy_id, a.product_type, &a.symbol).cmp(&(
                &b.strategy_id,
                b.product_type,
                &b.symbol,
            ))
        });
        Ok(rows)
    }

    fn max_datetime(&self, source: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .positions
            .get(source)
            .and_then(|rows| rows.iter().map(|r| r.datetime).max()))
    }
}
