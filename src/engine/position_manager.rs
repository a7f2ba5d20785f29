//! Position manager
//!
//! Books order fills into trades, maintains the per-(strategy, product_type,
//! symbol) position book with live PnL, persists positions at end of day and
//! stop, and reloads them at begin of day. Zero positions stay in the book
//! within a day but are not carried across the day boundary.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::calendar::TradingCalendar;
use crate::engine::order::OrderState;
use crate::engine::order_manager::OrderManager;
use crate::errors::{EngineError, EngineResult};
use crate::market_data::MarketData;
use crate::store::{PositionRecord, Store};
use crate::types::{ProductType, Side, Symbol, DAILY_FREQUENCY};

/// Position book key, ordered lexicographically
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PositionKey {
    pub strategy_id: String,
    pub product_type: ProductType,
    pub symbol: Symbol,
}

impl PositionKey {
    pub fn new(strategy_id: impl Into<String>, product_type: ProductType, symbol: Symbol) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            product_type,
            symbol,
        }
    }
}

/// One row of the position book
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionRow {
    pub current_position: Decimal,
    pub start_position: Decimal,
    pub net_quantity: Decimal,
    pub buy_quantity: Decimal,
    pub sell_quantity: Decimal,
    pub buy_avg_price: Decimal,
    pub sell_avg_price: Decimal,
    pub buy_pnl: Decimal,
    pub sell_pnl: Decimal,
    pub trade_pnl: Decimal,
    pub position_pnl: Decimal,
    pub gross_pnl: Decimal,
    pub commission: Decimal,
    pub net_pnl: Decimal,
    pub prior_close_price: Option<Decimal>,
    pub current_price: Option<Decimal>,
}

/// Position row with its key, the shape persisted in snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshotRow {
    pub strategy_id: String,
    pub product_type: ProductType,
    pub symbol: Symbol,
    #[serde(flatten)]
    pub row: PositionRow,
}

/// A booked trade derived from an order fill or entered directly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: u64,
    pub originator_id: String,
    pub strategy_id: String,
    pub bartime: DateTime<Utc>,
    pub product_type: ProductType,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub commission: Decimal,
    pub order_uuid: Option<Uuid>,
    pub fill_id: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

pub type PositionsBook = BTreeMap<PositionKey, PositionRow>;

/// End-of-day metric hook, invoked in registration order
pub trait EodMetric {
    fn calculate(&mut self, datetime: DateTime<Utc>, positions: &PositionsBook);
}

pub struct PositionManager {
    id: String,
    uuid: Uuid,
    store: Arc<dyn Store>,
    live_frequency: String,
    positions: PositionsBook,
    new_trades: Vec<Trade>,
    next_trade_id: u64,
    eod_metrics: Vec<(String, Box<dyn EodMetric>)>,
}

impl PositionManager {
    pub fn new(
        position_manager_id: impl Into<String>,
        store: Arc<dyn Store>,
        live_frequency: impl Into<String>,
    ) -> Self {
        let manager = Self {
            id: position_manager_id.into(),
            uuid: Uuid::new_v4(),
            store,
            live_frequency: live_frequency.into(),
            positions: BTreeMap::new(),
            new_trades: Vec::new(),
            next_trade_id: 1,
            eod_metrics: Vec::new(),
        };
        info!(id = %manager.id, "position manager initialized");
        manager
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn positions(&self) -> &PositionsBook {
        &self.positions
    }

    pub fn position(&self, key: &PositionKey) -> Option<&PositionRow> {
        self.positions.get(key)
    }

    /// Current position for a key, None when the row does not exist
    pub fn current_position(&self, key: &PositionKey) -> Option<Decimal> {
        self.positions.get(key).map(|r| r.current_position)
    }

    /// Trades booked since this manager was constructed
    pub fn new_trades(&self) -> &[Trade] {
        &self.new_trades
    }

    /// Book one trade and update the position row
    #[allow(clippy::too_many_arguments)]
    pub fn enter_trade(
        &mut self,
        originator_id: impl Into<String>,
        strategy_id: impl Into<String>,
        bartime: DateTime<Utc>,
        product_type: ProductType,
        symbol: Symbol,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        commission: Decimal,
        order_uuid: Option<Uuid>,
        fill_id: Option<u64>,
    ) -> EngineResult<()> {
        let trade = Trade {
            id: self.next_trade_id,
            originator_id: originator_id.into(),
            strategy_id: strategy_id.into(),
            bartime,
            product_type,
            symbol,
            side,
            quantity,
            price,
            commission,
            order_uuid,
            fill_id,
            timestamp: Utc::now(),
        };
        self.next_trade_id += 1;
        info!(
            trade_id = trade.id,
            strategy = %trade.strategy_id,
            symbol = %trade.symbol,
            side = %trade.side,
            %quantity,
            %price,
            "entering trade"
        );
        self.update_position_row(&trade);
        self.new_trades.push(trade);
        Ok(())
    }

    /// Book every unbooked fill on an order as a trade, in fill order, then
    /// flip the order's booked flag. A FILLED order is closed here.
    pub fn enter_trade_from_order(
        &mut self,
        orders: &mut OrderManager,
        uuid: Uuid,
    ) -> EngineResult<()> {
        let order = orders.order(uuid)?;
        if !matches!(
            order.state(),
            OrderState::PartiallyFilled | OrderState::Filled
        ) {
            return Err(EngineError::NotBookable(order.state()));
        }

        let unbooked: Vec<_> = order
            .fills()
            .iter()
            .filter(|f| !f.booked)
            .cloned()
            .collect();
        let (originator_id, strategy_id, product_type, symbol, side) = (
            order.originator_id().to_string(),
            order.strategy_id().to_string(),
            order.product_type(),
            order.symbol().clone(),
            order.side(),
        );

        for fill in unbooked {
            self.enter_trade(
                &originator_id,
                &strategy_id,
                fill.bartime,
                product_type,
                symbol.clone(),
                side,
                fill.quantity,
                fill.price,
                fill.commission,
                Some(uuid),
                Some(fill.id),
            )?;
            orders.order_mut(uuid)?.mark_fill_booked(fill.id);
        }
        orders.set_booked(uuid, true)?;
        if orders.order(uuid)?.state() == OrderState::Filled {
            orders.close_order(uuid)?;
        }
        Ok(())
    }

    /// Book all orders with unbooked fills. Returns the booked orders
    /// grouped by originator id, in booking order.
    pub fn book_fills(
        &mut self,
        orders: &mut OrderManager,
    ) -> EngineResult<BTreeMap<String, Vec<Uuid>>> {
        debug!("booking order fills");
        let mut booked: BTreeMap<String, Vec<Uuid>> = BTreeMap::new();
        for uuid in orders.to_be_booked_list() {
            self.enter_trade_from_order(orders, uuid)?;
            let originator_id = orders.order(uuid)?.originator_id().to_string();
            booked.entry(originator_id).or_default().push(uuid);
        }
        Ok(booked)
    }

    /// Accumulate a trade into its position row; creates the row lazily.
    /// Updates everything except PnL.
    fn update_position_row(&mut self, trade: &Trade) {
        let key = PositionKey::new(
            trade.strategy_id.clone(),
            trade.product_type,
            trade.symbol.clone(),
        );
        let row = self.positions.entry(key).or_default();

        // average price must be updated before the quantity
        let (avg_price, total_quantity) = match trade.side {
            Side::Buy => (&mut row.buy_avg_price, &mut row.buy_quantity),
            Side::Sell => (&mut row.sell_avg_price, &mut row.sell_quantity),
        };
        *avg_price = (*avg_price * *total_quantity + trade.price * trade.quantity)
            / (*total_quantity + trade.quantity);
        *total_quantity += trade.quantity;

        row.net_quantity = row.buy_quantity - row.sell_quantity;
        row.current_position = row.start_position + row.net_quantity;
        row.commission += trade.commission;
    }

    /// Full PnL pass: prior closes for new rows, latest live prices, then
    /// the PnL columns. A no-op when the book is empty.
    pub fn update_pnl(
        &mut self,
        market_data: &mut dyn MarketData,
        calendar: &dyn TradingCalendar,
    ) -> EngineResult<()> {
        if self.positions.is_empty() {
            return Ok(());
        }
        self.initialize_prior_close(market_data, calendar)?;
        self.update_current_prices(market_data)?;
        self.calculate_pnl();
        Ok(())
    }

    /// Fill in the prior business day's close for rows that do not have one
    pub fn initialize_prior_close(
        &mut self,
        market_data: &mut dyn MarketData,
        calendar: &dyn TradingCalendar,
    ) -> EngineResult<()> {
        let missing: Vec<PositionKey> = self
            .positions
            .iter()
            .filter(|(_, row)| row.prior_close_price.is_none())
            .map(|(key, _)| key.clone())
            .collect();

        for key in missing {
            let symbols = [key.symbol.clone()];
            market_data.add_symbols(key.product_type, &symbols, DAILY_FREQUENCY);
            // the live series must also be registered and current: the row
            // may have been created after the runner's update for this bar
            market_data.add_symbols(key.product_type, &symbols, &self.live_frequency);
            market_data.update(key.product_type, &self.live_frequency, Some(&symbols))?;

            let prior = calendar.prior_business_day(key.product_type, market_data.bartime(), 1);
            let close = market_data
                .bar(key.product_type, &key.symbol, DAILY_FREQUENCY, prior)
                .and_then(|bar| bar.close)
                .ok_or_else(|| EngineError::MissingBar {
                    product_type: key.product_type,
                    symbol: key.symbol.clone(),
                    frequency: DAILY_FREQUENCY.to_string(),
                    context: format!("prior close at {prior}"),
                })?;
            info!(symbol = %key.symbol, %close, "setting prior close");
            self.positions.get_mut(&key).expect("row exists").prior_close_price = Some(close);
        }
        Ok(())
    }

    /// Refresh current prices from the latest valid live-frequency bar
    pub fn update_current_prices(&mut self, market_data: &dyn MarketData) -> EngineResult<()> {
        debug!(frequency = %self.live_frequency, "updating current prices");
        for (key, row) in self.positions.iter_mut() {
            let close = market_data
                .last_valid_bar(key.product_type, &key.symbol, &self.live_frequency)
                .and_then(|bar| bar.close)
                .ok_or_else(|| EngineError::MissingBar {
                    product_type: key.product_type,
                    symbol: key.symbol.clone(),
                    frequency: self.live_frequency.clone(),
                    context: "current price".to_string(),
                })?;
            row.current_price = Some(close);
        }
        Ok(())
    }

    /// Overwrite current prices with today's daily close for EOD rollover
    pub fn insert_today_close(&mut self, market_data: &dyn MarketData) -> EngineResult<()> {
        debug!("inserting today's closing prices");
        for (key, row) in self.positions.iter_mut() {
            let close = market_data
                .current_bar(key.product_type, &key.symbol, DAILY_FREQUENCY)
                .and_then(|bar| bar.close)
                .ok_or_else(|| EngineError::MissingBar {
                    product_type: key.product_type,
                    symbol: key.symbol.clone(),
                    frequency: DAILY_FREQUENCY.to_string(),
                    context: "today close".to_string(),
                })?;
            row.current_price = Some(close);
        }
        Ok(())
    }

    /// Recompute the PnL columns from the accumulated quantities and prices
    pub fn calculate_pnl(&mut self) {
        debug!("calculating pnl");
        for row in self.positions.values_mut() {
            let prior_close = row.prior_close_price.unwrap_or_default();
            let current_price = row.current_price.unwrap_or_default();
            row.buy_pnl = row.buy_quantity * (prior_close - row.buy_avg_price);
            row.sell_pnl = row.sell_quantity * (row.sell_avg_price - prior_close);
            row.trade_pnl = row.buy_pnl + row.sell_pnl;
            row.position_pnl = row.current_position * (current_price - prior_close);
            row.gross_pnl = row.trade_pnl + row.position_pnl;
            row.net_pnl = row.gross_pnl + row.commission;
        }
    }

    /// Begin-of-day: rehydrate positions from the last persisted datetime
    /// and initialize prior closes for the loaded rows.
    pub fn begin_of_day(
        &mut self,
        market_data: &mut dyn MarketData,
        calendar: &dyn TradingCalendar,
    ) -> EngineResult<()> {
        info!(id = %self.id, "position manager begin of day");
        let datetime = self.store.max_datetime(&self.id)?;
        self.load_positions(datetime)?;
        self.initialize_prior_close(market_data, calendar)
    }

    /// End-of-day: roll prices to today's close, final PnL, metrics, persist
    pub fn end_of_day(&mut self, market_data: &dyn MarketData) -> EngineResult<()> {
        info!(id = %self.id, "position manager end of day");
        let datetime = market_data.bartime();
        if !self.positions.is_empty() {
            self.insert_today_close(market_data)?;
            self.calculate_pnl();
            self.calculate_eod_metrics(datetime);
            self.save_positions(datetime)?;
        }
        self.save_positions_snapshot(datetime)
    }

    /// Stop: final PnL at the last bartime and persist
    pub fn stop(
        &mut self,
        market_data: &mut dyn MarketData,
        calendar: &dyn TradingCalendar,
    ) -> EngineResult<()> {
        info!(id = %self.id, "position manager stop");
        self.update_pnl(market_data, calendar)?;
        let datetime = market_data.bartime();
        if !self.positions.is_empty() {
            self.save_positions(datetime)?;
        }
        self.save_positions_snapshot(datetime)?;
        self.calculate_eod_metrics(datetime);
        Ok(())
    }

    /// Persist long-form position rows used by the next begin-of-day load
    pub fn save_positions(&self, datetime: DateTime<Utc>) -> EngineResult<()> {
        info!("saving positions");
        let records: Vec<PositionRecord> = self
            .positions
            .iter()
            .map(|(key, row)| PositionRecord {
                strategy_id: key.strategy_id.clone(),
                product_type: key.product_type,
                symbol: key.symbol.clone(),
                datetime,
                position: row.current_position,
            })
            .collect();
        self.store.insert_positions(&self.id, &records)?;
        Ok(())
    }

    /// Replace the book with the stored positions for a datetime, dropping
    /// rows whose stored position is zero.
    pub fn load_positions(&mut self, datetime: Option<DateTime<Utc>>) -> EngineResult<()> {
        info!("loading positions");
        self.positions.clear();
        let Some(datetime) = datetime else {
            return Ok(());
        };
        for record in self.store.positions(&self.id, Some(datetime))? {
            if record.position == Decimal::ZERO {
                continue;
            }
            let key = PositionKey::new(record.strategy_id, record.product_type, record.symbol);
            let row = self.positions.entry(key).or_default();
            row.start_position = record.position;
            row.current_position = record.position;
        }
        Ok(())
    }

    /// Persist the full position book snapshot
    pub fn save_positions_snapshot(&self, datetime: DateTime<Utc>) -> EngineResult<()> {
        info!("saving positions snapshot");
        let rows = self.snapshot_rows();
        self.store
            .insert_positions_snapshot(&self.id, datetime, &rows)?;
        Ok(())
    }

    pub fn snapshot_rows(&self) -> Vec<PositionSnapshotRow> {
        self.positions
            .iter()
            .map(|(key, row)| PositionSnapshotRow {
                strategy_id: key.strategy_id.clone(),
                product_type: key.product_type,
                symbol: key.symbol.clone(),
                row: row.clone(),
            })
            .collect()
    }

    /// Register an end-of-day metric. Metrics run in registration order, so
    /// a metric that depends on another must be added after it.
    pub fn add_eod_metric(&mut self, metric_id: impl Into<String>, metric: Box<dyn EodMetric>) {
        self.eod_metrics.push((metric_id.into(), metric));
    }

    pub fn calculate_eod_metrics(&mut self, datetime: DateTime<Utc>) {
        let mut metrics = std::mem::take(&mut self.eod_metrics);
        for (metric_id, metric) in metrics.iter_mut() {
            debug!(metric = %metric_id, "calculating eod metric");
            metric.calculate(datetime, &self.positions);
        }
        self.eod_metrics = metrics;
    }
}
