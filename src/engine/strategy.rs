//! Strategy extension point
//!
//! Concrete strategies implement the `Strategy` trait callbacks and keep any
//! cross-callback state (remembered order uuids, bar counters) as ordinary
//! fields on the implementing type. Identity, portfolio membership, and
//! symbol registrations live in `StrategyMeta`, owned by the event
//! processor's arena; callbacks reach the rest of the engine through the
//! contexts passed in.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;
use uuid::Uuid;

use crate::engine::order::{Order, OrderDetails, OrderState};
use crate::engine::order_manager::{OrderFilter, OrderManager};
use crate::engine::portfolio::Portfolio;
use crate::engine::position_manager::{PositionKey, PositionManager, PositionRow};
use crate::errors::{EngineError, EngineResult};
use crate::market_data::MarketData;
use crate::types::{ProductType, Side, Symbol};

/// Strategy identity and registrations, owned by the event processor
#[derive(Debug, Clone)]
pub struct StrategyMeta {
    strategy_id: String,
    uuid: Uuid,
    portfolio_id: String,
    symbols: BTreeMap<ProductType, BTreeSet<Symbol>>,
    symbol_tuples: Vec<(ProductType, Symbol, String)>,
    frequencies: BTreeSet<String>,
    started: bool,
}

impl StrategyMeta {
    pub fn new(strategy_id: impl Into<String>, portfolio_id: impl Into<String>) -> Self {
        let meta = Self {
            strategy_id: strategy_id.into(),
            uuid: Uuid::new_v4(),
            portfolio_id: portfolio_id.into(),
            symbols: BTreeMap::new(),
            symbol_tuples: Vec::new(),
            frequencies: BTreeSet::new(),
            started: false,
        };
        info!(strategy = %meta.strategy_id, uuid = %meta.uuid, "strategy initialized");
        meta
    }

    pub fn strategy_id(&self) -> &str {
        &self.strategy_id
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn portfolio_id(&self) -> &str {
        &self.portfolio_id
    }

    /// The originator id this strategy stamps on its orders
    pub fn originator_id(&self) -> String {
        format!("strategy.{}", self.strategy_id)
    }

    pub fn is_registered(&self, product_type: ProductType, symbol: &Symbol) -> bool {
        self.symbols
            .get(&product_type)
            .is_some_and(|set| set.contains(symbol))
    }

    pub fn symbol_tuples(&self) -> &[(ProductType, Symbol, String)] {
        &self.symbol_tuples
    }

    pub fn product_types(&self) -> impl Iterator<Item = ProductType> + '_ {
        self.symbols.keys().copied()
    }

    pub fn frequencies(&self) -> impl Iterator<Item = &str> {
        self.frequencies.iter().map(|s| s.as_str())
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub(crate) fn mark_started(&mut self) {
        self.started = true;
    }

    fn add_symbol(&mut self, product_type: ProductType, symbol: Symbol, frequency: &str) {
        self.symbols
            .entry(product_type)
            .or_default()
            .insert(symbol.clone());
        self.frequencies.insert(frequency.to_string());
        self.symbol_tuples
            .push((product_type, symbol, frequency.to_string()));
    }
}

/// Context for `on_initialize`: symbol registration happens here, before
/// the strategy starts.
pub struct SetupContext<'a> {
    meta: &'a mut StrategyMeta,
    market_data: &'a mut dyn MarketData,
}

impl<'a> SetupContext<'a> {
    pub(crate) fn new(meta: &'a mut StrategyMeta, market_data: &'a mut dyn MarketData) -> Self {
        Self { meta, market_data }
    }

    pub fn strategy_id(&self) -> &str {
        self.meta.strategy_id()
    }

    /// Register an instrument with the strategy and the market data layer
    pub fn add_symbol(
        &mut self,
        product_type: ProductType,
        symbol: impl Into<Symbol>,
        frequency: &str,
    ) -> EngineResult<()> {
        if self.meta.started() {
            return Err(EngineError::AlreadyStarted(
                self.meta.strategy_id().to_string(),
            ));
        }
        let symbol = symbol.into();
        info!(
            strategy = %self.meta.strategy_id(),
            %product_type,
            %symbol,
            frequency,
            "adding symbol to strategy"
        );
        self.market_data
            .add_symbols(product_type, &[symbol.clone()], frequency);
        self.meta.add_symbol(product_type, symbol, frequency);
        Ok(())
    }

    pub fn add_symbols(
        &mut self,
        tuples: impl IntoIterator<Item = (ProductType, Symbol, &'static str)>,
    ) -> EngineResult<()> {
        for (product_type, symbol, frequency) in tuples {
            self.add_symbol(product_type, symbol, frequency)?;
        }
        Ok(())
    }
}

/// Context passed to every running-state callback
pub struct StrategyContext<'a> {
    meta: &'a StrategyMeta,
    bartime: DateTime<Utc>,
    orders: &'a mut OrderManager,
    portfolio: &'a mut Portfolio,
    positions: &'a PositionManager,
    market_data: &'a dyn MarketData,
}

impl<'a> StrategyContext<'a> {
    pub(crate) fn new(
        meta: &'a StrategyMeta,
        bartime: DateTime<Utc>,
        orders: &'a mut OrderManager,
        portfolio: &'a mut Portfolio,
        positions: &'a PositionManager,
        market_data: &'a dyn MarketData,
    ) -> Self {
        Self {
            meta,
            bartime,
            orders,
            portfolio,
            positions,
            market_data,
        }
    }

    pub fn strategy_id(&self) -> &str {
        self.meta.strategy_id()
    }

    pub fn bartime(&self) -> DateTime<Utc> {
        self.bartime
    }

    pub fn market_data(&self) -> &dyn MarketData {
        self.market_data
    }

    /// Create a LIMIT order; returns its uuid. The instrument must have been
    /// registered during on_initialize.
    pub fn order(
        &mut self,
        product_type: ProductType,
        symbol: impl Into<Symbol>,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> EngineResult<Uuid> {
        let symbol = symbol.into();
        if !self.meta.is_registered(product_type, &symbol) {
            return Err(EngineError::NotRegistered {
                strategy_id: self.meta.strategy_id().to_string(),
                product_type,
                symbol,
            });
        }
        info!(
            strategy = %self.meta.strategy_id(),
            %symbol,
            %side,
            %quantity,
            %price,
            "creating order"
        );
        let order = Order::new(
            self.meta.uuid(),
            self.meta.originator_id(),
            self.meta.uuid(),
            self.meta.strategy_id(),
            product_type,
            symbol,
            side,
            quantity,
            OrderDetails::limit(price),
        );
        self.orders.new_order(order)
    }

    pub fn get_order(&self, uuid: Uuid) -> EngineResult<&Order> {
        self.orders.order(uuid)
    }

    /// Request a cancel. A cancel on an already-closed order is ignored.
    pub fn cancel_order(&mut self, uuid: Uuid) -> EngineResult<()> {
        if self.orders.order(uuid)?.closed() {
            info!(%uuid, "cancel on closed order ignored");
            return Ok(());
        }
        self.orders.change_state(uuid, OrderState::CancelRequested)
    }

    /// Request a replace. A replace on an already-closed order is ignored.
    pub fn replace_order(
        &mut self,
        uuid: Uuid,
        quantity: Option<Decimal>,
        price: Option<Decimal>,
    ) -> EngineResult<()> {
        if self.orders.order(uuid)?.closed() {
            info!(%uuid, "replace on closed order ignored");
            return Ok(());
        }
        self.orders
            .replace_order(uuid, quantity, price.map(OrderDetails::limit))
    }

    /// This strategy's orders matching a filter, in insertion order
    pub fn orders_list(&self, filter: &OrderFilter) -> Vec<Uuid> {
        let mut filter = filter.clone();
        filter.originator_uuids = Some(vec![self.meta.uuid()]);
        self.orders.orders_list(&filter)
    }

    /// Declare a target position for an instrument. A target of None clears
    /// any standing intent.
    pub fn set_intent(
        &mut self,
        product_type: ProductType,
        symbol: impl Into<Symbol>,
        target: impl Into<Option<Decimal>>,
    ) {
        self.portfolio
            .set_intent(self.meta.strategy_id(), product_type, symbol.into(), target.into());
    }

    pub fn get_intent(&self, product_type: ProductType, symbol: &Symbol) -> Option<Decimal> {
        self.portfolio
            .get_intent(self.meta.strategy_id(), product_type, symbol)
            .and_then(|row| row.target)
    }

    /// Current position, zero when the book has no row
    pub fn position(&self, product_type: ProductType, symbol: &Symbol) -> Decimal {
        self.positions
            .current_position(&PositionKey::new(
                self.meta.strategy_id(),
                product_type,
                symbol.clone(),
            ))
            .unwrap_or_default()
    }

    /// Full position row, if one exists
    pub fn position_row(&self, product_type: ProductType, symbol: &Symbol) -> Option<&PositionRow> {
        self.positions.position(&PositionKey::new(
            self.meta.strategy_id(),
            product_type,
            symbol.clone(),
        ))
    }
}

/// Strategy callback set. Only override what the strategy needs; every
/// callback defaults to doing nothing. Errors propagate to the runner
/// unchanged.
pub trait Strategy {
    /// Called once at registration, before the engine starts. Register
    /// symbols here.
    fn on_initialize(&mut self, _setup: &mut SetupContext) -> EngineResult<()> {
        Ok(())
    }

    fn on_start(&mut self, _ctx: &mut StrategyContext) -> EngineResult<()> {
        Ok(())
    }

    fn on_stop(&mut self, _ctx: &mut StrategyContext) -> EngineResult<()> {
        Ok(())
    }

    fn on_begin_of_day(&mut self, _ctx: &mut StrategyContext) -> EngineResult<()> {
        Ok(())
    }

    fn on_end_of_day(&mut self, _ctx: &mut StrategyContext) -> EngineResult<()> {
        Ok(())
    }

    fn on_market_open(&mut self, _ctx: &mut StrategyContext) -> EngineResult<()> {
        Ok(())
    }

    fn on_market_close(&mut self, _ctx: &mut StrategyContext) -> EngineResult<()> {
        Ok(())
    }

    fn on_bar(&mut self, _ctx: &mut StrategyContext) -> EngineResult<()> {
        Ok(())
    }

    /// One or more of this strategy's orders were filled and booked. The
    /// position book already reflects the fills.
    fn on_fills(&mut self, _ctx: &mut StrategyContext, _fills: &[Uuid]) -> EngineResult<()> {
        Ok(())
    }

    /// One or more of this strategy's orders were canceled. Orders created
    /// here are staged and risk-checked in the same bar.
    fn on_cancels(&mut self, _ctx: &mut StrategyContext, _cancels: &[Uuid]) -> EngineResult<()> {
        Ok(())
    }
}
