//! Order manager
//!
//! The registry of every order in the system, keyed by uuid and ordered by
//! insertion. All order mutation flows through here: state changes are
//! validated by the order's transition table, and the closed/booked/portfolio
//! flags can only be flipped via manager methods. Also the keeper of the
//! per-product-type market open/closed state.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::engine::order::{Order, OrderDetails, OrderSnapshotRow, OrderState};
use crate::errors::{EngineError, EngineResult};
use crate::store::Store;
use crate::types::{ProductType, Symbol};
use rust_decimal::Decimal;

/// Query filter over the registry: AND across fields, OR across the values
/// listed within a field.
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub states: Option<Vec<OrderState>>,
    pub originator_ids: Option<Vec<String>>,
    pub originator_uuids: Option<Vec<Uuid>>,
    pub strategy_ids: Option<Vec<String>>,
    pub strategy_uuids: Option<Vec<Uuid>>,
    pub portfolio_uuids: Option<Vec<Uuid>>,
    pub product_types: Option<Vec<ProductType>>,
    pub symbols: Option<Vec<Symbol>>,
    pub booked: Option<bool>,
    pub closed: Option<bool>,
}

impl OrderFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn states(mut self, states: impl IntoIterator<Item = OrderState>) -> Self {
        self.states = Some(states.into_iter().collect());
        self
    }

    pub fn state(self, state: OrderState) -> Self {
        self.states([state])
    }

    pub fn originator_id(mut self, id: impl Into<String>) -> Self {
        self.originator_ids = Some(vec![id.into()]);
        self
    }

    pub fn originator_uuid(mut self, uuid: Uuid) -> Self {
        self.originator_uuids = Some(vec![uuid]);
        self
    }

    pub fn strategy_id(mut self, id: impl Into<String>) -> Self {
        self.strategy_ids = Some(vec![id.into()]);
        self
    }

    pub fn strategy_uuid(mut self, uuid: Uuid) -> Self {
        self.strategy_uuids = Some(vec![uuid]);
        self
    }

    pub fn portfolio_uuid(mut self, uuid: Uuid) -> Self {
        self.portfolio_uuids = Some(vec![uuid]);
        self
    }

    pub fn product_type(mut self, product_type: ProductType) -> Self {
        self.product_types = Some(vec![product_type]);
        self
    }

    pub fn symbol(mut self, symbol: Symbol) -> Self {
        self.symbols = Some(vec![symbol]);
        self
    }

    pub fn booked(mut self, booked: bool) -> Self {
        self.booked = Some(booked);
        self
    }

    pub fn closed(mut self, closed: bool) -> Self {
        self.closed = Some(closed);
        self
    }

    fn matches(&self, order: &Order) -> bool {
        if let Some(states) = &self.states {
            if !states.contains(&order.state()) {
                return false;
            }
        }
        if let Some(ids) = &self.originator_ids {
            if !ids.iter().any(|id| id == order.originator_id()) {
                return false;
            }
        }
        if let Some(uuids) = &self.originator_uuids {
            if !uuids.contains(&order.originator_uuid()) {
                return false;
            }
        }
        if let Some(ids) = &self.strategy_ids {
            if !ids.iter().any(|id| id == order.strategy_id()) {
                return false;
            }
        }
        if let Some(uuids) = &self.strategy_uuids {
            if !uuids.contains(&order.strategy_uuid()) {
                return false;
            }
        }
        if let Some(uuids) = &self.portfolio_uuids {
            if order.portfolio_uuid().map_or(true, |u| !uuids.contains(&u)) {
                return false;
            }
        }
        if let Some(product_types) = &self.product_types {
            if !product_types.contains(&order.product_type()) {
                return false;
            }
        }
        if let Some(symbols) = &self.symbols {
            if !symbols.contains(order.symbol()) {
                return false;
            }
        }
        if let Some(booked) = self.booked {
            if order.booked() != Some(booked) {
                return false;
            }
        }
        if let Some(closed) = self.closed {
            if order.closed() != closed {
                return false;
            }
        }
        true
    }
}

pub struct OrderManager {
    id: String,
    uuid: Uuid,
    store: Arc<dyn Store>,
    orders: Vec<Order>,
    by_uuid: HashMap<Uuid, usize>,
    market_state: HashMap<ProductType, bool>,
}

impl OrderManager {
    pub fn new(order_manager_id: impl Into<String>, store: Arc<dyn Store>) -> Self {
        let manager = Self {
            id: order_manager_id.into(),
            uuid: Uuid::new_v4(),
            store,
            orders: Vec::new(),
            by_uuid: HashMap::new(),
            market_state: HashMap::new(),
        };
        info!(id = %manager.id, "order manager initialized");
        manager
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Register a new order. The uuid must not already be known.
    pub fn new_order(&mut self, order: Order) -> EngineResult<Uuid> {
        let uuid = order.uuid();
        if self.by_uuid.contains_key(&uuid) {
            return Err(EngineError::DuplicateOrder(uuid));
        }
        self.by_uuid.insert(uuid, self.orders.len());
        self.orders.push(order);
        Ok(uuid)
    }

    pub fn order(&self, uuid: Uuid) -> EngineResult<&Order> {
        self.by_uuid
            .get(&uuid)
            .map(|&i| &self.orders[i])
            .ok_or(EngineError::UnknownOrder(uuid))
    }

    /// Mutable access for fill bookkeeping. State, booked, closed, and
    /// portfolio fields must still go through the dedicated methods.
    pub(crate) fn order_mut(&mut self, uuid: Uuid) -> EngineResult<&mut Order> {
        self.by_uuid
            .get(&uuid)
            .map(|&i| &mut self.orders[i])
            .ok_or(EngineError::UnknownOrder(uuid))
    }

    /// Change the order state through the transition table. A no-op when the
    /// target equals the current state.
    pub fn change_state(&mut self, uuid: Uuid, state: OrderState) -> EngineResult<()> {
        let order = self.order_mut(uuid)?;
        if order.state() == state {
            return Ok(());
        }
        order.set_state(state)
    }

    /// Flip closed to true. Only legal once the state is a closed state.
    pub fn close_order(&mut self, uuid: Uuid) -> EngineResult<()> {
        let order = self.order_mut(uuid)?;
        if !order.state().is_closed() {
            return Err(EngineError::NotClosedState(order.state()));
        }
        order.set_closed()
    }

    /// Lodge a replace request: append to the order's replace log and move
    /// it to REPLACE_REQUESTED. A replace against a closed order is ignored
    /// with a log entry.
    pub fn replace_order(
        &mut self,
        uuid: Uuid,
        quantity: Option<Decimal>,
        details: Option<OrderDetails>,
    ) -> EngineResult<()> {
        let order = self.order_mut(uuid)?;
        if order.closed() {
            info!(%uuid, "replace on closed order ignored");
            return Ok(());
        }
        order.replace(quantity, details);
        self.change_state(uuid, OrderState::ReplaceRequested)
    }

    pub fn set_booked(&mut self, uuid: Uuid, booked: bool) -> EngineResult<()> {
        self.order_mut(uuid)?.set_booked(booked);
        Ok(())
    }

    /// Stamp the owning portfolio onto an order, write-once
    pub fn add_portfolio(
        &mut self,
        uuid: Uuid,
        portfolio_uuid: Uuid,
        portfolio_id: &str,
    ) -> EngineResult<()> {
        self.order_mut(uuid)?.set_portfolio(portfolio_uuid, portfolio_id)
    }

    /// Orders matching the filter, in insertion order
    pub fn orders_list(&self, filter: &OrderFilter) -> Vec<Uuid> {
        self.orders
            .iter()
            .filter(|o| filter.matches(o))
            .map(|o| o.uuid())
            .collect()
    }

    /// Order references matching the filter, in insertion order
    pub fn orders(&self, filter: &OrderFilter) -> Vec<&Order> {
        self.orders.iter().filter(|o| filter.matches(o)).collect()
    }

    /// Flattened snapshot rows for the filter, sorted by create timestamp
    pub fn orders_snapshot(&self, filter: &OrderFilter) -> Vec<OrderSnapshotRow> {
        let mut rows: Vec<OrderSnapshotRow> = self
            .orders
            .iter()
            .filter(|o| filter.matches(o))
            .map(|o| o.snapshot_row())
            .collect();
        rows.sort_by_key(|r| r.create_timestamp);
        rows
    }

    pub fn open_orders(&self, filter: &OrderFilter) -> Vec<Uuid> {
        let mut filter = filter.clone();
        filter.states = Some(OrderState::OPEN.to_vec());
        self.orders_list(&filter)
    }

    pub fn closed_orders(&self, filter: &OrderFilter) -> Vec<Uuid> {
        let mut filter = filter.clone();
        filter.states = Some(OrderState::CLOSED.to_vec());
        self.orders_list(&filter)
    }

    /// Filled or partially filled orders whose fills have not been booked
    pub fn to_be_booked_list(&self) -> Vec<Uuid> {
        self.orders_list(
            &OrderFilter::new()
                .states([OrderState::Filled, OrderState::PartiallyFilled])
                .booked(false),
        )
    }

    /// CANCELED orders that have not yet been marked closed
    pub fn cancels_to_process(&self) -> Vec<Uuid> {
        self.orders_list(&OrderFilter::new().state(OrderState::Canceled).closed(false))
    }

    /// Current market state for a product type. Reading before the state was
    /// ever set is an error.
    pub fn market_state(&self, product_type: ProductType) -> EngineResult<bool> {
        self.market_state
            .get(&product_type)
            .copied()
            .ok_or(EngineError::UnknownMarket(product_type))
    }

    pub fn set_market_state(&mut self, product_type: ProductType, open: bool) {
        info!(%product_type, open, "market state changed");
        self.market_state.insert(product_type, open);
    }

    /// Persist the orders snapshot. The registry is kept.
    pub fn stop(&mut self, datetime: DateTime<Utc>) -> EngineResult<()> {
        info!(id = %self.id, "order manager stop");
        self.save_orders(datetime)
    }

    /// Persist the orders snapshot, then clear the registry for the next day
    pub fn end_of_day(&mut self, datetime: DateTime<Utc>) -> EngineResult<()> {
        info!(id = %self.id, "order manager end of day");
        self.save_orders(datetime)?;
        self.orders.clear();
        self.by_uuid.clear();
        Ok(())
    }

    fn save_orders(&self, datetime: DateTime<Utc>) -> EngineResult<()> {
        let rows = self.orders_snapshot(&OrderFilter::new());
        self.store.insert_orders(&self.id, datetime, &rows)?;
        Ok(())
    }
}
