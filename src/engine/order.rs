//! Order value type and its state machine
//!
//! An order has immutable identity (uuid, originator, instrument) and a
//! mutable state driven through a fixed transition table. State history,
//! fills, and replace requests are append-only logs on the order. All
//! mutation of state, booked, closed, and portfolio fields must go through
//! the OrderManager so its registry stays consistent.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::info;
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};
use crate::types::{ProductType, Side, Symbol};

/// Order lifecycle states.
///
/// Open states advance monotonically along the linear prefix
/// CREATED → STAGED → RISK_ACCEPTED → SENT → LIVE → CANCEL_REQUESTED; the
/// cancel/replace/partial-fill cluster is mutually reachable; replace states
/// may also fall back to LIVE. Any open state may jump to any closed state.
/// Closed states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    Created,
    Staged,
    RiskAccepted,
    Sent,
    Live,
    CancelRequested,
    CancelSent,
    ReplaceRequested,
    ReplaceRejected,
    ReplaceSent,
    PartiallyFilled,
    RiskRejected,
    Rejected,
    Filled,
    Canceled,
}

impl OrderState {
    /// All open states, in transition order
    pub const OPEN: [OrderState; 11] = [
        OrderState::Created,
        OrderState::Staged,
        OrderState::RiskAccepted,
        OrderState::Sent,
        OrderState::Live,
        OrderState::CancelRequested,
        OrderState::CancelSent,
        OrderState::ReplaceRequested,
        OrderState::ReplaceRejected,
        OrderState::ReplaceSent,
        OrderState::PartiallyFilled,
    ];

    /// All closed (terminal) states
    pub const CLOSED: [OrderState; 4] = [
        OrderState::RiskRejected,
        OrderState::Rejected,
        OrderState::Filled,
        OrderState::Canceled,
    ];

    pub fn is_closed(&self) -> bool {
        Self::CLOSED.contains(self)
    }

    pub fn is_open(&self) -> bool {
        !self.is_closed()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Created => "CREATED",
            OrderState::Staged => "STAGED",
            OrderState::RiskAccepted => "RISK_ACCEPTED",
            OrderState::Sent => "SENT",
            OrderState::Live => "LIVE",
            OrderState::CancelRequested => "CANCEL_REQUESTED",
            OrderState::CancelSent => "CANCEL_SENT",
            OrderState::ReplaceRequested => "REPLACE_REQUESTED",
            OrderState::ReplaceRejected => "REPLACE_REJECTED",
            OrderState::ReplaceSent => "REPLACE_SENT",
            OrderState::PartiallyFilled => "PARTIALLY_FILLED",
            OrderState::RiskRejected => "RISK_REJECTED",
            OrderState::Rejected => "REJECTED",
            OrderState::Filled => "FILLED",
            OrderState::Canceled => "CANCELED",
        }
    }

    fn open_index(&self) -> Option<usize> {
        Self::OPEN.iter().position(|s| s == self)
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The cancel/replace/partial-fill cluster reachable from any of its members
const CLUSTER: [OrderState; 6] = [
    OrderState::CancelRequested,
    OrderState::CancelSent,
    OrderState::ReplaceRequested,
    OrderState::ReplaceRejected,
    OrderState::ReplaceSent,
    OrderState::PartiallyFilled,
];

/// Whether `to` is a legal next state from `from`.
///
/// Transitions out of a closed state are never legal, nor are transitions
/// back to CREATED (it is only the initial state).
pub fn allowable_transition(from: OrderState, to: OrderState) -> bool {
    if from.is_closed() || to == OrderState::Created {
        return false;
    }
    if to.is_closed() {
        return true;
    }
    match from {
        OrderState::Created
        | OrderState::Staged
        | OrderState::RiskAccepted
        | OrderState::Sent
        | OrderState::Live
        | OrderState::CancelRequested => {
            // forward only along the open list
            to.open_index().unwrap_or(0) > from.open_index().unwrap_or(usize::MAX)
        }
        OrderState::CancelSent | OrderState::PartiallyFilled => CLUSTER.contains(&to),
        OrderState::ReplaceRequested | OrderState::ReplaceSent | OrderState::ReplaceRejected => {
            CLUSTER.contains(&to) || to == OrderState::Live
        }
        _ => false,
    }
}

/// Order-type specific details. LIMIT is the only supported type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderDetails {
    Limit { price: Decimal },
}

impl OrderDetails {
    pub fn limit(price: Decimal) -> Self {
        OrderDetails::Limit { price }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OrderDetails::Limit { .. } => "LIMIT",
        }
    }

    pub fn price(&self) -> Decimal {
        match self {
            OrderDetails::Limit { price } => *price,
        }
    }

    /// Details as a flat map for the snapshot projection
    pub fn as_map(&self) -> BTreeMap<String, Decimal> {
        match self {
            OrderDetails::Limit { price } => BTreeMap::from([("price".to_string(), *price)]),
        }
    }
}

/// One fill on an order, keyed by the exchange-provided fill id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub bartime: DateTime<Utc>,
    pub quantity: Decimal,
    pub price: Decimal,
    pub commission: Decimal,
    pub booked: bool,
}

/// One replace request: the quantity and details in force after applying it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaceRecord {
    pub quantity: Decimal,
    pub details: OrderDetails,
}

/// Order object holding all information about an order
#[derive(Debug, Clone)]
pub struct Order {
    uuid: Uuid,
    create_timestamp: DateTime<Utc>,
    originator_uuid: Uuid,
    originator_id: String,
    strategy_uuid: Uuid,
    strategy_id: String,
    portfolio_uuid: Option<Uuid>,
    portfolio_id: Option<String>,
    product_type: ProductType,
    symbol: Symbol,
    side: Side,
    quantity: Decimal,
    details: OrderDetails,
    state: OrderState,
    state_history: Vec<(OrderState, DateTime<Utc>)>,
    closed: bool,
    replaces: Vec<ReplaceRecord>,
    broker_order_id: Option<u64>,
    exchange_order_id: Option<u64>,
    fills: Vec<Fill>,
    fill_price: Option<Decimal>,
    fill_quantity: Option<Decimal>,
    commission: Option<Decimal>,
    booked: Option<bool>,
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        originator_uuid: Uuid,
        originator_id: impl Into<String>,
        strategy_uuid: Uuid,
        strategy_id: impl Into<String>,
        product_type: ProductType,
        symbol: Symbol,
        side: Side,
        quantity: Decimal,
        details: OrderDetails,
    ) -> Self {
        let now = Utc::now();
        let order = Self {
            uuid: Uuid::new_v4(),
            create_timestamp: now,
            originator_uuid,
            originator_id: originator_id.into(),
            strategy_uuid,
            strategy_id: strategy_id.into(),
            portfolio_uuid: None,
            portfolio_id: None,
            product_type,
            symbol,
            side,
            quantity,
            details,
            state: OrderState::Created,
            state_history: vec![(OrderState::Created, now)],
            closed: false,
            replaces: vec![ReplaceRecord { quantity, details }],
            broker_order_id: None,
            exchange_order_id: None,
            fills: Vec::new(),
            fill_price: None,
            fill_quantity: None,
            commission: None,
            booked: None,
        };
        info!(
            uuid = %order.uuid,
            originator = %order.originator_id,
            symbol = %order.symbol,
            side = %order.side,
            quantity = %order.quantity,
            "order created"
        );
        order
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn create_timestamp(&self) -> DateTime<Utc> {
        self.create_timestamp
    }

    pub fn originator_uuid(&self) -> Uuid {
        self.originator_uuid
    }

    pub fn originator_id(&self) -> &str {
        &self.originator_id
    }

    pub fn strategy_uuid(&self) -> Uuid {
        self.strategy_uuid
    }

    pub fn strategy_id(&self) -> &str {
        &self.strategy_id
    }

    pub fn portfolio_uuid(&self) -> Option<Uuid> {
        self.portfolio_uuid
    }

    pub fn portfolio_id(&self) -> Option<&str> {
        self.portfolio_id.as_deref()
    }

    pub fn product_type(&self) -> ProductType {
        self.product_type
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn quantity(&self) -> Decimal {
        self.quantity
    }

    pub fn details(&self) -> OrderDetails {
        self.details
    }

    pub fn order_type(&self) -> &'static str {
        self.details.kind()
    }

    pub fn state(&self) -> OrderState {
        self.state
    }

    pub fn state_history(&self) -> &[(OrderState, DateTime<Utc>)] {
        &self.state_history
    }

    pub fn closed(&self) -> bool {
        self.closed
    }

    pub fn replaces(&self) -> &[ReplaceRecord] {
        &self.replaces
    }

    pub fn broker_order_id(&self) -> Option<u64> {
        self.broker_order_id
    }

    pub fn exchange_order_id(&self) -> Option<u64> {
        self.exchange_order_id
    }

    pub fn fills(&self) -> &[Fill] {
        &self.fills
    }

    pub fn fill_price(&self) -> Option<Decimal> {
        self.fill_price
    }

    pub fn fill_quantity(&self) -> Option<Decimal> {
        self.fill_quantity
    }

    /// Filled quantity treating "never filled" as zero
    pub fn filled_or_zero(&self) -> Decimal {
        self.fill_quantity.unwrap_or(Decimal::ZERO)
    }

    pub fn commission(&self) -> Option<Decimal> {
        self.commission
    }

    pub fn booked(&self) -> Option<bool> {
        self.booked
    }

    /// Single entry point for state changes; validates against the
    /// transition table and appends to the state history.
    pub(crate) fn set_state(&mut self, state: OrderState) -> EngineResult<()> {
        if self.state.is_closed() {
            return Err(EngineError::ClosedOrderMutation);
        }
        if !allowable_transition(self.state, state) {
            return Err(EngineError::IllegalTransition {
                from: self.state,
                to: state,
            });
        }
        self.state = state;
        self.state_history.push((state, Utc::now()));
        info!(uuid = %self.uuid, state = %state, "order state changed");
        Ok(())
    }

    /// Flip closed to true, once. The OrderManager checks the state first.
    pub(crate) fn set_closed(&mut self) -> EngineResult<()> {
        if self.closed {
            return Err(EngineError::ClosedOrderMutation);
        }
        self.closed = true;
        Ok(())
    }

    pub(crate) fn set_booked(&mut self, booked: bool) {
        self.booked = Some(booked);
    }

    pub(crate) fn set_portfolio(&mut self, portfolio_uuid: Uuid, portfolio_id: &str) -> EngineResult<()> {
        if let Some(existing) = self.portfolio_uuid {
            return Err(EngineError::AlreadySet {
                field: "portfolio_uuid",
                current: existing.to_string(),
            });
        }
        if let Some(existing) = &self.portfolio_id {
            return Err(EngineError::AlreadySet {
                field: "portfolio_id",
                current: existing.clone(),
            });
        }
        self.portfolio_uuid = Some(portfolio_uuid);
        self.portfolio_id = Some(portfolio_id.to_string());
        Ok(())
    }

    pub(crate) fn set_broker_order_id(&mut self, id: u64) -> EngineResult<()> {
        if let Some(existing) = self.broker_order_id {
            return Err(EngineError::AlreadySet {
                field: "broker_order_id",
                current: existing.to_string(),
            });
        }
        self.broker_order_id = Some(id);
        Ok(())
    }

    pub(crate) fn set_exchange_order_id(&mut self, id: u64) -> EngineResult<()> {
        if let Some(existing) = self.exchange_order_id {
            return Err(EngineError::AlreadySet {
                field: "exchange_order_id",
                current: existing.to_string(),
            });
        }
        self.exchange_order_id = Some(id);
        Ok(())
    }

    /// Append a fill and update the volume-weighted fill aggregate
    pub(crate) fn add_fill(
        &mut self,
        id: u64,
        timestamp: DateTime<Utc>,
        bartime: DateTime<Utc>,
        quantity: Decimal,
        price: Decimal,
        commission: Decimal,
    ) {
        info!(
            uuid = %self.uuid,
            fill_id = id,
            %quantity,
            %price,
            %commission,
            "add fill"
        );
        self.fills.push(Fill {
            id,
            timestamp,
            bartime,
            quantity,
            price,
            commission,
            booked: false,
        });
        self.fill_price = Some(match (self.fill_price, self.fill_quantity) {
            (Some(avg), Some(total)) => (avg * total + price * quantity) / (total + quantity),
            _ => price,
        });
        self.fill_quantity = Some(self.filled_or_zero() + quantity);
        self.commission = Some(self.commission.unwrap_or(Decimal::ZERO) + commission);
    }

    pub(crate) fn mark_fill_booked(&mut self, fill_id: u64) {
        if let Some(fill) = self.fills.iter_mut().find(|f| f.id == fill_id) {
            fill.booked = true;
        }
    }

    pub fn has_fill(&self, fill_id: u64) -> bool {
        self.fills.iter().any(|f| f.id == fill_id)
    }

    /// Record a replace request. A missing quantity means unchanged, missing
    /// details mean unchanged.
    pub(crate) fn replace(&mut self, quantity: Option<Decimal>, details: Option<OrderDetails>) {
        let quantity = quantity.unwrap_or(self.quantity);
        let details = details.unwrap_or(self.details);
        self.replaces.push(ReplaceRecord { quantity, details });
        self.quantity = quantity;
        self.details = details;
        info!(uuid = %self.uuid, %quantity, ?details, "replace requested");
    }

    /// Flattened projection with the stable snapshot column set
    pub fn snapshot_row(&self) -> OrderSnapshotRow {
        let mut state_times = BTreeMap::new();
        for (state, ts) in &self.state_history {
            state_times.entry(state.as_str().to_string()).or_insert(*ts);
        }
        OrderSnapshotRow {
            originator_id: self.originator_id.clone(),
            strategy_id: self.strategy_id.clone(),
            strategy_uuid: self.strategy_uuid,
            portfolio_id: self.portfolio_id.clone(),
            portfolio_uuid: self.portfolio_uuid,
            quantity: self.quantity,
            event_type: "ORDER".to_string(),
            product_type: self.product_type,
            symbol: self.symbol.clone(),
            buy_sell: self.side,
            order_type: self.order_type().to_string(),
            details: self.details.as_map(),
            state: self.state.as_str().to_string(),
            closed: self.closed,
            uuid: self.uuid,
            create_timestamp: self.create_timestamp,
            fill_price: self.fill_price,
            fill_quantity: self.fill_quantity,
            commission: self.commission,
            booked: self.booked,
            broker_order_id: self.broker_order_id,
            exchange_order_id: self.exchange_order_id,
            state_times,
        }
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Order {} : {} : {} {} {} {} @ {:?}",
            self.uuid,
            self.state,
            self.symbol,
            self.side,
            self.quantity,
            self.order_type(),
            self.details
        )
    }
}

/// Stable flattened order row persisted at EOD and stop, one column per
/// state name carrying the timestamp of first entry into that state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshotRow {
    pub originator_id: String,
    pub strategy_id: String,
    pub strategy_uuid: Uuid,
    pub portfolio_id: Option<String>,
    pub portfolio_uuid: Option<Uuid>,
    pub quantity: Decimal,
    pub event_type: String,
    pub product_type: ProductType,
    pub symbol: Symbol,
    pub buy_sell: Side,
    #[serde(rename = "type")]
    pub order_type: String,
    pub details: BTreeMap<String, Decimal>,
    pub state: String,
    pub closed: bool,
    pub uuid: Uuid,
    pub create_timestamp: DateTime<Utc>,
    pub fill_price: Option<Decimal>,
    pub fill_quantity: Option<Decimal>,
    pub commission: Option<Decimal>,
    pub booked: Option<bool>,
    pub broker_order_id: Option<u64>,
    pub exchange_order_id: Option<u64>,
    #[serde(flatten)]
    pub state_times: BTreeMap<String, DateTime<Utc>>,
}

/// Group a list of order uuids by an attribute of the order
pub fn group_by_originator<'a>(
    orders: impl IntoIterator<Item = &'a Order>,
) -> BTreeMap<String, Vec<Uuid>> {
    use itertools::Itertools;
    orders
        .into_iter()
        .map(|o| (o.originator_id().to_string(), o.uuid()))
        .into_group_map()
        .into_iter()
        .collect()
}
