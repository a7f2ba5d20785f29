//! Engine error taxonomy
//!
//! State-machine violations, stuck-order checks, and residual-order checks
//! are fatal: they mean an engine invariant was broken and the runner should
//! terminate. Risk rejections are not errors, they are regular order state
//! transitions.

use crate::engine::order::OrderState;
use crate::types::{ProductType, Symbol};
use thiserror::Error;
use uuid::Uuid;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("state transition from {from} to {to} not allowed")]
    IllegalTransition { from: OrderState, to: OrderState },

    #[error("cannot change state of an order already in a closed state")]
    ClosedOrderMutation,

    #[error("order {0} is already registered in the order manager")]
    DuplicateOrder(Uuid),

    #[error("no order with uuid {0} in the order manager")]
    UnknownOrder(Uuid),

    #[error("no order with exchange order id {0}")]
    UnknownExchangeOrder(u64),

    #[error("market state for product type {0} has not been set")]
    UnknownMarket(ProductType),

    #[error("({product_type}, {symbol}) is not registered with strategy {strategy_id}")]
    NotRegistered {
        strategy_id: String,
        product_type: ProductType,
        symbol: Symbol,
    },

    #[error("only order type LIMIT is supported")]
    UnsupportedOrderType,

    #[error("cannot close order because state {0} is not a closed state")]
    NotClosedState(OrderState),

    #[error("order not in RISK_ACCEPTED state, cannot send (state: {0})")]
    NotRiskAccepted(OrderState),

    #[error("order cannot be booked in state {0}")]
    NotBookable(OrderState),

    #[error("{count} stuck order(s) in {state} state at end of bar")]
    StuckOrder { state: OrderState, count: usize },

    #[error("cannot request replace on order {0} that has not reached the exchange")]
    StuckReplace(Uuid),

    #[error("{0} open order(s) remain in the order manager after market close")]
    ResidualOpenOrders(usize),

    #[error("{field} is already set to {current}, cannot set to a new value")]
    AlreadySet { field: &'static str, current: String },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("no {frequency} bar for ({product_type}, {symbol}) at {context}")]
    MissingBar {
        product_type: ProductType,
        symbol: Symbol,
        frequency: String,
        context: String,
    },

    #[error("bartime cannot regress from {current} to {requested}")]
    BartimeRegression {
        current: chrono::DateTime<chrono::Utc>,
        requested: chrono::DateTime<chrono::Utc>,
    },

    #[error("strategy {0} is already running, cannot modify its setup")]
    AlreadyStarted(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the persistence backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid stored value: {0}")]
    InvalidValue(String),
}
