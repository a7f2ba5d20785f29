//! Paper broker
//!
//! Transport and id-assigner between the order manager and the paper
//! exchange. Sends risk-accepted orders, relays cancel and replace requests,
//! mirrors exchange state back onto the orders, and computes commissions on
//! fills as they arrive.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::exchange::{ExchangeFill, PaperExchange};
use crate::engine::order::{Order, OrderState};
use crate::engine::order_manager::{OrderFilter, OrderManager};
use crate::errors::{EngineError, EngineResult};
use crate::types::ProductType;

/// Tunable paper broker behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerParameters {
    /// Per-share fee on stock fills, negative for a cost
    pub stock_fee_per_share: Decimal,
}

impl Default for BrokerParameters {
    fn default() -> Self {
        Self {
            stock_fee_per_share: rust_decimal_macros::dec!(-0.01),
        }
    }
}

pub struct PaperBroker {
    broker_id: String,
    uuid: Uuid,
    parameters: BrokerParameters,
    next_order_id: u64,
}

impl PaperBroker {
    pub fn new(broker_id: impl Into<String>, parameters: BrokerParameters) -> Self {
        let broker = Self {
            broker_id: broker_id.into(),
            uuid: Uuid::new_v4(),
            parameters,
            next_order_id: 100,
        };
        info!(id = %broker.broker_id, "paper broker initialized");
        broker
    }

    pub fn broker_id(&self) -> &str {
        &self.broker_id
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn parameters(&self) -> &BrokerParameters {
        &self.parameters
    }

    fn order_id(&mut self) -> u64 {
        let id = self.next_order_id;
        self.next_order_id += 1;
        id
    }

    /// Send a single RISK_ACCEPTED order to the exchange
    pub fn send_order(
        &mut self,
        orders: &mut OrderManager,
        exchange: &mut PaperExchange,
        uuid: Uuid,
    ) -> EngineResult<()> {
        let order = orders.order(uuid)?;
        if order.state() != OrderState::RiskAccepted {
            return Err(EngineError::NotRiskAccepted(order.state()));
        }
        let (product_type, symbol, side, quantity, details) = (
            order.product_type(),
            order.symbol().clone(),
            order.side(),
            order.quantity(),
            order.details(),
        );

        let broker_order_id = self.order_id();
        orders.order_mut(uuid)?.set_broker_order_id(broker_order_id)?;
        info!(%uuid, broker_order_id, "sending order to exchange");
        orders.change_state(uuid, OrderState::Sent)?;

        let exchange_order_id =
            exchange.receive_order(product_type, symbol, side, quantity, details);
        orders.order_mut(uuid)?.set_exchange_order_id(exchange_order_id)
    }

    /// Relay all CANCEL_REQUESTED orders. An order that never reached the
    /// exchange is canceled directly.
    pub fn send_cancel_requested(
        &mut self,
        orders: &mut OrderManager,
        exchange: &mut PaperExchange,
    ) -> EngineResult<()> {
        debug!("sending cancel requests to exchange");
        for uuid in orders.orders_list(&OrderFilter::new().state(OrderState::CancelRequested)) {
            match orders.order(uuid)?.exchange_order_id() {
                Some(exchange_order_id) => {
                    orders.change_state(uuid, OrderState::CancelSent)?;
                    exchange.receive_cancel(exchange_order_id)?;
                }
                None => orders.change_state(uuid, OrderState::Canceled)?,
            }
        }
        Ok(())
    }

    /// Relay all REPLACE_REQUESTED orders. A replace on an order without an
    /// exchange id cannot be honored and is an engine fault.
    pub fn send_replace_requested(
        &mut self,
        orders: &mut OrderManager,
        exchange: &mut PaperExchange,
    ) -> EngineResult<()> {
        debug!("sending replace requests to exchange");
        for uuid in orders.orders_list(&OrderFilter::new().state(OrderState::ReplaceRequested)) {
            let order = orders.order(uuid)?;
            let Some(exchange_order_id) = order.exchange_order_id() else {
                return Err(EngineError::StuckReplace(uuid));
            };
            let (quantity, details) = (order.quantity(), order.details());
            orders.change_state(uuid, OrderState::ReplaceSent)?;
            exchange.receive_replace(exchange_order_id, quantity, details)?;
        }
        Ok(())
    }

    fn send_risk_accepted(
        &mut self,
        orders: &mut OrderManager,
        exchange: &mut PaperExchange,
    ) -> EngineResult<()> {
        debug!("sending risk-accepted orders to exchange");
        for uuid in orders.orders_list(&OrderFilter::new().state(OrderState::RiskAccepted)) {
            self.send_order(orders, exchange, uuid)?;
        }
        Ok(())
    }

    /// Cancels, then replaces, then new risk-accepted orders
    pub fn send_orders(
        &mut self,
        orders: &mut OrderManager,
        exchange: &mut PaperExchange,
    ) -> EngineResult<()> {
        self.send_cancel_requested(orders, exchange)?;
        self.send_replace_requested(orders, exchange)?;
        self.send_risk_accepted(orders, exchange)
    }

    /// Commission for one fill under the broker's fee schedule
    pub fn commission(&self, order: &Order, fill: &ExchangeFill) -> EngineResult<Decimal> {
        match order.product_type() {
            ProductType::Stock => Ok(fill.quantity * self.parameters.stock_fee_per_share),
            other => Err(EngineError::Unsupported(format!(
                "no commission policy for product_type {other}"
            ))),
        }
    }

    /// Copy exchange fills the order has not yet seen onto the Order. When
    /// there is nothing new but the exchange reports FILLED (a replace at or
    /// below the filled quantity), the order is closed here.
    fn process_fills(
        &mut self,
        orders: &mut OrderManager,
        uuid: Uuid,
        exchange: &PaperExchange,
        exchange_order_id: u64,
    ) -> EngineResult<()> {
        let exchange_order = exchange.order(exchange_order_id)?;
        let order = orders.order(uuid)?;

        let new_fills: Vec<(ExchangeFill, Decimal)> = exchange_order
            .fills
            .iter()
            .filter(|fill| !order.has_fill(fill.id))
            .map(|fill| self.commission(order, fill).map(|c| (*fill, c)))
            .collect::<EngineResult<_>>()?;

        if new_fills.is_empty() {
            if orders.order(uuid)?.state() == OrderState::Filled {
                orders.close_order(uuid)?;
            }
            return Ok(());
        }

        for (fill, commission) in new_fills {
            orders.order_mut(uuid)?.add_fill(
                fill.id,
                Utc::now(),
                fill.timestamp,
                fill.quantity,
                fill.price,
                commission,
            );
            orders.set_booked(uuid, false)?;
        }
        Ok(())
    }

    fn update_order_state(
        &mut self,
        orders: &mut OrderManager,
        exchange: &PaperExchange,
        uuid: Uuid,
    ) -> EngineResult<()> {
        let order = orders.order(uuid)?;
        let Some(exchange_order_id) = order.exchange_order_id() else {
            // SENT but the exchange handoff did not record an id
            return Err(EngineError::UnknownOrder(uuid));
        };
        let exchange_state = exchange.order(exchange_order_id)?.state;
        if exchange_state != order.state() {
            orders.change_state(uuid, exchange_state)?;
        }
        if matches!(
            exchange_state,
            OrderState::PartiallyFilled | OrderState::Filled
        ) {
            self.process_fills(orders, uuid, exchange, exchange_order_id)?;
        }
        Ok(())
    }

    /// Reconcile exchange state back into every order that is out at the
    /// exchange.
    pub fn update_order_states(
        &mut self,
        orders: &mut OrderManager,
        exchange: &PaperExchange,
    ) -> EngineResult<()> {
        debug!("getting order states from exchange");
        let uuids = orders.orders_list(&OrderFilter::new().states([
            OrderState::Live,
            OrderState::Sent,
            OrderState::CancelSent,
            OrderState::ReplaceSent,
            OrderState::PartiallyFilled,
        ]));
        for uuid in uuids {
            self.update_order_state(orders, exchange, uuid)?;
        }
        Ok(())
    }
}
