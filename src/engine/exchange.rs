//! Paper exchange
//!
//! In-memory matching engine for LIMIT orders over bar OHLCV, used with the
//! paper broker in simulation. Orders live in insertion-ordered open/closed
//! books keyed by exchange order id; cancels and replaces received from the
//! broker take effect on the next matching pass, in the order submitted.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::engine::order::{OrderDetails, OrderState, ReplaceRecord};
use crate::errors::{EngineError, EngineResult};
use crate::market_data::MarketData;
use crate::types::{ProductType, Side, Symbol};

/// Exchange-side fill record
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExchangeFill {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub quantity: Decimal,
    pub price: Decimal,
}

/// Exchange-internal mirror of an order
#[derive(Debug, Clone)]
pub struct ExchangeOrder {
    pub order_id: u64,
    pub product_type: ProductType,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    pub details: OrderDetails,
    pub state: OrderState,
    pub fill_quantity: Option<Decimal>,
    pub fill_price: Option<Decimal>,
    pub fills: Vec<ExchangeFill>,
    pub replaces: Vec<ReplaceRecord>,
    pub close_bar_timestamp: Option<DateTime<Utc>>,
}

impl ExchangeOrder {
    fn remaining(&self) -> Decimal {
        self.quantity - self.fill_quantity.unwrap_or(Decimal::ZERO)
    }
}

/// Tunable paper exchange behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeParameters {
    /// Fraction of the bar's volume available to fill a single order
    pub fill_multiplier: Decimal,
}

impl Default for ExchangeParameters {
    fn default() -> Self {
        Self {
            fill_multiplier: rust_decimal_macros::dec!(0.5),
        }
    }
}

pub struct PaperExchange {
    live_frequency: String,
    parameters: ExchangeParameters,
    open: BTreeMap<u64, ExchangeOrder>,
    closed: BTreeMap<u64, ExchangeOrder>,
    next_order_id: u64,
    next_fill_id: u64,
}

impl PaperExchange {
    pub fn new(live_frequency: impl Into<String>, parameters: ExchangeParameters) -> Self {
        let exchange = Self {
            live_frequency: live_frequency.into(),
            parameters,
            open: BTreeMap::new(),
            closed: BTreeMap::new(),
            next_order_id: 1,
            next_fill_id: 1,
        };
        info!(frequency = %exchange.live_frequency, "paper exchange initialized");
        exchange
    }

    pub fn live_frequency(&self) -> &str {
        &self.live_frequency
    }

    pub fn parameters(&self) -> &ExchangeParameters {
        &self.parameters
    }

    /// Receive an order from a broker; returns the exchange order id
    pub fn receive_order(
        &mut self,
        product_type: ProductType,
        symbol: Symbol,
        side: Side,
        quantity: Decimal,
        details: OrderDetails,
    ) -> u64 {
        let order_id = self.next_order_id;
        self.next_order_id += 1;
        self.open.insert(
            order_id,
            ExchangeOrder {
                order_id,
                product_type,
                symbol,
                side,
                quantity,
                details,
                state: OrderState::Live,
                fill_quantity: None,
                fill_price: None,
                fills: Vec::new(),
                replaces: vec![ReplaceRecord { quantity, details }],
                close_bar_timestamp: None,
            },
        );
        info!(order_id, "order received");
        order_id
    }

    /// Receive a cancel request. A cancel for an already-closed order is
    /// ignored; the broker will observe the closed state instead.
    pub fn receive_cancel(&mut self, order_id: u64) -> EngineResult<()> {
        info!(order_id, "cancel request received");
        if self.closed.contains_key(&order_id) {
            return Ok(());
        }
        let order = self
            .open
            .get_mut(&order_id)
            .ok_or(EngineError::UnknownExchangeOrder(order_id))?;
        order.state = OrderState::CancelSent;
        Ok(())
    }

    /// Receive a replace request. A replace for an already-closed order is
    /// ignored with a log entry, not an error.
    pub fn receive_replace(
        &mut self,
        order_id: u64,
        quantity: Decimal,
        details: OrderDetails,
    ) -> EngineResult<()> {
        info!(order_id, %quantity, ?details, "replace request received");
        if self.closed.contains_key(&order_id) {
            debug!(order_id, "replace on closed order ignored");
            return Ok(());
        }
        let order = self
            .open
            .get_mut(&order_id)
            .ok_or(EngineError::UnknownExchangeOrder(order_id))?;
        order.state = OrderState::ReplaceSent;
        order.replaces.push(ReplaceRecord { quantity, details });
        Ok(())
    }

    /// Run the matching loop over all open orders in insertion order
    pub fn process_orders(&mut self, market_data: &dyn MarketData) -> EngineResult<()> {
        debug!("processing orders");
        let order_ids: Vec<u64> = self.open.keys().copied().collect();
        for order_id in order_ids {
            if self.open.contains_key(&order_id) {
                self.process_order(order_id, market_data)?;
            }
        }
        Ok(())
    }

    fn process_order(&mut self, order_id: u64, market_data: &dyn MarketData) -> EngineResult<()> {
        let bartime = market_data.bartime();
        match self.open[&order_id].state {
            OrderState::CancelSent => {
                self.cancel_order(order_id, bartime);
                return Ok(());
            }
            OrderState::ReplaceSent => self.replace_order(order_id, bartime),
            _ => {}
        }

        let Some(order) = self.open.get(&order_id) else {
            // the replace collapsed the order to FILLED
            return Ok(());
        };
        if !matches!(order.state, OrderState::Live | OrderState::PartiallyFilled) {
            return Ok(());
        }

        let OrderDetails::Limit { price } = order.details;
        let bar = market_data.current_bar(order.product_type, &order.symbol, &self.live_frequency);
        let Some(bar) = bar else {
            debug!(order_id, "no current bar, order not processed");
            return Ok(());
        };

        let crossed = match order.side {
            Side::Buy => bar.low.map_or(false, |low| low < price),
            Side::Sell => bar.high.map_or(false, |high| high > price),
        };
        if !crossed {
            return Ok(());
        }

        let quantity = self.fill_quantity(order, bar.volume);
        if quantity > Decimal::ZERO {
            self.fill_order(order_id, quantity, bartime);
        }
        Ok(())
    }

    /// Fillable quantity for one bar: the remaining quantity capped at the
    /// bar's volume scaled by the fill multiplier, rounded down.
    fn fill_quantity(&self, order: &ExchangeOrder, volume: Option<Decimal>) -> Decimal {
        let Some(volume) = volume else {
            return Decimal::ZERO;
        };
        order
            .remaining()
            .min(volume * self.parameters.fill_multiplier)
            .floor()
    }

    /// Apply a fill, updating the volume-weighted average fill price, and
    /// close the order when it is complete.
    fn fill_order(&mut self, order_id: u64, fill_quantity: Decimal, timestamp: DateTime<Utc>) {
        let fill_id = self.next_fill_id;
        self.next_fill_id += 1;

        let order = self.open.get_mut(&order_id).expect("order is open");
        let price = order.details.price();
        order.fills.push(ExchangeFill {
            id: fill_id,
            timestamp,
            quantity: fill_quantity,
            price,
        });

        order.fill_price = Some(match (order.fill_price, order.fill_quantity) {
            (Some(avg), Some(total)) => {
                (avg * total + price * fill_quantity) / (total + fill_quantity)
            }
            _ => price,
        });
        order.fill_quantity =
            Some(order.fill_quantity.unwrap_or(Decimal::ZERO) + fill_quantity);

        info!(order_id, fill_id, %fill_quantity, %price, "order fill");
        if order.fill_quantity.unwrap_or(Decimal::ZERO) >= order.quantity {
            self.make_filled(order_id, timestamp);
        } else {
            order.state = OrderState::PartiallyFilled;
        }
    }

    fn make_filled(&mut self, order_id: u64, timestamp: DateTime<Utc>) {
        let mut order = self.open.remove(&order_id).expect("order is open");
        order.state = OrderState::Filled;
        order.close_bar_timestamp = Some(timestamp);
        self.closed.insert(order_id, order);
    }

    fn cancel_order(&mut self, order_id: u64, timestamp: DateTime<Utc>) {
        let mut order = self.open.remove(&order_id).expect("order is open");
        order.state = OrderState::Canceled;
        order.close_bar_timestamp = Some(timestamp);
        self.closed.insert(order_id, order);
        info!(order_id, "order canceled");
    }

    /// Apply the latest replace request. A replace at or below the filled
    /// quantity collapses the order to FILLED, otherwise it returns to LIVE.
    fn replace_order(&mut self, order_id: u64, timestamp: DateTime<Utc>) {
        let order = self.open.get_mut(&order_id).expect("order is open");
        let replacement = order.replaces.last().expect("replace log is never empty").clone();
        order.quantity = replacement.quantity;
        order.details = replacement.details;

        let filled = order.fill_quantity.unwrap_or(Decimal::ZERO);
        if filled > Decimal::ZERO && filled >= order.quantity {
            self.make_filled(order_id, timestamp);
        } else {
            order.state = OrderState::Live;
        }
        info!(order_id, "order replaced");
    }

    /// Look up an order by exchange id in the open then closed books
    pub fn order(&self, order_id: u64) -> EngineResult<&ExchangeOrder> {
        self.open
            .get(&order_id)
            .or_else(|| self.closed.get(&order_id))
            .ok_or(EngineError::UnknownExchangeOrder(order_id))
    }

    pub fn open_orders(&self) -> impl Iterator<Item = &ExchangeOrder> {
        self.open.values()
    }

    pub fn closed_orders(&self) -> impl Iterator<Item = &ExchangeOrder> {
        self.closed.values()
    }

    /// Market close: cancel every open order with the closing timestamp
    pub fn market_close(&mut self, timestamp: DateTime<Utc>) {
        info!("canceling open orders at market close");
        let order_ids: Vec<u64> = self.open.keys().copied().collect();
        for order_id in order_ids {
            self.cancel_order(order_id, timestamp);
        }
    }
}
