//! Risk validator
//!
//! Stateless per-bar check that admits staged orders and replace requests.
//! Rejections are not errors: a rejected order simply transitions to
//! RISK_REJECTED and is closed, and a rejected replace reverts to the
//! previous replace values so the broker never sees the bad request.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::order::OrderState;
use crate::engine::order_manager::{OrderFilter, OrderManager};
use crate::engine::portfolio::Portfolio;
use crate::errors::EngineResult;

/// Risk limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParameters {
    /// Largest quantity a single order or replace may carry
    pub max_order_quantity: Decimal,
}

impl Default for RiskParameters {
    fn default() -> Self {
        Self {
            max_order_quantity: rust_decimal_macros::dec!(500),
        }
    }
}

pub struct Risk {
    parameters: RiskParameters,
}

impl Risk {
    pub fn new(parameters: RiskParameters) -> Self {
        Self { parameters }
    }

    pub fn parameters(&self) -> &RiskParameters {
        &self.parameters
    }

    /// Run the risk checks on a single order. The market state for the
    /// order's product type must have been set.
    pub fn process_order(&self, orders: &mut OrderManager, uuid: Uuid) -> EngineResult<()> {
        let order = orders.order(uuid)?;
        let market_open = orders.market_state(order.product_type())?;
        if !market_open {
            info!(%uuid, "market closed, rejecting order");
            orders.change_state(uuid, OrderState::RiskRejected)?;
            return orders.close_order(uuid);
        }

        match orders.order(uuid)?.state() {
            OrderState::Created | OrderState::Staged => {
                if orders.order(uuid)?.quantity() > self.parameters.max_order_quantity {
                    info!(%uuid, "quantity over limit, rejecting order");
                    orders.change_state(uuid, OrderState::RiskRejected)?;
                    orders.close_order(uuid)?;
                } else {
                    orders.change_state(uuid, OrderState::RiskAccepted)?;
                }
            }
            OrderState::ReplaceRequested => {
                if orders.order(uuid)?.quantity() > self.parameters.max_order_quantity {
                    info!(%uuid, "replace quantity over limit, rejecting replace");
                    orders.change_state(uuid, OrderState::ReplaceRejected)?;
                    self.revert_replace(orders, uuid)?;
                }
                // an accepted replace stays REPLACE_REQUESTED for the broker
            }
            // LIVE, SENT, and the rest are none of risk's business
            _ => {}
        }
        Ok(())
    }

    /// Restore the order to its previous replace values. The order ends
    /// back in REPLACE_REQUESTED carrying quantities the broker may send.
    fn revert_replace(&self, orders: &mut OrderManager, uuid: Uuid) -> EngineResult<()> {
        let prior = {
            let replaces = orders.order(uuid)?.replaces();
            if replaces.len() < 2 {
                return Ok(());
            }
            replaces[replaces.len() - 2].clone()
        };
        orders.replace_order(uuid, Some(prior.quantity), Some(prior.details))
    }

    /// Risk-check a portfolio's staged orders and replace requests
    pub fn process_portfolio_orders(
        &self,
        orders: &mut OrderManager,
        portfolio: &Portfolio,
    ) -> EngineResult<()> {
        debug!(portfolio = %portfolio.id(), "risk checking portfolio orders");
        let uuids = orders.orders_list(
            &OrderFilter::new()
                .portfolio_uuid(portfolio.uuid())
                .states([OrderState::Staged, OrderState::ReplaceRequested]),
        );
        for uuid in uuids {
            self.process_order(orders, uuid)?;
        }
        Ok(())
    }
}
