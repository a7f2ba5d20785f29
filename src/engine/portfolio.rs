//! Portfolio: intent engine and order staging
//!
//! Strategies either create orders directly or declare intents (target
//! position levels). Each bar the portfolio reconciles every intent against
//! the live position and any outstanding intent order, issuing, replacing,
//! or cancel-requesting orders as needed, then stages all freshly created
//! orders for the risk check.

use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::order::{Order, OrderDetails, OrderState};
use crate::engine::order_manager::{OrderFilter, OrderManager};
use crate::engine::position_manager::{PositionKey, PositionManager};
use crate::engine::strategy::StrategyMeta;
use crate::errors::{EngineError, EngineResult};
use crate::market_data::MarketData;
use crate::types::{ProductType, Side, Symbol};

/// One intent row: the declared target (consumed each bar) and the working
/// order serving it, if any.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntentRow {
    pub target: Option<Decimal>,
    pub order: Option<Uuid>,
}

pub struct Portfolio {
    portfolio_id: String,
    uuid: Uuid,
    live_frequency: String,
    strategy_ids: Vec<String>,
    intents: BTreeMap<PositionKey, IntentRow>,
}

impl Portfolio {
    pub fn new(portfolio_id: impl Into<String>, live_frequency: impl Into<String>) -> Self {
        let portfolio = Self {
            portfolio_id: portfolio_id.into(),
            uuid: Uuid::new_v4(),
            live_frequency: live_frequency.into(),
            strategy_ids: Vec::new(),
            intents: BTreeMap::new(),
        };
        info!(id = %portfolio.portfolio_id, "portfolio initialized");
        portfolio
    }

    pub fn id(&self) -> &str {
        &self.portfolio_id
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The originator id this portfolio stamps on intent orders
    pub fn originator_id(&self) -> String {
        format!("portfolio.{}", self.portfolio_id)
    }

    pub fn strategy_ids(&self) -> &[String] {
        &self.strategy_ids
    }

    /// Bind a strategy to this portfolio. Each strategy belongs to exactly
    /// one portfolio.
    pub fn add_strategy(&mut self, strategy_id: impl Into<String>) {
        self.strategy_ids.push(strategy_id.into());
    }

    /// Upsert the intent target for (strategy, product_type, symbol)
    pub fn set_intent(
        &mut self,
        strategy_id: &str,
        product_type: ProductType,
        symbol: Symbol,
        target: Option<Decimal>,
    ) {
        info!(strategy_id, %product_type, %symbol, ?target, "setting intent");
        self.intents
            .entry(PositionKey::new(strategy_id, product_type, symbol))
            .or_default()
            .target = target;
    }

    pub fn get_intent(
        &self,
        strategy_id: &str,
        product_type: ProductType,
        symbol: &Symbol,
    ) -> Option<&IntentRow> {
        self.intents
            .get(&PositionKey::new(strategy_id, product_type, symbol.clone()))
    }

    pub fn intents(&self) -> &BTreeMap<PositionKey, IntentRow> {
        &self.intents
    }

    /// Create an intent order in the order manager; the originator is this
    /// portfolio, the strategy is the intent's owner.
    fn new_order(
        &self,
        orders: &mut OrderManager,
        market_data: &dyn MarketData,
        meta: &StrategyMeta,
        key: &PositionKey,
        trade_to_do: Decimal,
    ) -> EngineResult<Uuid> {
        if !meta.is_registered(key.product_type, &key.symbol) {
            return Err(EngineError::NotRegistered {
                strategy_id: meta.strategy_id().to_string(),
                product_type: key.product_type,
                symbol: key.symbol.clone(),
            });
        }

        let price = market_data
            .last_valid_bar(key.product_type, &key.symbol, &self.live_frequency)
            .and_then(|bar| bar.close)
            .ok_or_else(|| EngineError::MissingBar {
                product_type: key.product_type,
                symbol: key.symbol.clone(),
                frequency: self.live_frequency.clone(),
                context: "intent order price".to_string(),
            })?;
        let side = Side::from_signed(trade_to_do);
        let quantity = trade_to_do.abs();

        info!(
            symbol = %key.symbol,
            %side,
            %quantity,
            %price,
            "creating order from intent"
        );
        let order = Order::new(
            self.uuid,
            self.originator_id(),
            meta.uuid(),
            meta.strategy_id(),
            key.product_type,
            key.symbol.clone(),
            side,
            quantity,
            OrderDetails::limit(price),
        );
        orders.new_order(order)
    }

    /// Cancel-request a working intent order; ignored if already closed
    fn cancel_order(&self, orders: &mut OrderManager, uuid: Uuid) -> EngineResult<()> {
        info!(%uuid, "cancelling intent order");
        if orders.order(uuid)?.closed() {
            debug!(%uuid, "cancel on closed order ignored");
            return Ok(());
        }
        orders.change_state(uuid, OrderState::CancelRequested)
    }

    /// Replace a working intent order's quantity and price so that the
    /// remaining quantity equals the trade to do.
    fn modify_order(
        &self,
        orders: &mut OrderManager,
        market_data: &dyn MarketData,
        key: &PositionKey,
        uuid: Uuid,
        trade_to_do: Decimal,
    ) -> EngineResult<()> {
        let filled = orders.order(uuid)?.filled_or_zero();
        let quantity = trade_to_do.abs() + filled;
        let price = market_data
            .last_valid_bar(key.product_type, &key.symbol, &self.live_frequency)
            .and_then(|bar| bar.close)
            .ok_or_else(|| EngineError::MissingBar {
                product_type: key.product_type,
                symbol: key.symbol.clone(),
                frequency: self.live_frequency.clone(),
                context: "intent replace price".to_string(),
            })?;
        info!(%uuid, %quantity, %price, "modifying intent order");
        orders.replace_order(uuid, Some(quantity), Some(OrderDetails::limit(price)))
    }

    /// Reconcile every intent row against the live position and working
    /// order, then reset all targets to absent.
    pub fn process_intents(
        &mut self,
        orders: &mut OrderManager,
        positions: &PositionManager,
        market_data: &dyn MarketData,
        metas: &[StrategyMeta],
    ) -> EngineResult<()> {
        debug!("processing intents");
        let keys: Vec<PositionKey> = self.intents.keys().cloned().collect();
        for key in keys {
            self.process_intent(orders, positions, market_data, metas, &key)?;
        }
        for row in self.intents.values_mut() {
            row.target = None;
        }
        Ok(())
    }

    fn process_intent(
        &mut self,
        orders: &mut OrderManager,
        positions: &PositionManager,
        market_data: &dyn MarketData,
        metas: &[StrategyMeta],
        key: &PositionKey,
    ) -> EngineResult<()> {
        let row = self.intents.get(key).cloned().unwrap_or_default();
        debug!(strategy = %key.strategy_id, symbol = %key.symbol, "processing intent");

        let Some(target) = row.target else {
            // no intent: take down any working order
            if let Some(uuid) = row.order {
                if orders.order(uuid).is_ok() {
                    self.cancel_order(orders, uuid)?;
                }
                self.intents.get_mut(key).expect("row exists").order = None;
            }
            return Ok(());
        };

        let meta = metas
            .iter()
            .find(|m| m.strategy_id() == key.strategy_id)
            .ok_or_else(|| EngineError::NotRegistered {
                strategy_id: key.strategy_id.clone(),
                product_type: key.product_type,
                symbol: key.symbol.clone(),
            })?;

        let actual = positions.current_position(key).unwrap_or_default();
        let trade_to_do = target - actual;

        // a working order that is gone from the registry (cleared at EOD) or
        // already closed no longer counts as an existing order
        let open_order = row
            .order
            .and_then(|uuid| orders.order(uuid).ok())
            .filter(|order| !order.closed())
            .map(|order| (order.uuid(), order.side()));

        match open_order {
            Some((uuid, _)) if trade_to_do == Decimal::ZERO => {
                self.cancel_order(orders, uuid)?;
                self.intents.get_mut(key).expect("row exists").order = None;
            }
            Some((uuid, side)) => {
                let same_direction = (trade_to_do > Decimal::ZERO && side == Side::Buy)
                    || (trade_to_do < Decimal::ZERO && side == Side::Sell);
                if same_direction {
                    self.modify_order(orders, market_data, key, uuid, trade_to_do)?;
                } else {
                    self.cancel_order(orders, uuid)?;
                    let new_order =
                        self.new_order(orders, market_data, meta, key, trade_to_do)?;
                    self.intents.get_mut(key).expect("row exists").order = Some(new_order);
                }
            }
            None if trade_to_do != Decimal::ZERO => {
                let new_order = self.new_order(orders, market_data, meta, key, trade_to_do)?;
                self.intents.get_mut(key).expect("row exists").order = Some(new_order);
            }
            None => {
                // target met and nothing working; drop any stale closed slot
                if row.order.is_some() {
                    self.intents.get_mut(key).expect("row exists").order = None;
                }
            }
        }
        Ok(())
    }

    /// Process intents, then stage every CREATED order belonging to an
    /// attached strategy, stamping this portfolio onto it.
    pub fn process_orders(
        &mut self,
        orders: &mut OrderManager,
        positions: &PositionManager,
        market_data: &dyn MarketData,
        metas: &[StrategyMeta],
    ) -> EngineResult<()> {
        self.process_intents(orders, positions, market_data, metas)?;
        for strategy_id in &self.strategy_ids {
            debug!(strategy = %strategy_id, "staging created orders");
            let Some(meta) = metas.iter().find(|m| m.strategy_id() == *strategy_id) else {
                continue;
            };
            let created = orders.orders_list(
                &OrderFilter::new()
                    .strategy_uuid(meta.uuid())
                    .state(OrderState::Created),
            );
            for uuid in created {
                orders.add_portfolio(uuid, self.uuid, &self.portfolio_id)?;
                orders.change_state(uuid, OrderState::Staged)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::position_manager::PositionManager;
    use crate::market_data::SimMarketData;
    use crate::store::MemoryStore;
    use crate::types::Bar;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn bartime() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap()
    }

    fn market(close: Decimal) -> SimMarketData {
        let mut md = SimMarketData::new();
        md.load_series(
            ProductType::Stock,
            Symbol::new("AAPL"),
            "1min",
            vec![Bar {
                datetime: bartime(),
                open: Some(close),
                high: Some(close),
                low: Some(close),
                close: Some(close),
                volume: Some(dec!(1000)),
            }],
        );
        md.set_bartime(bartime()).unwrap();
        md
    }

    struct Fixture {
        portfolio: Portfolio,
        orders: OrderManager,
        positions: PositionManager,
        metas: Vec<StrategyMeta>,
    }

    fn fixture() -> Fixture {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let mut portfolio = Portfolio::new("port_test", "1min");
        let mut meta = StrategyMeta::new("TEST1", "port_test");
        // register AAPL directly on the meta
        let mut md = SimMarketData::new();
        let mut setup = crate::engine::strategy::SetupContext::new(&mut meta, &mut md);
        setup
            .add_symbol(ProductType::Stock, "AAPL", "1min")
            .unwrap();
        portfolio.add_strategy("TEST1");
        Fixture {
            portfolio,
            orders: OrderManager::new("unit_test", store.clone()),
            positions: PositionManager::new("pm_test", store, "1min"),
            metas: vec![meta],
        }
    }

    fn process(fixture: &mut Fixture, md: &SimMarketData) {
        fixture
            .portfolio
            .process_intents(&mut fixture.orders, &fixture.positions, md, &fixture.metas)
            .unwrap();
    }

    fn intent_order(fixture: &Fixture) -> Option<Uuid> {
        fixture
            .portfolio
            .get_intent("TEST1", ProductType::Stock, &Symbol::new("AAPL"))
            .and_then(|row| row.order)
    }

    #[test]
    fn new_intent_creates_priced_order() {
        let mut fixture = fixture();
        let md = market(dec!(44.0));
        fixture
            .portfolio
            .set_intent("TEST1", ProductType::Stock, Symbol::new("AAPL"), Some(dec!(100)));
        process(&mut fixture, &md);

        let uuid = intent_order(&fixture).unwrap();
        let order = fixture.orders.order(uuid).unwrap();
        assert_eq!(order.side(), Side::Buy);
        assert_eq!(order.quantity(), dec!(100));
        assert_eq!(order.details().price(), dec!(44.0));
        assert_eq!(order.originator_id(), "portfolio.port_test");
        assert_eq!(order.strategy_id(), "TEST1");
    }

    #[test]
    fn targets_reset_after_processing() {
        let mut fixture = fixture();
        let md = market(dec!(44.0));
        fixture
            .portfolio
            .set_intent("TEST1", ProductType::Stock, Symbol::new("AAPL"), Some(dec!(100)));
        process(&mut fixture, &md);

        for row in fixture.portfolio.intents().values() {
            assert_eq!(row.target, None);
        }
    }

    #[test]
    fn intent_is_idempotent() {
        let mut fixture = fixture();
        let md = market(dec!(44.0));
        // two consecutive identical sets then one process
        fixture
            .portfolio
            .set_intent("TEST1", ProductType::Stock, Symbol::new("AAPL"), Some(dec!(100)));
        fixture
            .portfolio
            .set_intent("TEST1", ProductType::Stock, Symbol::new("AAPL"), Some(dec!(100)));
        process(&mut fixture, &md);

        let all = fixture.orders.orders_list(&OrderFilter::new());
        assert_eq!(all.len(), 1);
        assert_eq!(
            fixture.orders.order(all[0]).unwrap().quantity(),
            dec!(100)
        );
    }

    #[test]
    fn zero_target_with_no_position_does_nothing() {
        let mut fixture = fixture();
        let md = market(dec!(44.0));
        fixture
            .portfolio
            .set_intent("TEST1", ProductType::Stock, Symbol::new("AAPL"), Some(dec!(0)));
        process(&mut fixture, &md);
        assert!(fixture.orders.orders_list(&OrderFilter::new()).is_empty());
    }

    #[test]
    fn zero_target_with_position_sells_it_down() {
        let mut fixture = fixture();
        let md = market(dec!(44.0));
        fixture
            .positions
            .enter_trade(
                "strategy.TEST1",
                "TEST1",
                bartime(),
                ProductType::Stock,
                Symbol::new("AAPL"),
                Side::Buy,
                dec!(100),
                dec!(43.0),
                Decimal::ZERO,
                None,
                None,
            )
            .unwrap();
        fixture
            .portfolio
            .set_intent("TEST1", ProductType::Stock, Symbol::new("AAPL"), Some(dec!(0)));
        process(&mut fixture, &md);

        let uuid = intent_order(&fixture).unwrap();
        let order = fixture.orders.order(uuid).unwrap();
        assert_eq!(order.side(), Side::Sell);
        assert_eq!(order.quantity(), dec!(100));
    }

    #[test]
    fn absent_target_cancels_working_order() {
        let mut fixture = fixture();
        let md = market(dec!(44.0));
        fixture
            .portfolio
            .set_intent("TEST1", ProductType::Stock, Symbol::new("AAPL"), Some(dec!(100)));
        process(&mut fixture, &md);
        let uuid = intent_order(&fixture).unwrap();

        // next bar: no intent set; the working buy is cancel-requested
        process(&mut fixture, &md);
        assert_eq!(
            fixture.orders.order(uuid).unwrap().state(),
            OrderState::CancelRequested
        );
        assert_eq!(intent_order(&fixture), None);
        // and no replacement was created
        assert_eq!(fixture.orders.orders_list(&OrderFilter::new()).len(), 1);
    }

    #[test]
    fn same_direction_intent_replaces_in_place() {
        let mut fixture = fixture();
        let md = market(dec!(44.0));
        fixture
            .portfolio
            .set_intent("TEST1", ProductType::Stock, Symbol::new("AAPL"), Some(dec!(100)));
        process(&mut fixture, &md);
        let uuid = intent_order(&fixture).unwrap();

        let md = market(dec!(45.0));
        fixture
            .portfolio
            .set_intent("TEST1", ProductType::Stock, Symbol::new("AAPL"), Some(dec!(150)));
        process(&mut fixture, &md);

        // same order, replaced with the new quantity and price
        assert_eq!(intent_order(&fixture), Some(uuid));
        let order = fixture.orders.order(uuid).unwrap();
        assert_eq!(order.state(), OrderState::ReplaceRequested);
        assert_eq!(order.quantity(), dec!(150));
        assert_eq!(order.details().price(), dec!(45.0));
    }

    #[test]
    fn opposite_direction_intent_flips_the_order() {
        let mut fixture = fixture();
        let md = market(dec!(44.0));
        fixture
            .portfolio
            .set_intent("TEST1", ProductType::Stock, Symbol::new("AAPL"), Some(dec!(100)));
        process(&mut fixture, &md);
        let buy = intent_order(&fixture).unwrap();

        fixture
            .portfolio
            .set_intent("TEST1", ProductType::Stock, Symbol::new("AAPL"), Some(dec!(-100)));
        process(&mut fixture, &md);

        assert_eq!(
            fixture.orders.order(buy).unwrap().state(),
            OrderState::CancelRequested
        );
        let sell = intent_order(&fixture).unwrap();
        assert_ne!(sell, buy);
        let order = fixture.orders.order(sell).unwrap();
        assert_eq!(order.side(), Side::Sell);
        assert_eq!(order.quantity(), dec!(100));
    }

    #[test]
    fn unregistered_symbol_fails() {
        let mut fixture = fixture();
        let md = market(dec!(44.0));
        fixture
            .portfolio
            .set_intent("TEST1", ProductType::Stock, Symbol::new("MSFT"), Some(dec!(10)));
        let err = fixture
            .portfolio
            .process_intents(&mut fixture.orders, &fixture.positions, &md, &fixture.metas)
            .unwrap_err();
        assert!(matches!(err, EngineError::NotRegistered { .. }));
    }

    #[test]
    fn staging_stamps_portfolio_and_transitions() {
        let mut fixture = fixture();
        let md = market(dec!(44.0));
        let order = Order::new(
            fixture.metas[0].uuid(),
            "strategy.TEST1",
            fixture.metas[0].uuid(),
            "TEST1",
            ProductType::Stock,
            Symbol::new("AAPL"),
            Side::Buy,
            dec!(10),
            OrderDetails::limit(dec!(44.0)),
        );
        let uuid = fixture.orders.new_order(order).unwrap();

        fixture
            .portfolio
            .process_orders(&mut fixture.orders, &fixture.positions, &md, &fixture.metas)
            .unwrap();

        let order = fixture.orders.order(uuid).unwrap();
        assert_eq!(order.state(), OrderState::Staged);
        assert_eq!(order.portfolio_id(), Some("port_test"));
        assert_eq!(order.portfolio_uuid(), Some(fixture.portfolio.uuid()));
    }
}
