//! Event processor
//!
//! Drives the per-bar cycle and the day boundaries across every component:
//! market data update, PnL, exchange matching (simulation), broker
//! reconciliation, cancel and fill delivery, strategy callbacks, intent and
//! order processing, risk, order dispatch, and the end-of-bar stuck-order
//! assertion. Owns the whole arena: strategies and portfolios live here and
//! orders refer to them by id only.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};
use uuid::Uuid;

use crate::calendar::TradingCalendar;
use crate::engine::broker::PaperBroker;
use crate::engine::exchange::PaperExchange;
use crate::engine::order::{group_by_originator, OrderState};
use crate::engine::order_manager::{OrderFilter, OrderManager};
use crate::engine::portfolio::Portfolio;
use crate::engine::position_manager::{EodMetric, PositionManager};
use crate::engine::risk::Risk;
use crate::engine::strategy::{SetupContext, Strategy, StrategyContext, StrategyMeta};
use crate::errors::{EngineError, EngineResult};
use crate::market_data::MarketData;
use crate::types::{parse_frequency, ProductType, DAILY_FREQUENCY};

pub struct EventProcessor {
    strategy_metas: Vec<StrategyMeta>,
    behaviors: Vec<Box<dyn Strategy>>,
    portfolios: Vec<Portfolio>,
    risk: Risk,
    order_manager: OrderManager,
    position_manager: PositionManager,
    broker: PaperBroker,
    exchange: PaperExchange,
    simulation: bool,
    market_data: Box<dyn MarketData>,
    calendar: Box<dyn TradingCalendar>,
    live_frequency: String,
}

impl EventProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        order_manager: OrderManager,
        position_manager: PositionManager,
        risk: Risk,
        broker: PaperBroker,
        exchange: PaperExchange,
        market_data: Box<dyn MarketData>,
        calendar: Box<dyn TradingCalendar>,
        live_frequency: impl Into<String>,
    ) -> Self {
        info!("initializing event processor");
        Self {
            strategy_metas: Vec::new(),
            behaviors: Vec::new(),
            portfolios: Vec::new(),
            risk,
            order_manager,
            position_manager,
            broker,
            exchange,
            simulation: true,
            market_data,
            calendar,
            live_frequency: live_frequency.into(),
        }
    }

    /// When false, the exchange matching loop and market-close cancels are
    /// assumed to happen outside this process.
    pub fn set_simulation(&mut self, simulation: bool) {
        self.simulation = simulation;
    }

    // -------------------------------------------------------------------------
    // setup
    // -------------------------------------------------------------------------

    pub fn add_portfolio(&mut self, portfolio_id: &str) {
        if !self.portfolios.iter().any(|p| p.id() == portfolio_id) {
            self.portfolios
                .push(Portfolio::new(portfolio_id, &self.live_frequency));
        }
    }

    /// Register a strategy under a portfolio. Runs the strategy's
    /// on_initialize so it can register its symbols.
    pub fn add_strategy(
        &mut self,
        strategy_id: &str,
        portfolio_id: &str,
        mut behavior: Box<dyn Strategy>,
    ) -> EngineResult<()> {
        if !self.portfolios.iter().any(|p| p.id() == portfolio_id) {
            return Err(EngineError::Unsupported(format!(
                "portfolio {portfolio_id} has not been added"
            )));
        }
        let mut meta = StrategyMeta::new(strategy_id, portfolio_id);
        {
            let mut setup = SetupContext::new(&mut meta, self.market_data.as_mut());
            behavior.on_initialize(&mut setup)?;
        }
        self.portfolios
            .iter_mut()
            .find(|p| p.id() == portfolio_id)
            .expect("portfolio exists")
            .add_strategy(strategy_id);
        self.strategy_metas.push(meta);
        self.behaviors.push(behavior);
        Ok(())
    }

    pub fn add_eod_metric(&mut self, metric_id: &str, metric: Box<dyn EodMetric>) {
        self.position_manager.add_eod_metric(metric_id, metric);
    }

    /// Product types registered across all strategies
    pub fn product_types(&self) -> Vec<ProductType> {
        let set: BTreeSet<ProductType> = self
            .strategy_metas
            .iter()
            .flat_map(|meta| meta.product_types())
            .collect();
        set.into_iter().collect()
    }

    /// The shortest registered frequency, the event-loop increment
    pub fn min_frequency(&self) -> Option<String> {
        self.strategy_metas
            .iter()
            .flat_map(|meta| meta.frequencies())
            .filter_map(|f| parse_frequency(f).map(|d| (d, f.to_string())))
            .min_by_key(|(duration, _)| *duration)
            .map(|(_, frequency)| frequency)
    }

    // -------------------------------------------------------------------------
    // component access
    // -------------------------------------------------------------------------

    pub fn order_manager(&self) -> &OrderManager {
        &self.order_manager
    }

    pub fn order_manager_mut(&mut self) -> &mut OrderManager {
        &mut self.order_manager
    }

    pub fn position_manager(&self) -> &PositionManager {
        &self.position_manager
    }

    pub fn portfolios(&self) -> &[Portfolio] {
        &self.portfolios
    }

    pub fn exchange(&self) -> &PaperExchange {
        &self.exchange
    }

    pub fn market_data(&self) -> &dyn MarketData {
        self.market_data.as_ref()
    }

    pub fn set_bartime(&mut self, bartime: chrono::DateTime<chrono::Utc>) -> EngineResult<()> {
        self.market_data.set_bartime(bartime)
    }

    // -------------------------------------------------------------------------
    // dispatch
    // -------------------------------------------------------------------------

    /// Run a callback for every strategy with a fully wired context
    fn dispatch<F>(&mut self, mut callback: F) -> EngineResult<()>
    where
        F: FnMut(&mut Box<dyn Strategy>, &mut StrategyContext<'_>) -> EngineResult<()>,
    {
        let bartime = self.market_data.bartime();
        let Self {
            strategy_metas,
            behaviors,
            portfolios,
            order_manager,
            position_manager,
            market_data,
            ..
        } = self;
        for (meta, behavior) in strategy_metas.iter().zip(behaviors.iter_mut()) {
            let portfolio = portfolios
                .iter_mut()
                .find(|p| p.id() == meta.portfolio_id())
                .expect("strategy is attached to a known portfolio");
            let mut ctx = StrategyContext::new(
                meta,
                bartime,
                &mut *order_manager,
                portfolio,
                &*position_manager,
                market_data.as_ref(),
            );
            callback(behavior, &mut ctx)?;
        }
        Ok(())
    }

    /// Start every strategy: on_start callbacks, then lock registrations
    pub fn start(&mut self) -> EngineResult<()> {
        info!("starting strategies");
        self.dispatch(|behavior, ctx| behavior.on_start(ctx))?;
        for meta in &mut self.strategy_metas {
            meta.mark_started();
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // per-bar cycle
    // -------------------------------------------------------------------------

    /// Deliver canceled orders to their originating strategies, then mark
    /// them closed. Portfolio-originated cancels are closed without
    /// delivery; the intent engine already observed them.
    pub fn process_cancels(&mut self) -> EngineResult<()> {
        debug!("processing cancels");
        let filter = OrderFilter::new().state(OrderState::Canceled).closed(false);
        let cancels = self.order_manager.orders_list(&filter);
        let buckets: BTreeMap<String, Vec<Uuid>> =
            group_by_originator(self.order_manager.orders(&filter));

        self.dispatch(|behavior, ctx| {
            let key = format!("strategy.{}", ctx.strategy_id());
            match buckets.get(&key) {
                Some(bucket) => behavior.on_cancels(ctx, bucket),
                None => Ok(()),
            }
        })?;

        for uuid in cancels {
            self.order_manager.close_order(uuid)?;
        }
        Ok(())
    }

    /// Book all unbooked fills into the position book, then deliver the
    /// booked orders to their originating strategies.
    pub fn process_fills(&mut self) -> EngineResult<()> {
        debug!("processing fills");
        let booked = self.position_manager.book_fills(&mut self.order_manager)?;
        self.dispatch(|behavior, ctx| {
            let key = format!("strategy.{}", ctx.strategy_id());
            match booked.get(&key) {
                Some(bucket) => behavior.on_fills(ctx, bucket),
                None => Ok(()),
            }
        })
    }

    /// No order may be left mid-staging at the end of a bar
    pub fn check_stuck_orders(&mut self) -> EngineResult<()> {
        debug!("checking for stuck orders");
        for state in [
            OrderState::Created,
            OrderState::Staged,
            OrderState::RiskAccepted,
        ] {
            let stuck = self
                .order_manager
                .orders_list(&OrderFilter::new().state(state));
            if !stuck.is_empty() {
                return Err(EngineError::StuckOrder {
                    state,
                    count: stuck.len(),
                });
            }
        }
        Ok(())
    }

    /// Process one bar at the current bartime
    pub fn process_bar(
        &mut self,
        product_types: &[ProductType],
        frequency: &str,
    ) -> EngineResult<()> {
        let bartime = self.market_data.bartime();
        info!(%bartime, frequency, "processing bar");
        for product_type in product_types {
            self.market_data.update(*product_type, frequency, None)?;
        }

        // pre-exchange PnL so strategies can see it even before fills
        self.position_manager
            .update_pnl(self.market_data.as_mut(), self.calendar.as_ref())?;

        // in simulation the exchange matches here; in production it is
        // matching continuously on its own
        if self.simulation {
            self.exchange.process_orders(self.market_data.as_ref())?;
        }

        self.broker
            .update_order_states(&mut self.order_manager, &self.exchange)?;

        self.process_cancels()?;
        self.process_fills()?;
        self.position_manager
            .update_pnl(self.market_data.as_mut(), self.calendar.as_ref())?;

        self.dispatch(|behavior, ctx| behavior.on_bar(ctx))?;

        let Self {
            portfolios,
            order_manager,
            position_manager,
            market_data,
            strategy_metas,
            risk,
            ..
        } = self;
        for portfolio in portfolios.iter_mut() {
            portfolio.process_orders(
                order_manager,
                position_manager,
                market_data.as_ref(),
                strategy_metas,
            )?;
            risk.process_portfolio_orders(order_manager, portfolio)?;
        }

        self.broker
            .send_orders(&mut self.order_manager, &mut self.exchange)?;

        self.check_stuck_orders()
    }

    // -------------------------------------------------------------------------
    // day boundaries
    // -------------------------------------------------------------------------

    pub fn market_open(&mut self, product_types: &[ProductType]) -> EngineResult<()> {
        info!("running market open");
        for product_type in product_types {
            self.order_manager.set_market_state(*product_type, true);
        }
        self.dispatch(|behavior, ctx| behavior.on_market_open(ctx))
    }

    /// Market close: cancel what remains on the exchange, reconcile, deliver
    /// cancels, then assert no open orders survive the close.
    pub fn market_close(&mut self, product_types: &[ProductType]) -> EngineResult<()> {
        info!("running market close");
        for product_type in product_types {
            self.order_manager.set_market_state(*product_type, false);
        }

        if self.simulation {
            let bartime = self.market_data.bartime();
            self.exchange.market_close(bartime);
        }
        self.broker
            .update_order_states(&mut self.order_manager, &self.exchange)?;
        self.process_cancels()?;

        // the market is closed: anything these callbacks create will be
        // risk-rejected next bar
        self.dispatch(|behavior, ctx| behavior.on_market_close(ctx))?;

        let open = self
            .order_manager
            .orders_list(&OrderFilter::new().states(OrderState::OPEN));
        if !open.is_empty() {
            return Err(EngineError::ResidualOpenOrders(open.len()));
        }
        Ok(())
    }

    pub fn begin_of_day(&mut self) -> EngineResult<()> {
        info!("running begin of day");
        self.position_manager
            .begin_of_day(self.market_data.as_mut(), self.calendar.as_ref())?;
        self.dispatch(|behavior, ctx| behavior.on_begin_of_day(ctx))
    }

    pub fn end_of_day(&mut self, product_types: &[ProductType]) -> EngineResult<()> {
        info!("running end of day");
        for product_type in product_types {
            self.market_data.extend(*product_type, DAILY_FREQUENCY)?;
        }
        self.dispatch(|behavior, ctx| behavior.on_end_of_day(ctx))?;
        self.position_manager.end_of_day(self.market_data.as_ref())?;
        self.order_manager.end_of_day(self.market_data.bartime())
    }

    pub fn stop(&mut self) -> EngineResult<()> {
        info!("running stop");
        self.dispatch(|behavior, ctx| behavior.on_stop(ctx))?;
        self.position_manager
            .stop(self.market_data.as_mut(), self.calendar.as_ref())?;
        self.order_manager.stop(self.market_data.bartime())
    }
}
