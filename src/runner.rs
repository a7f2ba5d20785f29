//! Simulation runner
//!
//! The outermost wiring: builds the engine components from a configuration,
//! registers portfolios and strategies, and sequences the event processor
//! over a series of bartimes, inserting the market-open/close and
//! begin/end-of-day boundaries at date changes.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use crate::calendar::TradingCalendar;
use crate::config::EngineConfig;
use crate::engine::{
    EodMetric, EventProcessor, OrderManager, PaperBroker, PaperExchange, PositionManager, Risk,
    Strategy,
};
use crate::errors::{EngineError, EngineResult};
use crate::market_data::MarketData;
use crate::store::Store;
use crate::types::ProductType;

pub struct SimRunner {
    runner_id: String,
    processor: EventProcessor,
}

impl SimRunner {
    /// Wire up an engine writing to the store under `runner_id` as source
    pub fn new(
        runner_id: impl Into<String>,
        market_data: Box<dyn MarketData>,
        store: Arc<dyn Store>,
        calendar: Box<dyn TradingCalendar>,
        config: EngineConfig,
    ) -> Self {
        let runner_id = runner_id.into();
        info!(id = %runner_id, "initializing simulation runner");

        let order_manager = OrderManager::new(runner_id.clone(), store.clone());
        let position_manager =
            PositionManager::new(runner_id.clone(), store, config.live_frequency.clone());
        let risk = Risk::new(config.risk);
        let exchange = PaperExchange::new(config.live_frequency.clone(), config.exchange);
        let broker = PaperBroker::new("paper_broker", config.broker);

        let processor = EventProcessor::new(
            order_manager,
            position_manager,
            risk,
            broker,
            exchange,
            market_data,
            calendar,
            config.live_frequency,
        );
        Self {
            runner_id,
            processor,
        }
    }

    pub fn id(&self) -> &str {
        &self.runner_id
    }

    pub fn processor(&self) -> &EventProcessor {
        &self.processor
    }

    pub fn processor_mut(&mut self) -> &mut EventProcessor {
        &mut self.processor
    }

    pub fn add_portfolio(&mut self, portfolio_id: &str) {
        self.processor.add_portfolio(portfolio_id);
    }

    pub fn add_strategy(
        &mut self,
        strategy_id: &str,
        portfolio_id: &str,
        strategy: Box<dyn Strategy>,
    ) -> EngineResult<()> {
        self.processor.add_strategy(strategy_id, portfolio_id, strategy)
    }

    pub fn add_eod_metric(&mut self, metric_id: &str, metric: Box<dyn EodMetric>) {
        self.processor.add_eod_metric(metric_id, metric);
    }

    /// Run the engine over the bartimes. The first bar of each date opens
    /// the day; a date change closes the prior day first; the final bar is
    /// followed by the stop sequence.
    pub fn run(&mut self, bartimes: &[DateTime<Utc>]) -> EngineResult<()> {
        if bartimes.is_empty() {
            return Ok(());
        }
        self.processor.start()?;

        let product_types: Vec<ProductType> = self.processor.product_types();
        let frequency = self
            .processor
            .min_frequency()
            .ok_or_else(|| EngineError::Unsupported("no frequencies registered".to_string()))?;
        info!(
            start = %bartimes[0],
            end = %bartimes[bartimes.len() - 1],
            frequency,
            "beginning run"
        );

        let mut prior_bar: Option<DateTime<Utc>> = None;
        for &bartime in bartimes {
            match prior_bar {
                None => {
                    self.processor.set_bartime(bartime)?;
                    self.processor.begin_of_day()?;
                    self.processor.market_open(&product_types)?;
                }
                Some(prior) if bartime.date_naive() > prior.date_naive() => {
                    self.processor.market_close(&product_types)?;
                    self.processor.end_of_day(&product_types)?;
                    self.processor.set_bartime(bartime)?;
                    self.processor.begin_of_day()?;
                    self.processor.market_open(&product_types)?;
                }
                _ => self.processor.set_bartime(bartime)?,
            }
            self.processor.process_bar(&product_types, &frequency)?;
            prior_bar = Some(bartime);
        }

        self.processor.stop()
    }
}
