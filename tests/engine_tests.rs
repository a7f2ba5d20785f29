//! End-to-end engine scenarios
//!
//! Drives the full runner (event processor, order manager, risk, paper
//! broker and exchange, position manager, portfolio intents) over scripted
//! market data and strategies, covering risk rejection, partial fills,
//! replaces, cancel races, intent flips, day boundaries, and persistence
//! round trips.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use uuid::Uuid;

use bartrade::calendar::WeekdayCalendar;
use bartrade::engine::{
    Order, OrderDetails, OrderFilter, OrderState, SetupContext, Strategy, StrategyContext,
};
use bartrade::errors::{EngineError, EngineResult};
use bartrade::market_data::SimMarketData;
use bartrade::runner::SimRunner;
use bartrade::store::{MemoryStore, Store};
use bartrade::types::{Bar, ProductType, Side, Symbol, DAILY_FREQUENCY};
use bartrade::EngineConfig;

// =============================================================================
// Test Utilities
// =============================================================================

fn minute_bar(
    day: u32,
    minute: u32,
    low: Decimal,
    high: Decimal,
    close: Decimal,
    volume: Decimal,
) -> Bar {
    let datetime = Utc.with_ymd_and_hms(2024, 3, day, 14, 30, 0).unwrap()
        + chrono::Duration::minutes(minute as i64);
    Bar {
        datetime,
        open: Some(close),
        high: Some(high),
        low: Some(low),
        close: Some(close),
        volume: Some(volume),
    }
}

fn daily_bar(day: u32, close: Decimal) -> Bar {
    Bar {
        datetime: Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap(),
        open: Some(close),
        high: Some(close),
        low: Some(close),
        close: Some(close),
        volume: Some(dec!(1_000_000)),
    }
}

fn bartimes(day: u32, count: u32) -> Vec<DateTime<Utc>> {
    (0..count)
        .map(|minute| {
            Utc.with_ymd_and_hms(2024, 3, day, 14, 30, 0).unwrap()
                + chrono::Duration::minutes(minute as i64)
        })
        .collect()
}

type BarHook = Box<dyn FnMut(&mut StrategyContext) -> EngineResult<()>>;
type ListHook = Box<dyn FnMut(&mut StrategyContext, &[Uuid]) -> EngineResult<()>>;

/// Everything the scripted strategy observed during the run
#[derive(Default)]
struct Recorder {
    placed: HashMap<&'static str, Uuid>,
    fill_events: Vec<Vec<Uuid>>,
    cancel_events: Vec<Vec<Uuid>>,
    notes: Vec<(&'static str, Decimal)>,
}

/// A strategy scripted per global bar index, recording what the engine
/// delivers to it.
struct Scripted {
    symbols: Vec<&'static str>,
    bar_index: usize,
    bar_hooks: HashMap<usize, BarHook>,
    cancels_hook: Option<ListHook>,
    fills_hook: Option<ListHook>,
    market_close_hook: Option<BarHook>,
    recorder: Rc<RefCell<Recorder>>,
}

impl Scripted {
    fn new(symbols: Vec<&'static str>, recorder: Rc<RefCell<Recorder>>) -> Self {
        Self {
            symbols,
            bar_index: 0,
            bar_hooks: HashMap::new(),
            cancels_hook: None,
            fills_hook: None,
            market_close_hook: None,
            recorder,
        }
    }

    fn on_bar_index(mut self, index: usize, hook: BarHook) -> Self {
        self.bar_hooks.insert(index, hook);
        self
    }
}

impl Strategy for Scripted {
    fn on_initialize(&mut self, setup: &mut SetupContext) -> EngineResult<()> {
        for symbol in &self.symbols {
            setup.add_symbol(ProductType::Stock, *symbol, "1min")?;
        }
        Ok(())
    }

    fn on_bar(&mut self, ctx: &mut StrategyContext) -> EngineResult<()> {
        let index = self.bar_index;
        self.bar_index += 1;
        if let Some(hook) = self.bar_hooks.get_mut(&index) {
            hook(ctx)?;
        }
        Ok(())
    }

    fn on_fills(&mut self, ctx: &mut StrategyContext, fills: &[Uuid]) -> EngineResult<()> {
        self.recorder.borrow_mut().fill_events.push(fills.to_vec());
        if let Some(hook) = &mut self.fills_hook {
            hook(ctx, fills)?;
        }
        Ok(())
    }

    fn on_cancels(&mut self, ctx: &mut StrategyContext, cancels: &[Uuid]) -> EngineResult<()> {
        self.recorder
            .borrow_mut()
            .cancel_events
            .push(cancels.to_vec());
        if let Some(hook) = &mut self.cancels_hook {
            hook(ctx, cancels)?;
        }
        Ok(())
    }

    fn on_market_close(&mut self, ctx: &mut StrategyContext) -> EngineResult<()> {
        if let Some(hook) = &mut self.market_close_hook {
            hook(ctx)?;
        }
        Ok(())
    }
}

struct Sim {
    runner: SimRunner,
    store: Arc<MemoryStore>,
    recorder: Rc<RefCell<Recorder>>,
}

fn simulation(market_data: SimMarketData, strategy_builder: impl FnOnce(Rc<RefCell<Recorder>>) -> Scripted) -> Sim {
    let store = Arc::new(MemoryStore::new());
    let recorder = Rc::new(RefCell::new(Recorder::default()));
    let mut runner = SimRunner::new(
        "sim",
        Box::new(market_data),
        store.clone(),
        Box::new(WeekdayCalendar::default()),
        EngineConfig::default(),
    );
    runner.add_portfolio("port");
    let strategy = strategy_builder(recorder.clone());
    runner.add_strategy("TEST1", "port", Box::new(strategy)).unwrap();
    Sim {
        runner,
        store,
        recorder,
    }
}

// =============================================================================
// S1: risk rejection on quantity
// =============================================================================

#[test]
fn risk_rejects_oversized_order_end_to_end() {
    let mut md = SimMarketData::new();
    md.load_series(
        ProductType::Stock,
        Symbol::new("AAA"),
        "1min",
        vec![
            minute_bar(4, 0, dec!(100.6), dec!(101.0), dec!(100.8), dec!(1000)),
            minute_bar(4, 1, dec!(100.6), dec!(101.0), dec!(100.8), dec!(1000)),
        ],
    );
    md.load_series(
        ProductType::Stock,
        Symbol::new("BBB"),
        "1min",
        vec![
            minute_bar(4, 0, dec!(5.0), dec!(5.4), dec!(5.2), dec!(1000)),
            minute_bar(4, 1, dec!(5.0), dec!(5.4), dec!(5.2), dec!(1000)),
        ],
    );

    let mut sim = simulation(md, |recorder| {
        Scripted::new(vec!["AAA", "BBB"], recorder.clone()).on_bar_index(
            0,
            Box::new(move |ctx| {
                let big = ctx.order(ProductType::Stock, "AAA", Side::Buy, dec!(1000), dec!(100.5))?;
                let small = ctx.order(ProductType::Stock, "BBB", Side::Sell, dec!(55), dec!(5.5))?;
                let mut rec = recorder.borrow_mut();
                rec.placed.insert("big", big);
                rec.placed.insert("small", small);
                Ok(())
            }),
        )
    });
    sim.runner.run(&bartimes(4, 2)).unwrap();

    let recorder = sim.recorder.borrow();
    let orders = sim.runner.processor().order_manager();

    let big = orders.order(recorder.placed["big"]).unwrap();
    assert_eq!(big.state(), OrderState::RiskRejected);
    assert!(big.closed());
    let states: Vec<OrderState> = big.state_history().iter().map(|(s, _)| *s).collect();
    assert_eq!(
        states,
        vec![OrderState::Created, OrderState::Staged, OrderState::RiskRejected]
    );

    let small = orders.order(recorder.placed["small"]).unwrap();
    assert_eq!(small.state(), OrderState::Live);
    let states: Vec<OrderState> = small.state_history().iter().map(|(s, _)| *s).collect();
    assert_eq!(
        states,
        vec![
            OrderState::Created,
            OrderState::Staged,
            OrderState::RiskAccepted,
            OrderState::Sent,
            OrderState::Live
        ]
    );
}

// =============================================================================
// S2 + S8: partial fill into full fill, with paper commission
// =============================================================================

#[test]
fn partial_fill_then_complete_with_commission() {
    let mut md = SimMarketData::new();
    md.load_series(
        ProductType::Stock,
        Symbol::new("AAA"),
        "1min",
        vec![
            // no cross on the placement bar
            minute_bar(4, 0, dec!(15.1), dec!(15.4), dec!(15.2), dec!(600)),
            // 0.5 * 600 = 300 then the remaining 100
            minute_bar(4, 1, dec!(14.8), dec!(15.4), dec!(15.0), dec!(600)),
            minute_bar(4, 2, dec!(14.8), dec!(15.4), dec!(15.0), dec!(600)),
        ],
    );
    md.load_series(
        ProductType::Stock,
        Symbol::new("AAA"),
        DAILY_FREQUENCY,
        vec![daily_bar(1, dec!(15.0)), daily_bar(4, dec!(15.0))],
    );

    let mut sim = simulation(md, |recorder| {
        let placing = recorder.clone();
        let mut scripted = Scripted::new(vec!["AAA"], recorder.clone()).on_bar_index(
            0,
            Box::new(move |ctx| {
                let uuid = ctx.order(ProductType::Stock, "AAA", Side::Buy, dec!(400), dec!(15.0))?;
                placing.borrow_mut().placed.insert("buy", uuid);
                Ok(())
            }),
        );
        // position() inside on_fills already reflects the booked fills
        scripted.fills_hook = Some(Box::new(move |ctx, _fills| {
            let position = ctx.position(ProductType::Stock, &Symbol::new("AAA"));
            recorder.borrow_mut().notes.push(("position_at_fill", position));
            Ok(())
        }));
        scripted
    });
    sim.runner.run(&bartimes(4, 3)).unwrap();

    let recorder = sim.recorder.borrow();
    let uuid = recorder.placed["buy"];
    let order = sim.runner.processor().order_manager().order(uuid).unwrap();

    assert_eq!(order.state(), OrderState::Filled);
    assert!(order.closed());
    assert_eq!(order.fill_quantity(), Some(dec!(400)));
    assert_eq!(order.fill_price(), Some(dec!(15.0)));
    // fee of -0.01 per share on 400 shares
    assert_eq!(order.commission(), Some(dec!(-4.00)));
    assert_eq!(order.booked(), Some(true));

    // fill aggregate equals the sum over the fills log, all booked
    assert_eq!(order.fills().len(), 2);
    let total: Decimal = order.fills().iter().map(|f| f.quantity).sum();
    assert_eq!(Some(total), order.fill_quantity());
    assert!(order.fills().iter().all(|f| f.booked));

    // two fill deliveries, with the position already updated inside each
    assert_eq!(recorder.fill_events.len(), 2);
    assert_eq!(
        recorder.notes,
        vec![("position_at_fill", dec!(300)), ("position_at_fill", dec!(400))]
    );

    let positions = sim.runner.processor().position_manager();
    let key = bartrade::engine::PositionKey::new("TEST1", ProductType::Stock, Symbol::new("AAA"));
    let row = positions.position(&key).unwrap();
    assert_eq!(row.current_position, dec!(400));
    assert_eq!(row.commission, dec!(-4.00));
    // prior close == avg price == current price, so pnl is pure commission
    assert_eq!(row.gross_pnl, dec!(0));
    assert_eq!(row.net_pnl, dec!(-4.00));
}

// =============================================================================
// S3: replace below the filled quantity collapses the order
// =============================================================================

#[test]
fn replace_below_filled_quantity_closes_order() {
    let mut md = SimMarketData::new();
    md.load_series(
        ProductType::Stock,
        Symbol::new("AAA"),
        "1min",
        vec![
            minute_bar(4, 0, dec!(15.1), dec!(15.4), dec!(15.2), dec!(100)),
            // 0.5 * 100 = 50 of 75 fills here
            minute_bar(4, 1, dec!(14.8), dec!(15.4), dec!(15.0), dec!(100)),
            // replaced down to 40 on this bar, no further cross
            minute_bar(4, 2, dec!(15.1), dec!(15.4), dec!(15.2), dec!(100)),
            minute_bar(4, 3, dec!(15.1), dec!(15.4), dec!(15.2), dec!(100)),
        ],
    );
    md.load_series(
        ProductType::Stock,
        Symbol::new("AAA"),
        DAILY_FREQUENCY,
        vec![daily_bar(1, dec!(15.0)), daily_bar(4, dec!(15.0))],
    );

    let mut sim = simulation(md, |recorder| {
        let placing = recorder.clone();
        let replacing = recorder.clone();
        Scripted::new(vec!["AAA"], recorder)
            .on_bar_index(
                0,
                Box::new(move |ctx| {
                    let uuid =
                        ctx.order(ProductType::Stock, "AAA", Side::Buy, dec!(75), dec!(15.0))?;
                    placing.borrow_mut().placed.insert("buy", uuid);
                    Ok(())
                }),
            )
            .on_bar_index(
                2,
                Box::new(move |ctx| {
                    let uuid = replacing.borrow().placed["buy"];
                    ctx.replace_order(uuid, Some(dec!(40)), None)
                }),
            )
    });
    sim.runner.run(&bartimes(4, 4)).unwrap();

    let recorder = sim.recorder.borrow();
    let order = sim
        .runner
        .processor()
        .order_manager()
        .order(recorder.placed["buy"])
        .unwrap();
    assert_eq!(order.state(), OrderState::Filled);
    assert!(order.closed());
    assert_eq!(order.fill_quantity(), Some(dec!(50)));
    assert_eq!(order.quantity(), dec!(40));
    // the one partial fill was the only delivery
    assert_eq!(recorder.fill_events.len(), 1);
}

// =============================================================================
// S4 + S6: intent flip and cancels on portfolio orders
// =============================================================================

#[test]
fn intent_flip_cancels_and_reissues() {
    let mut md = SimMarketData::new();
    md.load_series(
        ProductType::Stock,
        Symbol::new("AAA"),
        "1min",
        vec![
            minute_bar(4, 0, dec!(44.0), dec!(44.2), dec!(44.0), dec!(1000)),
            // the working buy at 44.0 never crosses, the flip happens here
            minute_bar(4, 1, dec!(44.0), dec!(44.4), dec!(44.5), dec!(1000)),
            // the new sell at 44.5 never crosses either
            minute_bar(4, 2, dec!(44.0), dec!(44.4), dec!(44.2), dec!(1000)),
        ],
    );

    let mut sim = simulation(md, |recorder| {
        Scripted::new(vec!["AAA"], recorder)
            .on_bar_index(
                0,
                Box::new(|ctx| {
                    ctx.set_intent(ProductType::Stock, "AAA", dec!(100));
                    Ok(())
                }),
            )
            .on_bar_index(
                1,
                Box::new(|ctx| {
                    ctx.set_intent(ProductType::Stock, "AAA", dec!(-100));
                    Ok(())
                }),
            )
            // intents are consumed each bar, so the level must be re-declared
            .on_bar_index(
                2,
                Box::new(|ctx| {
                    ctx.set_intent(ProductType::Stock, "AAA", dec!(-100));
                    Ok(())
                }),
            )
    });
    sim.runner.run(&bartimes(4, 3)).unwrap();

    let orders = sim.runner.processor().order_manager();
    let all = orders.orders(&OrderFilter::new());
    assert_eq!(all.len(), 2);

    let buy = all[0];
    assert_eq!(buy.side(), Side::Buy);
    assert_eq!(buy.quantity(), dec!(100));
    assert_eq!(buy.details().price(), dec!(44.0));
    assert_eq!(buy.originator_id(), "portfolio.port");
    assert_eq!(buy.state(), OrderState::Canceled);
    assert!(buy.closed());

    // the re-declared intent keeps the same sell order working, repriced to
    // the latest close
    let sell = all[1];
    assert_eq!(sell.side(), Side::Sell);
    assert_eq!(sell.quantity(), dec!(100));
    assert_eq!(sell.originator_id(), "portfolio.port");
    assert_eq!(sell.state(), OrderState::ReplaceSent);
    assert_eq!(sell.details().price(), dec!(44.2));

    // portfolio-originated cancels are not delivered to on_cancels
    assert!(sim.recorder.borrow().cancel_events.is_empty());
}

// =============================================================================
// S5: cancel race resolves to FILLED
// =============================================================================

#[test]
fn cancel_race_resolves_to_filled() {
    let mut md = SimMarketData::new();
    md.load_series(
        ProductType::Stock,
        Symbol::new("AAA"),
        "1min",
        vec![
            minute_bar(4, 0, dec!(50.0), dec!(50.4), dec!(50.2), dec!(1000)),
            // fill happens before the strategy's cancel this bar
            minute_bar(4, 1, dec!(49.0), dec!(50.4), dec!(50.0), dec!(1000)),
        ],
    );
    md.load_series(
        ProductType::Stock,
        Symbol::new("AAA"),
        DAILY_FREQUENCY,
        vec![daily_bar(1, dec!(50.0)), daily_bar(4, dec!(50.0))],
    );

    let mut sim = simulation(md, |recorder| {
        let placing = recorder.clone();
        let cancelling = recorder.clone();
        Scripted::new(vec!["AAA"], recorder)
            .on_bar_index(
                0,
                Box::new(move |ctx| {
                    let uuid =
                        ctx.order(ProductType::Stock, "AAA", Side::Buy, dec!(100), dec!(50.0))?;
                    placing.borrow_mut().placed.insert("buy", uuid);
                    Ok(())
                }),
            )
            .on_bar_index(
                1,
                Box::new(move |ctx| {
                    let uuid = cancelling.borrow().placed["buy"];
                    ctx.cancel_order(uuid)
                }),
            )
    });
    sim.runner.run(&bartimes(4, 2)).unwrap();

    let recorder = sim.recorder.borrow();
    let order = sim
        .runner
        .processor()
        .order_manager()
        .order(recorder.placed["buy"])
        .unwrap();
    assert_eq!(order.state(), OrderState::Filled);
    assert!(order.closed());
    assert_eq!(recorder.fill_events.len(), 1);
    assert!(recorder.cancel_events.is_empty());
}

// =============================================================================
// cancels delivered to strategies, new orders staged in the same bar
// =============================================================================

#[test]
fn order_created_inside_on_cancels_reaches_exchange_same_bar() {
    let mut md = SimMarketData::new();
    md.load_series(
        ProductType::Stock,
        Symbol::new("AAA"),
        "1min",
        vec![
            minute_bar(4, 0, dec!(50.0), dec!(50.4), dec!(50.2), dec!(1000)),
            minute_bar(4, 1, dec!(50.0), dec!(50.4), dec!(50.2), dec!(1000)),
            minute_bar(4, 2, dec!(50.0), dec!(50.4), dec!(50.2), dec!(1000)),
        ],
    );

    let mut sim = simulation(md, |recorder| {
        let placing = recorder.clone();
        let cancelling = recorder.clone();
        let reissuing = recorder.clone();
        let mut scripted = Scripted::new(vec!["AAA"], recorder)
            .on_bar_index(
                0,
                Box::new(move |ctx| {
                    let uuid =
                        ctx.order(ProductType::Stock, "AAA", Side::Buy, dec!(100), dec!(49.0))?;
                    placing.borrow_mut().placed.insert("first", uuid);
                    Ok(())
                }),
            )
            .on_bar_index(
                1,
                Box::new(move |ctx| {
                    let uuid = cancelling.borrow().placed["first"];
                    ctx.cancel_order(uuid)
                }),
            );
        scripted.cancels_hook = Some(Box::new(move |ctx, _cancels| {
            let uuid = ctx.order(ProductType::Stock, "AAA", Side::Buy, dec!(10), dec!(49.5))?;
            reissuing.borrow_mut().placed.insert("second", uuid);
            Ok(())
        }));
        scripted
    });
    sim.runner.run(&bartimes(4, 3)).unwrap();

    let recorder = sim.recorder.borrow();
    let orders = sim.runner.processor().order_manager();

    let first = orders.order(recorder.placed["first"]).unwrap();
    assert_eq!(first.state(), OrderState::Canceled);
    assert!(first.closed());
    assert_eq!(recorder.cancel_events, vec![vec![first.uuid()]]);

    // the replacement went out in the same bar the cancel was delivered
    let second = orders.order(recorder.placed["second"]).unwrap();
    assert_eq!(second.state(), OrderState::Sent);
    let exchange_order_id = second.exchange_order_id().unwrap();
    assert_eq!(
        sim.runner
            .processor()
            .exchange()
            .order(exchange_order_id)
            .unwrap()
            .state,
        OrderState::Live
    );
}

// =============================================================================
// S7 + round-trip laws: day boundary, rehydration, snapshots
// =============================================================================

#[test]
fn day_boundary_rehydrates_nonzero_positions() {
    let mut md = SimMarketData::new();
    md.load_series(
        ProductType::Stock,
        Symbol::new("AAA"),
        "1min",
        vec![
            minute_bar(4, 0, dec!(15.1), dec!(15.4), dec!(15.2), dec!(1000)),
            minute_bar(4, 1, dec!(14.9), dec!(15.4), dec!(15.1), dec!(1000)),
            minute_bar(4, 2, dec!(15.0), dec!(15.4), dec!(15.2), dec!(1000)),
            minute_bar(5, 0, dec!(15.8), dec!(16.2), dec!(16.0), dec!(1000)),
        ],
    );
    md.load_series(
        ProductType::Stock,
        Symbol::new("BBB"),
        "1min",
        vec![
            minute_bar(4, 0, dec!(5.5), dec!(5.6), dec!(5.5), dec!(1000)),
            minute_bar(4, 1, dec!(5.3), dec!(5.6), dec!(5.5), dec!(1000)),
            minute_bar(4, 2, dec!(5.3), dec!(5.6), dec!(5.5), dec!(1000)),
            minute_bar(5, 0, dec!(5.5), dec!(5.6), dec!(5.5), dec!(1000)),
        ],
    );
    md.load_series(
        ProductType::Stock,
        Symbol::new("AAA"),
        DAILY_FREQUENCY,
        vec![
            daily_bar(1, dec!(15.0)),
            daily_bar(4, dec!(15.5)),
            daily_bar(5, dec!(16.0)),
        ],
    );
    md.load_series(
        ProductType::Stock,
        Symbol::new("BBB"),
        DAILY_FREQUENCY,
        vec![
            daily_bar(1, dec!(5.5)),
            daily_bar(4, dec!(5.5)),
            daily_bar(5, dec!(5.5)),
        ],
    );

    let mut sim = simulation(md, |recorder| {
        let day1 = recorder.clone();
        let day1b = recorder.clone();
        let day2 = recorder.clone();
        Scripted::new(vec!["AAA", "BBB"], recorder)
            .on_bar_index(
                0,
                Box::new(move |ctx| {
                    // fills next bar
                    let buy =
                        ctx.order(ProductType::Stock, "AAA", Side::Buy, dec!(100), dec!(15.0))?;
                    let round_trip =
                        ctx.order(ProductType::Stock, "BBB", Side::Buy, dec!(40), dec!(5.5))?;
                    let mut rec = day1.borrow_mut();
                    rec.placed.insert("aaa_buy", buy);
                    rec.placed.insert("bbb_buy", round_trip);
                    Ok(())
                }),
            )
            .on_bar_index(
                1,
                Box::new(move |ctx| {
                    // flatten BBB again, fills next bar
                    let sell =
                        ctx.order(ProductType::Stock, "BBB", Side::Sell, dec!(40), dec!(5.4))?;
                    day1b.borrow_mut().placed.insert("bbb_sell", sell);
                    Ok(())
                }),
            )
            .on_bar_index(
                3,
                Box::new(move |ctx| {
                    // first bar of day 2: inspect the rehydrated book
                    let aaa = Symbol::new("AAA");
                    let row = ctx
                        .position_row(ProductType::Stock, &aaa)
                        .expect("AAA position survives the day boundary");
                    let mut rec = day2.borrow_mut();
                    rec.notes.push(("start_position", row.start_position));
                    rec.notes.push(("current_position", row.current_position));
                    rec.notes
                        .push(("prior_close", row.prior_close_price.unwrap()));
                    let bbb_dropped =
                        ctx.position_row(ProductType::Stock, &Symbol::new("BBB")).is_none();
                    rec.notes
                        .push(("bbb_dropped", if bbb_dropped { dec!(1) } else { dec!(0) }));
                    Ok(())
                }),
            )
    });
    sim.runner
        .run(&[bartimes(4, 3), bartimes(5, 1)].concat())
        .unwrap();

    let recorder = sim.recorder.borrow();
    assert_eq!(
        recorder.notes,
        vec![
            ("start_position", dec!(100)),
            ("current_position", dec!(100)),
            // day 2's prior close is day 1's daily close
            ("prior_close", dec!(15.5)),
            ("bbb_dropped", dec!(1)),
        ]
    );

    // orders snapshot persisted at EOD matches the day's registry: both
    // AAA and BBB orders, all closed by then
    let order_snapshots = sim.store.order_snapshots("sim");
    assert_eq!(order_snapshots.len(), 2); // day-1 EOD and stop
    let day1_rows = &order_snapshots[0].1;
    assert_eq!(day1_rows.len(), 3);
    assert!(day1_rows.iter().all(|row| row.closed));
    assert!(day1_rows
        .iter()
        .any(|row| row.uuid == recorder.placed["aaa_buy"] && row.state == "FILLED"));
    // the EOD wipe leaves day 2 with an empty registry
    assert!(order_snapshots[1].1.is_empty());

    // long-form persisted positions from day 1 include the zero BBB row;
    // the BOD load is what drops it
    let day1_close = sim
        .store
        .positions("sim", Some(order_snapshots[0].0))
        .unwrap();
    assert_eq!(day1_close.len(), 2);
    let bbb = day1_close
        .iter()
        .find(|r| r.symbol.as_str() == "BBB")
        .unwrap();
    assert_eq!(bbb.position, dec!(0));

    let position_snapshots = sim.store.position_snapshots("sim");
    assert_eq!(position_snapshots.len(), 2);
}

// =============================================================================
// market close discipline
// =============================================================================

#[test]
fn market_close_cancels_working_orders_and_delivers_cancels() {
    let mut md = SimMarketData::new();
    md.load_series(
        ProductType::Stock,
        Symbol::new("AAA"),
        "1min",
        vec![
            minute_bar(4, 0, dec!(50.0), dec!(50.4), dec!(50.2), dec!(1000)),
            minute_bar(4, 1, dec!(50.0), dec!(50.4), dec!(50.2), dec!(1000)),
            minute_bar(5, 0, dec!(50.0), dec!(50.4), dec!(50.2), dec!(1000)),
        ],
    );

    let mut sim = simulation(md, |recorder| {
        let placing = recorder.clone();
        Scripted::new(vec!["AAA"], recorder).on_bar_index(
            0,
            Box::new(move |ctx| {
                // never crosses, so it is still working at the close
                let uuid = ctx.order(ProductType::Stock, "AAA", Side::Buy, dec!(10), dec!(49.0))?;
                placing.borrow_mut().placed.insert("buy", uuid);
                Ok(())
            }),
        )
    });
    sim.runner
        .run(&[bartimes(4, 2), bartimes(5, 1)].concat())
        .unwrap();

    let recorder = sim.recorder.borrow();
    // the day-1 registry was cleared at EOD; the snapshot kept the order
    let day1_rows = &sim.store.order_snapshots("sim")[0].1;
    let row = day1_rows
        .iter()
        .find(|row| row.uuid == recorder.placed["buy"])
        .unwrap();
    assert_eq!(row.state, "CANCELED");
    assert!(row.closed);
    // strategy-originated, so the cancel was delivered
    assert_eq!(recorder.cancel_events.len(), 1);
}

#[test]
fn residual_open_orders_after_market_close_is_fatal() {
    let mut md = SimMarketData::new();
    md.load_series(
        ProductType::Stock,
        Symbol::new("AAA"),
        "1min",
        vec![
            minute_bar(4, 0, dec!(50.0), dec!(50.4), dec!(50.2), dec!(1000)),
            minute_bar(5, 0, dec!(50.0), dec!(50.4), dec!(50.2), dec!(1000)),
        ],
    );

    let mut sim = simulation(md, |recorder| {
        let mut scripted = Scripted::new(vec!["AAA"], recorder);
        scripted.market_close_hook = Some(Box::new(|ctx| {
            // an order created after the close can never be worked off
            ctx.order(ProductType::Stock, "AAA", Side::Buy, dec!(10), dec!(49.0))?;
            Ok(())
        }));
        scripted
    });
    let err = sim
        .runner
        .run(&[bartimes(4, 1), bartimes(5, 1)].concat())
        .unwrap_err();
    assert!(matches!(err, EngineError::ResidualOpenOrders(1)));
}

#[test]
fn stuck_order_is_detected_at_end_of_bar() {
    let md = SimMarketData::new();
    let mut sim = simulation(md, |recorder| Scripted::new(vec!["AAA"], recorder));

    // an order slipped into the registry outside the staging flow
    let order = Order::new(
        Uuid::new_v4(),
        "strategy.TEST1",
        Uuid::new_v4(),
        "TEST1",
        ProductType::Stock,
        Symbol::new("AAA"),
        Side::Buy,
        dec!(10),
        OrderDetails::limit(dec!(50.0)),
    );
    sim.runner
        .processor_mut()
        .order_manager_mut()
        .new_order(order)
        .unwrap();

    let err = sim.runner.processor_mut().check_stuck_orders().unwrap_err();
    assert!(matches!(
        err,
        EngineError::StuckOrder {
            state: OrderState::Created,
            count: 1
        }
    ));
}
