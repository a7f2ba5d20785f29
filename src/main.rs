//! Bartrade - main entry point
//!
//! Runs a simulation over a directory of CSV bar files with the built-in
//! target-holding demo strategy.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bartrade::calendar::WeekdayCalendar;
use bartrade::data;
use bartrade::engine::{SetupContext, Strategy, StrategyContext};
use bartrade::errors::EngineResult;
use bartrade::runner::SimRunner;
use bartrade::store::{MemoryStore, SqliteStore, Store};
use bartrade::{EngineConfig, ProductType, Symbol};

#[derive(Parser, Debug)]
#[command(name = "bartrade")]
#[command(about = "Bar-driven algorithmic trading engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a simulation over CSV bar data
    Run {
        /// Path to the engine configuration file
        #[arg(short, long)]
        config: Option<String>,

        /// Directory of <SYMBOL>_<frequency>.csv bar files
        #[arg(short, long, default_value = "data")]
        data: String,

        /// Symbols to trade (comma-separated)
        #[arg(short, long)]
        symbols: String,

        /// Target position per symbol for the demo strategy
        #[arg(short, long, default_value = "100")]
        target: Decimal,

        /// SQLite state database path; in-memory when omitted
        #[arg(long)]
        state_db: Option<String>,
    },
}

/// Demo strategy: declare a fixed target position for each symbol on every
/// bar and let the portfolio work the orders.
struct TargetHolder {
    symbols: Vec<Symbol>,
    target: Decimal,
}

impl Strategy for TargetHolder {
    fn on_initialize(&mut self, setup: &mut SetupContext) -> EngineResult<()> {
        for symbol in self.symbols.clone() {
            setup.add_symbol(ProductType::Stock, symbol, "1min")?;
        }
        Ok(())
    }

    fn on_bar(&mut self, ctx: &mut StrategyContext) -> EngineResult<()> {
        for symbol in self.symbols.clone() {
            ctx.set_intent(ProductType::Stock, symbol, self.target);
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Run {
            config,
            data,
            symbols,
            target,
            state_db,
        } => run_simulation(config, data, symbols, target, state_db),
    }
}

fn run_simulation(
    config: Option<String>,
    data_dir: String,
    symbols: String,
    target: Decimal,
    state_db: Option<String>,
) -> Result<()> {
    let config = match config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let symbols: Vec<Symbol> = symbols.split(',').map(|s| Symbol::new(s.trim())).collect();

    let market_data = data::load_directory(&data_dir, ProductType::Stock)?;
    let mut bartimes: BTreeSet<chrono::DateTime<chrono::Utc>> = BTreeSet::new();
    for symbol in &symbols {
        for datetime in market_data.datetimes(ProductType::Stock, symbol, &config.live_frequency) {
            bartimes.insert(datetime);
        }
    }
    let bartimes: Vec<_> = bartimes.into_iter().collect();
    if bartimes.is_empty() {
        anyhow::bail!("no {} bars found under {data_dir} for the requested symbols", config.live_frequency);
    }

    let store: Arc<dyn Store> = match state_db {
        Some(path) => Arc::new(SqliteStore::open(path)?),
        None => Arc::new(MemoryStore::new()),
    };

    let mut runner = SimRunner::new(
        "simulation",
        Box::new(market_data),
        store,
        Box::new(WeekdayCalendar::default()),
        config,
    );
    runner.add_portfolio("main");
    runner.add_strategy(
        "target_holder",
        "main",
        Box::new(TargetHolder {
            symbols: symbols.clone(),
            target,
        }),
    )?;

    info!(bars = bartimes.len(), "starting simulation");
    runner.run(&bartimes).context("simulation failed")?;

    println!("\nClosing positions:");
    println!(
        "{:<16} {:<8} {:>12} {:>12} {:>12} {:>12}",
        "strategy", "symbol", "position", "trade_pnl", "position_pnl", "net_pnl"
    );
    for row in runner.processor().position_manager().snapshot_rows() {
        println!(
            "{:<16} {:<8} {:>12} {:>12} {:>12} {:>12}",
            row.strategy_id,
            row.symbol.as_str(),
            row.row.current_position,
            row.row.trade_pnl.round_dp(2),
            row.row.position_pnl.round_dp(2),
            row.row.net_pnl.round_dp(2),
        );
    }
    Ok(())
}
