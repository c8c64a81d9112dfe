//! Scheduled trading-session runner.
//!
//! Reads `trader.toml`, decides whether each configured account's market is in
//! a trading session, runs bounded decision sessions, and records trades in a
//! per-account append-only ledger.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use tracing::{info, warn};

use trader::core::calendar::{Clock, SystemClock};
use trader::core::markets::{MarketId, MarketSpec, format_hhmm};
use trader::core::positions::{PositionSnapshot, Side};
use trader::core::scheduler::MarketScheduler;
use trader::core::types::TradeEnv;
use trader::cycle::{AccountFleet, TradingCycle, for_each_account};
use trader::driver::{DriverConfig, DriverSummary, run_driver};
use trader::exit_codes;
use trader::io::broker::{Broker, PaperBroker, bare_symbol};
use trader::io::config::{AccountConfig, ConfigError, TraderConfig, read_config};
use trader::io::decision::CommandDecisionStep;
use trader::io::ledger::{LedgerError, LedgerStore, Registration};
use trader::logging;
use trader::retry::ThreadSleeper;
use trader::trade::{OrderRequest, execute_order};

#[derive(Parser)]
#[command(
    name = "trader",
    version,
    about = "Scheduled trading-session runner with a crash-safe position ledger"
)]
struct Cli {
    /// Path to the TOML config.
    #[arg(short, long, global = true, default_value = "trader.toml")]
    config: PathBuf,

    /// Debug-level logs for this crate (ignored when RUST_LOG is set).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the current session for every configured market.
    Status,
    /// Create each account ledger that does not exist yet.
    Register(AccountArgs),
    /// Run exactly one trading session per account now, regardless of trading hours.
    Once(AccountArgs),
    /// Run sessions every interval until interrupted.
    Loop {
        #[command(flatten)]
        account: AccountArgs,
        /// Seconds between cycles.
        #[arg(short, long)]
        interval: Option<u64>,
        /// Run outside trading sessions too.
        #[arg(long)]
        all_hours: bool,
        /// Stop after this many cycles.
        #[arg(long)]
        max_cycles: Option<u64>,
    },
    /// Run one analysis-only session; no ledger writes.
    Analyze {
        #[command(flatten)]
        account: AccountArgs,
        /// Question for the analyst.
        #[arg(short, long)]
        query: String,
    },
    /// Print the latest position snapshot of one account.
    Positions(AccountArgs),
    /// Place a paper order and record the fill in the ledger.
    Record {
        #[command(flatten)]
        account: AccountArgs,
        side: SideArg,
        symbol: String,
        quantity: i64,
        /// Limit price. Omit for a market order at the last recorded fill price.
        #[arg(long)]
        price: Option<Decimal>,
    },
}

#[derive(Args, Clone, Default)]
struct AccountArgs {
    /// Act on this configured account only. Single-account commands default to
    /// the first one.
    #[arg(short, long)]
    account: Option<String>,
    /// Override the market of the selected accounts.
    #[arg(short, long)]
    market: Option<String>,
    /// Override the trade environment of the selected accounts.
    #[arg(short, long, value_enum)]
    env: Option<EnvArg>,
}

#[derive(Clone, Copy, ValueEnum)]
enum EnvArg {
    Simulate,
    Real,
}

#[derive(Clone, Copy, ValueEnum)]
enum SideArg {
    Buy,
    Sell,
}

fn main() {
    let cli = Cli::parse();
    logging::init(if cli.verbose {
        logging::VERBOSE_FILTER
    } else {
        logging::DEFAULT_FILTER
    });
    let code = match run(cli) {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.downcast_ref::<ConfigError>().is_some() {
            return exit_codes::CONFIG;
        }
        if let Some(LedgerError::StorageUnavailable { .. }) = cause.downcast_ref::<LedgerError>() {
            return exit_codes::STORAGE_UNAVAILABLE;
        }
    }
    exit_codes::FAILED
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Status => cmd_status(&load(&cli.config, &AccountArgs::default())?),
        Command::Register(args) => cmd_register(&load(&cli.config, &args)?),
        Command::Once(args) => cmd_once(&load(&cli.config, &args)?),
        Command::Loop {
            account,
            interval,
            all_hours,
            max_cycles,
        } => {
            let mut cfg = load(&cli.config, &account)?;
            if let Some(interval) = interval {
                cfg.schedule.interval_secs = interval;
            }
            if all_hours {
                cfg.schedule.only_trading_hours = false;
            }
            cfg.validate()?;
            cmd_loop(&cfg, max_cycles)
        }
        Command::Analyze { account, query } => cmd_analyze(&load(&cli.config, &account)?, &query),
        Command::Positions(args) => cmd_positions(&load(&cli.config, &args)?),
        Command::Record {
            account,
            side,
            symbol,
            quantity,
            price,
        } => {
            let side = match side {
                SideArg::Buy => Side::Buy,
                SideArg::Sell => Side::Sell,
            };
            cmd_record(&load(&cli.config, &account)?, side, &symbol, quantity, price)
        }
    }
}

/// Read the config, apply CLI overrides, then validate everything before any I/O.
fn load(path: &Path, overrides: &AccountArgs) -> Result<TraderConfig> {
    let mut cfg = read_config(path)?;
    if let Some(signature) = &overrides.account {
        cfg.select_account(signature)?;
    }
    for account in cfg.account_configs_mut() {
        if let Some(market) = &overrides.market {
            account.market = market.clone();
        }
        if let Some(env) = overrides.env {
            account.trade_env = match env {
                EnvArg::Simulate => TradeEnv::Simulate,
                EnvArg::Real => TradeEnv::Real,
            };
        }
    }
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

fn store(cfg: &TraderConfig) -> LedgerStore {
    let store = LedgerStore::new(&cfg.storage.data_dir);
    match cfg.lock_timeout() {
        Some(timeout) => store.with_lock_timeout(timeout),
        None => store,
    }
}

fn market_spec(cfg: &TraderConfig, account: &AccountConfig) -> Result<MarketSpec> {
    let table = cfg.market_table()?;
    Ok(table.get(&account.market_id()?)?.clone())
}

/// `(signature, account)` pairs for [`for_each_account`].
fn signed(cfg: &TraderConfig) -> Vec<(&str, &AccountConfig)> {
    cfg.account_configs()
        .into_iter()
        .map(|account| (account.signature.trim(), account))
        .collect()
}

fn trading_cycle(
    cfg: &TraderConfig,
    account: &AccountConfig,
) -> Result<TradingCycle<CommandDecisionStep, ThreadSleeper>> {
    let spec = market_spec(cfg, account)?;
    let symbols = account.symbols(&spec);
    TradingCycle::new(
        account.account()?,
        spec,
        &symbols,
        account.initial_cash,
        store(cfg),
        cfg.session_config(),
        CommandDecisionStep::from_config(&cfg.decision)?,
        ThreadSleeper,
    )
}

fn cmd_status(cfg: &TraderConfig) -> Result<()> {
    let scheduler = MarketScheduler::new(cfg.market_table()?);
    let now = SystemClock.now();
    println!("UTC {}", now.format("%Y-%m-%d %H:%M:%S"));
    for spec in scheduler.table().iter() {
        let session = scheduler.classify(&spec.id, now)?;
        println!(
            "{:<4} {}  {:<12} trading={}  ({})",
            spec.id.as_str(),
            session.local_time.format("%Y-%m-%d %H:%M:%S %a"),
            session.session_name,
            session.is_trading,
            spec.zone.name()
        );
        for window in &spec.windows {
            println!(
                "       {:<12} {} - {}",
                window.name,
                format_hhmm(window.start_minute),
                format_hhmm(window.end_minute)
            );
        }
    }
    Ok(())
}

fn cmd_register(cfg: &TraderConfig) -> Result<()> {
    let store = store(cfg);
    for_each_account(signed(cfg), |config| {
        let spec = market_spec(cfg, config)?;
        let symbols: Vec<String> = config
            .symbols(&spec)
            .iter()
            .map(|symbol| bare_symbol(&spec, symbol))
            .collect();
        let account = config.account()?;
        let initial = PositionSnapshot::initial(config.initial_cash, &symbols);
        match store.register(&account, initial)? {
            Registration::Created(entry) => println!(
                "registered {} (cash {}, {} instruments)",
                account.signature,
                entry.positions.cash,
                entry.positions.holdings.len()
            ),
            Registration::Existing(entry) => println!(
                "{} already registered at {}",
                account.signature, entry.timestamp
            ),
        }
        Ok(())
    })
}

fn cmd_once(cfg: &TraderConfig) -> Result<()> {
    let scheduler = MarketScheduler::new(cfg.market_table()?);
    for_each_account(signed(cfg), |account| {
        let cycle = trading_cycle(cfg, account)?;
        let session = scheduler.classify(&cycle.account().market, SystemClock.now())?;
        if !session.is_trading {
            warn!(
                signature = %cycle.account().signature,
                session = %session.session_name,
                "running outside trading hours"
            );
        }
        let outcome = cycle.trade(&session)?;
        println!(
            "{}: session {} ended {:?} after {} steps",
            cycle.account().signature,
            outcome.session_id,
            outcome.state,
            outcome.steps
        );
        if let Some(text) = outcome.final_text {
            println!("{text}");
        }
        Ok(())
    })
}

/// One driver per market, each running the cycles of that market's accounts.
fn cmd_loop(cfg: &TraderConfig, max_cycles: Option<u64>) -> Result<()> {
    let mut by_market: BTreeMap<MarketId, Vec<_>> = BTreeMap::new();
    for account in cfg.account_configs() {
        by_market
            .entry(account.market_id()?)
            .or_default()
            .push(trading_cycle(cfg, account)?);
    }
    let scheduler = MarketScheduler::new(cfg.market_table()?);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    let summary = runtime.block_on(async {
        let mut drivers = tokio::task::JoinSet::new();
        for (market, cycles) in by_market {
            let config = DriverConfig {
                market,
                interval: cfg.interval(),
                only_trading_hours: cfg.schedule.only_trading_hours,
                max_cycles,
            };
            let scheduler = scheduler.clone();
            let fleet = AccountFleet::new(cycles);
            info!(
                market = %config.market,
                accounts = fleet.cycles().len(),
                interval_secs = config.interval.as_secs(),
                only_trading_hours = config.only_trading_hours,
                "starting driver"
            );
            drivers.spawn(async move {
                run_driver(&config, &scheduler, &SystemClock, fleet, shutdown_signal()).await
            });
        }

        let mut total = DriverSummary::default();
        while let Some(joined) = drivers.join_next().await {
            total += joined.context("join driver task")??;
        }
        Ok::<_, anyhow::Error>(total)
    })?;
    println!(
        "cycles={} sessions_run={} sessions_failed={} skipped={}",
        summary.cycles, summary.sessions_run, summary.sessions_failed, summary.skipped
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(err = %err, "cannot listen for Ctrl-C; stop the process to exit");
        std::future::pending::<()>().await;
    }
}

fn cmd_analyze(cfg: &TraderConfig, query: &str) -> Result<()> {
    let scheduler = MarketScheduler::new(cfg.market_table()?);
    let labelled = cfg.account_configs().len() > 1;
    for_each_account(signed(cfg), |account| {
        let cycle = trading_cycle(cfg, account)?;
        let session = scheduler.classify(&cycle.account().market, SystemClock.now())?;
        let outcome = cycle.analyze(query, &session)?;
        if labelled {
            println!("== {} ==", cycle.account().signature);
        }
        println!("{}", outcome.final_text.unwrap_or_default());
        Ok(())
    })
}

fn cmd_positions(cfg: &TraderConfig) -> Result<()> {
    let summary = store(cfg).summary(cfg.primary_account().signature.trim())?;
    println!(
        "{} as of {} ({} records, last id {})",
        summary.signature,
        summary.latest.timestamp,
        summary.total_records,
        summary.latest.sequence_id
    );
    let mut payload = serde_json::to_string_pretty(&summary.latest.positions)
        .context("serialize positions")?;
    payload.push('\n');
    print!("{payload}");
    Ok(())
}

fn cmd_record(
    cfg: &TraderConfig,
    side: Side,
    symbol: &str,
    quantity: i64,
    price: Option<Decimal>,
) -> Result<()> {
    let primary = cfg.primary_account();
    let account = primary.account()?;
    let spec = market_spec(cfg, primary)?;
    let store = store(cfg);
    let mut broker = PaperBroker::new(
        spec.clone(),
        account.trade_env,
        &PositionSnapshot::initial(Decimal::ZERO, &[] as &[&str]),
    );
    if price.is_none() {
        broker = broker.with_ledger_prices(&store.read_all(&account.signature)?);
    }
    let result = execute_order(
        &store,
        &account,
        &spec,
        &mut broker,
        &OrderRequest {
            side,
            symbol: symbol.to_string(),
            quantity,
            price,
        },
    );
    broker.close()?;
    let trade = result?;
    println!(
        "recorded #{} {:?} {} {} @ {} (cash {})",
        trade.sequence_id,
        trade.action.kind,
        trade.action.quantity,
        trade.action.symbol,
        trade.action.price,
        trade.positions.cash
    );
    Ok(())
}
