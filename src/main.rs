//! Intraday Trader - Main Entry Point
//!
//! One subcommand per strategy, plus a standalone square-off.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use intraday_trader::broker::{BrokerApi, KiteClient, KiteTicker, TickMode};
use intraday_trader::config::Config;
use intraday_trader::engine::{dispatcher, ReconcileConfig, Reconciler, SquareOff};
use intraday_trader::signal::{
    brick_size_from_atr, select_option_contract, underlying_quote_key, OptionLegState, OptionType,
    RenkoState, SignalState, SupertrendState,
};
use intraday_trader::store::{InstrumentRecord, InstrumentStore};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Intraday Trader CLI
#[derive(Parser)]
#[command(name = "intraday-trader")]
#[command(version, about = "Intraday signal-to-order execution on Zerodha Kite")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Buy an ATM option leg with a fixed point bracket
    Straddle {
        /// NIFTY or BANKNIFTY
        #[arg(long)]
        underlying: Option<String>,

        /// CE or PE
        #[arg(long)]
        option_type: Option<String>,

        /// Stop-loss distance in points
        #[arg(long)]
        stoploss: Option<Decimal>,

        /// Take-profit distance in points
        #[arg(long)]
        takeprofit: Option<Decimal>,

        /// Number of lots
        #[arg(long)]
        lots: Option<u32>,

        /// Expiry offset (0 = nearest)
        #[arg(long)]
        exp_offset: Option<usize>,

        /// Strikes away from at-the-money
        #[arg(long)]
        atm_offset: Option<i64>,
    },

    /// Renko bricks with MACD confirmation over the configured tickers
    Renko,

    /// Triple-Supertrend unanimity gate over the configured tickers
    Supertrend,

    /// Cancel all live orders and flatten all positions, then exit
    SquareOff {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let mut config = Config::load()?;

    if let Commands::Straddle {
        underlying,
        option_type,
        stoploss,
        takeprofit,
        lots,
        exp_offset,
        atm_offset,
    } = &cli.command
    {
        // CLI flags override the file/env configuration.
        if let Some(v) = underlying {
            config.strategy.underlying = v.to_uppercase();
        }
        if let Some(v) = option_type {
            config.strategy.option_type = v.to_uppercase();
        }
        if let Some(v) = stoploss {
            config.strategy.stoploss_points = *v;
        }
        if let Some(v) = takeprofit {
            config.strategy.takeprofit_points = *v;
        }
        if let Some(v) = lots {
            config.strategy.lots = *v;
        }
        if let Some(v) = exp_offset {
            config.strategy.expiry_offset = *v;
        }
        if let Some(v) = atm_offset {
            config.strategy.atm_offset = *v;
        }
    }
    config.validate()?;

    let broker = connect(&mut config).await?;

    match cli.command {
        Commands::SquareOff { yes } => {
            if !yes && !confirm("Cancel all orders and square off all positions?").await? {
                info!("square-off aborted by operator");
                return Ok(());
            }
            SquareOff::new(broker).run().await?;
            return Ok(());
        }
        Commands::Straddle { .. } => {
            let store = build_straddle_store(broker.as_ref(), &config).await?;
            let engine_cfg = ReconcileConfig {
                stoploss_points: Some(config.strategy.stoploss_points),
                takeprofit_points: Some(config.strategy.takeprofit_points),
                ..engine_config(&config)
            };
            run_strategy(broker, store, engine_cfg, &config).await
        }
        Commands::Renko => {
            let store = build_renko_store(broker.as_ref(), &config).await?;
            run_strategy(broker, store, engine_config(&config), &config).await
        }
        Commands::Supertrend => {
            let store = build_supertrend_store(broker.as_ref(), &config).await?;
            run_strategy(broker, store, engine_config(&config), &config).await
        }
    }
}

/// Build the live client, generating a session first if only an API secret
/// and a request token are available.
async fn connect(config: &mut Config) -> Result<Arc<KiteClient>> {
    if config.kite.access_token.is_empty() {
        let request_token = std::env::var("KITE_REQUEST_TOKEN")
            .context("no access token; set KITE_REQUEST_TOKEN to generate a session")?;
        let access_token = KiteClient::generate_session(&config.kite, &request_token).await?;
        info!("session generated");
        config.kite.access_token = access_token;
    }
    Ok(Arc::new(KiteClient::new(&config.kite)?))
}

fn engine_config(config: &Config) -> ReconcileConfig {
    ReconcileConfig {
        poll_interval: Duration::from_secs(config.engine.poll_interval_secs),
        snapshot_retries: config.engine.snapshot_retries,
        margin_utilization: config.engine.margin_utilization,
        stoploss_points: None,
        takeprofit_points: None,
        fill_poll_interval: Duration::from_millis(config.engine.fill_poll_interval_ms),
        fill_timeout: Duration::from_secs(config.engine.fill_timeout_secs),
    }
}

/// One record: the selected option contract.
async fn build_straddle_store(broker: &dyn BrokerApi, config: &Config) -> Result<InstrumentStore> {
    let option_type: OptionType = config
        .strategy
        .option_type
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let underlying = &config.strategy.underlying;
    let spot = broker.ltp(&underlying_quote_key(underlying)).await?;
    info!(%underlying, %spot, "underlying last traded price");

    let instruments = broker.instruments("NFO").await?;
    let contract = select_option_contract(
        &instruments,
        underlying,
        spot,
        option_type,
        config.strategy.expiry_offset,
        config.strategy.atm_offset,
    )
    .context("no option contract matches the configured expiry/strike offsets")?;

    let quantity = contract.lot_size * config.strategy.lots;
    info!(
        symbol = %contract.tradingsymbol,
        strike = %contract.strike,
        expiry = ?contract.expiry,
        quantity,
        "selected option contract"
    );

    let mut store = InstrumentStore::new();
    store.insert(InstrumentRecord::new(
        &contract.tradingsymbol,
        "NFO",
        contract.instrument_token,
        contract.lot_size,
        quantity,
        SignalState::OptionLeg(OptionLegState::new(&contract, option_type)),
    ));
    Ok(store)
}

/// One record per configured ticker, brick size from hourly history.
async fn build_renko_store(broker: &dyn BrokerApi, config: &Config) -> Result<InstrumentStore> {
    let instruments = broker.instruments("NSE").await?;
    let to = chrono::Utc::now().date_naive();
    let from = to - chrono::Duration::days(60);

    let mut store = InstrumentStore::new();
    for symbol in &config.strategy.tickers {
        let Some(instrument) = instruments.iter().find(|i| &i.tradingsymbol == symbol) else {
            warn!(%symbol, "not in the NSE instrument dump, skipping");
            continue;
        };
        let bars = broker
            .historical_data(instrument.instrument_token, from, to, "60minute")
            .await?;
        let Some(brick_size) = brick_size_from_atr(&bars) else {
            warn!(%symbol, "not enough hourly history for a brick size, skipping");
            continue;
        };
        let Some(quantity) = position_quantity(broker, symbol, config).await? else {
            continue;
        };
        info!(%symbol, %brick_size, quantity, "renko instrument ready");
        store.insert(InstrumentRecord::new(
            symbol,
            "NSE",
            instrument.instrument_token,
            instrument.lot_size,
            quantity,
            SignalState::Renko(RenkoState::new(brick_size)),
        ));
    }
    if store.is_empty() {
        bail!("no tradable instruments for the renko strategy");
    }
    Ok(store)
}

async fn build_supertrend_store(
    broker: &dyn BrokerApi,
    config: &Config,
) -> Result<InstrumentStore> {
    let instruments = broker.instruments("NSE").await?;

    let mut store = InstrumentStore::new();
    for symbol in &config.strategy.tickers {
        let Some(instrument) = instruments.iter().find(|i| &i.tradingsymbol == symbol) else {
            warn!(%symbol, "not in the NSE instrument dump, skipping");
            continue;
        };
        let Some(quantity) = position_quantity(broker, symbol, config).await? else {
            continue;
        };
        info!(%symbol, quantity, "supertrend instrument ready");
        store.insert(InstrumentRecord::new(
            symbol,
            "NSE",
            instrument.instrument_token,
            instrument.lot_size,
            quantity,
            SignalState::Supertrend(SupertrendState::new()),
        ));
    }
    if store.is_empty() {
        bail!("no tradable instruments for the supertrend strategy");
    }
    Ok(store)
}

/// Shares from the per-symbol capital allocation, truncated.
async fn position_quantity(
    broker: &dyn BrokerApi,
    symbol: &str,
    config: &Config,
) -> Result<Option<u32>> {
    let price = broker.ltp(&format!("NSE:{}", symbol)).await?;
    let quantity = (config.strategy.capital_per_symbol / price)
        .floor()
        .to_u32()
        .unwrap_or(0);
    if quantity == 0 {
        warn!(%symbol, %price, "capital_per_symbol buys zero shares, skipping");
        return Ok(None);
    }
    Ok(Some(quantity))
}

/// Wire the tick stream, dispatcher and reconciler, run until shutdown or
/// the configured deadline, then square off.
async fn run_strategy(
    broker: Arc<KiteClient>,
    store: InstrumentStore,
    engine_cfg: ReconcileConfig,
    config: &Config,
) -> Result<()> {
    info!(
        instruments = store.len(),
        run_duration_secs = config.engine.run_duration_secs,
        "starting strategy run"
    );
    let store = Arc::new(store);

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        warn!("interrupt received, shutting down");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    let shutdown_clone = shutdown.clone();
    let run_duration = Duration::from_secs(config.engine.run_duration_secs);
    tokio::spawn(async move {
        tokio::time::sleep(run_duration).await;
        info!("run duration elapsed, shutting down");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    let (tick_tx, tick_rx) = mpsc::channel(256);
    let ticker = KiteTicker::new(&config.kite.api_key, &config.kite.access_token);
    if let Err(err) = ticker.stream(store.tokens(), TickMode::Full, tick_tx).await {
        // The reconciler can still trade from REST quotes.
        error!(%err, "tick stream unavailable");
    }
    tokio::spawn(dispatcher::run(store.clone(), tick_rx));

    let broker: Arc<dyn BrokerApi> = broker;
    let reconciler = Reconciler::new(broker.clone(), store, engine_cfg);
    reconciler.run(shutdown).await;

    if confirm("Square off all positions before exit?").await? {
        SquareOff::new(broker).run().await?;
    } else {
        warn!("exiting without square-off; positions may remain open");
    }
    Ok(())
}

/// Operator yes/no prompt. Non-interactive runs answer yes, so an unattended
/// shutdown always squares off.
async fn confirm(question: &str) -> Result<bool> {
    if !std::io::stdin().is_terminal() {
        return Ok(true);
    }
    let question = format!("{} [y/N] ", question);
    let answer = tokio::task::spawn_blocking(move || {
        use std::io::Write;
        print!("{}", question);
        std::io::stdout().flush().ok();
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await??;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::daily("logs", "intraday-trader.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("intraday_trader=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(true)
        .init();

    Ok(())
}
