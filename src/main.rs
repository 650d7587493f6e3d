//! Bracket Keeper - Main Entry Point

use anyhow::{Context, Result};
use bracket_keeper::config::Config;
use bracket_keeper::exchange::{BinanceClient, ExchangeClient, MockExchange};
use bracket_keeper::persistence::Store;
use bracket_keeper::strategy::{ProviderRegistry, RunOutcome};
use bracket_keeper::utils::{shutdown_requested, ServiceHandle};
use bracket_keeper::BracketKeeper;
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// How often paper mode copies live market data into the mock exchange.
const PAPER_FEED_INTERVAL: Duration = Duration::from_secs(5);

/// Bracket Keeper CLI
#[derive(Parser)]
#[command(name = "bracket-keeper")]
#[command(version, about = "Scheduled strategies with bracket (TP/SL) order management on Binance")]
struct Cli {
    /// Emit JSON logs on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Route orders to the in-memory paper exchange fed with live market data
    #[arg(long, global = true)]
    paper: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and reconciliation loop until Ctrl-C (default)
    Run,

    /// Evaluate one strategy now
    Evaluate {
        /// Strategy id
        #[arg(short, long)]
        strategy: String,
    },

    /// Run a single reconciliation cycle
    Reconcile,

    /// Show bracket and review queue status from the store
    Status {
        /// Path to SQLite database (default: store.path from config)
        #[arg(short, long)]
        db: Option<String>,

        /// List recent brackets and every review item
        #[arg(short, long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.json)?;

    let config = Config::load()?;
    config.validate().context("Invalid configuration")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&config, cli.paper).await,
        Commands::Evaluate { strategy } => evaluate(&config, cli.paper, &strategy).await,
        Commands::Reconcile => reconcile(&config, cli.paper).await,
        Commands::Status { db, verbose } => {
            show_status(db.as_deref().unwrap_or(&config.store.path), verbose).await
        }
    }
}

fn init_logging(json: bool) -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "bracket-keeper.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer guard alive for the program duration
    Box::leak(Box::new(guard));

    let filter = EnvFilter::from_default_env()
        .add_directive("bracket_keeper=debug".parse()?)
        .add_directive(Level::INFO.into());

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stdout.and(file_writer))
            .with_target(true)
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stdout.and(file_writer))
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(true)
            .init();
    }

    Ok(())
}

/// Live Binance client, or a paper exchange plus the task feeding it.
fn build_exchange(
    config: &Config,
    paper: bool,
) -> Result<(Arc<dyn ExchangeClient>, Option<ServiceHandle>)> {
    let binance = BinanceClient::new(&config.binance).context("Failed to create Binance client")?;

    if !paper {
        anyhow::ensure!(
            !config.binance.api_key.is_empty() && !config.binance.secret_key.is_empty(),
            "Live mode needs BRK__BINANCE__API_KEY and BRK__BINANCE__SECRET_KEY (or use --paper)"
        );
        warn!(testnet = config.binance.testnet, "LIVE MODE - orders go to Binance");
        return Ok((Arc::new(binance), None));
    }

    info!("Paper mode - orders stay in memory");
    let mock = Arc::new(MockExchange::new());
    let symbols: BTreeSet<String> = config
        .strategies
        .iter()
        .flat_map(|s| s.symbols.iter().cloned())
        .collect();

    let feed = {
        let mock = mock.clone();
        ServiceHandle::spawn("paper-feed", move |mut shutdown| async move {
            let mut interval = tokio::time::interval(PAPER_FEED_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => feed_paper_exchange(&binance, &mock, &symbols).await,
                    _ = shutdown_requested(&mut shutdown) => break,
                }
            }
        })
    };

    Ok((mock, Some(feed)))
}

async fn feed_paper_exchange(
    binance: &BinanceClient,
    mock: &MockExchange,
    symbols: &BTreeSet<String>,
) {
    for symbol in symbols {
        match binance.trading_rules(symbol).await {
            Ok(rules) => mock.set_rules(rules).await,
            Err(e) => debug!(%symbol, error = %e, "Keeping previous paper rules"),
        }
        match binance.market_snapshot(symbol).await {
            Ok(snapshot) => {
                let fired = mock.set_snapshot(snapshot).await;
                if !fired.is_empty() {
                    info!(%symbol, fired = ?fired, "Paper legs triggered");
                }
            }
            Err(e) => warn!(%symbol, error = %e, "Failed to fetch market data for paper exchange"),
        }
    }
}

async fn build_keeper(config: &Config, paper: bool) -> Result<(BracketKeeper, Option<ServiceHandle>)> {
    let store = Store::open(&config.store.path, &config.store)
        .with_context(|| format!("Failed to open store at {}", config.store.path))?;
    let (exchange, feed) = build_exchange(config, paper)?;

    let keeper = BracketKeeper::new(config, store, exchange, ProviderRegistry::with_defaults());
    let seeded = keeper.seed_strategies(config).await?;
    info!(strategies = seeded, store = %config.store.path, "Bracket keeper ready");

    Ok((keeper, feed))
}

async fn run(config: &Config, paper: bool) -> Result<()> {
    info!(
        "Bracket Keeper v{} starting ({} mode)",
        env!("CARGO_PKG_VERSION"),
        if paper { "paper" } else { "live" }
    );

    let (keeper, feed) = build_keeper(config, paper).await?;
    let handles = keeper.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown signal received");

    handles.stop().await;
    if let Some(feed) = feed {
        feed.stop().await;
    }

    if !keeper.discrepancies.is_empty() {
        warn!(
            pending = keeper.discrepancies.len(),
            "Exiting with accepted orders not yet persisted; check the exchange manually"
        );
    }
    info!("Bracket keeper shutdown complete");
    Ok(())
}

async fn evaluate(config: &Config, paper: bool, strategy_id: &str) -> Result<()> {
    let (keeper, feed) = build_keeper(config, paper).await?;
    if paper {
        // One feed tick so the paper exchange has prices
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    let outcome = keeper.scheduler.evaluate_once(strategy_id).await;
    if let Some(feed) = feed {
        feed.stop().await;
    }

    match outcome? {
        RunOutcome::Skipped => println!("{}: skipped, another run holds the lease", strategy_id),
        RunOutcome::Completed(report) => {
            println!("Strategy {}", report.strategy_id);
            println!("   ├─ Symbols evaluated: {}", report.evaluated);
            println!("   ├─ No-ops:            {}", report.no_ops);
            println!("   ├─ Submitted:         {}", report.submitted.len());
            for id in &report.submitted {
                println!("   │    {}", id);
            }
            println!("   └─ Failures:          {}", report.failures.len());
            for failure in &report.failures {
                println!("        {} [{}] {}", failure.symbol, failure.kind, failure.message);
            }
        }
    }
    Ok(())
}

async fn reconcile(config: &Config, paper: bool) -> Result<()> {
    let (keeper, feed) = build_keeper(config, paper).await?;
    let report = keeper.reconciler.run_once().await;
    if let Some(feed) = feed {
        feed.stop().await;
    }
    let report = report?;

    println!("Reconciliation cycle");
    println!("   ├─ Brackets polled: {}", report.polled);
    println!("   ├─ Orders updated:  {}", report.updated);
    println!("   ├─ Closed:          {}", report.closed);
    println!("   ├─ Orphaned:        {}", report.orphaned);
    println!("   ├─ Ambiguous:       {}", report.ambiguous);
    println!("   ├─ Recovered:       {}", report.recovered);
    println!("   └─ Errors:          {}", report.errors);
    Ok(())
}

async fn show_status(db_path: &str, verbose: bool) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              BRACKET KEEPER STATUS                         ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   The keeper has not been started yet, or the database path is incorrect.");
        return Ok(());
    }

    let store = Store::open(db_path, &Default::default())?;

    println!("\n📊 Brackets");
    let counts = store.count_brackets_by_status().await?;
    if counts.is_empty() {
        println!("   └─ none");
    }
    for (i, (status, count)) in counts.iter().enumerate() {
        let branch = if i + 1 == counts.len() { "└─" } else { "├─" };
        println!("   {} {:<9} {}", branch, status.as_str(), count);
    }

    let reviews = store.list_reviews().await?;
    let escalated = reviews.iter().filter(|r| r.escalated).count();
    println!("\n🔎 Review queue");
    println!("   ├─ Pending:   {}", reviews.len() - escalated);
    println!("   └─ Escalated: {}", escalated);

    let attention: Vec<_> = store
        .list_brackets(200)
        .await?
        .into_iter()
        .filter(|link| link.sibling_cancel_error.is_some())
        .collect();
    if !attention.is_empty() {
        println!("\n⚠️  Closed with sibling possibly still open");
        for link in &attention {
            println!(
                "   ├─ {} {} sibling of {}: {}",
                link.group_id,
                link.symbol,
                link.closed_leg.map(|l| l.as_str()).unwrap_or("?"),
                link.sibling_cancel_error.as_deref().unwrap_or_default()
            );
        }
    }

    if verbose {
        println!("\n📈 Recent brackets");
        for link in store.list_brackets(20).await? {
            println!(
                "   ├─ {} {:<10} {:<8} {} {}",
                link.created_at.format("%Y-%m-%d %H:%M:%S"),
                link.symbol,
                link.status.as_str(),
                link.group_id,
                link.close_reason.as_deref().unwrap_or("")
            );
        }

        if !reviews.is_empty() {
            println!("\n📝 Review items");
            for item in &reviews {
                println!(
                    "   ├─ {} status={:?} seen={}x last={}{}",
                    item.client_id,
                    item.raw_status,
                    item.occurrences,
                    item.last_seen.format("%Y-%m-%d %H:%M:%S"),
                    if item.escalated { " ESCALATED" } else { "" }
                );
            }
        }
    }

    Ok(())
}
