mod bootstrap;
mod obs;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use volscan_application::config;
use volscan_application::scheduler::TickOutcome;
use volscan_application::symbols::render_symbol_file;
use volscan_domain::repositories::clock::Clock;
use volscan_infrastructure::clock::{BucketTicker, SystemClock};
use volscan_infrastructure::market_data::binance::BinanceFuturesCandleSource;
use volscan_infrastructure::persistence::postgres_candles::migrate_db;

const NOTIFY_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "volscan")]
#[command(
    about = "Incremental OHLCV ingestion and volume-anomaly alerts for Binance USDT futures.",
    version,
    arg_required_else_help = true
)]
#[command(
    after_help = "Examples:\n  volscan migrate --config platform/ops/configs/sample.toml\n  volscan symbols --out platform/ops/configs/binance_USDTFutures.txt\n  volscan once --config platform/ops/configs/sample.toml\n  volscan run --config platform/ops/configs/sample.toml --metrics-addr 127.0.0.1:9000\n"
)]
struct Cli {
    /// Log filter used when VOLSCAN_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log output: text | json
    #[arg(long, global = true, default_value = "text")]
    log_format: String,

    /// Prometheus listener (host:port).
    #[arg(long, global = true)]
    metrics_addr: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted.
    Run {
        /// Config file path (TOML). If omitted, uses env VOLSCAN_CONFIG.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Wait for the first bucket boundary instead of running immediately.
        #[arg(long, default_value_t = false)]
        wait_first_tick: bool,
    },
    /// Run a single tick and print its result as JSON.
    Once {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Fetch time in epoch seconds (defaults to now).
        #[arg(long)]
        fetch_time: Option<i64>,
    },
    /// Apply SQL migrations to the target database.
    Migrate {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Overrides db.url / VOLSCAN_DB_URL.
        #[arg(long)]
        db_url: Option<String>,
        #[arg(long, default_value = bootstrap::DEFAULT_MIGRATIONS_PATH)]
        migrations_path: PathBuf,
    },
    /// Write the current USDT futures symbol list.
    Symbols {
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long, default_value_t = 10_000)]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let cli = Cli::parse();
    obs::init_tracing(&cli.log_level, &cli.log_format)?;
    obs::init_metrics(cli.metrics_addr.as_deref())?;

    match cli.command {
        Commands::Run {
            config,
            wait_first_tick,
        } => run_scheduler(config, wait_first_tick).await,
        Commands::Once { config, fetch_time } => run_once(config, fetch_time).await,
        Commands::Migrate {
            config,
            db_url,
            migrations_path,
        } => {
            let db_url = match db_url {
                Some(url) => url,
                None => {
                    let path = bootstrap::resolve_config_path(config)?;
                    bootstrap::resolve_db_url(&config::load_config(&path)?)?
                }
            };
            migrate_db(&db_url, &migrations_path).await
        }
        Commands::Symbols {
            out,
            base_url,
            timeout_ms,
        } => {
            let source = BinanceFuturesCandleSource::new(
                base_url.as_deref(),
                Duration::from_millis(timeout_ms),
            )?;
            let symbols = source.fetch_usdt_perpetual_symbols().await?;
            if symbols.is_empty() {
                return Err("exchangeInfo returned no USDT symbols".to_string());
            }
            std::fs::write(&out, render_symbol_file(&symbols))
                .map_err(|err| format!("failed to write {}: {}", out.display(), err))?;
            tracing::info!(count = symbols.len(), out = %out.display(), "symbol list written");
            Ok(())
        }
    }
}

async fn run_scheduler(config: Option<PathBuf>, wait_first_tick: bool) -> Result<(), String> {
    let config_path = bootstrap::resolve_config_path(config)?;
    let runtime = bootstrap::build_runtime(config_path).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    runtime
        .pipeline
        .warm_up(runtime.catalog.symbols(), clock.now())
        .await;

    let ticker = BucketTicker::new(
        runtime.settings.timeframe.clone(),
        runtime.settings.tick_offset_secs,
        clock,
    )
    .fire_immediately(!wait_first_tick);

    tokio::select! {
        _ = runtime.scheduler.clone().run_forever(ticker) => {
            tracing::warn!("ticker ended");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|err| format!("failed to listen for shutdown signal: {err}"))?;
            tracing::info!(coalesced = runtime.scheduler.coalesced_ticks(), "shutdown requested");
        }
    }
    Ok(())
}

async fn run_once(config: Option<PathBuf>, fetch_time: Option<i64>) -> Result<(), String> {
    let config_path = bootstrap::resolve_config_path(config)?;
    let runtime = bootstrap::build_runtime(config_path).await?;
    let fetch_time = fetch_time.unwrap_or_else(|| SystemClock.now());

    runtime
        .pipeline
        .warm_up(runtime.catalog.symbols(), fetch_time)
        .await;
    let result = match runtime.scheduler.on_tick(fetch_time).await {
        TickOutcome::Completed(result) => result,
        TickOutcome::Coalesced => return Err("tick coalesced with a run in flight".to_string()),
    };

    let bootstrap::Runtime {
        scheduler,
        notify_consumer,
        ..
    } = runtime;
    drop(scheduler);
    if tokio::time::timeout(NOTIFY_DRAIN_TIMEOUT, notify_consumer)
        .await
        .is_err()
    {
        tracing::warn!("pending notifications not delivered before exit");
    }

    let json = serde_json::to_string_pretty(&result)
        .map_err(|err| format!("failed to serialize run result: {err}"))?;
    println!("{json}");
    if result.all_failed() {
        return Err(format!(
            "every symbol failed ({} failures)",
            result.failures.len()
        ));
    }
    Ok(())
}
