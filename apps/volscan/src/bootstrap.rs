use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use volscan_application::config::{self, Config, RuntimeSettings, SinkKind, StoreBackend};
use volscan_application::notify::NotificationDispatcher;
use volscan_application::pipeline::{IngestionPipeline, PipelineSettings};
use volscan_application::scheduler::{Scheduler, SchedulerSettings};
use volscan_application::symbols::SymbolCatalog;
use volscan_domain::repositories::alert_sink::AlertSink;
use volscan_domain::repositories::time_series::TimeSeriesStore;
use volscan_domain::services::anomaly::AnomalyDetector;
use volscan_domain::services::rolling_stats::RollingStatsEngine;
use volscan_infrastructure::alerts::log::LogAlertSink;
use volscan_infrastructure::alerts::telegram::TelegramAlertSink;
use volscan_infrastructure::market_data::binance::BinanceFuturesCandleSource;
use volscan_infrastructure::persistence::memory::InMemoryCandleStore;
use volscan_infrastructure::persistence::postgres_candles::PostgresCandleStore;

pub const DEFAULT_CONFIG_PATH: &str = "platform/ops/configs/sample.toml";
pub const DEFAULT_MIGRATIONS_PATH: &str = "platform/ops/migrations/0001_create_candles.sql";

/// Fully wired service graph for one config.
pub struct Runtime {
    pub settings: RuntimeSettings,
    pub catalog: SymbolCatalog,
    pub pipeline: Arc<IngestionPipeline>,
    pub scheduler: Arc<Scheduler>,
    pub notify_consumer: JoinHandle<()>,
}

pub fn resolve_config_path(cli_path: Option<PathBuf>) -> Result<PathBuf, String> {
    let path = match cli_path {
        Some(path) => path,
        None => match env::var("VOLSCAN_CONFIG") {
            Ok(raw) if !raw.trim().is_empty() => PathBuf::from(raw),
            _ => PathBuf::from(DEFAULT_CONFIG_PATH),
        },
    };
    if !path.is_file() {
        return Err(format!(
            "config file not found (expected {} or set --config/VOLSCAN_CONFIG)",
            path.display()
        ));
    }
    Ok(path)
}

pub fn resolve_db_url(config: &Config) -> Result<String, String> {
    match config.db.url.as_deref() {
        Some(url) if !url.trim().is_empty() => Ok(url.to_string()),
        _ => env::var("VOLSCAN_DB_URL")
            .map_err(|_| "missing db.url in config and env VOLSCAN_DB_URL is not set".to_string()),
    }
}

fn resolve_telegram_token(config: &Config) -> Result<String, String> {
    let from_config = config
        .notify
        .as_ref()
        .and_then(|n| n.telegram_token.as_deref())
        .filter(|token| !token.trim().is_empty());
    match from_config {
        Some(token) => Ok(token.to_string()),
        None => env::var("VOLSCAN_TELEGRAM_TOKEN").map_err(|_| {
            "missing notify.telegram_token in config and env VOLSCAN_TELEGRAM_TOKEN is not set"
                .to_string()
        }),
    }
}

/// Symbols file paths are taken relative to the config file when not absolute and not
/// present relative to the working directory.
fn resolve_symbols_path(config_path: &Path, raw: &str) -> PathBuf {
    let path = PathBuf::from(raw);
    if path.is_absolute() || path.is_file() {
        return path;
    }
    config_path
        .parent()
        .map(|dir| dir.join(&path))
        .filter(|candidate| candidate.is_file())
        .unwrap_or(path)
}

async fn build_store(
    config: &Config,
    settings: &RuntimeSettings,
) -> Result<Arc<dyn TimeSeriesStore>, String> {
    match config.db.backend {
        StoreBackend::Postgres => {
            let db_url = resolve_db_url(config)?;
            let pool_size = u32::try_from(settings.workers).unwrap_or(u32::MAX);
            let store = PostgresCandleStore::connect(
                &db_url,
                config.ohlcv_table(),
                pool_size,
                settings.store_timeout,
            )
            .await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            tracing::warn!("using in-memory candle store; data is lost on exit");
            Ok(Arc::new(InMemoryCandleStore::new()))
        }
    }
}

fn build_sink(config: &Config, settings: &RuntimeSettings) -> Result<Arc<dyn AlertSink>, String> {
    match config.sink_kind() {
        SinkKind::Log => Ok(Arc::new(LogAlertSink)),
        SinkKind::Telegram => {
            let chat_id = config
                .notify
                .as_ref()
                .and_then(|n| n.telegram_chat_id)
                .ok_or_else(|| "notify.telegram_chat_id is required".to_string())?;
            let token = resolve_telegram_token(config)?;
            Ok(Arc::new(TelegramAlertSink::new(
                token,
                chat_id,
                settings.fetch_timeout,
            )?))
        }
    }
}

pub async fn build_runtime(config_path: PathBuf) -> Result<Runtime, String> {
    let config = config::load_config(&config_path)?;
    let settings = config.resolve()?;

    let symbols_path = resolve_symbols_path(&config_path, &config.symbols.path);
    let catalog = SymbolCatalog::load_file(&symbols_path)?;

    let base_url = config.fetch.as_ref().and_then(|f| f.base_url.as_deref());
    let source = Arc::new(BinanceFuturesCandleSource::new(
        base_url,
        settings.fetch_timeout,
    )?);
    let store = build_store(&config, &settings).await?;
    let sink = build_sink(&config, &settings)?;

    let stats = Arc::new(RollingStatsEngine::new(
        settings.window_seconds,
        settings.timeframe.step_seconds,
    )?);
    let pipeline = Arc::new(IngestionPipeline::new(
        source,
        store,
        stats,
        AnomalyDetector::new(settings.policy),
        PipelineSettings {
            timeframe: settings.timeframe.clone(),
            fetch_limit: settings.fetch_limit,
            bootstrap_limit: settings.bootstrap_limit,
            fetch_timeout: settings.fetch_timeout,
            workers: settings.workers,
        },
    )?);

    let (dispatcher, notify_consumer) =
        NotificationDispatcher::spawn(sink, settings.notify_queue_capacity);
    let scheduler = Arc::new(Scheduler::new(
        pipeline.clone(),
        catalog.clone(),
        dispatcher,
        SchedulerSettings {
            report_top_n: settings.report_top_n,
            report_lookback_secs: settings.report_lookback_secs,
        },
    ));

    tracing::info!(
        config = %config_path.display(),
        symbols = catalog.len(),
        timeframe = %settings.timeframe,
        window_secs = settings.window_seconds,
        window_candles = settings.window_candles,
        k = settings.policy.k,
        min_samples = settings.policy.min_samples,
        workers = settings.workers,
        "runtime ready"
    );

    Ok(Runtime {
        settings,
        catalog,
        pipeline,
        scheduler,
        notify_consumer,
    })
}
