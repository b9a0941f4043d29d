use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info_span, Instrument};
use volscan_domain::errors::PipelineError;
use volscan_domain::events::anomaly_event::AnomalyEvent;
use volscan_domain::repositories::candle_source::CandleSource;
use volscan_domain::repositories::time_series::TimeSeriesStore;
use volscan_domain::services::anomaly::AnomalyDetector;
use volscan_domain::services::dedup::select_final_candles;
use volscan_domain::services::rolling_stats::RollingStatsEngine;
use volscan_domain::value_objects::symbol::Symbol;
use volscan_domain::value_objects::timeframe::Timeframe;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub timeframe: Timeframe,
    /// Candles requested per tick for a symbol that is up to date.
    pub fetch_limit: usize,
    /// Upper bound on candles requested for a new or lagging symbol.
    pub bootstrap_limit: usize,
    pub fetch_timeout: Duration,
    pub workers: usize,
}

/// Outcome of one tick. `inserted` holds every symbol that completed, including zero-row ones.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunResult {
    pub fetch_time: i64,
    pub inserted: BTreeMap<Symbol, u64>,
    pub failures: BTreeMap<Symbol, PipelineError>,
    /// In detection order.
    pub anomalies: Vec<AnomalyEvent>,
}

impl RunResult {
    pub fn total_inserted(&self) -> u64 {
        self.inserted.values().sum()
    }

    pub fn all_failed(&self) -> bool {
        self.inserted.is_empty() && !self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WarmUpResult {
    pub folded: u64,
    pub failures: BTreeMap<Symbol, PipelineError>,
}

pub struct IngestionPipeline {
    source: Arc<dyn CandleSource>,
    store: Arc<dyn TimeSeriesStore>,
    stats: Arc<RollingStatsEngine>,
    detector: AnomalyDetector,
    settings: PipelineSettings,
    symbol_guards: Mutex<HashMap<Symbol, Arc<tokio::sync::Mutex<()>>>>,
}

impl IngestionPipeline {
    pub fn new(
        source: Arc<dyn CandleSource>,
        store: Arc<dyn TimeSeriesStore>,
        stats: Arc<RollingStatsEngine>,
        detector: AnomalyDetector,
        settings: PipelineSettings,
    ) -> Result<Self, String> {
        if settings.workers == 0 {
            return Err("workers must be > 0".to_string());
        }
        if settings.fetch_limit < 2 {
            return Err("fetch_limit must be >= 2".to_string());
        }
        if settings.fetch_timeout.is_zero() {
            return Err("fetch_timeout must be > 0".to_string());
        }
        Ok(Self {
            source,
            store,
            stats,
            detector,
            settings,
            symbol_guards: Mutex::new(HashMap::new()),
        })
    }

    pub fn stats(&self) -> &Arc<RollingStatsEngine> {
        &self.stats
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn TimeSeriesStore> {
        &self.store
    }

    /// Runs one tick over `symbols`. Per-symbol failures are collected, never propagated.
    pub async fn run(&self, symbols: &[Symbol], fetch_time: i64) -> RunResult {
        let span = info_span!(
            "app.pipeline.run",
            fetch_time,
            symbols = symbols.len(),
            workers = self.settings.workers
        );
        async move {
            let started = Instant::now();
            let mut result = RunResult {
                fetch_time,
                ..RunResult::default()
            };

            let mut outcomes = stream::iter(symbols.iter().cloned())
                .map(|symbol| async move {
                    let outcome = self.process_symbol(&symbol, fetch_time).await;
                    (symbol, outcome)
                })
                .buffer_unordered(self.settings.workers);

            while let Some((symbol, outcome)) = outcomes.next().await {
                match outcome {
                    Ok((inserted, anomaly)) => {
                        result.inserted.insert(symbol, inserted);
                        if let Some(event) = anomaly {
                            result.anomalies.push(event);
                        }
                    }
                    Err(err) => {
                        metrics::counter!("volscan.pipeline.symbol_failures_total", "kind" => err.kind())
                            .increment(1);
                        tracing::warn!(symbol = %symbol, kind = err.kind(), error = %err, "symbol skipped this tick");
                        result.failures.insert(symbol, err);
                    }
                }
            }

            metrics::counter!("volscan.pipeline.runs_total").increment(1);
            metrics::counter!("volscan.pipeline.candles_inserted_total")
                .increment(result.total_inserted());
            metrics::counter!("volscan.pipeline.anomalies_total")
                .increment(result.anomalies.len() as u64);
            metrics::histogram!("volscan.pipeline.run_seconds")
                .record(started.elapsed().as_secs_f64());
            metrics::gauge!("volscan.pipeline.tracked_symbols")
                .set(self.stats.tracked_symbols() as f64);

            tracing::info!(
                ok = result.inserted.len(),
                failed = result.failures.len(),
                inserted = result.total_inserted(),
                anomalies = result.anomalies.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "pipeline run finished"
            );
            result
        }
        .instrument(span)
        .await
    }

    /// Folds the stored trailing window of every symbol into the stats engine.
    pub async fn warm_up(&self, symbols: &[Symbol], now: i64) -> WarmUpResult {
        let span = info_span!("app.pipeline.warm_up", now, symbols = symbols.len());
        async move {
            let since = now - self.stats.window_seconds();
            let mut result = WarmUpResult::default();
            let mut loads = stream::iter(symbols.iter().cloned())
                .map(|symbol| async move {
                    let loaded = self.store.load_since(&symbol, since).await;
                    (symbol, loaded)
                })
                .buffer_unordered(self.settings.workers);

            while let Some((symbol, loaded)) = loads.next().await {
                match loaded {
                    Ok(candles) => {
                        let guard = self.symbol_guard(&symbol);
                        let _held = guard.lock().await;
                        for candle in candles.iter().filter(|c| c.period_end <= now) {
                            if self.stats.update(&symbol, candle) {
                                result.folded += 1;
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(symbol = %symbol, error = %err, "warm-up load failed");
                        result.failures.insert(symbol, err);
                    }
                }
            }
            tracing::info!(
                folded = result.folded,
                failed = result.failures.len(),
                "stats warm-up finished"
            );
            result
        }
        .instrument(span)
        .await
    }

    async fn process_symbol(
        &self,
        symbol: &Symbol,
        fetch_time: i64,
    ) -> Result<(u64, Option<AnomalyEvent>), PipelineError> {
        let guard = self.symbol_guard(symbol);
        let _held = guard.lock().await;

        let last_period_end = self.store.last_period_end(symbol).await?;
        let limit = self.limit_for(last_period_end, fetch_time);

        let fetched = tokio::time::timeout(
            self.settings.fetch_timeout,
            self.source.fetch(symbol, &self.settings.timeframe, limit),
        )
        .await
        .map_err(|_| {
            PipelineError::TransientFetch(format!(
                "fetch timed out after {} ms",
                self.settings.fetch_timeout.as_millis()
            ))
        })??;

        let admitted = select_final_candles(symbol, &fetched, last_period_end, fetch_time)?;
        let Some((latest, earlier)) = admitted.split_last() else {
            tracing::debug!(symbol = %symbol, fetched = fetched.len(), "no new final candles");
            return Ok((0, None));
        };

        let inserted = self.store.upsert(symbol, &admitted).await?;

        for candle in earlier {
            self.stats.update(symbol, candle);
        }
        let baseline = self.stats.snapshot(symbol, latest.period_start);
        let anomaly = self.detector.evaluate(symbol, latest, &baseline);
        self.stats.update(symbol, latest);

        if let Some(event) = &anomaly {
            tracing::info!(
                symbol = %symbol,
                volume = event.observed_volume,
                mean = event.baseline_mean,
                std_dev = event.baseline_std_dev,
                n = baseline.n,
                "volume anomaly detected"
            );
        }
        tracing::debug!(symbol = %symbol, limit, inserted, "symbol ingested");
        Ok((inserted, anomaly))
    }

    /// Up-to-date symbols use `fetch_limit`; unknown or lagging ones request enough candles to
    /// close the gap, capped at `bootstrap_limit`.
    fn limit_for(&self, last_period_end: Option<i64>, fetch_time: i64) -> usize {
        let fetch_limit = self.settings.fetch_limit;
        let bootstrap_limit = self.settings.bootstrap_limit.max(fetch_limit);
        match last_period_end {
            None => bootstrap_limit,
            Some(last) => {
                let step = self.settings.timeframe.step_seconds;
                let missing = (fetch_time - last).max(0) / step;
                let wanted = usize::try_from(missing).unwrap_or(usize::MAX).saturating_add(1);
                wanted.clamp(fetch_limit, bootstrap_limit)
            }
        }
    }

    fn symbol_guard(&self, symbol: &Symbol) -> Arc<tokio::sync::Mutex<()>> {
        self.symbol_guards
            .lock()
            .entry(symbol.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
