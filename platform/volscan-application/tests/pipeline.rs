use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use volscan_application::notify::NotificationDispatcher;
use volscan_application::pipeline::{IngestionPipeline, PipelineSettings};
use volscan_application::scheduler::{Scheduler, SchedulerSettings, SchedulerState, TickOutcome};
use volscan_application::symbols::SymbolCatalog;
use volscan_domain::errors::PipelineError;
use volscan_domain::events::anomaly_event::AnomalyEvent;
use volscan_domain::repositories::alert_sink::AlertSink;
use volscan_domain::repositories::candle_source::CandleSource;
use volscan_domain::repositories::clock::Ticker;
use volscan_domain::repositories::time_series::TimeSeriesStore;
use volscan_domain::services::anomaly::{AnomalyDetector, AnomalyPolicy};
use volscan_domain::services::rolling_stats::RollingStatsEngine;
use volscan_domain::value_objects::candle::Candle;
use volscan_domain::value_objects::symbol::Symbol;
use volscan_domain::value_objects::timeframe::Timeframe;
use volscan_infrastructure::persistence::memory::InMemoryCandleStore;

const STEP: i64 = 180;
const WINDOW_CANDLES: i64 = 50;

fn sym(name: &str) -> Symbol {
    Symbol::new(name).unwrap()
}

fn candle(symbol: &Symbol, idx: i64, volume: f64) -> Candle {
    Candle {
        symbol: symbol.clone(),
        period_start: idx * STEP,
        period_end: (idx + 1) * STEP,
        open: 1.0,
        high: 1.0,
        low: 1.0,
        close: 1.0,
        volume,
    }
}

fn quiet_volume(idx: i64) -> f64 {
    100.0 + ((idx * 7) % 11) as f64 - 5.0
}

/// Serves a fixed series per symbol as an exchange would at `exchange_now`: every candle that
/// has started, the newest one possibly still in progress.
#[derive(Default)]
struct ScriptedSource {
    series: Mutex<HashMap<Symbol, Vec<Candle>>>,
    failing: HashSet<Symbol>,
    /// Calls that fail before the exchange comes back.
    outage_calls: AtomicUsize,
    delay: Option<Duration>,
    exchange_now: AtomicI64,
    calls: AtomicUsize,
    limits: Mutex<Vec<usize>>,
}

impl ScriptedSource {
    fn with_series(series: Vec<(Symbol, Vec<Candle>)>) -> Self {
        Self {
            series: Mutex::new(series.into_iter().collect()),
            ..Self::default()
        }
    }

    fn set_now(&self, now: i64) {
        self.exchange_now.store(now, Ordering::SeqCst);
    }
}

#[async_trait]
impl CandleSource for ScriptedSource {
    async fn fetch(
        &self,
        symbol: &Symbol,
        _timeframe: &Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.limits.lock().push(limit);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.contains(symbol) {
            return Err(PipelineError::TransientFetch("HTTP 503".to_string()));
        }
        if self
            .outage_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(PipelineError::TransientFetch("connection refused".to_string()));
        }
        let now = self.exchange_now.load(Ordering::SeqCst);
        let started: Vec<Candle> = self
            .series
            .lock()
            .get(symbol)
            .map(|series| {
                series
                    .iter()
                    .filter(|c| c.period_start <= now)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let skip = started.len().saturating_sub(limit);
        Ok(started.into_iter().skip(skip).collect())
    }
}

struct FailingWriteStore {
    inner: InMemoryCandleStore,
}

#[async_trait]
impl TimeSeriesStore for FailingWriteStore {
    async fn upsert(&self, _symbol: &Symbol, _candles: &[Candle]) -> Result<u64, PipelineError> {
        Err(PipelineError::StoreWrite("connection reset".to_string()))
    }

    async fn last_period_end(&self, symbol: &Symbol) -> Result<Option<i64>, PipelineError> {
        self.inner.last_period_end(symbol).await
    }

    async fn load_since(&self, symbol: &Symbol, since: i64) -> Result<Vec<Candle>, PipelineError> {
        self.inner.load_since(symbol, since).await
    }

    async fn top_volume(
        &self,
        since: i64,
        limit: usize,
    ) -> Result<Vec<(Symbol, f64)>, PipelineError> {
        self.inner.top_volume(since, limit).await
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<AnomalyEvent>>,
    attempts: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn notify(&self, event: &AnomalyEvent) -> Result<(), PipelineError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(PipelineError::Notify("chat not found".to_string()));
        }
        self.events.lock().push(event.clone());
        Ok(())
    }
}

struct ScriptedTicker {
    ticks: Vec<i64>,
    gap: Duration,
}

#[async_trait]
impl Ticker for ScriptedTicker {
    async fn next_tick(&mut self) -> Option<i64> {
        if self.ticks.is_empty() {
            return None;
        }
        tokio::time::sleep(self.gap).await;
        Some(self.ticks.remove(0))
    }
}

fn settings() -> PipelineSettings {
    PipelineSettings {
        timeframe: Timeframe::parse("3m").unwrap(),
        fetch_limit: 2,
        bootstrap_limit: 100,
        fetch_timeout: Duration::from_millis(500),
        workers: 4,
    }
}

fn pipeline_with(
    source: Arc<ScriptedSource>,
    store: Arc<dyn TimeSeriesStore>,
    settings: PipelineSettings,
) -> IngestionPipeline {
    let stats = Arc::new(RollingStatsEngine::new(WINDOW_CANDLES * STEP, STEP).unwrap());
    IngestionPipeline::new(
        source,
        store,
        stats,
        AnomalyDetector::new(AnomalyPolicy {
            k: 3.0,
            min_samples: 10,
        }),
        settings,
    )
    .unwrap()
}

fn quiet_then_spike(symbol: &Symbol) -> Vec<Candle> {
    let mut series: Vec<Candle> = (0..49).map(|idx| candle(symbol, idx, quiet_volume(idx))).collect();
    series.push(candle(symbol, 49, 1_000.0));
    // In progress at the time of the fetch.
    series.push(candle(symbol, 50, 5.0));
    series
}

async fn wait_for_events(sink: &RecordingSink, expected: usize) {
    for _ in 0..100 {
        if sink.events.lock().len() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn spike_after_quiet_window_is_reported_once() {
    let btc = sym("BTCUSDT");
    let source = Arc::new(ScriptedSource::with_series(vec![(btc.clone(), quiet_then_spike(&btc))]));
    let fetch_time = 50 * STEP + 1;
    source.set_now(fetch_time);
    let store = Arc::new(InMemoryCandleStore::new());
    let pipeline = pipeline_with(source.clone(), store.clone(), settings());

    let first = pipeline.run(&[btc.clone()], fetch_time).await;
    assert!(first.failures.is_empty());
    assert_eq!(first.inserted.get(&btc), Some(&50));
    assert_eq!(first.anomalies.len(), 1);
    let event = &first.anomalies[0];
    assert_eq!(event.symbol, btc);
    assert_eq!(event.observed_volume, 1_000.0);
    assert_eq!(event.timestamp, 49 * STEP);
    assert!(event.baseline_mean > 95.0 && event.baseline_mean < 105.0);
    assert_eq!(*source.limits.lock(), vec![100]);

    // The in-progress candle was never persisted.
    assert_eq!(store.last_period_end(&btc).await.unwrap(), Some(50 * STEP));

    let again = pipeline.run(&[btc.clone()], fetch_time).await;
    assert_eq!(again.inserted.get(&btc), Some(&0));
    assert!(again.anomalies.is_empty());
    assert_eq!(store.len(), 50);
    assert_eq!(pipeline.stats().snapshot(&btc, fetch_time).n, 50);
}

#[tokio::test]
async fn rerun_of_same_tick_changes_nothing() {
    let eth = sym("ETHUSDT");
    let series: Vec<Candle> = (0..30).map(|idx| candle(&eth, idx, quiet_volume(idx))).collect();
    let source = Arc::new(ScriptedSource::with_series(vec![(eth.clone(), series)]));
    let fetch_time = 29 * STEP + 60;
    source.set_now(fetch_time);
    let store = Arc::new(InMemoryCandleStore::new());
    let pipeline = pipeline_with(source, store.clone(), settings());

    let first = pipeline.run(&[eth.clone()], fetch_time).await;
    assert_eq!(first.inserted.get(&eth), Some(&29));
    let before = pipeline.stats().window_state(&eth).unwrap();

    for _ in 0..3 {
        let rerun = pipeline.run(&[eth.clone()], fetch_time).await;
        assert_eq!(rerun.total_inserted(), 0);
        assert!(rerun.failures.is_empty());
    }
    let after = pipeline.stats().window_state(&eth).unwrap();
    assert_eq!(store.len(), 29);
    assert_eq!(before.count(), after.count());
    assert_eq!(before.sum_volume(), after.sum_volume());
}

#[tokio::test]
async fn one_failing_symbol_does_not_affect_the_others() {
    let (a, b, c) = (sym("AAAUSDT"), sym("BBBUSDT"), sym("CCCUSDT"));
    let series = |s: &Symbol| (0..5).map(|idx| candle(s, idx, 10.0)).collect::<Vec<_>>();
    let mut source = ScriptedSource::with_series(vec![
        (a.clone(), series(&a)),
        (b.clone(), series(&b)),
        (c.clone(), series(&c)),
    ]);
    source.failing.insert(b.clone());
    let source = Arc::new(source);
    let fetch_time = 5 * STEP;
    source.set_now(fetch_time);
    let pipeline = pipeline_with(source, Arc::new(InMemoryCandleStore::new()), settings());

    let result = pipeline.run(&[a.clone(), b.clone(), c.clone()], fetch_time).await;
    assert_eq!(result.inserted.get(&a), Some(&5));
    assert_eq!(result.inserted.get(&c), Some(&5));
    assert!(!result.inserted.contains_key(&b));
    assert!(matches!(
        result.failures.get(&b),
        Some(PipelineError::TransientFetch(_))
    ));
    assert!(!result.all_failed());

    assert_eq!(pipeline.stats().snapshot(&a, fetch_time).n, 5);
    assert_eq!(pipeline.stats().snapshot(&c, fetch_time).n, 5);
    assert!(pipeline.stats().window_state(&b).is_none());
}

#[tokio::test]
async fn fetch_timeout_is_a_transient_failure() {
    let sol = sym("SOLUSDT");
    let mut source = ScriptedSource::with_series(vec![(
        sol.clone(),
        (0..5).map(|idx| candle(&sol, idx, 1.0)).collect(),
    )]);
    source.delay = Some(Duration::from_millis(300));
    let source = Arc::new(source);
    source.set_now(5 * STEP);
    let mut short = settings();
    short.fetch_timeout = Duration::from_millis(20);
    let store = Arc::new(InMemoryCandleStore::new());
    let pipeline = pipeline_with(source, store.clone(), short);

    let result = pipeline.run(&[sol.clone()], 5 * STEP).await;
    match result.failures.get(&sol) {
        Some(PipelineError::TransientFetch(msg)) => assert!(msg.contains("timed out")),
        other => panic!("expected timeout failure, got {other:?}"),
    }
    assert!(result.all_failed());
    assert_eq!(store.len(), 0);
}

#[tokio::test]
async fn store_write_failure_leaves_stats_untouched() {
    let xrp = sym("XRPUSDT");
    let source = Arc::new(ScriptedSource::with_series(vec![(
        xrp.clone(),
        (0..12).map(|idx| candle(&xrp, idx, 3.0)).collect(),
    )]));
    source.set_now(12 * STEP);
    let store = Arc::new(FailingWriteStore {
        inner: InMemoryCandleStore::new(),
    });
    let pipeline = pipeline_with(source, store, settings());

    let result = pipeline.run(&[xrp.clone()], 12 * STEP).await;
    assert!(matches!(
        result.failures.get(&xrp),
        Some(PipelineError::StoreWrite(_))
    ));
    assert!(pipeline.stats().window_state(&xrp).is_none());
    assert_eq!(pipeline.stats().snapshot(&xrp, 12 * STEP).n, 0);
}

#[tokio::test]
async fn lagging_symbol_requests_enough_candles_to_close_the_gap() {
    let ada = sym("ADAUSDT");
    let series: Vec<Candle> = (0..25).map(|idx| candle(&ada, idx, 7.0)).collect();
    let store = Arc::new(InMemoryCandleStore::new());
    store.upsert(&ada, &series[..10]).await.unwrap();
    let source = Arc::new(ScriptedSource::with_series(vec![(ada.clone(), series)]));
    let fetch_time = 20 * STEP + 1;
    source.set_now(fetch_time);
    let pipeline = pipeline_with(source.clone(), store.clone(), settings());

    let result = pipeline.run(&[ada.clone()], fetch_time).await;
    assert_eq!(*source.limits.lock(), vec![11]);
    assert_eq!(result.inserted.get(&ada), Some(&10));
    assert_eq!(store.last_period_end(&ada).await.unwrap(), Some(20 * STEP));
}

#[tokio::test]
async fn warm_up_restores_the_baseline_after_restart() {
    let bnb = sym("BNBUSDT");
    let series = quiet_then_spike(&bnb);
    let store = Arc::new(InMemoryCandleStore::new());
    store.upsert(&bnb, &series[..49]).await.unwrap();

    let source = Arc::new(ScriptedSource::with_series(vec![(bnb.clone(), series)]));
    let fetch_time = 50 * STEP + 1;
    source.set_now(fetch_time);
    let pipeline = pipeline_with(source.clone(), store, settings());

    let warm = pipeline.warm_up(&[bnb.clone()], 49 * STEP).await;
    assert_eq!(warm.folded, 49);
    assert!(warm.failures.is_empty());

    let result = pipeline.run(&[bnb.clone()], fetch_time).await;
    assert_eq!(*source.limits.lock(), vec![2]);
    assert_eq!(result.inserted.get(&bnb), Some(&1));
    assert_eq!(result.anomalies.len(), 1);
    assert_eq!(result.anomalies[0].observed_volume, 1_000.0);
}

#[tokio::test]
async fn scheduler_coalesces_a_tick_that_arrives_mid_run() {
    let btc = sym("BTCUSDT");
    let mut source = ScriptedSource::with_series(vec![(btc.clone(), quiet_then_spike(&btc))]);
    source.delay = Some(Duration::from_millis(200));
    let source = Arc::new(source);
    source.set_now(50 * STEP + 1);
    let pipeline = Arc::new(pipeline_with(
        source.clone(),
        Arc::new(InMemoryCandleStore::new()),
        settings(),
    ));
    let sink = Arc::new(RecordingSink::default());
    let (dispatcher, _consumer) = NotificationDispatcher::spawn(sink.clone(), 16);
    let scheduler = Arc::new(Scheduler::new(
        pipeline,
        SymbolCatalog::new(vec![btc.clone()]).unwrap(),
        dispatcher,
        SchedulerSettings::default(),
    ));

    let first = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.on_tick(50 * STEP + 1).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(scheduler.state(), SchedulerState::Running);
    assert!(matches!(
        scheduler.on_tick(50 * STEP + 2).await,
        TickOutcome::Coalesced
    ));

    match first.await.unwrap() {
        TickOutcome::Completed(result) => assert_eq!(result.anomalies.len(), 1),
        TickOutcome::Coalesced => panic!("first tick must run"),
    }
    assert_eq!(scheduler.state(), SchedulerState::Idle);
    assert_eq!(scheduler.coalesced_ticks(), 1);
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);

    wait_for_events(&sink, 1).await;
    assert_eq!(sink.events.lock().len(), 1);
}

#[tokio::test]
async fn run_forever_stops_when_the_ticker_ends() {
    let btc = sym("BTCUSDT");
    let source = Arc::new(ScriptedSource::with_series(vec![(btc.clone(), quiet_then_spike(&btc))]));
    source.set_now(50 * STEP + 1);
    let store = Arc::new(InMemoryCandleStore::new());
    let pipeline = Arc::new(pipeline_with(source, store.clone(), settings()));
    let sink = Arc::new(RecordingSink::default());
    let (dispatcher, consumer) = NotificationDispatcher::spawn(sink.clone(), 16);
    let scheduler = Arc::new(Scheduler::new(
        pipeline,
        SymbolCatalog::new(vec![btc.clone()]).unwrap(),
        dispatcher,
        SchedulerSettings {
            report_top_n: 5,
            report_lookback_secs: 86_400,
        },
    ));

    scheduler
        .clone()
        .run_forever(ScriptedTicker {
            ticks: vec![50 * STEP + 1],
            gap: Duration::ZERO,
        })
        .await;
    assert_eq!(store.len(), 50);
    assert_eq!(scheduler.state(), SchedulerState::Idle);

    drop(scheduler);
    consumer.await.unwrap();
    assert_eq!(sink.events.lock().len(), 1);
}

#[tokio::test]
async fn scheduler_recovers_after_a_tick_where_every_symbol_failed() {
    let btc = sym("BTCUSDT");
    let source = ScriptedSource::with_series(vec![(btc.clone(), quiet_then_spike(&btc))]);
    source.outage_calls.store(1, Ordering::SeqCst);
    let source = Arc::new(source);
    source.set_now(50 * STEP + 1);
    let store = Arc::new(InMemoryCandleStore::new());
    let pipeline = Arc::new(pipeline_with(source.clone(), store.clone(), settings()));
    let sink = Arc::new(RecordingSink::default());
    let (dispatcher, consumer) = NotificationDispatcher::spawn(sink.clone(), 16);
    let scheduler = Arc::new(Scheduler::new(
        pipeline,
        SymbolCatalog::new(vec![btc.clone()]).unwrap(),
        dispatcher,
        SchedulerSettings::default(),
    ));

    scheduler
        .clone()
        .run_forever(ScriptedTicker {
            ticks: vec![50 * STEP + 1, 50 * STEP + 2],
            gap: Duration::from_millis(100),
        })
        .await;

    assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    assert_eq!(scheduler.coalesced_ticks(), 0);
    assert_eq!(scheduler.state(), SchedulerState::Idle);
    assert_eq!(store.len(), 50);
    assert_eq!(store.last_period_end(&btc).await.unwrap(), Some(50 * STEP));

    drop(scheduler);
    consumer.await.unwrap();
    let events = sink.events.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].timestamp, 49 * STEP);
}

fn event(name: &str) -> AnomalyEvent {
    AnomalyEvent {
        symbol: sym(name),
        observed_volume: 1_000.0,
        baseline_mean: 100.0,
        baseline_std_dev: 5.0,
        z_score_threshold: 3.0,
        timestamp: 0,
    }
}

#[tokio::test]
async fn dispatcher_drops_newest_events_when_full() {
    let sink = Arc::new(RecordingSink::default());
    let (dispatcher, consumer) = NotificationDispatcher::spawn(sink.clone(), 1);

    let report = dispatcher.send(vec![event("AUSDT"), event("BUSDT"), event("CUSDT")]);
    assert_eq!(report.queued, 1);
    assert_eq!(report.dropped, 2);

    drop(dispatcher);
    consumer.await.unwrap();
    let delivered = sink.events.lock();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].symbol, sym("AUSDT"));
}

#[tokio::test]
async fn dispatcher_swallows_sink_errors() {
    let sink = Arc::new(RecordingSink {
        fail: true,
        ..RecordingSink::default()
    });
    let (dispatcher, consumer) = NotificationDispatcher::spawn(sink.clone(), 8);

    let report = dispatcher.send(vec![event("AUSDT"), event("BUSDT")]);
    assert_eq!(report.queued, 2);
    drop(dispatcher);
    consumer.await.unwrap();
    assert_eq!(sink.attempts.load(Ordering::SeqCst), 2);
    assert!(sink.events.lock().is_empty());
}
