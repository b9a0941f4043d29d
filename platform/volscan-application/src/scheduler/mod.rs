use crate::notify::NotificationDispatcher;
use crate::pipeline::{IngestionPipeline, RunResult};
use crate::reporting::{render_report, top_volume_report};
use crate::symbols::SymbolCatalog;
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use volscan_domain::repositories::clock::Ticker;

#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerSettings {
    /// Symbols listed in the post-run volume report; 0 disables it.
    pub report_top_n: usize,
    pub report_lookback_secs: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
}

#[derive(Debug)]
pub enum TickOutcome {
    Completed(RunResult),
    /// A run was already in flight; this tick was dropped.
    Coalesced,
}

/// Drives the pipeline from ticks with at most one run in flight.
pub struct Scheduler {
    pipeline: Arc<IngestionPipeline>,
    catalog: SymbolCatalog,
    dispatcher: NotificationDispatcher,
    settings: SchedulerSettings,
    running: AtomicBool,
    coalesced: AtomicU64,
}

// Returns the scheduler to Idle on drop, including when the run panics.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Scheduler {
    pub fn new(
        pipeline: Arc<IngestionPipeline>,
        catalog: SymbolCatalog,
        dispatcher: NotificationDispatcher,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            pipeline,
            catalog,
            dispatcher,
            settings,
            running: AtomicBool::new(false),
            coalesced: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SchedulerState {
        if self.running.load(Ordering::Acquire) {
            SchedulerState::Running
        } else {
            SchedulerState::Idle
        }
    }

    pub fn coalesced_ticks(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    pub fn catalog(&self) -> &SymbolCatalog {
        &self.catalog
    }

    pub async fn on_tick(&self, fetch_time: i64) -> TickOutcome {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("volscan.scheduler.ticks_coalesced_total").increment(1);
            tracing::warn!(fetch_time, "previous run still in flight; tick coalesced");
            return TickOutcome::Coalesced;
        };
        metrics::counter!("volscan.scheduler.ticks_total").increment(1);

        let result = self
            .pipeline
            .run(self.catalog.symbols(), fetch_time)
            .await;

        if !result.anomalies.is_empty() {
            let report = self.dispatcher.send(result.anomalies.clone());
            tracing::info!(
                queued = report.queued,
                dropped = report.dropped,
                "anomaly notifications dispatched"
            );
        }

        if result.all_failed() {
            metrics::counter!("volscan.scheduler.failed_runs_total").increment(1);
            tracing::error!(
                fetch_time,
                failures = result.failures.len(),
                "every symbol failed this tick"
            );
        }

        if self.settings.report_top_n > 0 {
            self.log_volume_report(fetch_time).await;
        }

        TickOutcome::Completed(result)
    }

    /// Consumes ticks until the ticker ends, then waits for the in-flight run.
    ///
    /// Each tick is spawned so that ticks arriving during a long run reach `on_tick` and are
    /// coalesced instead of queueing up behind it.
    pub async fn run_forever<T: Ticker>(self: Arc<Self>, mut ticker: T) {
        let mut runs = JoinSet::new();
        while let Some(fetch_time) = ticker.next_tick().await {
            while let Some(joined) = runs.join_next().now_or_never().flatten() {
                log_join(joined);
            }
            let scheduler = Arc::clone(&self);
            runs.spawn(async move { scheduler.on_tick(fetch_time).await });
        }
        while let Some(joined) = runs.join_next().await {
            log_join(joined);
        }
        tracing::info!(coalesced = self.coalesced_ticks(), "scheduler stopped");
    }

    async fn log_volume_report(&self, now: i64) {
        match top_volume_report(
            self.pipeline.store().as_ref(),
            now,
            self.settings.report_lookback_secs,
            self.settings.report_top_n,
        )
        .await
        {
            Ok(ranks) if ranks.is_empty() => {}
            Ok(ranks) => {
                tracing::info!(
                    top_n = ranks.len(),
                    lookback_secs = self.settings.report_lookback_secs,
                    "top volume (millions)\n{}",
                    render_report(&ranks)
                );
            }
            Err(err) => tracing::warn!(error = %err, "volume report failed"),
        }
    }
}

fn log_join(joined: Result<TickOutcome, tokio::task::JoinError>) {
    if let Err(err) = joined {
        tracing::error!(error = %err, "scheduler run aborted");
    }
}
