use metrics::Unit;
use std::net::SocketAddr;

/// Filter env var; overrides `--log-level` when set.
const LOG_ENV: &str = "VOLSCAN_LOG";

/// Buckets for every `*_ms` histogram.
#[cfg(feature = "prometheus")]
const LATENCY_BUCKETS_MS: &[f64] = &[
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0,
];

const COUNTERS: &[(&str, &str)] = &[
    ("volscan.pipeline.runs_total", "Pipeline runs started"),
    ("volscan.pipeline.candles_inserted_total", "Closed candles written to the store"),
    ("volscan.pipeline.anomalies_total", "Volume anomalies detected"),
    ("volscan.pipeline.symbol_failures_total", "Per-symbol pipeline failures by error kind"),
    ("volscan.scheduler.ticks_total", "Ticks that started a run"),
    ("volscan.scheduler.ticks_coalesced_total", "Ticks dropped because a run was still in flight"),
    ("volscan.scheduler.failed_runs_total", "Runs in which every symbol failed"),
    ("volscan.notify.sent_total", "Anomaly notifications delivered to the sink"),
    ("volscan.notify.failed_total", "Anomaly notifications the sink rejected"),
    ("volscan.notify.dropped_total", "Anomaly notifications dropped on a full queue"),
    ("volscan.infra.binance.requests_total", "Binance REST requests by endpoint and result"),
    ("volscan.infra.binance.retries_total", "Binance requests retried after HTTP 429"),
    ("volscan.infra.postgres.calls_total", "Store calls by operation and result"),
    ("volscan.infra.postgres.timeouts_total", "Store calls cut off by db.timeout_ms"),
    ("volscan.infra.postgres.pool.get_errors_total", "Failed pool checkouts"),
    ("volscan.infra.telegram.messages_total", "Telegram sendMessage calls by result"),
];

const HISTOGRAMS_MS: &[(&str, &str)] = &[
    ("volscan.infra.binance.request_ms", "Binance REST request latency"),
    ("volscan.infra.postgres.query_ms", "Store call latency, pool checkout included"),
    ("volscan.infra.postgres.pool.get_ms", "Pool checkout latency"),
];

pub fn init_tracing(log_level: &str, log_format: &str) -> Result<(), String> {
    let filter = std::env::var(LOG_ENV).unwrap_or_else(|_| log_level.to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_new(&filter)
        .map_err(|err| format!("invalid log filter '{filter}': {err}"))?;
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);

    match log_format.trim().to_lowercase().as_str() {
        "json" => builder.json().with_current_span(true).init(),
        "text" | "" => builder.init(),
        other => return Err(format!("unsupported --log-format: {other} (expected text|json)")),
    }
    Ok(())
}

fn describe_metrics() {
    for (name, help) in COUNTERS {
        metrics::describe_counter!(*name, Unit::Count, *help);
    }
    for (name, help) in HISTOGRAMS_MS {
        metrics::describe_histogram!(*name, Unit::Milliseconds, *help);
    }
    metrics::describe_histogram!(
        "volscan.pipeline.run_seconds",
        Unit::Seconds,
        "Wall time of one pipeline run across all symbols"
    );
    metrics::describe_gauge!(
        "volscan.pipeline.tracked_symbols",
        Unit::Count,
        "Symbols with a rolling volume window in memory"
    );
}

#[cfg(feature = "prometheus")]
pub fn init_metrics(metrics_addr: Option<&str>) -> Result<Option<SocketAddr>, String> {
    use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

    let Some(raw) = metrics_addr else {
        return Ok(None);
    };
    let addr: SocketAddr = raw
        .parse()
        .map_err(|err| format!("invalid --metrics-addr (expected host:port): {err}"))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(Matcher::Suffix("_ms".to_string()), LATENCY_BUCKETS_MS)
        .map_err(|err| format!("invalid latency buckets: {err}"))?
        .install()
        .map_err(|err| format!("failed to install prometheus exporter: {err}"))?;

    describe_metrics();
    tracing::info!(metrics_addr = %addr, "prometheus metrics exporter enabled");
    Ok(Some(addr))
}

#[cfg(not(feature = "prometheus"))]
pub fn init_metrics(metrics_addr: Option<&str>) -> Result<Option<SocketAddr>, String> {
    if metrics_addr.is_some() {
        return Err("metrics exporter requires volscan feature `prometheus`".to_string());
    }
    describe_metrics();
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::{COUNTERS, HISTOGRAMS_MS};
    use std::collections::HashSet;

    #[test]
    fn metric_descriptions_are_unique_and_namespaced() {
        let mut seen = HashSet::new();
        for (name, help) in COUNTERS.iter().chain(HISTOGRAMS_MS) {
            assert!(name.starts_with("volscan."), "{name}");
            assert!(!help.is_empty(), "{name}");
            assert!(seen.insert(*name), "duplicate description for {name}");
        }
        assert!(COUNTERS.iter().all(|(name, _)| name.ends_with("_total")));
        assert!(HISTOGRAMS_MS.iter().all(|(name, _)| name.ends_with("_ms")));
    }
}
