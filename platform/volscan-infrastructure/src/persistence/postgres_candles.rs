use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use postgres::{NoTls, Row};
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use std::path::Path;
use std::time::{Duration, Instant};
use volscan_domain::errors::PipelineError;
use volscan_domain::repositories::time_series::TimeSeriesStore;
use volscan_domain::value_objects::candle::Candle;
use volscan_domain::value_objects::symbol::Symbol;

type PgPool = Pool<PostgresConnectionManager<NoTls>>;
type PgConnection = PooledConnection<PostgresConnectionManager<NoTls>>;

/// Candle table behind an r2d2 pool.
///
/// Queries run on the blocking thread pool and each call, checkout included, is bounded
/// by `call_timeout`. Broken connections are discarded by the pool and replaced on the
/// next checkout.
#[derive(Clone)]
pub struct PostgresCandleStore {
    pool: PgPool,
    table: String,
    call_timeout: Duration,
}

impl PostgresCandleStore {
    pub async fn connect(
        db_url: &str,
        table: &str,
        pool_size: u32,
        call_timeout: Duration,
    ) -> Result<Self, String> {
        if let Err(err) = validate_table_name(table) {
            return Err(format!("invalid ohlcv_table '{table}': {err}"));
        }
        let call_timeout = call_timeout.max(Duration::from_millis(1));
        let manager = connection_manager(db_url, call_timeout)?;
        let pool = tokio::task::spawn_blocking(move || {
            Pool::builder()
                .max_size(pool_size.max(1))
                .connection_timeout(call_timeout)
                .build(manager)
        })
        .await
        .map_err(|err| format!("postgres pool task failed: {err}"))?
        .map_err(|err| format!("failed to build postgres pool: {err}"))?;

        tracing::info!(table = %table, pool_size, "connected to postgres candle store");
        Ok(Self {
            pool,
            table: table.to_string(),
            call_timeout,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

fn connection_manager(
    db_url: &str,
    connect_timeout: Duration,
) -> Result<PostgresConnectionManager<NoTls>, String> {
    let mut config = db_url
        .parse::<postgres::Config>()
        .map_err(|err| format!("invalid postgres db url: {err}"))?;
    config.connect_timeout(connect_timeout);
    Ok(PostgresConnectionManager::new(config, NoTls))
}

pub async fn migrate_db(db_url: &str, migrations_path: &Path) -> Result<(), String> {
    let sql = std::fs::read_to_string(migrations_path).map_err(|err| {
        format!(
            "failed to read migrations file {}: {}",
            migrations_path.display(),
            err
        )
    })?;
    let config = db_url
        .parse::<postgres::Config>()
        .map_err(|err| format!("invalid postgres db url: {err}"))?;
    tokio::task::spawn_blocking(move || {
        let mut client = config
            .connect(NoTls)
            .map_err(|err| format!("failed to connect to postgres: {err}"))?;
        client
            .batch_execute(&sql)
            .map_err(|err| format!("failed to apply migrations: {err}"))
    })
    .await
    .map_err(|err| format!("migration task failed: {err}"))??;
    tracing::info!(path = %migrations_path.display(), "migrations applied");
    Ok(())
}

/// Runs `task` on the blocking pool; gives up after `timeout`.
async fn run_bounded<T, F>(op: &'static str, timeout: Duration, task: F) -> Result<T, String>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, String> + Send + 'static,
{
    let started = Instant::now();
    let result = match tokio::time::timeout(timeout, tokio::task::spawn_blocking(task)).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => Err(format!("postgres {op} task failed: {err}")),
        Err(_) => {
            metrics::counter!("volscan.infra.postgres.timeouts_total", "op" => op).increment(1);
            Err(format!(
                "postgres {op} timed out after {} ms",
                timeout.as_millis()
            ))
        }
    };
    record_call(op, result.is_ok(), started);
    result
}

fn checkout(pool: &PgPool) -> Result<PgConnection, String> {
    let started = Instant::now();
    let client = pool.get().map_err(|err| {
        metrics::counter!("volscan.infra.postgres.pool.get_errors_total").increment(1);
        format!("failed to checkout postgres connection: {err}")
    })?;
    metrics::histogram!("volscan.infra.postgres.pool.get_ms")
        .record(started.elapsed().as_secs_f64() * 1000.0);
    Ok(client)
}

fn to_utc(ts: i64) -> Result<DateTime<Utc>, String> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| format!("invalid timestamp: {ts}"))
}

fn record_call(op: &'static str, ok: bool, started: Instant) {
    let result = if ok { "ok" } else { "err" };
    metrics::counter!("volscan.infra.postgres.calls_total", "op" => op, "result" => result)
        .increment(1);
    metrics::histogram!("volscan.infra.postgres.query_ms", "op" => op)
        .record(started.elapsed().as_secs_f64() * 1000.0);
}

fn row_to_candle(symbol: &Symbol, row: &Row) -> Result<Candle, String> {
    let period_start: DateTime<Utc> = row.try_get(0).map_err(|err| err.to_string())?;
    let period_end: DateTime<Utc> = row.try_get(1).map_err(|err| err.to_string())?;
    Ok(Candle {
        symbol: symbol.clone(),
        period_start: period_start.timestamp(),
        period_end: period_end.timestamp(),
        open: row.try_get(2).map_err(|err| err.to_string())?,
        high: row.try_get(3).map_err(|err| err.to_string())?,
        low: row.try_get(4).map_err(|err| err.to_string())?,
        close: row.try_get(5).map_err(|err| err.to_string())?,
        volume: row.try_get(6).map_err(|err| err.to_string())?,
    })
}

fn upsert_rows(
    pool: &PgPool,
    table: &str,
    symbol: &Symbol,
    candles: &[Candle],
) -> Result<u64, String> {
    if let Some(foreign) = candles.iter().find(|candle| &candle.symbol != symbol) {
        return Err(format!(
            "candle for {} passed to upsert of {symbol}",
            foreign.symbol
        ));
    }
    let mut client = checkout(pool)?;
    let mut transaction = client
        .transaction()
        .map_err(|err| format!("failed to start transaction: {err}"))?;
    let statement = transaction
        .prepare(&format!(
            "INSERT INTO {table} (symbol, period_start, period_end, open, high, low, close, volume)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (symbol, period_start)
             DO UPDATE SET
                period_end = EXCLUDED.period_end,
                open = EXCLUDED.open,
                high = EXCLUDED.high,
                low = EXCLUDED.low,
                close = EXCLUDED.close,
                volume = EXCLUDED.volume,
                ingested_at = NOW()"
        ))
        .map_err(|err| format!("failed to prepare upsert: {err}"))?;

    let mut total = 0u64;
    for candle in candles {
        let period_start = to_utc(candle.period_start)?;
        let period_end = to_utc(candle.period_end)?;
        total += transaction
            .execute(
                &statement,
                &[
                    &symbol.as_str(),
                    &period_start,
                    &period_end,
                    &candle.open,
                    &candle.high,
                    &candle.low,
                    &candle.close,
                    &candle.volume,
                ],
            )
            .map_err(|err| format!("upsert failed: {err}"))?;
    }
    transaction
        .commit()
        .map_err(|err| format!("failed to commit: {err}"))?;
    Ok(total)
}

#[async_trait]
impl TimeSeriesStore for PostgresCandleStore {
    async fn upsert(&self, symbol: &Symbol, candles: &[Candle]) -> Result<u64, PipelineError> {
        if candles.is_empty() {
            return Ok(0);
        }
        let span = tracing::debug_span!(
            "infra.postgres.upsert",
            table = %self.table,
            symbol = %symbol,
            rows = candles.len()
        );
        let pool = self.pool.clone();
        let table = self.table.clone();
        let symbol = symbol.clone();
        let candles = candles.to_vec();
        run_bounded("upsert", self.call_timeout, move || {
            span.in_scope(|| upsert_rows(&pool, &table, &symbol, &candles))
        })
        .await
        .map_err(PipelineError::StoreWrite)
    }

    async fn last_period_end(&self, symbol: &Symbol) -> Result<Option<i64>, PipelineError> {
        let pool = self.pool.clone();
        let query = format!("SELECT MAX(period_end) FROM {} WHERE symbol = $1", self.table);
        let symbol = symbol.clone();
        run_bounded("last_period_end", self.call_timeout, move || {
            let mut client = checkout(&pool)?;
            let row = client
                .query_one(&query, &[&symbol.as_str()])
                .map_err(|err| format!("failed to query last period: {err}"))?;
            let last: Option<DateTime<Utc>> = row.try_get(0).map_err(|err| err.to_string())?;
            Ok(last.map(|ts| ts.timestamp()))
        })
        .await
        .map_err(PipelineError::StoreRead)
    }

    async fn load_since(&self, symbol: &Symbol, since: i64) -> Result<Vec<Candle>, PipelineError> {
        let pool = self.pool.clone();
        let query = format!(
            "SELECT period_start, period_end, open, high, low, close, volume FROM {} \
             WHERE symbol = $1 AND period_end > $2 \
             ORDER BY period_start ASC",
            self.table
        );
        let symbol = symbol.clone();
        run_bounded("load_since", self.call_timeout, move || {
            let since = to_utc(since)?;
            let mut client = checkout(&pool)?;
            let rows = client
                .query(&query, &[&symbol.as_str(), &since])
                .map_err(|err| format!("failed to load candles: {err}"))?;
            rows.iter()
                .map(|row| row_to_candle(&symbol, row))
                .collect::<Result<Vec<_>, String>>()
        })
        .await
        .map_err(PipelineError::StoreRead)
    }

    async fn top_volume(
        &self,
        since: i64,
        limit: usize,
    ) -> Result<Vec<(Symbol, f64)>, PipelineError> {
        let pool = self.pool.clone();
        let query = format!(
            "SELECT symbol, SUM(volume) AS sum_volume FROM {} \
             WHERE period_start >= $1 \
             GROUP BY symbol \
             ORDER BY sum_volume DESC, symbol ASC \
             LIMIT $2",
            self.table
        );
        run_bounded("top_volume", self.call_timeout, move || {
            let since = to_utc(since)?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let mut client = checkout(&pool)?;
            let rows = client
                .query(&query, &[&since, &limit])
                .map_err(|err| format!("failed to rank volume: {err}"))?;
            let mut ranked = Vec::with_capacity(rows.len());
            for row in rows {
                let name: String = row.try_get(0).map_err(|err| err.to_string())?;
                let volume: f64 = row.try_get(1).map_err(|err| err.to_string())?;
                ranked.push((Symbol::new(&name)?, volume));
            }
            Ok(ranked)
        })
        .await
        .map_err(PipelineError::StoreRead)
    }
}

pub fn validate_table_name(table: &str) -> Result<(), String> {
    if table.is_empty() {
        return Err("table name is empty".to_string());
    }
    let parts: Vec<&str> = table.split('.').collect();
    if parts.len() > 2 {
        return Err(format!("invalid table name: {table}"));
    }
    for part in parts {
        let mut chars = part.chars();
        let valid_first = chars
            .next()
            .is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '_');
        if !valid_first || !chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
            return Err(format!("invalid table name: {table}"));
        }
    }
    Ok(())
}
