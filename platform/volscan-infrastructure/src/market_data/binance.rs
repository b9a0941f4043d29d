use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use volscan_domain::errors::PipelineError;
use volscan_domain::repositories::candle_source::CandleSource;
use volscan_domain::value_objects::candle::Candle;
use volscan_domain::value_objects::symbol::Symbol;
use volscan_domain::value_objects::timeframe::Timeframe;

pub const BINANCE_FUTURES_BASE: &str = "https://fapi.binance.com";
const BINANCE_KLINES_MAX_LIMIT: usize = 1500;
const MAX_ATTEMPTS: u32 = 5;
const QUOTE_ASSET: &str = "USDT";

/// USDT-margined futures klines over Binance REST.
#[derive(Debug, Clone)]
pub struct BinanceFuturesCandleSource {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<ExchangeSymbol>,
}

#[derive(Debug, Deserialize)]
struct ExchangeSymbol {
    symbol: String,
    #[serde(default)]
    status: Option<String>,
}

impl BinanceFuturesCandleSource {
    pub fn new(base_url: Option<&str>, request_timeout: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(request_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|err| format!("failed to build http client: {err}"))?;
        Ok(Self {
            client,
            base_url: base_url
                .unwrap_or(BINANCE_FUTURES_BASE)
                .trim_end_matches('/')
                .to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Every tradable symbol quoted in USDT, as listed by `exchangeInfo`.
    pub async fn fetch_usdt_perpetual_symbols(&self) -> Result<Vec<Symbol>, String> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let response = self.get_with_retry(&url, &[], "exchange_info").await?;
        let info: ExchangeInfo = response
            .json()
            .await
            .map_err(|err| format!("exchangeInfo response parse failed: {err}"))?;
        Ok(select_usdt_symbols(info))
    }

    async fn get_with_retry(
        &self,
        url: &str,
        query: &[(&str, String)],
        endpoint: &'static str,
    ) -> Result<Response, String> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let started = Instant::now();
            let response = self
                .client
                .get(url)
                .query(query)
                .send()
                .await
                .map_err(|err| {
                    metrics::counter!("volscan.infra.binance.requests_total", "endpoint" => endpoint, "result" => "err")
                        .increment(1);
                    format!("{endpoint} request failed: {err}")
                })?;
            metrics::histogram!("volscan.infra.binance.request_ms", "endpoint" => endpoint)
                .record(started.elapsed().as_secs_f64() * 1000.0);

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS && attempts < MAX_ATTEMPTS {
                metrics::counter!("volscan.infra.binance.retries_total", "endpoint" => endpoint)
                    .increment(1);
                let backoff = 500u64 * attempts as u64;
                tracing::warn!(endpoint, attempts, backoff_ms = backoff, "rate limited; backing off");
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                continue;
            }
            if !status.is_success() {
                metrics::counter!("volscan.infra.binance.requests_total", "endpoint" => endpoint, "result" => "err")
                    .increment(1);
                return Err(format!("{endpoint} request failed with status {status}"));
            }
            metrics::counter!("volscan.infra.binance.requests_total", "endpoint" => endpoint, "result" => "ok")
                .increment(1);
            return Ok(response);
        }
    }
}

#[async_trait]
impl CandleSource for BinanceFuturesCandleSource {
    async fn fetch(
        &self,
        symbol: &Symbol,
        timeframe: &Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, PipelineError> {
        let url = format!("{}/fapi/v1/klines", self.base_url);
        let limit = limit.clamp(1, BINANCE_KLINES_MAX_LIMIT);
        let query = [
            ("symbol", symbol.as_str().to_string()),
            ("interval", timeframe.label.clone()),
            ("limit", limit.to_string()),
        ];
        let response = self
            .get_with_retry(&url, &query, "klines")
            .await
            .map_err(PipelineError::TransientFetch)?;
        let rows: Vec<Vec<Value>> = response
            .json()
            .await
            .map_err(|err| PipelineError::TransientFetch(format!("klines response parse failed: {err}")))?;
        parse_kline_rows(symbol, &rows).map_err(PipelineError::TransientFetch)
    }
}

/// Rows are `[open_ms, open, high, low, close, volume, close_ms, quote_volume, ...]`.
/// The stored volume is the quote-asset (USDT) volume; `close_ms` is inclusive.
pub fn parse_kline_rows(symbol: &Symbol, rows: &[Vec<Value>]) -> Result<Vec<Candle>, String> {
    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        if row.len() < 8 {
            return Err(format!("unexpected kline row length: {}", row.len()));
        }
        let open_ms = parse_i64(&row[0], "open_time")?;
        let close_ms = parse_i64(&row[6], "close_time")?;
        candles.push(Candle {
            symbol: symbol.clone(),
            period_start: open_ms.div_euclid(1000),
            period_end: (close_ms + 1).div_euclid(1000),
            open: parse_f64(&row[1], "open")?,
            high: parse_f64(&row[2], "high")?,
            low: parse_f64(&row[3], "low")?,
            close: parse_f64(&row[4], "close")?,
            volume: parse_f64(&row[7], "quote_volume")?,
        });
    }
    candles.sort_by_key(|c| c.period_start);
    Ok(candles)
}

fn select_usdt_symbols(info: ExchangeInfo) -> Vec<Symbol> {
    info.symbols
        .into_iter()
        .filter(|s| s.symbol.ends_with(QUOTE_ASSET))
        .filter(|s| s.status.as_deref().map_or(true, |status| status == "TRADING"))
        .filter_map(|s| Symbol::new(&s.symbol).ok())
        .collect()
}

fn parse_i64(value: &Value, field: &str) -> Result<i64, String> {
    match value {
        Value::Number(n) => n.as_i64().ok_or_else(|| format!("invalid {field}: {n}")),
        Value::String(s) => s.parse::<i64>().map_err(|_| format!("invalid {field}: {s}")),
        other => Err(format!("invalid {field}: {other}")),
    }
}

fn parse_f64(value: &Value, field: &str) -> Result<f64, String> {
    match value {
        Value::String(s) => s.parse::<f64>().map_err(|_| format!("invalid {field}: {s}")),
        Value::Number(n) => n.as_f64().ok_or_else(|| format!("invalid {field}: {n}")),
        other => Err(format!("invalid {field}: {other}")),
    }
}
