use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use volscan_domain::errors::PipelineError;
use volscan_domain::repositories::time_series::TimeSeriesStore;
use volscan_domain::value_objects::candle::Candle;
use volscan_domain::value_objects::symbol::Symbol;

/// Process-local store keyed on `(symbol, period_start)`. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryCandleStore {
    rows: RwLock<HashMap<Symbol, BTreeMap<i64, Candle>>>,
}

impl InMemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total rows across all symbols.
    pub fn len(&self) -> usize {
        self.rows.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn candles(&self, symbol: &Symbol) -> Vec<Candle> {
        self.rows
            .read()
            .get(symbol)
            .map(|series| series.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TimeSeriesStore for InMemoryCandleStore {
    async fn upsert(&self, symbol: &Symbol, candles: &[Candle]) -> Result<u64, PipelineError> {
        if let Some(foreign) = candles.iter().find(|c| &c.symbol != symbol) {
            return Err(PipelineError::StoreWrite(format!(
                "candle for {} passed to upsert of {symbol}",
                foreign.symbol
            )));
        }
        let mut rows = self.rows.write();
        let series = rows.entry(symbol.clone()).or_default();
        for candle in candles {
            series.insert(candle.period_start, candle.clone());
        }
        Ok(candles.len() as u64)
    }

    async fn last_period_end(&self, symbol: &Symbol) -> Result<Option<i64>, PipelineError> {
        Ok(self
            .rows
            .read()
            .get(symbol)
            .and_then(|series| series.values().map(|c| c.period_end).max()))
    }

    async fn load_since(&self, symbol: &Symbol, since: i64) -> Result<Vec<Candle>, PipelineError> {
        Ok(self
            .rows
            .read()
            .get(symbol)
            .map(|series| {
                series
                    .values()
                    .filter(|c| c.period_end > since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn top_volume(
        &self,
        since: i64,
        limit: usize,
    ) -> Result<Vec<(Symbol, f64)>, PipelineError> {
        let rows = self.rows.read();
        let mut ranked: Vec<(Symbol, f64)> = rows
            .iter()
            .filter_map(|(symbol, series)| {
                let in_range: Vec<f64> = series
                    .range(since..)
                    .map(|(_, candle)| candle.volume)
                    .collect();
                (!in_range.is_empty()).then(|| (symbol.clone(), in_range.iter().sum()))
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);
        Ok(ranked)
    }
}
