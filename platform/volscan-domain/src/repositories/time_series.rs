use crate::errors::PipelineError;
use crate::value_objects::candle::Candle;
use crate::value_objects::symbol::Symbol;
use async_trait::async_trait;

/// Append-only candle store keyed on `(symbol, period_start)`.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Inserts or replaces `candles` atomically. Returns the number of rows written.
    async fn upsert(&self, symbol: &Symbol, candles: &[Candle]) -> Result<u64, PipelineError>;

    async fn last_period_end(&self, symbol: &Symbol) -> Result<Option<i64>, PipelineError>;

    /// Candles with `period_end > since`, oldest first.
    async fn load_since(&self, symbol: &Symbol, since: i64) -> Result<Vec<Candle>, PipelineError>;

    /// Symbols ranked by summed volume of candles starting at or after `since`, highest first.
    async fn top_volume(
        &self,
        since: i64,
        limit: usize,
    ) -> Result<Vec<(Symbol, f64)>, PipelineError>;
}
