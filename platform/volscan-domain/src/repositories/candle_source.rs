use crate::errors::PipelineError;
use crate::value_objects::candle::Candle;
use crate::value_objects::symbol::Symbol;
use crate::value_objects::timeframe::Timeframe;
use async_trait::async_trait;

/// Exchange-side candle feed.
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Returns up to `limit` candles ordered oldest to newest. The newest may still be in
    /// progress. Errors are transient by default.
    async fn fetch(
        &self,
        symbol: &Symbol,
        timeframe: &Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, PipelineError>;
}
