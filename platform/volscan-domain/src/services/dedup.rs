use crate::errors::PipelineError;
use crate::value_objects::candle::Candle;
use crate::value_objects::symbol::Symbol;

/// Selects the candles of one fetch that may be appended to the store.
///
/// `fetched` must be ordered oldest to newest with non-overlapping periods. A candle is
/// admitted when it starts at or after `last_period_end` (nothing already stored is
/// re-admitted) and its period has elapsed at `fetch_time`. The trailing in-progress
/// bucket therefore never passes; gaps after downtime are accepted as-is.
pub fn select_final_candles(
    symbol: &Symbol,
    fetched: &[Candle],
    last_period_end: Option<i64>,
    fetch_time: i64,
) -> Result<Vec<Candle>, PipelineError> {
    validate_sequence(symbol, fetched)?;

    Ok(fetched
        .iter()
        .filter(|candle| candle.is_final_at(fetch_time))
        .filter(|candle| last_period_end.map_or(true, |last| candle.period_start >= last))
        .cloned()
        .collect())
}

fn validate_sequence(symbol: &Symbol, fetched: &[Candle]) -> Result<(), PipelineError> {
    let mut prev_end: Option<i64> = None;
    for (idx, candle) in fetched.iter().enumerate() {
        if &candle.symbol != symbol {
            return Err(PipelineError::MalformedCandleSequence(format!(
                "candle {idx} belongs to {} while fetching {symbol}",
                candle.symbol
            )));
        }
        if candle.period_end <= candle.period_start {
            return Err(PipelineError::MalformedCandleSequence(format!(
                "candle {idx} has empty period [{}, {})",
                candle.period_start, candle.period_end
            )));
        }
        if !candle.volume.is_finite() || candle.volume < 0.0 {
            return Err(PipelineError::MalformedCandleSequence(format!(
                "candle {idx} has invalid volume {}",
                candle.volume
            )));
        }
        if let Some(prev) = prev_end {
            if candle.period_start < prev {
                return Err(PipelineError::MalformedCandleSequence(format!(
                    "candle {idx} starts at {} before previous end {prev} (unsorted or overlapping)",
                    candle.period_start
                )));
            }
        }
        prev_end = Some(candle.period_end);
    }
    Ok(())
}
