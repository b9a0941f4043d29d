use crate::value_objects::symbol::Symbol;
use serde::{Deserialize, Serialize};

/// OHLCV summary of one bucket. Times are epoch seconds; `period_end` is exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: Symbol,
    pub period_start: i64,
    pub period_end: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// A candle is final once its period has fully elapsed at `now`.
    pub fn is_final_at(&self, now: i64) -> bool {
        self.period_end <= now
    }

    pub fn span_seconds(&self) -> i64 {
        self.period_end - self.period_start
    }
}
