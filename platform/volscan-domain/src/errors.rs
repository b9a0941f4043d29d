use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-symbol failure of one pipeline stage. None of these cross symbols or stop the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum PipelineError {
    /// Network, HTTP status, payload parse or timeout. Retried on the next tick.
    TransientFetch(String),
    /// Unsorted, overlapping or otherwise invalid candle sequence.
    MalformedCandleSequence(String),
    StoreRead(String),
    StoreWrite(String),
    Notify(String),
}

impl PipelineError {
    /// Stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::TransientFetch(_) => "transient_fetch",
            PipelineError::MalformedCandleSequence(_) => "malformed_candle_sequence",
            PipelineError::StoreRead(_) => "store_read",
            PipelineError::StoreWrite(_) => "store_write",
            PipelineError::Notify(_) => "notify",
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::TransientFetch(msg) => write!(f, "transient fetch error: {msg}"),
            PipelineError::MalformedCandleSequence(msg) => {
                write!(f, "malformed candle sequence: {msg}")
            }
            PipelineError::StoreRead(msg) => write!(f, "store read error: {msg}"),
            PipelineError::StoreWrite(msg) => write!(f, "store write error: {msg}"),
            PipelineError::Notify(msg) => write!(f, "notify error: {msg}"),
        }
    }
}

impl std::error::Error for PipelineError {}
