use async_trait::async_trait;

/// Wall-clock time in epoch seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Source of scheduler activations.
#[async_trait]
pub trait Ticker: Send {
    /// Waits for the next activation and returns its time (epoch seconds). `None` ends the
    /// schedule.
    async fn next_tick(&mut self) -> Option<i64>;
}
