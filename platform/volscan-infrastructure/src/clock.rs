use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use volscan_domain::repositories::clock::{Clock, Ticker};
use volscan_domain::value_objects::timeframe::Timeframe;

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Fires `offset_secs` after every bucket boundary of `timeframe`.
pub struct BucketTicker {
    timeframe: Timeframe,
    offset_secs: i64,
    clock: Arc<dyn Clock>,
    fire_immediately: bool,
}

impl BucketTicker {
    pub fn new(timeframe: Timeframe, offset_secs: i64, clock: Arc<dyn Clock>) -> Self {
        let offset_secs = offset_secs.rem_euclid(timeframe.step_seconds);
        Self {
            timeframe,
            offset_secs,
            clock,
            fire_immediately: false,
        }
    }

    /// Makes the first tick fire right away instead of waiting for the next boundary.
    pub fn fire_immediately(mut self, enabled: bool) -> Self {
        self.fire_immediately = enabled;
        self
    }
}

/// First `boundary + offset` strictly after `now`.
pub fn next_fire_time(timeframe: &Timeframe, offset_secs: i64, now: i64) -> i64 {
    let candidate = timeframe.bucket_start(now) + offset_secs;
    if candidate > now {
        candidate
    } else {
        candidate + timeframe.step_seconds
    }
}

#[async_trait]
impl Ticker for BucketTicker {
    async fn next_tick(&mut self) -> Option<i64> {
        let now = self.clock.now();
        if self.fire_immediately {
            self.fire_immediately = false;
            return Some(now);
        }
        let target = next_fire_time(&self.timeframe, self.offset_secs, now);
        let wait = u64::try_from(target - now).unwrap_or(0);
        tracing::debug!(target, wait_secs = wait, "waiting for next tick");
        tokio::time::sleep(Duration::from_secs(wait)).await;
        Some(self.clock.now().max(target))
    }
}
