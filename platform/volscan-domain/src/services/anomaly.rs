use crate::events::anomaly_event::AnomalyEvent;
use crate::services::rolling_stats::VolumeStats;
use crate::value_objects::candle::Candle;
use crate::value_objects::symbol::Symbol;
use serde::{Deserialize, Serialize};

pub const DEFAULT_Z_SCORE_MULTIPLIER: f64 = 3.0;
pub const DEFAULT_MIN_SAMPLES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnomalyPolicy {
    /// Standard deviations above the mean a volume must exceed.
    pub k: f64,
    /// Below this many baseline samples nothing is flagged.
    pub min_samples: usize,
}

impl Default for AnomalyPolicy {
    fn default() -> Self {
        Self {
            k: DEFAULT_Z_SCORE_MULTIPLIER,
            min_samples: DEFAULT_MIN_SAMPLES,
        }
    }
}

impl AnomalyPolicy {
    /// Default sample floor for a window holding `window_candles` buckets.
    pub fn derived_min_samples(window_candles: usize) -> usize {
        DEFAULT_MIN_SAMPLES.min(window_candles).max(1)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AnomalyDetector {
    policy: AnomalyPolicy,
}

impl AnomalyDetector {
    pub fn new(policy: AnomalyPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &AnomalyPolicy {
        &self.policy
    }

    pub fn threshold(&self, stats: &VolumeStats) -> f64 {
        stats.mean + self.policy.k * stats.std_dev
    }

    /// Flags `latest` when its volume is strictly above the baseline threshold.
    ///
    /// The baseline must end at or before `latest.period_start`; a baseline that already
    /// contains the evaluated candle is refused rather than compared against.
    pub fn evaluate(
        &self,
        symbol: &Symbol,
        latest: &Candle,
        stats: &VolumeStats,
    ) -> Option<AnomalyEvent> {
        if stats.n == 0 || stats.n < self.policy.min_samples {
            return None;
        }
        if let Some(newest) = stats.newest_period_end {
            if newest > latest.period_start {
                tracing::warn!(
                    symbol = %symbol,
                    baseline_end = newest,
                    candle_start = latest.period_start,
                    "baseline overlaps evaluated candle; skipping evaluation"
                );
                return None;
            }
        }
        if !latest.volume.is_finite() {
            return None;
        }

        let threshold = self.threshold(stats);
        if latest.volume > threshold {
            Some(AnomalyEvent {
                symbol: symbol.clone(),
                observed_volume: latest.volume,
                baseline_mean: stats.mean,
                baseline_std_dev: stats.std_dev,
                z_score_threshold: self.policy.k,
                timestamp: latest.period_start,
            })
        } else {
            None
        }
    }
}
