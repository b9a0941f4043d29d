use crate::value_objects::symbol::Symbol;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A symbol whose latest final candle traded volume above `mean + k * std_dev` of its baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub symbol: Symbol,
    pub observed_volume: f64,
    pub baseline_mean: f64,
    pub baseline_std_dev: f64,
    pub z_score_threshold: f64,
    /// `period_start` of the flagged candle, epoch seconds.
    pub timestamp: i64,
}

impl AnomalyEvent {
    pub fn threshold_volume(&self) -> f64 {
        self.baseline_mean + self.z_score_threshold * self.baseline_std_dev
    }

    /// Observed z-score; infinite when the baseline had no dispersion.
    pub fn z_score(&self) -> f64 {
        if self.baseline_std_dev > 0.0 {
            (self.observed_volume - self.baseline_mean) / self.baseline_std_dev
        } else {
            f64::INFINITY
        }
    }

    /// Single-message rendering used by chat-style alert sinks.
    pub fn to_message(&self) -> String {
        let at = Utc
            .timestamp_opt(self.timestamp, 0)
            .single()
            .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| self.timestamp.to_string());
        let z = self.z_score();
        let z = if z.is_finite() {
            format!("{z:.2}")
        } else {
            "inf".to_string()
        };
        format!(
            "volume spike {symbol} @ {at}\nvolume {observed:.2} > {threshold:.2} (mean {mean:.2} + {k}σ {std:.2})\nz = {z}",
            symbol = self.symbol,
            observed = self.observed_volume,
            threshold = self.threshold_volume(),
            mean = self.baseline_mean,
            k = self.z_score_threshold,
            std = self.baseline_std_dev,
        )
    }
}
