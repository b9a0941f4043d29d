use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed-size bucket interval. `label` is the exchange-style interval (`1m`, `15m`, `4h`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timeframe {
    pub label: String,
    pub step_seconds: i64,
}

impl Timeframe {
    pub fn parse(value: &str) -> Result<Self, String> {
        let normalized = value.trim().to_lowercase();
        let label = match normalized.as_str() {
            "1m" | "1min" => "1m",
            "3m" | "3min" => "3m",
            "5m" | "5min" => "5m",
            "15m" | "15min" => "15m",
            "30m" | "30min" => "30m",
            "1h" | "1hour" => "1h",
            "2h" | "2hour" => "2h",
            "4h" | "4hour" => "4h",
            "6h" | "6hour" => "6h",
            "8h" | "8hour" => "8h",
            "12h" | "12hour" => "12h",
            "1d" | "1day" => "1d",
            "3d" | "3day" => "3d",
            "1w" | "1week" => "1w",
            _ => return Err(format!("unsupported timeframe: {value}")),
        };

        let step_seconds = parse_duration_like_seconds(label)?;
        Ok(Self {
            label: label.to_string(),
            step_seconds,
        })
    }

    /// Start of the bucket containing `ts`.
    pub fn bucket_start(&self, ts: i64) -> i64 {
        ts - ts.rem_euclid(self.step_seconds)
    }

    /// First bucket boundary strictly after `ts`.
    pub fn next_boundary(&self, ts: i64) -> i64 {
        self.bucket_start(ts) + self.step_seconds
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

impl TryFrom<String> for Timeframe {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Timeframe> for String {
    fn from(value: Timeframe) -> Self {
        value.label
    }
}

/// Parses `90s`, `15m`, `15min`, `4h`, `1d`, `1w` or a bare number of seconds.
pub fn parse_duration_like_seconds(value: &str) -> Result<i64, String> {
    let trimmed = value.trim().to_lowercase();
    if trimmed.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(seconds) = trimmed.parse::<i64>() {
        if seconds <= 0 {
            return Err(format!("duration must be > 0: {value}"));
        }
        return Ok(seconds);
    }

    let (number_part, unit) = if let Some(stripped) = trimmed.strip_suffix("min") {
        (stripped, "min")
    } else if let Some(stripped) = trimmed.strip_suffix("hour") {
        (stripped, "hour")
    } else if let Some(stripped) = trimmed.strip_suffix("day") {
        (stripped, "day")
    } else if let Some(stripped) = trimmed.strip_suffix("week") {
        (stripped, "week")
    } else {
        let split = trimmed
            .char_indices()
            .last()
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        trimmed.split_at(split)
    };

    let multiplier = match unit {
        "s" => 1,
        "m" | "min" => 60,
        "h" | "hour" => 3600,
        "d" | "day" => 86400,
        "w" | "week" => 604800,
        _ => return Err(format!("unsupported duration unit: {unit}")),
    };

    let number: i64 = number_part
        .parse()
        .map_err(|_| format!("invalid duration: {value}"))?;
    if number <= 0 {
        return Err(format!("duration must be > 0: {value}"));
    }
    number
        .checked_mul(multiplier)
        .ok_or_else(|| format!("duration out of range: {value}"))
}

/// Number of `step_seconds` buckets needed to cover `window_seconds`, rounded up.
pub fn buckets_covering(window_seconds: i64, step_seconds: i64) -> i64 {
    window_seconds / step_seconds + i64::from(window_seconds % step_seconds != 0)
}
