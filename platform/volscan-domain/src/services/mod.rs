pub mod anomaly;
pub mod dedup;
pub mod rolling_stats;
