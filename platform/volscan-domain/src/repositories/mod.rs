pub mod alert_sink;
pub mod candle_source;
pub mod clock;
pub mod time_series;
