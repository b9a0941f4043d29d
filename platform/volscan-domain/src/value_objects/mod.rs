pub mod candle;
pub mod symbol;
pub mod timeframe;
