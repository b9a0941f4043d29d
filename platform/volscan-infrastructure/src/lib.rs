pub mod alerts;
pub mod clock;
pub mod market_data;
pub mod persistence;
