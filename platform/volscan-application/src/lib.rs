pub mod config;
pub mod notify;
pub mod pipeline;
pub mod reporting;
pub mod scheduler;
pub mod symbols;
