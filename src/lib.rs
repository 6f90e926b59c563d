pub mod error;
pub mod sample;
pub mod dispatch;
pub mod traits;
pub mod processor;
pub mod model;
pub mod grid;
pub mod kde;
pub mod outlier;
pub mod aggregator;
pub mod config;
