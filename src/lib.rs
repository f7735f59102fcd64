/// Market-breadth index over USDT-margined perpetual futures: ingestion,
/// base-price lifecycle, index aggregation, and uptrend-wave segmentation.
pub mod aggregator;
pub mod backfill;
pub mod base_price;
pub mod collector;
pub mod config;
pub mod context;
pub mod distribution;
pub mod error;
pub mod exchange;
pub mod http;
pub mod model;
pub mod persistence;
pub mod time_spec;
pub mod uptrend;
