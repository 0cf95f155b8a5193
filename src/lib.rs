//! Prometheus exporter for the metrics of a single Rocket Pool node.

pub mod agent;
pub mod beacon;
pub mod collector;
pub mod config;
pub mod execution;
pub mod export;
pub mod rewards;
pub mod state;
