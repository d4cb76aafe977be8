//! Metrics & Circuit-Breaker Engine (C2): per-(baseURL, key) sliding-window
//! health tracking, time-bucketed history, and durable persistence.

pub mod engine;
pub mod estimator;
pub mod history;
pub mod key_metrics;
pub mod persistence;

pub use engine::{aggregate_daily_stats, MetricsConfig, MetricsEngine};
pub use estimator::{HeuristicEstimator, UsageEstimator};
pub use history::HistoricalStats;
pub use key_metrics::{metrics_key, KeyMetrics, RequestRecord};
