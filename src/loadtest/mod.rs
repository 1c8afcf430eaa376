//! Load testing engine for routing services.
//!
//! Provides typed TOML configuration, a pluggable request executor with
//! named checks, a linear ramp scheduler over virtual users, HdrHistogram
//! based metrics, k6-style thresholds, and console/JSON summaries.

pub mod checks;
pub mod config;
pub mod display;
pub mod engine;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod provider;
pub mod ramp;
pub mod report;
pub mod run;
pub mod scenario;
pub mod summary;
pub mod threshold;
pub mod vu;
