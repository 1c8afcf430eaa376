//! Staged load testing for HTTP routing services.
//!
//! The [`loadtest`] module holds the engine: virtual users issuing paced
//! route requests, a ramp scheduler driving their count, metric
//! aggregation, threshold evaluation and the console and JSON summaries.
//! The `routeload` binary is a thin CLI over it.

pub mod loadtest;
