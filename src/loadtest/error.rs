//! Error types for the load testing engine.
//!
//! Defines [`LoadTestError`] for setup- and evaluation-time failures, and
//! [`RequestError`] for transport failures captured inside a
//! [`RequestOutcome`](crate::loadtest::executor::RequestOutcome).

use crate::loadtest::run::RunState;

/// Errors that abort a load test, either before any virtual user is spawned
/// (configuration) or at the end-of-run evaluation step (thresholds).
#[derive(Debug, thiserror::Error)]
pub enum LoadTestError {
    /// TOML parse failure -- the config file contains invalid TOML syntax
    /// or does not match the expected schema.
    #[error("Failed to parse config TOML: {source}")]
    ConfigParse {
        #[from]
        source: toml::de::Error,
    },

    /// Semantic validation failure -- the config parsed successfully but
    /// contains invalid values (e.g., empty coordinate pool, zero timeout).
    #[error("Config validation error: {message}")]
    ConfigValidation { message: String },

    /// File I/O failure -- the config file could not be read from disk.
    #[error("Failed to read config file '{path}': {source}")]
    ConfigIo {
        source: std::io::Error,
        path: String,
    },

    /// The run lifecycle was asked to move backwards or skip winding-down.
    #[error("Invalid run state transition: {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },

    /// A threshold could not be evaluated (unknown metric, aggregation not
    /// applicable to the metric kind).
    #[error("Threshold evaluation error: {message}")]
    Threshold { message: String },

    /// The JSON summary could not be written.
    #[error("Failed to write summary '{path}': {source}")]
    ReportIo {
        source: std::io::Error,
        path: String,
    },
}

impl LoadTestError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    pub(crate) fn threshold(message: impl Into<String>) -> Self {
        Self::Threshold {
            message: message.into(),
        }
    }
}

/// Transport errors encountered while executing a single request.
///
/// These never propagate out of the executor; they are stored on the
/// outcome and counted by category in the metrics pipeline.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The request exceeded the configured per-request timeout.
    #[error("Request timed out")]
    Timeout,

    /// Connection-level failure (DNS resolution, TCP connect, TLS handshake).
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// The response head arrived but reading the body failed.
    #[error("Failed to read response body: {message}")]
    Body { message: String },

    /// Any other failure while building or sending the request.
    #[error("Request error: {message}")]
    Request { message: String },
}

impl RequestError {
    /// Returns the error category as a static string for metrics classification.
    ///
    /// Categories: `"timeout"`, `"connection"`, `"body"`, `"request"`.
    pub fn error_category(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connection { .. } => "connection",
            Self::Body { .. } => "body",
            Self::Request { .. } => "request",
        }
    }

    /// Classify a [`reqwest::Error`] into the appropriate [`RequestError`] variant.
    pub fn classify_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connection {
                message: err.to_string(),
            }
        } else if err.is_body() || err.is_decode() {
            Self::Body {
                message: err.to_string(),
            }
        } else {
            Self::Request {
                message: err.to_string(),
            }
        }
    }
}
