//! JSON summary document for load test results.
//!
//! Produces a schema-versioned JSON document containing every metric,
//! per-check counts, error classification, threshold outcomes and the
//! resolved run configuration. Built from the same final snapshot as the
//! console summary. Designed for CI/CD pipeline consumption.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::loadtest::config::Stage;
use crate::loadtest::engine::LoadTestResult;
use crate::loadtest::error::LoadTestError;
use crate::loadtest::metrics::{CheckCounts, MetricSummary};
use crate::loadtest::threshold::{ThresholdReport, ThresholdStatus};

/// Schema version for the JSON summary format.
///
/// Increment when making breaking changes to the document structure.
/// External tools key on this field to determine parser compatibility.
pub const SCHEMA_VERSION: &str = "1.0";

/// Top-level JSON summary document.
#[derive(Debug, Serialize)]
pub struct SummaryReport {
    /// Document format version for parser compatibility.
    pub schema_version: String,
    /// RFC 3339 timestamp when the document was generated.
    pub timestamp: String,
    /// Routing service base URL that was tested.
    pub base_url: String,
    /// Actual run duration in seconds, including winding-down.
    pub duration_secs: f64,
    /// Peak concurrent virtual users.
    pub vus_max: u32,
    /// Whether the run was stopped before the last stage elapsed.
    pub interrupted: bool,
    /// Resolved configuration (with CLI overrides applied).
    pub config: ReportConfig,
    /// Every metric keyed by name.
    pub metrics: BTreeMap<String, ReportMetric>,
    /// Per-check pass/fail counts in first-seen order.
    pub checks: Vec<CheckCounts>,
    /// Failed request counts by error category.
    pub errors: BTreeMap<String, u64>,
    /// Threshold outcomes, in evaluation order.
    pub thresholds: Vec<ReportThreshold>,
    /// Threshold evaluation error, if evaluation could not complete.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold_error: Option<String>,
    /// AND of every threshold outcome; `false` on an evaluation error.
    pub passed: bool,
}

/// Resolved run configuration embedded in the document.
#[derive(Debug, Serialize)]
pub struct ReportConfig {
    pub profile: String,
    pub timeout_ms: u64,
    pub iteration_period_ms: u64,
    pub start_vus: u32,
    pub stages: Vec<Stage>,
}

/// Aggregated statistics for one metric. Trend values are milliseconds.
#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReportMetric {
    Counter {
        count: f64,
        /// Per second over the run duration.
        rate: f64,
    },
    Rate {
        rate: f64,
        passes: u64,
        fails: u64,
    },
    Trend {
        count: u64,
        avg: f64,
        min: f64,
        med: f64,
        max: f64,
        #[serde(rename = "p(90)")]
        p90: f64,
        #[serde(rename = "p(95)")]
        p95: f64,
        #[serde(rename = "p(99)")]
        p99: f64,
    },
}

/// One threshold outcome.
#[derive(Debug, Serialize)]
pub struct ReportThreshold {
    pub metric: String,
    pub expression: String,
    /// `passed`, `failed` or `no_samples`.
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed: Option<f64>,
    pub samples: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_samples: Option<u64>,
}

impl SummaryReport {
    /// Build the document from a finished run and its threshold evaluation.
    pub fn from_result(
        result: &LoadTestResult,
        thresholds: Result<&ThresholdReport, &LoadTestError>,
    ) -> Self {
        let snap = &result.snapshot;
        let config = &result.config;
        let elapsed_secs = result.elapsed.as_secs_f64();

        let metrics = snap
            .metrics
            .iter()
            .map(|(name, metric)| (name.to_string(), report_metric(metric, result.elapsed)))
            .collect();

        let (threshold_rows, threshold_error, passed) = match thresholds {
            Ok(report) => (
                report
                    .outcomes
                    .iter()
                    .map(|outcome| {
                        let samples = snap
                            .metric(&outcome.threshold.metric)
                            .map(MetricSummary::samples);
                        let (label, observed, required) = match outcome.status {
                            ThresholdStatus::Passed { observed } => {
                                ("passed", Some(observed), None)
                            },
                            ThresholdStatus::Failed { observed } => {
                                ("failed", Some(observed), None)
                            },
                            ThresholdStatus::NoSamples { required, .. } => {
                                ("no_samples", None, Some(required))
                            },
                        };
                        ReportThreshold {
                            metric: outcome.threshold.metric.clone(),
                            expression: outcome.threshold.expr.clone(),
                            outcome: label,
                            observed,
                            samples,
                            required_samples: required,
                        }
                    })
                    .collect(),
                None,
                report.passed(),
            ),
            Err(err) => (Vec::new(), Some(err.to_string()), false),
        };

        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            base_url: config.settings.base_url.clone(),
            duration_secs: elapsed_secs,
            vus_max: result.vus_max,
            interrupted: result.interrupted,
            config: ReportConfig {
                profile: config.settings.profile.clone(),
                timeout_ms: config.settings.timeout_ms,
                iteration_period_ms: config.settings.iteration_period_ms,
                start_vus: config.settings.start_vus,
                stages: config.stage.clone(),
            },
            metrics,
            checks: snap.checks.clone(),
            errors: snap.errors.clone(),
            thresholds: threshold_rows,
            threshold_error,
            passed,
        }
    }
}

fn report_metric(metric: &MetricSummary, elapsed: Duration) -> ReportMetric {
    match metric {
        MetricSummary::Counter(c) => ReportMetric::Counter {
            count: c.sum,
            rate: c.per_second(elapsed),
        },
        MetricSummary::Rate(r) => ReportMetric::Rate {
            rate: r.rate(),
            passes: r.trues,
            fails: r.total - r.trues,
        },
        MetricSummary::Trend(t) => ReportMetric::Trend {
            count: t.count(),
            avg: t.mean(),
            min: t.min(),
            med: t.med(),
            max: t.max(),
            p90: t.percentile(90.0),
            p95: t.percentile(95.0),
            p99: t.percentile(99.0),
        },
    }
}

/// Write the document as pretty-printed JSON to `path`.
///
/// Creates missing parent directories.
pub fn write_report(report: &SummaryReport, path: &Path) -> Result<(), LoadTestError> {
    let io_err = |source: std::io::Error| LoadTestError::ReportIo {
        source,
        path: path.display().to_string(),
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let json = serde_json::to_string_pretty(report).map_err(|e| io_err(std::io::Error::other(e)))?;
    std::fs::write(path, json).map_err(io_err)
}
