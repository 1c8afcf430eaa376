//! HdrHistogram-based metrics pipeline.
//!
//! Virtual users emit [`MetricSample`] values through a [`MetricsSink`]
//! (a bounded mpsc channel). A single aggregator task owns the
//! [`MetricsRecorder`] and folds samples into per-metric series; nothing
//! else touches the recorder, so it needs no locking. Point-in-time views
//! are taken with [`MetricsRecorder::snapshot`].
//!
//! # Design
//!
//! - **Built-in metrics are pre-registered**: a metric that never received a
//!   sample still exists in every snapshot, with a sample count of zero.
//! - **Three series kinds**: counters (sum of values), rates (fraction of
//!   non-zero observations), trends (latency distributions).
//! - **Microsecond histograms**: trend values are milliseconds as `f64` and
//!   are stored at microsecond resolution with 3 significant figures.
//!   Min, max and sum are tracked exactly alongside the histogram.
//! - **Order-independent**: every statistic is a commutative fold, so the
//!   arrival order of samples from different virtual users does not matter.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use hdrhistogram::Histogram;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::loadtest::checks::CheckResult;
use crate::loadtest::executor::RequestOutcome;

/// Total HTTP requests issued.
pub const HTTP_REQS: &str = "http_reqs";
/// Total request duration (ms).
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
/// Time until the response head arrived (ms).
pub const HTTP_REQ_WAITING: &str = "http_req_waiting";
/// Time spent reading the response body (ms).
pub const HTTP_REQ_RECEIVING: &str = "http_req_receiving";
/// Fraction of requests that errored or returned an unexpected status.
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
/// Completed iterations.
pub const ITERATIONS: &str = "iterations";
/// Wall-clock duration of one iteration including the pacing sleep (ms).
pub const ITERATION_DURATION: &str = "iteration_duration";
/// Fraction of passed checks across all check names.
pub const CHECKS: &str = "checks";
/// Response body bytes received.
pub const DATA_RECEIVED: &str = "data_received";

/// Kind of a metric series, which decides how samples are folded and which
/// threshold aggregations apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Running sum of sample values.
    Counter,
    /// Fraction of non-zero samples.
    Rate,
    /// Distribution of sample values.
    Trend,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Counter => "counter",
            Self::Rate => "rate",
            Self::Trend => "trend",
        };
        f.write_str(s)
    }
}

/// Every metric the engine emits, with its kind.
pub const BUILTIN_METRICS: &[(&str, MetricKind)] = &[
    (CHECKS, MetricKind::Rate),
    (DATA_RECEIVED, MetricKind::Counter),
    (HTTP_REQ_DURATION, MetricKind::Trend),
    (HTTP_REQ_FAILED, MetricKind::Rate),
    (HTTP_REQ_RECEIVING, MetricKind::Trend),
    (HTTP_REQ_WAITING, MetricKind::Trend),
    (HTTP_REQS, MetricKind::Counter),
    (ITERATION_DURATION, MetricKind::Trend),
    (ITERATIONS, MetricKind::Counter),
];

/// Returns the kind of a built-in metric, or `None` for unknown names.
pub fn builtin_kind(name: &str) -> Option<MetricKind> {
    BUILTIN_METRICS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, kind)| *kind)
}

/// A single timestamped observation for one metric.
///
/// `tag` carries the check name for [`CHECKS`] samples and the error
/// category for failed [`HTTP_REQ_FAILED`] samples.
#[derive(Debug, Clone)]
pub struct MetricSample {
    /// Metric name (one of the built-in constants).
    pub metric: &'static str,
    /// Observed value: milliseconds for trends, 0/1 for rates, an amount
    /// for counters.
    pub value: f64,
    /// Optional tag.
    pub tag: Option<Arc<str>>,
    /// When the sample was taken.
    pub timestamp: Instant,
}

impl MetricSample {
    /// Creates an untagged sample with the current timestamp.
    pub fn new(metric: &'static str, value: f64) -> Self {
        Self {
            metric,
            value,
            tag: None,
            timestamp: Instant::now(),
        }
    }

    /// A trend sample from a duration, in milliseconds.
    pub fn duration(metric: &'static str, duration: Duration) -> Self {
        Self::new(metric, duration.as_secs_f64() * 1000.0)
    }

    /// A rate sample (`true` -> 1.0).
    pub fn flag(metric: &'static str, value: bool) -> Self {
        Self::new(metric, if value { 1.0 } else { 0.0 })
    }

    /// Attaches a tag.
    pub fn with_tag(mut self, tag: Arc<str>) -> Self {
        self.tag = Some(tag);
        self
    }

    /// A [`CHECKS`] sample for one check result.
    pub fn check(result: &CheckResult) -> Self {
        Self::flag(CHECKS, result.passed).with_tag(Arc::clone(&result.name))
    }

    /// The samples describing one request outcome and its check results.
    pub fn from_outcome(outcome: &RequestOutcome, checks: &[CheckResult]) -> Vec<Self> {
        let mut samples = Vec::with_capacity(6 + checks.len());
        samples.push(Self::new(HTTP_REQS, 1.0));
        samples.push(Self::duration(HTTP_REQ_DURATION, outcome.timings.total));
        samples.push(Self::duration(HTTP_REQ_WAITING, outcome.timings.waiting));
        samples.push(Self::duration(
            HTTP_REQ_RECEIVING,
            outcome.timings.receiving,
        ));

        let failed = Self::flag(HTTP_REQ_FAILED, outcome.is_failed());
        samples.push(match failure_category(outcome) {
            Some(category) => failed.with_tag(category),
            None => failed,
        });
        samples.push(Self::new(DATA_RECEIVED, outcome.bytes_received as f64));
        samples.extend(checks.iter().map(Self::check));
        samples
    }
}

/// Error classification for a failed outcome: the transport error category,
/// or `http <status>` for unexpected statuses.
fn failure_category(outcome: &RequestOutcome) -> Option<Arc<str>> {
    if let Some(err) = &outcome.error {
        return Some(Arc::from(err.error_category()));
    }
    match outcome.status {
        Some(status) if outcome.is_failed() => Some(Arc::from(format!("http {status}"))),
        _ => None,
    }
}

/// Pass/fail counts for one named check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckCounts {
    /// Check name.
    pub name: String,
    /// Number of outcomes the check passed on.
    pub passes: u64,
    /// Number of outcomes the check failed on.
    pub fails: u64,
}

impl CheckCounts {
    /// Pass fraction (0.0..=1.0). Returns 0.0 if the check never ran.
    pub fn pass_rate(&self) -> f64 {
        let total = self.passes + self.fails;
        if total == 0 {
            return 0.0;
        }
        self.passes as f64 / total as f64
    }
}

/// Counter statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CounterSummary {
    /// Number of samples.
    pub samples: u64,
    /// Sum of sample values.
    pub sum: f64,
}

impl CounterSummary {
    /// Sum divided by `elapsed`, or 0.0 for a zero-length window.
    pub fn per_second(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            self.sum / secs
        } else {
            0.0
        }
    }
}

/// Rate statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateSummary {
    /// Samples with a non-zero value.
    pub trues: u64,
    /// All samples.
    pub total: u64,
}

impl RateSummary {
    /// Fraction of true observations. Returns 0.0 if no samples recorded.
    pub fn rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.trues as f64 / self.total as f64
    }
}

/// Trend statistics, in milliseconds.
#[derive(Clone)]
pub struct TrendSummary {
    histogram: Histogram<u64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl TrendSummary {
    fn new() -> Self {
        let mut histogram = Histogram::<u64>::new(3).expect("3 sigfigs is always valid");
        histogram.auto(true);
        Self {
            histogram,
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn record(&mut self, value_ms: f64) {
        let value_ms = value_ms.max(0.0);
        let micros = (value_ms * 1000.0).round() as u64;
        let _ = self.histogram.record(micros);
        self.count += 1;
        self.sum += value_ms;
        self.min = self.min.min(value_ms);
        self.max = self.max.max(value_ms);
    }

    /// Number of samples.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Arithmetic mean. Returns 0.0 if no samples recorded.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }

    /// Smallest sample. Returns 0.0 if no samples recorded.
    pub fn min(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.min
    }

    /// Largest sample. Returns 0.0 if no samples recorded.
    pub fn max(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.max
    }

    /// Value at percentile `p` (0..=100). Returns 0.0 if no samples recorded.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let q = (p / 100.0).clamp(0.0, 1.0);
        let value = self.histogram.value_at_quantile(q) as f64 / 1000.0;
        // Histogram buckets round up; never report beyond the observed range.
        value.clamp(self.min, self.max)
    }

    /// Median.
    pub fn med(&self) -> f64 {
        self.percentile(50.0)
    }
}

impl fmt::Debug for TrendSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrendSummary")
            .field("count", &self.count)
            .field("mean", &self.mean())
            .field("min", &self.min())
            .field("max", &self.max())
            .field("p95", &self.percentile(95.0))
            .finish()
    }
}

/// Aggregated state of one metric.
#[derive(Debug, Clone)]
pub enum MetricSummary {
    Counter(CounterSummary),
    Rate(RateSummary),
    Trend(TrendSummary),
}

impl MetricSummary {
    fn empty(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Self::Counter(CounterSummary::default()),
            MetricKind::Rate => Self::Rate(RateSummary::default()),
            MetricKind::Trend => Self::Trend(TrendSummary::new()),
        }
    }

    /// The series kind.
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Rate(_) => MetricKind::Rate,
            Self::Trend(_) => MetricKind::Trend,
        }
    }

    /// Number of samples folded into this metric.
    pub fn samples(&self) -> u64 {
        match self {
            Self::Counter(c) => c.samples,
            Self::Rate(r) => r.total,
            Self::Trend(t) => t.count(),
        }
    }

    fn record(&mut self, value: f64) {
        match self {
            Self::Counter(c) => {
                c.samples += 1;
                c.sum += value;
            },
            Self::Rate(r) => {
                r.total += 1;
                if value != 0.0 {
                    r.trues += 1;
                }
            },
            Self::Trend(t) => t.record(value),
        }
    }
}

/// Point-in-time snapshot of all metrics state.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Time since the recorder was created.
    pub elapsed: Duration,
    /// Every metric, keyed by name.
    pub metrics: BTreeMap<&'static str, MetricSummary>,
    /// Per-check pass/fail counts, in first-seen order.
    pub checks: Vec<CheckCounts>,
    /// Failed request counts by error category.
    pub errors: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    /// Looks up a metric by name.
    pub fn metric(&self, name: &str) -> Option<&MetricSummary> {
        self.metrics.get(name)
    }

    /// Looks up a trend metric by name.
    pub fn trend(&self, name: &str) -> Option<&TrendSummary> {
        match self.metric(name) {
            Some(MetricSummary::Trend(t)) => Some(t),
            _ => None,
        }
    }

    /// Looks up a rate metric by name.
    pub fn rate(&self, name: &str) -> Option<&RateSummary> {
        match self.metric(name) {
            Some(MetricSummary::Rate(r)) => Some(r),
            _ => None,
        }
    }

    /// Looks up a counter metric by name.
    pub fn counter(&self, name: &str) -> Option<&CounterSummary> {
        match self.metric(name) {
            Some(MetricSummary::Counter(c)) => Some(c),
            _ => None,
        }
    }

    /// Total HTTP requests recorded.
    pub fn total_requests(&self) -> u64 {
        self.counter(HTTP_REQS).map_or(0, |c| c.sum as u64)
    }

    /// Total completed iterations.
    pub fn iterations(&self) -> u64 {
        self.counter(ITERATIONS).map_or(0, |c| c.sum as u64)
    }

    /// Fraction of failed requests (0.0..=1.0).
    pub fn failure_rate(&self) -> f64 {
        self.rate(HTTP_REQ_FAILED).map_or(0.0, RateSummary::rate)
    }

    /// Request duration p95 in milliseconds.
    pub fn p95(&self) -> f64 {
        self.trend(HTTP_REQ_DURATION)
            .map_or(0.0, |t| t.percentile(95.0))
    }

    /// Counts for a named check.
    pub fn check(&self, name: &str) -> Option<&CheckCounts> {
        self.checks.iter().find(|c| c.name == name)
    }
}

/// Single-owner recorder folding samples into per-metric series.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use routeload::loadtest::metrics::{MetricsRecorder, MetricSample, HTTP_REQ_DURATION};
///
/// let mut recorder = MetricsRecorder::new();
/// recorder.record(&MetricSample::duration(HTTP_REQ_DURATION, Duration::from_millis(42)));
///
/// let snapshot = recorder.snapshot();
/// let trend = snapshot.trend(HTTP_REQ_DURATION).unwrap();
/// assert_eq!(trend.count(), 1);
/// assert_eq!(trend.max(), 42.0);
/// ```
pub struct MetricsRecorder {
    started: Instant,
    series: BTreeMap<&'static str, MetricSummary>,
    checks: Vec<CheckCounts>,
    errors: BTreeMap<String, u64>,
}

impl MetricsRecorder {
    /// Creates a recorder with every built-in metric registered and empty.
    pub fn new() -> Self {
        let series = BUILTIN_METRICS
            .iter()
            .map(|(name, kind)| (*name, MetricSummary::empty(*kind)))
            .collect();
        Self {
            started: Instant::now(),
            series,
            checks: Vec::new(),
            errors: BTreeMap::new(),
        }
    }

    /// Folds one sample into its metric series.
    ///
    /// Samples for unknown metric names are dropped.
    pub fn record(&mut self, sample: &MetricSample) {
        let Some(series) = self.series.get_mut(sample.metric) else {
            tracing::debug!(metric = sample.metric, "dropping sample for unknown metric");
            return;
        };
        series.record(sample.value);

        let Some(tag) = sample.tag.as_deref() else {
            return;
        };
        let truthy = sample.value != 0.0;
        if sample.metric == CHECKS {
            let counts = match self.checks.iter_mut().position(|c| c.name == tag) {
                Some(idx) => &mut self.checks[idx],
                None => {
                    self.checks.push(CheckCounts {
                        name: tag.to_string(),
                        passes: 0,
                        fails: 0,
                    });
                    let last = self.checks.len() - 1;
                    &mut self.checks[last]
                },
            };
            if truthy {
                counts.passes += 1;
            } else {
                counts.fails += 1;
            }
        } else if sample.metric == HTTP_REQ_FAILED && truthy {
            *self.errors.entry(tag.to_string()).or_insert(0) += 1;
        }
    }

    /// Capture a point-in-time snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            elapsed: self.started.elapsed(),
            metrics: self.series.clone(),
            checks: self.checks.clone(),
            errors: self.errors.clone(),
        }
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Returned by [`MetricsSink::record`] once the aggregator has shut down.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("metrics aggregator has shut down")]
pub struct MetricsClosed;

/// Cloneable, concurrency-safe handle for submitting samples.
///
/// Every virtual user holds a clone; the receiving half is drained by the
/// aggregator task.
#[derive(Debug, Clone)]
pub struct MetricsSink {
    tx: mpsc::Sender<MetricSample>,
}

impl MetricsSink {
    /// Creates a sink and the receiver the aggregator drains.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<MetricSample>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    /// Submits one sample, waiting for buffer space if needed.
    pub async fn record(&self, sample: MetricSample) -> Result<(), MetricsClosed> {
        self.tx.send(sample).await.map_err(|_| MetricsClosed)
    }

    /// Submits samples in order.
    pub async fn record_all(
        &self,
        samples: impl IntoIterator<Item = MetricSample>,
    ) -> Result<(), MetricsClosed> {
        for sample in samples {
            self.record(sample).await?;
        }
        Ok(())
    }
}
