//! Pass/fail conditions over aggregated metrics.
//!
//! Expressions follow the `<aggregation> <op> <number>` form, for example
//! `p(95)<2000`, `rate<0.01` or `avg <= 300`. They are parsed once at config
//! load time and evaluated against the final [`MetricsSnapshot`].
//!
//! A metric with zero samples never passes: its thresholds report
//! [`ThresholdStatus::NoSamples`], which counts as a failure.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::loadtest::error::LoadTestError;
use crate::loadtest::metrics::{MetricKind, MetricSummary, MetricsSnapshot};

/// Statistic a threshold is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    Avg,
    Min,
    Max,
    Med,
    /// Percentile in `(0, 100]`.
    Percentile(f64),
    Count,
    /// Fraction of true samples for rates, events per second for counters.
    Rate,
}

impl Aggregation {
    fn parse(token: &str) -> Result<Self, String> {
        match token {
            "avg" => Ok(Self::Avg),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "med" => Ok(Self::Med),
            "count" => Ok(Self::Count),
            "rate" => Ok(Self::Rate),
            other => {
                let inner = other
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| format!("unknown aggregation '{other}'"))?;
                let p: f64 = inner
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid percentile '{inner}'"))?;
                if !(p > 0.0 && p <= 100.0) {
                    return Err(format!("percentile must be in (0, 100], got {p}"));
                }
                Ok(Self::Percentile(p))
            },
        }
    }

    /// Whether this aggregation can be computed for a metric of `kind`.
    pub fn applies_to(self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Trend => !matches!(self, Self::Rate),
            MetricKind::Rate | MetricKind::Counter => matches!(self, Self::Rate | Self::Count),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Avg => f.write_str("avg"),
            Self::Min => f.write_str("min"),
            Self::Max => f.write_str("max"),
            Self::Med => f.write_str("med"),
            Self::Percentile(p) => write!(f, "p({p})"),
            Self::Count => f.write_str("count"),
            Self::Rate => f.write_str("rate"),
        }
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    /// Applies the operator to `observed <op> limit`.
    pub fn holds(self, observed: f64, limit: f64) -> bool {
        match self {
            Self::Lt => observed < limit,
            Self::Le => observed <= limit,
            Self::Gt => observed > limit,
            Self::Ge => observed >= limit,
            Self::Eq => observed == limit,
            Self::Ne => observed != limit,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// A parsed threshold bound to one metric.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    /// Metric the threshold applies to.
    pub metric: String,
    /// Original expression text, as written in the config.
    pub expr: String,
    pub aggregation: Aggregation,
    pub comparison: Comparison,
    pub limit: f64,
}

impl Threshold {
    /// Parses `expr` as a threshold for `metric`.
    ///
    /// ```
    /// use routeload::loadtest::threshold::{Aggregation, Comparison, Threshold};
    ///
    /// let t = Threshold::parse("http_req_duration", "p(95) < 2000").unwrap();
    /// assert_eq!(t.aggregation, Aggregation::Percentile(95.0));
    /// assert_eq!(t.comparison, Comparison::Lt);
    /// assert_eq!(t.limit, 2000.0);
    /// ```
    pub fn parse(metric: &str, expr: &str) -> Result<Self, String> {
        let trimmed = expr.trim();
        let op_at = trimmed
            .find(['<', '>', '=', '!'])
            .ok_or_else(|| format!("missing comparison operator in '{trimmed}'"))?;
        let (lhs, rest) = trimmed.split_at(op_at);

        // Two-character operators first so "<=" does not parse as "<".
        let (comparison, rhs) = [
            ("<=", Comparison::Le),
            (">=", Comparison::Ge),
            ("==", Comparison::Eq),
            ("!=", Comparison::Ne),
            ("<", Comparison::Lt),
            (">", Comparison::Gt),
        ]
        .into_iter()
        .find_map(|(sym, cmp)| rest.strip_prefix(sym).map(|rhs| (cmp, rhs)))
        .ok_or_else(|| format!("invalid comparison operator in '{trimmed}'"))?;

        let aggregation = Aggregation::parse(lhs.trim())?;
        let rhs = rhs.trim();
        let limit: f64 = rhs
            .parse()
            .map_err(|_| format!("invalid threshold value '{rhs}'"))?;
        if !limit.is_finite() {
            return Err(format!("threshold value must be finite, got '{rhs}'"));
        }

        Ok(Self {
            metric: metric.to_string(),
            expr: trimmed.to_string(),
            aggregation,
            comparison,
            limit,
        })
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.metric, self.expr)
    }
}

/// Result of evaluating one threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ThresholdStatus {
    /// Condition held.
    Passed { observed: f64 },
    /// Condition did not hold.
    Failed { observed: f64 },
    /// Not enough samples to evaluate. `required` is 1 for an empty metric,
    /// or the configured minimum for percentiles.
    NoSamples { samples: u64, required: u64 },
}

impl ThresholdStatus {
    /// Only [`ThresholdStatus::Passed`] is a pass.
    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed { .. })
    }
}

/// One evaluated threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdOutcome {
    pub threshold: Threshold,
    pub status: ThresholdStatus,
}

/// All threshold outcomes of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdReport {
    pub outcomes: Vec<ThresholdOutcome>,
}

impl ThresholdReport {
    /// AND of every outcome. An empty report passes.
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.status.is_passed())
    }

    /// Number of outcomes that did not pass.
    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| !o.status.is_passed())
            .count()
    }
}

/// Evaluates every threshold against the final snapshot.
///
/// Percentile thresholds need at least `min_percentile_samples` samples;
/// every other aggregation needs at least one.
///
/// # Errors
///
/// Returns [`LoadTestError::Threshold`] when a threshold names a metric the
/// snapshot does not contain, or an aggregation the metric kind does not
/// support.
pub fn evaluate(
    thresholds: &[Threshold],
    snapshot: &MetricsSnapshot,
    min_percentile_samples: u64,
) -> Result<ThresholdReport, LoadTestError> {
    evaluate_over(thresholds, snapshot, snapshot.elapsed, min_percentile_samples)
}

/// Like [`evaluate`], but counter `rate` aggregations are per second over
/// `elapsed` instead of the snapshot's own clock.
pub fn evaluate_over(
    thresholds: &[Threshold],
    snapshot: &MetricsSnapshot,
    elapsed: Duration,
    min_percentile_samples: u64,
) -> Result<ThresholdReport, LoadTestError> {
    let mut outcomes = Vec::with_capacity(thresholds.len());

    for threshold in thresholds {
        let metric = snapshot.metric(&threshold.metric).ok_or_else(|| {
            LoadTestError::threshold(format!("unknown metric '{}'", threshold.metric))
        })?;
        if !threshold.aggregation.applies_to(metric.kind()) {
            return Err(LoadTestError::threshold(format!(
                "'{}' cannot be applied to {} metric '{}'",
                threshold.aggregation,
                metric.kind(),
                threshold.metric
            )));
        }

        let samples = metric.samples();
        let required = match threshold.aggregation {
            Aggregation::Percentile(_) => min_percentile_samples.max(1),
            _ => 1,
        };
        let status = if samples < required {
            ThresholdStatus::NoSamples { samples, required }
        } else {
            let observed = observe(metric, threshold.aggregation, elapsed);
            if threshold.comparison.holds(observed, threshold.limit) {
                ThresholdStatus::Passed { observed }
            } else {
                ThresholdStatus::Failed { observed }
            }
        };

        outcomes.push(ThresholdOutcome {
            threshold: threshold.clone(),
            status,
        });
    }

    Ok(ThresholdReport { outcomes })
}

fn observe(metric: &MetricSummary, aggregation: Aggregation, elapsed: Duration) -> f64 {
    match (metric, aggregation) {
        (MetricSummary::Trend(t), Aggregation::Avg) => t.mean(),
        (MetricSummary::Trend(t), Aggregation::Min) => t.min(),
        (MetricSummary::Trend(t), Aggregation::Max) => t.max(),
        (MetricSummary::Trend(t), Aggregation::Med) => t.med(),
        (MetricSummary::Trend(t), Aggregation::Percentile(p)) => t.percentile(p),
        (MetricSummary::Trend(t), Aggregation::Count) => t.count() as f64,
        (MetricSummary::Rate(r), Aggregation::Count) => r.trues as f64,
        (MetricSummary::Rate(r), _) => r.rate(),
        (MetricSummary::Counter(c), Aggregation::Count) => c.sum,
        (MetricSummary::Counter(c), _) => c.per_second(elapsed),
        (MetricSummary::Trend(_), Aggregation::Rate) => 0.0,
    }
}
