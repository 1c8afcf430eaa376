//! k6-style terminal summary renderer for load test results.
//!
//! Produces a colorized, human-readable summary with:
//! - ASCII art header with the test configuration
//! - Per-check pass/fail lines
//! - Dotted-line metric rows (metric.........: value)
//! - Error classification breakdown
//! - Threshold outcomes and the overall verdict
//!
//! The renderer is a pure function: [`render_summary`] takes structured data
//! and returns a formatted [`String`]. No I/O, no side effects -- easy to
//! unit test without terminal access.
//!
//! Color coding is applied via the `colored` crate, which respects
//! the global override set by [`colored::control::set_override(false)`]
//! when `--no-color` is active or stdout is piped.

use colored::Colorize;
use std::time::Duration;

use crate::loadtest::engine::LoadTestResult;
use crate::loadtest::error::LoadTestError;
use crate::loadtest::metrics::{MetricSummary, TrendSummary};
use crate::loadtest::threshold::{ThresholdReport, ThresholdStatus};

/// Width for dotted metric row padding.
const PAD_WIDTH: usize = 32;

/// Render a k6-style terminal summary.
///
/// `thresholds` is the outcome of threshold evaluation; an evaluation
/// error is reported in place of the threshold section while every metric
/// is still rendered.
///
/// # Layout
///
/// ```text
///           /\      |  routeload
///          /  \     |
///     /\  /    \    |  target:    http://1.230.54.14:5001
///    /  \/      \   |  planned:   5000 vus at peak
///   /    \       \  |  duration:  5m0s (5 stages)
///  /      \       \ |  pacing:    1000ms period, 10000ms timeout
///
///   ✓ status is 200
///   ✗ response body has routes
///      ↳  99% (✓ 990 / ✗ 10)
///
///   checks..........................: 99.50% ✓ 1990 ✗ 10
///   http_req_duration...............: avg=45.10ms min=12.00ms med=40.02ms max=310.50ms p(90)=80.01ms p(95)=120.00ms
///   http_req_failed.................: 1.00% ✓ 10 ✗ 990
///   http_reqs.......................: 1000   3.3/s
///
///   thresholds:
///     ✓ http_req_duration: p(95)<2000  ok (observed 120.00)
///     ✗ http_req_failed: rate<0.01  condition unmet (observed 0.0100)
///
///   result: FAILED (1 of 2 thresholds failed)
/// ```
pub fn render_summary(
    result: &LoadTestResult,
    thresholds: Result<&ThresholdReport, &LoadTestError>,
) -> String {
    let snap = &result.snapshot;
    let mut lines = Vec::new();

    lines.push(render_header(result));

    if !snap.checks.is_empty() {
        for check in &snap.checks {
            if check.fails == 0 {
                lines.push(format!("  {} {}", "✓".green(), check.name));
            } else {
                lines.push(format!("  {} {}", "✗".red(), check.name));
                lines.push(format!(
                    "     ↳  {:.0}% (✓ {} / ✗ {})",
                    check.pass_rate() * 100.0,
                    check.passes,
                    check.fails
                ));
            }
        }
        lines.push(String::new());
    }

    for (name, metric) in &snap.metrics {
        let value = match metric {
            MetricSummary::Trend(t) => format_trend(t),
            MetricSummary::Rate(r) if r.total == 0 => "no samples".dimmed().to_string(),
            MetricSummary::Rate(r) => format!(
                "{:.2}% ✓ {} ✗ {}",
                r.rate() * 100.0,
                r.trues,
                r.total - r.trues
            ),
            MetricSummary::Counter(c) => {
                format!("{}   {:.1}/s", c.sum, c.per_second(result.elapsed))
            },
        };
        lines.push(format_metric_row(name, &value, PAD_WIDTH));
    }
    lines.push(format_metric_row(
        "vus_max",
        &result.vus_max.to_string(),
        PAD_WIDTH,
    ));

    // Error breakdown (only when errors exist)
    if !snap.errors.is_empty() {
        lines.push(String::new());
        lines.push("  errors:".to_string());
        let mut categories: Vec<_> = snap.errors.iter().collect();
        categories.sort_by(|a, b| b.1.cmp(a.1));
        for (category, count) in categories {
            lines.push(format_metric_row(
                &format!("  {category}"),
                &count.to_string().red().to_string(),
                PAD_WIDTH,
            ));
        }
    }

    lines.push(String::new());
    match thresholds {
        Ok(report) => {
            if !report.outcomes.is_empty() {
                lines.push("  thresholds:".to_string());
                for outcome in &report.outcomes {
                    let mark = if outcome.status.is_passed() {
                        "✓".green()
                    } else {
                        "✗".red()
                    };
                    lines.push(format!(
                        "    {mark} {}  {}",
                        outcome.threshold,
                        describe_status(&outcome.status)
                    ));
                }
                lines.push(String::new());
            }
            if report.passed() {
                lines.push(format!("  result: {}", "PASSED".green().bold()));
            } else {
                lines.push(format!(
                    "  result: {} ({} of {} thresholds failed)",
                    "FAILED".red().bold(),
                    report.failures(),
                    report.outcomes.len()
                ));
            }
        },
        Err(err) => {
            lines.push(format!("  result: {} {err}", "ERROR".red().bold()));
        },
    }

    lines.join("\n")
}

/// Human-readable description of a threshold outcome.
///
/// Distinguishes an unmet condition from a metric that had no (or too few)
/// samples to evaluate.
pub fn describe_status(status: &ThresholdStatus) -> String {
    match status {
        ThresholdStatus::Passed { observed } => {
            format!("ok (observed {})", format_observed(*observed))
        },
        ThresholdStatus::Failed { observed } => format!(
            "{} (observed {})",
            "condition unmet".red(),
            format_observed(*observed)
        ),
        ThresholdStatus::NoSamples { samples: 0, .. } => "no samples".yellow().to_string(),
        ThresholdStatus::NoSamples { samples, required } => {
            format!("insufficient samples ({samples} < {required})")
                .yellow()
                .to_string()
        },
    }
}

fn format_observed(value: f64) -> String {
    if value.abs() < 1.0 {
        format!("{value:.4}")
    } else {
        format!("{value:.2}")
    }
}

fn format_trend(t: &TrendSummary) -> String {
    if t.count() == 0 {
        return "no samples".dimmed().to_string();
    }
    format!(
        "avg={} min={} med={} max={} p(90)={} p(95)={}",
        format_ms(t.mean()),
        format_ms(t.min()),
        format_ms(t.med()),
        format_ms(t.max()),
        format_ms(t.percentile(90.0)),
        format_ms(t.percentile(95.0)),
    )
}

/// `12.34ms` below a second, `1.23s` above.
fn format_ms(ms: f64) -> String {
    if ms >= 1000.0 {
        format!("{:.2}s", ms / 1000.0)
    } else {
        format!("{ms:.2}ms")
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 60 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

/// Render the ASCII art header with test configuration details.
fn render_header(result: &LoadTestResult) -> String {
    let config = &result.config;
    let planned = config.total_duration();
    let duration = if result.interrupted {
        format!(
            "{} of {} (interrupted)",
            format_duration(result.elapsed),
            format_duration(planned)
        )
    } else {
        format!(
            "{} ({} stages)",
            format_duration(planned),
            config.stage.len()
        )
    };
    format!(
        r#"
          /\      |  {}
         /  \     |
    /\  /    \    |  target:    {}
   /  \/      \   |  planned:   {} vus at peak
  /    \       \  |  duration:  {}
 /      \       \ |  pacing:    {}ms period, {}ms timeout
"#,
        "routeload".bold(),
        config.settings.base_url,
        config.max_target_vus(),
        duration,
        config.settings.iteration_period_ms,
        config.settings.timeout_ms,
    )
}

/// Format a single metric row with dot-padding.
///
/// Produces: `"  metric_name..................: value_string"`
fn format_metric_row(name: &str, value: &str, pad_width: usize) -> String {
    format!("  {name:.<pad_width$}: {value}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::checks::CheckResult;
    use crate::loadtest::config::{LoadTestConfig, Stage, ThresholdExprs};
    use crate::loadtest::error::RequestError;
    use crate::loadtest::executor::{RequestOutcome, Timings};
    use crate::loadtest::metrics::{MetricSample, MetricsRecorder, MetricsSnapshot};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    /// Disable colors in tests for deterministic assertions.
    fn setup_no_color() {
        colored::control::set_override(false);
    }

    fn config() -> LoadTestConfig {
        LoadTestConfig {
            stage: vec![Stage::new(5, 10), Stage::new(5, 0)],
            ..LoadTestConfig::default()
        }
    }

    fn snapshot(ok: u32, failed: u32) -> MetricsSnapshot {
        let mut recorder = MetricsRecorder::new();
        let good = RequestOutcome::response(
            200,
            r#"{"routes":[]}"#,
            Timings::from_total(Duration::from_millis(50)),
        );
        let bad = RequestOutcome::failure(
            RequestError::Timeout,
            Timings::from_total(Duration::from_secs(10)),
        );
        let record = |recorder: &mut MetricsRecorder, outcome: &RequestOutcome, passed: bool| {
            let checks = [CheckResult {
                name: Arc::from("status is 200"),
                passed,
            }];
            for sample in MetricSample::from_outcome(outcome, &checks) {
                recorder.record(&sample);
            }
        };
        for _ in 0..ok {
            record(&mut recorder, &good, true);
        }
        for _ in 0..failed {
            record(&mut recorder, &bad, false);
        }
        recorder.snapshot()
    }

    fn result(snapshot: MetricsSnapshot) -> LoadTestResult {
        LoadTestResult {
            snapshot,
            elapsed: Duration::from_secs(10),
            final_active_vus: 0,
            vus_max: 10,
            interrupted: false,
            config: config(),
        }
    }

    #[test]
    fn test_render_summary_contains_header() {
        setup_no_color();
        let result = result(snapshot(10, 0));
        let report = result.evaluate_thresholds().unwrap();
        let output = render_summary(&result, Ok(&report));

        assert!(output.contains("routeload"), "Missing header title");
        assert!(output.contains("http://1.230.54.14:5001"), "Missing target URL");
        assert!(output.contains("10.0s (2 stages)"), "{output}");
        assert!(output.contains("planned:   10 vus at peak"), "{output}");
        assert!(!output.contains("vus max:"), "{output}");
    }

    #[test]
    fn test_render_summary_passing_run() {
        setup_no_color();
        let result = result(snapshot(40, 0));
        let report = result.evaluate_thresholds().unwrap();
        let output = render_summary(&result, Ok(&report));

        assert!(output.contains("✓ status is 200"), "{output}");
        assert!(output.contains("http_reqs"), "{output}");
        assert!(output.contains("40   4.0/s"), "{output}");
        assert!(output.contains("p(95)=50.00ms"), "{output}");
        assert!(output.contains("http_req_duration: p(95)<2000  ok"), "{output}");
        assert!(output.contains("result: PASSED"), "{output}");
        assert!(!output.contains("errors:"), "{output}");
    }

    #[test]
    fn test_counter_rate_threshold_matches_printed_rate() {
        setup_no_color();
        let mut result = result(snapshot(40, 0));
        result.config.thresholds = BTreeMap::from([(
            "http_reqs".to_string(),
            ThresholdExprs::Many(vec!["rate>=3.99".to_string(), "rate<=4.01".to_string()]),
        )]);

        let report = result.evaluate_thresholds().unwrap();
        assert!(report.passed(), "{report:?}");
        for outcome in &report.outcomes {
            assert_eq!(outcome.status, ThresholdStatus::Passed { observed: 4.0 });
        }

        let output = render_summary(&result, Ok(&report));
        assert!(output.contains("40   4.0/s"), "{output}");
    }

    #[test]
    fn test_render_summary_failing_run() {
        setup_no_color();
        let result = result(snapshot(0, 5));
        let report = result.evaluate_thresholds().unwrap();
        let output = render_summary(&result, Ok(&report));

        assert!(output.contains("✗ status is 200"), "{output}");
        assert!(output.contains("↳  0% (✓ 0 / ✗ 5)"), "{output}");
        assert!(output.contains("condition unmet (observed 1.00)"), "{output}");
        assert!(output.contains("errors:"), "{output}");
        assert!(output.contains("timeout"), "{output}");
        assert!(output.contains("result: FAILED (2 of 2 thresholds failed)"), "{output}");
    }

    #[test]
    fn test_render_summary_no_samples_is_distinct() {
        setup_no_color();
        let result = result(MetricsRecorder::new().snapshot());
        let report = result.evaluate_thresholds().unwrap();
        let output = render_summary(&result, Ok(&report));

        assert!(output.contains("no samples"), "{output}");
        assert!(!output.contains("condition unmet"), "{output}");
        assert!(output.contains("result: FAILED"), "{output}");
    }

    #[test]
    fn test_render_summary_evaluation_error_keeps_metrics() {
        setup_no_color();
        let result = result(snapshot(3, 0));
        let err = LoadTestError::Threshold {
            message: "unknown metric 'http_req_blocked'".to_string(),
        };
        let output = render_summary(&result, Err(&err));

        assert!(output.contains("http_req_duration"), "{output}");
        assert!(output.contains("result: ERROR"), "{output}");
        assert!(output.contains("http_req_blocked"), "{output}");
    }

    #[test]
    fn test_describe_insufficient_samples() {
        setup_no_color();
        let text = describe_status(&ThresholdStatus::NoSamples {
            samples: 3,
            required: 10,
        });
        assert_eq!(text, "insufficient samples (3 < 10)");
    }

    #[test]
    fn test_format_metric_row_pads_with_dots() {
        let row = format_metric_row("http_reqs", "42", 16);
        assert_eq!(row, "  http_reqs.......: 42");
    }

    #[test]
    fn test_format_ms_switches_units() {
        assert_eq!(format_ms(45.5), "45.50ms");
        assert_eq!(format_ms(1500.0), "1.50s");
    }
}
