//! k6-style live terminal display for load test progress.
//!
//! Renders a single in-place updating spinner line on stderr with the
//! current stage, active/desired VUs, iterations, throughput, p95 latency,
//! failure rate and elapsed time. Reads the shared [`TestRun`] on a fixed
//! interval rather than reacting to every sample.

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::loadtest::metrics::MetricsSnapshot;
use crate::loadtest::run::TestRun;

/// How often the status line is refreshed.
const REFRESH_INTERVAL: Duration = Duration::from_millis(500);

/// Live spinner line for a running test.
pub struct LiveDisplay {
    status_bar: ProgressBar,
}

impl LiveDisplay {
    /// Create a new live display drawing to stderr.
    pub fn new() -> Self {
        let status_bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
        status_bar.set_style(style);
        status_bar.enable_steady_tick(Duration::from_millis(100));
        Self { status_bar }
    }

    /// Format a single line of live status.
    ///
    /// Color coding: red failure rate when any request failed, yellow p95
    /// above one second.
    pub fn format_status(
        stage_label: &str,
        snap: &MetricsSnapshot,
        elapsed: Duration,
        active_vus: u32,
        desired_vus: u32,
    ) -> String {
        let elapsed_secs = elapsed.as_secs_f64();
        let rps = if elapsed_secs > 0.0 {
            snap.total_requests() as f64 / elapsed_secs
        } else {
            0.0
        };

        let p95 = snap.p95();
        let p95_str = format!("{p95:.0}ms");
        let p95_display = if p95 > 1000.0 {
            p95_str.yellow().to_string()
        } else {
            p95_str.green().to_string()
        };

        let failure_rate = snap.failure_rate();
        let failed_str = format!("{:.1}%", failure_rate * 100.0);
        let failed_display = if failure_rate > 0.0 {
            failed_str.red().to_string()
        } else {
            failed_str
        };

        format!(
            "  [{}]  vus: {}  |  iters: {}  |  rps: {:.1}  |  p95: {}  |  failed: {}  |  elapsed: {}s",
            stage_label,
            format!("{active_vus}/{desired_vus}").green(),
            snap.iterations(),
            rps,
            p95_display,
            failed_display,
            elapsed.as_secs()
        )
    }

    /// Update the display from the run's current state.
    pub fn update(&self, run: &TestRun) {
        let msg = Self::format_status(
            &run.stage_label(),
            &run.metrics(),
            run.elapsed(),
            run.active_vus(),
            run.desired_vus(),
        );
        self.status_bar.set_message(msg);
    }

    /// Stop the display and clear the spinner.
    pub fn finish(&self) {
        self.status_bar.finish_and_clear();
    }
}

impl Default for LiveDisplay {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the live display loop until `stop` is cancelled.
pub async fn display_loop(run: TestRun, stop: CancellationToken) {
    let display = LiveDisplay::new();
    let mut tick = tokio::time::interval(REFRESH_INTERVAL);

    loop {
        tokio::select! {
            _ = tick.tick() => display.update(&run),
            _ = stop.cancelled() => break,
        }
    }

    display.finish();
}
