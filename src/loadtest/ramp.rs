//! Piecewise-linear concurrency profile over elapsed run time.

use std::time::Duration;

use crate::loadtest::config::Stage;

/// Desired virtual user count as a function of elapsed time.
///
/// Each stage moves the target linearly from the previous stage's target
/// (or `start_vus` for the first stage) to its own target over its
/// duration. Zero-length stages are instantaneous steps.
#[derive(Debug, Clone)]
pub struct RampProfile {
    start_vus: u32,
    stages: Vec<Stage>,
    total: Duration,
}

impl RampProfile {
    pub fn new(start_vus: u32, stages: Vec<Stage>) -> Self {
        let total = stages
            .iter()
            .fold(Duration::ZERO, |total, stage| total.saturating_add(stage.duration()));
        Self {
            start_vus,
            stages,
            total,
        }
    }

    /// Sum of all stage durations.
    pub fn total_duration(&self) -> Duration {
        self.total
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Index of the stage active at `elapsed`, or `None` once every stage
    /// has elapsed.
    pub fn stage_index(&self, elapsed: Duration) -> Option<usize> {
        let mut stage_end = Duration::ZERO;
        for (idx, stage) in self.stages.iter().enumerate() {
            stage_end = stage_end.saturating_add(stage.duration());
            if elapsed < stage_end {
                return Some(idx);
            }
        }
        None
    }

    /// Desired concurrency at `elapsed`.
    ///
    /// Rounded to the nearest integer and clamped between the active
    /// stage's start and end targets. After the last stage this is the last
    /// stage's target.
    pub fn desired_vus(&self, elapsed: Duration) -> u32 {
        let mut from = self.start_vus;
        let mut stage_start = Duration::ZERO;

        for stage in &self.stages {
            let span = stage.duration();
            let stage_end = stage_start.saturating_add(span);
            if elapsed < stage_end {
                let progress = (elapsed - stage_start).as_secs_f64() / span.as_secs_f64();
                return interpolate(from, stage.target_vus, progress);
            }
            stage_start = stage_end;
            from = stage.target_vus;
        }
        from
    }
}

fn interpolate(from: u32, to: u32, progress: f64) -> u32 {
    let (lo, hi) = (from.min(to), from.max(to));
    let value = f64::from(from) + (f64::from(to) - f64::from(from)) * progress;
    (value.round() as u32).clamp(lo, hi)
}
