//! Run lifecycle and the shared [`TestRun`] context handle.
//!
//! Everything that changes while a test runs (elapsed time, the current
//! stage, the active and desired VU counts, the live metrics view) lives
//! behind one cloneable [`TestRun`] handle. The engine owns the write side;
//! the live display and callers only read.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::loadtest::error::LoadTestError;
use crate::loadtest::metrics::MetricsSnapshot;
use crate::loadtest::vu::ActiveVuCounter;

/// Lifecycle state of a run.
///
/// Valid transitions: `not-started -> ramping(0)`, `ramping(i) -> ramping(j)`
/// for `j > i`, `ramping(_) -> winding-down`, `winding-down -> completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    /// Executing stage `stage` (zero-based).
    Ramping { stage: usize },
    /// No new iterations start; in-flight ones are draining.
    WindingDown,
    Completed,
}

impl RunState {
    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: RunState) -> bool {
        match (self, next) {
            (Self::NotStarted, Self::Ramping { .. }) => true,
            (Self::Ramping { stage: from }, Self::Ramping { stage: to }) => to > from,
            (Self::Ramping { .. }, Self::WindingDown) => true,
            (Self::WindingDown, Self::Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => f.write_str("not-started"),
            Self::Ramping { stage } => write!(f, "ramping(stage {})", stage + 1),
            Self::WindingDown => f.write_str("winding-down"),
            Self::Completed => f.write_str("completed"),
        }
    }
}

struct RunInner {
    started: Instant,
    stage_count: usize,
    state: watch::Sender<RunState>,
    active: ActiveVuCounter,
    desired: AtomicU32,
    metrics: watch::Receiver<MetricsSnapshot>,
}

/// Shared, cloneable context for one test run.
///
/// Created when the run starts. Once [`RunState::Completed`] is reached no
/// further transitions are accepted, so the state is effectively frozen.
#[derive(Clone)]
pub struct TestRun {
    inner: Arc<RunInner>,
}

impl TestRun {
    /// Starts the run clock. `metrics` is the live view published by the
    /// metrics aggregator.
    pub fn new(stage_count: usize, metrics: watch::Receiver<MetricsSnapshot>) -> Self {
        let (state, _) = watch::channel(RunState::NotStarted);
        Self {
            inner: Arc::new(RunInner {
                started: Instant::now(),
                stage_count,
                state,
                active: ActiveVuCounter::new(),
                desired: AtomicU32::new(0),
                metrics,
            }),
        }
    }

    /// Time since the run started.
    pub fn elapsed(&self) -> Duration {
        self.inner.started.elapsed()
    }

    pub fn started_at(&self) -> Instant {
        self.inner.started
    }

    pub fn stage_count(&self) -> usize {
        self.inner.stage_count
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RunState {
        *self.inner.state.borrow()
    }

    /// Subscribes to state changes.
    pub fn watch_state(&self) -> watch::Receiver<RunState> {
        self.inner.state.subscribe()
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`LoadTestError::InvalidTransition`] (and leaves the state
    /// unchanged) if the transition is not allowed.
    pub fn advance(&self, next: RunState) -> Result<(), LoadTestError> {
        let mut result = Ok(());
        self.inner.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                result = Err(LoadTestError::InvalidTransition {
                    from: *state,
                    to: next,
                });
                false
            }
        });
        result
    }

    /// Counter of VUs currently executing, including ones that have been
    /// told to stop but are still finishing an iteration.
    pub fn vu_counter(&self) -> &ActiveVuCounter {
        &self.inner.active
    }

    pub fn active_vus(&self) -> u32 {
        self.inner.active.get()
    }

    /// Peak concurrent VUs observed so far.
    pub fn vus_max(&self) -> u32 {
        self.inner.active.peak()
    }

    /// VU count the scheduler is currently reconciling towards.
    pub fn desired_vus(&self) -> u32 {
        self.inner.desired.load(Ordering::Relaxed)
    }

    pub(crate) fn set_desired_vus(&self, desired: u32) {
        self.inner.desired.store(desired, Ordering::Relaxed);
    }

    /// Latest live metrics snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.borrow().clone()
    }

    /// Short label for the current state, e.g. `stage 2/5`.
    pub fn stage_label(&self) -> String {
        match self.state() {
            RunState::NotStarted => "starting".to_string(),
            RunState::Ramping { stage } => {
                format!("stage {}/{}", stage + 1, self.inner.stage_count)
            },
            RunState::WindingDown => "winding down".to_string(),
            RunState::Completed => "completed".to_string(),
        }
    }
}

impl fmt::Debug for TestRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestRun")
            .field("state", &self.state())
            .field("elapsed", &self.elapsed())
            .field("active_vus", &self.active_vus())
            .field("desired_vus", &self.desired_vus())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::metrics::MetricsRecorder;

    fn new_run(stages: usize) -> (TestRun, watch::Sender<MetricsSnapshot>) {
        let (tx, rx) = watch::channel(MetricsRecorder::new().snapshot());
        (TestRun::new(stages, rx), tx)
    }

    #[test]
    fn test_state_display_names() {
        assert_eq!(RunState::NotStarted.to_string(), "not-started");
        assert_eq!(RunState::Ramping { stage: 1 }.to_string(), "ramping(stage 2)");
        assert_eq!(RunState::WindingDown.to_string(), "winding-down");
        assert_eq!(RunState::Completed.to_string(), "completed");
    }

    #[test]
    fn test_transition_table() {
        use RunState::*;
        assert!(NotStarted.can_transition_to(Ramping { stage: 0 }));
        assert!(Ramping { stage: 0 }.can_transition_to(Ramping { stage: 2 }));
        assert!(Ramping { stage: 3 }.can_transition_to(WindingDown));
        assert!(WindingDown.can_transition_to(Completed));

        assert!(!NotStarted.can_transition_to(WindingDown));
        assert!(!NotStarted.can_transition_to(Completed));
        assert!(!Ramping { stage: 2 }.can_transition_to(Ramping { stage: 1 }));
        assert!(!Ramping { stage: 1 }.can_transition_to(Ramping { stage: 1 }));
        assert!(!Ramping { stage: 0 }.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(NotStarted));
        assert!(!Completed.can_transition_to(Ramping { stage: 0 }));
    }

    #[tokio::test]
    async fn test_advance_through_full_lifecycle() {
        let (run, _tx) = new_run(2);
        let mut states = run.watch_state();
        assert_eq!(run.state(), RunState::NotStarted);

        run.advance(RunState::Ramping { stage: 0 }).unwrap();
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), RunState::Ramping { stage: 0 });
        assert_eq!(run.stage_label(), "stage 1/2");

        run.advance(RunState::Ramping { stage: 1 }).unwrap();
        run.advance(RunState::WindingDown).unwrap();
        assert_eq!(run.stage_label(), "winding down");
        run.advance(RunState::Completed).unwrap();
        assert_eq!(run.state(), RunState::Completed);
    }

    #[tokio::test]
    async fn test_invalid_advance_keeps_state() {
        let (run, _tx) = new_run(1);
        run.advance(RunState::Ramping { stage: 0 }).unwrap();

        let err = run.advance(RunState::Completed).unwrap_err();
        assert!(matches!(
            err,
            LoadTestError::InvalidTransition {
                from: RunState::Ramping { stage: 0 },
                to: RunState::Completed
            }
        ));
        assert_eq!(run.state(), RunState::Ramping { stage: 0 });
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let (run, tx) = new_run(1);
        let other = run.clone();

        run.set_desired_vus(7);
        run.vu_counter().increment();
        assert_eq!(other.desired_vus(), 7);
        assert_eq!(other.active_vus(), 1);
        assert_eq!(other.vus_max(), 1);

        let mut recorder = MetricsRecorder::new();
        recorder.record(&crate::loadtest::metrics::MetricSample::new(
            crate::loadtest::metrics::HTTP_REQS,
            1.0,
        ));
        tx.send(recorder.snapshot()).unwrap();
        assert_eq!(other.metrics().total_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_follows_clock() {
        let (run, _tx) = new_run(1);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(run.elapsed(), Duration::from_secs(3));
    }
}
