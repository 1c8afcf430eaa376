//! Load test execution engine with metrics aggregation and graceful shutdown.
//!
//! [`LoadTestEngine`] is the top-level orchestrator that:
//! - Reconciles the number of running virtual users to the [`RampProfile`]
//!   on a fixed sub-second tick, spawning tasks on a
//!   [`tokio_util::task::TaskTracker`]
//! - Collects metrics through a bounded mpsc channel into a single
//!   aggregator task
//! - Publishes live snapshots through a watch channel held by the
//!   [`TestRun`]
//! - Coordinates graceful shutdown via [`CancellationToken`]
//!
//! Each VU gets a child token of the run's shutdown token. Scaling down
//! cancels the oldest VUs first; cancelling the shutdown token (end of the
//! last stage, or Ctrl+C) stops every VU at once.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::loadtest::config::LoadTestConfig;
use crate::loadtest::display::display_loop;
use crate::loadtest::error::LoadTestError;
use crate::loadtest::executor::{HttpExecutor, RequestExecutor};
use crate::loadtest::metrics::{MetricSample, MetricsRecorder, MetricsSink, MetricsSnapshot};
use crate::loadtest::provider::DataProvider;
use crate::loadtest::ramp::RampProfile;
use crate::loadtest::run::{RunState, TestRun};
use crate::loadtest::scenario::Scenario;
use crate::loadtest::threshold::{self, ThresholdReport};
use crate::loadtest::vu::vu_loop;

/// How often the aggregator publishes a live snapshot.
const PUBLISH_INTERVAL: Duration = Duration::from_secs(1);

/// Exit code used when a second Ctrl+C aborts the run.
pub const ABORT_EXIT_CODE: i32 = 130;

/// Compile-time Send bounds verification for channel-transported types.
fn _assert_send<T: Send>() {}
#[allow(dead_code)]
fn _check_send_bounds() {
    _assert_send::<MetricSample>();
    _assert_send::<MetricsSnapshot>();
    _assert_send::<TestRun>();
}

/// Top-level load test engine configuration and entry point.
pub struct LoadTestEngine {
    config: LoadTestConfig,
    scenario: Scenario,
    executor: Arc<dyn RequestExecutor>,
    progress: bool,
    signals: bool,
    shutdown: CancellationToken,
}

impl LoadTestEngine {
    /// Creates an engine for a validated configuration, sending real HTTP
    /// requests through [`HttpExecutor`].
    pub fn new(config: LoadTestConfig) -> Result<Self, LoadTestError> {
        config.validate()?;
        let scenario = Scenario::from_config(&config)?;
        Ok(Self {
            config,
            scenario,
            executor: Arc::new(HttpExecutor::new()),
            progress: false,
            signals: false,
            shutdown: CancellationToken::new(),
        })
    }

    /// Replaces the request executor.
    pub fn with_executor(mut self, executor: Arc<dyn RequestExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Replaces the coordinate source.
    pub fn with_data_provider(mut self, provider: Arc<dyn DataProvider>) -> Self {
        self.scenario = self.scenario.with_provider(provider);
        self
    }

    /// Shows the live progress line on stderr while running.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Installs the two-phase Ctrl+C handler for the duration of the run.
    pub fn with_signal_handling(mut self, signals: bool) -> Self {
        self.signals = signals;
        self
    }

    /// Token that, when cancelled, ends the run early and winds down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Returns a reference to the engine's configuration.
    pub fn config(&self) -> &LoadTestConfig {
        &self.config
    }

    /// Runs the test to completion and returns the frozen result.
    ///
    /// Drives the run through `ramping -> winding-down -> completed`. The
    /// returned result is produced only after every VU has exited.
    pub async fn run(self) -> Result<LoadTestResult, LoadTestError> {
        let Self {
            config,
            scenario,
            executor,
            progress,
            signals,
            shutdown,
        } = self;

        let ramp = RampProfile::new(config.settings.start_vus, config.stage.clone());
        let tracker = TaskTracker::new();

        // Use a generous buffer -- stages can have high VU counts
        let buffer_size = (config.max_target_vus().max(1) as usize) * 100;
        let (sink, sample_rx) = MetricsSink::channel(buffer_size);
        let (metrics_tx, metrics_rx) = watch::channel(MetricsRecorder::new().snapshot());

        // Spawn metrics aggregator (NOT on tracker -- must outlive VU tasks)
        let aggregator = tokio::spawn(metrics_aggregator(sample_rx, metrics_tx, PUBLISH_INTERVAL));

        let run = TestRun::new(ramp.stages().len(), metrics_rx);
        let display_stop = CancellationToken::new();
        let display = progress.then(|| tokio::spawn(display_loop(run.clone(), display_stop.clone())));
        let ctrl_c = signals.then(|| tokio::spawn(handle_ctrl_c(shutdown.clone())));

        tracing::info!(
            stages = ramp.stages().len(),
            duration_secs = ramp.total_duration().as_secs(),
            max_vus = config.max_target_vus(),
            "starting load test"
        );

        let mut pool = VuPool {
            scenario: Arc::new(scenario),
            executor,
            sink,
            tracker: tracker.clone(),
            parent: shutdown.clone(),
            run: run.clone(),
            tokens: VecDeque::new(),
            next_id: 0,
        };
        let scheduled = schedule(&run, &ramp, config.settings.tick(), &mut pool, &shutdown).await;
        let interrupted = shutdown.is_cancelled();

        // Winding down: stop every VU, then wait for in-flight iterations.
        let wound_down = run.advance(RunState::WindingDown);
        tracing::info!(active = run.active_vus(), "winding down");
        shutdown.cancel();
        run.set_desired_vus(0);
        drop(pool);
        tracker.close();
        tracker.wait().await;

        let mut snapshot = match aggregator.await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::error!(error = %err, "metrics aggregator failed");
                run.metrics()
            },
        };
        let completed = run.advance(RunState::Completed);

        display_stop.cancel();
        if let Some(handle) = display {
            let _ = handle.await;
        }
        if let Some(handle) = ctrl_c {
            handle.abort();
        }

        // Propagate any scheduler error
        scheduled?;
        wound_down?;
        completed?;

        // One clock for every per-second figure derived from the result.
        let elapsed = run.elapsed();
        snapshot.elapsed = elapsed;

        Ok(LoadTestResult {
            snapshot,
            elapsed,
            final_active_vus: run.active_vus(),
            vus_max: run.vus_max(),
            interrupted,
            config,
        })
    }
}

/// Scheduled virtual users, oldest first.
struct VuPool {
    scenario: Arc<Scenario>,
    executor: Arc<dyn RequestExecutor>,
    sink: MetricsSink,
    tracker: TaskTracker,
    parent: CancellationToken,
    run: TestRun,
    tokens: VecDeque<CancellationToken>,
    next_id: u64,
}

impl VuPool {
    /// Number of VUs scheduled to keep running. VUs that were told to stop
    /// but are still finishing an iteration are not counted.
    fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Spawns or stops VUs until exactly `desired` are scheduled.
    fn scale_to(&mut self, desired: u32) {
        let desired = desired as usize;
        while self.tokens.len() < desired {
            let token = self.parent.child_token();
            self.tracker.spawn(vu_loop(
                self.next_id,
                Arc::clone(&self.scenario),
                Arc::clone(&self.executor),
                self.sink.clone(),
                token.clone(),
                self.run.vu_counter().clone(),
            ));
            self.tokens.push_back(token);
            self.next_id += 1;
        }
        while self.tokens.len() > desired {
            if let Some(token) = self.tokens.pop_front() {
                token.cancel();
            }
        }
    }
}

/// Reconcile loop: runs until the last stage has elapsed or `shutdown` is
/// cancelled.
async fn schedule(
    run: &TestRun,
    ramp: &RampProfile,
    tick_every: Duration,
    pool: &mut VuPool,
    shutdown: &CancellationToken,
) -> Result<(), LoadTestError> {
    let first = ramp.stage_index(Duration::ZERO).unwrap_or(0);
    run.advance(RunState::Ramping { stage: first })?;
    tracing::info!(stage = first + 1, "entering stage");

    let mut tick = tokio::time::interval(tick_every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::info!("stop requested");
                return Ok(());
            }
            _ = tick.tick() => {}
        }

        let elapsed = run.elapsed();
        let Some(stage) = ramp.stage_index(elapsed) else {
            return Ok(());
        };
        if let RunState::Ramping { stage: current } = run.state() {
            if stage != current {
                run.advance(RunState::Ramping { stage })?;
                tracing::info!(stage = stage + 1, "entering stage");
            }
        }

        let desired = ramp.desired_vus(elapsed);
        run.set_desired_vus(desired);
        if pool.len() != desired as usize {
            tracing::debug!(
                desired,
                scheduled = pool.len(),
                active = run.active_vus(),
                "reconciling virtual users"
            );
            pool.scale_to(desired);
        }
    }
}

/// Result of a completed load test run.
#[derive(Debug)]
pub struct LoadTestResult {
    /// Final metrics snapshot.
    pub snapshot: MetricsSnapshot,
    /// Total elapsed time of the test, including winding-down.
    pub elapsed: Duration,
    /// Number of VUs still active at test end. Always 0 for a drained run.
    pub final_active_vus: u32,
    /// Peak number of concurrently active VUs.
    pub vus_max: u32,
    /// Whether the run was stopped before the last stage elapsed.
    pub interrupted: bool,
    /// The configuration the run executed.
    pub config: LoadTestConfig,
}

impl LoadTestResult {
    /// Evaluates the configured thresholds against the final snapshot.
    pub fn evaluate_thresholds(&self) -> Result<ThresholdReport, LoadTestError> {
        let thresholds = self.config.parsed_thresholds()?;
        threshold::evaluate_over(
            &thresholds,
            &self.snapshot,
            self.elapsed,
            self.config.settings.min_percentile_samples,
        )
    }
}

/// Metrics aggregator task.
///
/// Owns the [`MetricsRecorder`], folds every [`MetricSample`] from the mpsc
/// channel into it, and publishes a snapshot through the watch channel on
/// every tick. Returns the final snapshot once every sender is dropped.
///
/// Uses `biased;` select to ensure the tick branch is checked first,
/// preventing display starvation when the mpsc channel is busy.
async fn metrics_aggregator(
    mut sample_rx: mpsc::Receiver<MetricSample>,
    publish: watch::Sender<MetricsSnapshot>,
    interval: Duration,
) -> MetricsSnapshot {
    let mut recorder = MetricsRecorder::new();
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = tick.tick() => {
                // Drain all available samples before publishing snapshot
                while let Ok(sample) = sample_rx.try_recv() {
                    recorder.record(&sample);
                }
                publish.send_replace(recorder.snapshot());
            }
            result = sample_rx.recv() => {
                match result {
                    Some(sample) => recorder.record(&sample),
                    // All senders dropped -- VUs are done
                    None => break,
                }
            }
        }
    }

    let snapshot = recorder.snapshot();
    publish.send_replace(snapshot.clone());
    snapshot
}

/// Ctrl+C handler with two-phase shutdown.
///
/// First Ctrl+C triggers graceful winding-down via the shutdown token.
/// Second Ctrl+C aborts the process with [`ABORT_EXIT_CODE`].
async fn handle_ctrl_c(shutdown: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to install Ctrl+C handler");
        return;
    }
    eprintln!("\nReceived Ctrl+C, winding down (press again to abort)...");
    shutdown.cancel();

    if tokio::signal::ctrl_c().await.is_ok() {
        eprintln!("\nReceived second Ctrl+C, aborting immediately.");
        std::process::exit(ABORT_EXIT_CODE);
    }
}
