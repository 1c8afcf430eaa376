//! Virtual user (VU) task loop for load test execution.
//!
//! Each VU repeatedly builds a route request from the shared
//! [`Scenario`], sends it through the shared [`RequestExecutor`], runs the
//! checks, emits [`MetricSample`] values through the [`MetricsSink`] and
//! then sleeps out the rest of the iteration period.
//!
//! Stopping is cooperative: the stop token is only checked between
//! iterations, so a stopped VU always finishes its request and its pacing
//! sleep before it exits.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::loadtest::checks;
use crate::loadtest::executor::{RequestExecutor, RequestOutcome, RequestSpec};
use crate::loadtest::metrics::{MetricSample, MetricsSink, ITERATIONS, ITERATION_DURATION};
use crate::loadtest::scenario::Scenario;

/// Longest body excerpt included in failure logs.
const LOG_BODY_LIMIT: usize = 512;

#[derive(Default)]
struct Counts {
    active: AtomicU32,
    peak: AtomicU32,
}

/// Atomic counter tracking the number of currently active virtual users.
///
/// Lightweight wrapper around an `Arc` of atomics for clone-friendly sharing
/// across VU tasks and the engine orchestrator. Also remembers the peak.
#[derive(Clone, Default)]
pub struct ActiveVuCounter(Arc<Counts>);

impl ActiveVuCounter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the active VU count by one.
    pub fn increment(&self) {
        let now = self.0.active.fetch_add(1, Ordering::Relaxed) + 1;
        self.0.peak.fetch_max(now, Ordering::Relaxed);
    }

    /// Decrements the active VU count by one.
    pub fn decrement(&self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Returns the current number of active VUs.
    pub fn get(&self) -> u32 {
        self.0.active.load(Ordering::Relaxed)
    }

    /// Returns the highest active count seen so far.
    pub fn peak(&self) -> u32 {
        self.0.peak.load(Ordering::Relaxed)
    }
}

/// How long to sleep after an iteration that took `elapsed`.
///
/// `period - elapsed`, or zero once the iteration has used up the period.
pub fn pacing_delay(period: Duration, elapsed: Duration) -> Duration {
    period.saturating_sub(elapsed)
}

/// Main virtual user task loop.
///
/// Runs iterations until `stop` is cancelled or the metrics aggregator goes
/// away. The `active_vus` counter is incremented on entry and decremented
/// on every exit path.
pub async fn vu_loop(
    vu_id: u64,
    scenario: Arc<Scenario>,
    executor: Arc<dyn RequestExecutor>,
    sink: MetricsSink,
    stop: CancellationToken,
    active_vus: ActiveVuCounter,
) {
    active_vus.increment();
    let iterations = vu_loop_inner(vu_id, &scenario, executor.as_ref(), &sink, &stop).await;
    tracing::trace!(vu = vu_id, iterations, "virtual user stopped");
    active_vus.decrement();
}

/// Returns the number of completed iterations.
async fn vu_loop_inner(
    vu_id: u64,
    scenario: &Scenario,
    executor: &dyn RequestExecutor,
    sink: &MetricsSink,
    stop: &CancellationToken,
) -> u64 {
    let mut completed = 0;

    loop {
        if stop.is_cancelled() {
            return completed;
        }

        let started = Instant::now();
        let request = scenario.next_request();
        let outcome = executor.execute(&request, scenario.timeout()).await;
        let results = checks::evaluate(&outcome, scenario.checks());
        log_failure(vu_id, &request, &outcome);

        if sink
            .record_all(MetricSample::from_outcome(&outcome, &results))
            .await
            .is_err()
        {
            return completed;
        }

        let delay = pacing_delay(scenario.period(), started.elapsed());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        completed += 1;
        let iteration = [
            MetricSample::new(ITERATIONS, 1.0),
            MetricSample::duration(ITERATION_DURATION, started.elapsed()),
        ];
        if sink.record_all(iteration).await.is_err() {
            return completed;
        }
    }
}

fn log_failure(vu_id: u64, request: &RequestSpec, outcome: &RequestOutcome) {
    if let Some(err) = &outcome.error {
        tracing::warn!(
            vu = vu_id,
            url = %request.url,
            status = ?outcome.status,
            error = %err,
            "request failed"
        );
    } else if let Some(status) = outcome.status.filter(|_| outcome.is_failed()) {
        tracing::warn!(
            vu = vu_id,
            url = %request.url,
            status,
            body = excerpt(&outcome.body, LOG_BODY_LIMIT),
            "unexpected response status"
        );
    }
}

/// Longest prefix of `body` no longer than `limit` bytes that ends on a
/// char boundary.
fn excerpt(body: &str, limit: usize) -> &str {
    if body.len() <= limit {
        return body;
    }
    let mut end = limit;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::error::RequestError;
    use crate::loadtest::executor::Timings;
    use crate::loadtest::metrics::{MetricsRecorder, HTTP_REQ_FAILED};
    use crate::loadtest::provider::SequenceProvider;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU64;

    /// Answers every request after `latency` with a fixed outcome.
    struct FixedExecutor {
        latency: Duration,
        fail: bool,
        calls: AtomicU64,
    }

    #[async_trait]
    impl RequestExecutor for FixedExecutor {
        async fn execute(&self, _request: &RequestSpec, _timeout: Duration) -> RequestOutcome {
            self.calls.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(self.latency).await;
            let timings = Timings::from_total(self.latency);
            if self.fail {
                RequestOutcome::failure(
                    RequestError::Connection {
                        message: "refused".to_string(),
                    },
                    timings,
                )
            } else {
                RequestOutcome::response(200, r#"{"routes":[]}"#, timings)
            }
        }
    }

    fn executor(latency_ms: u64, fail: bool) -> Arc<FixedExecutor> {
        Arc::new(FixedExecutor {
            latency: Duration::from_millis(latency_ms),
            fail,
            calls: AtomicU64::new(0),
        })
    }

    fn scenario(period_ms: u64) -> Arc<Scenario> {
        let provider = SequenceProvider::new(vec![
            "128.0923,35.1747;128.1171,35.1759".to_string(),
        ])
        .unwrap();
        Arc::new(
            Scenario::new("http://osrm.test", "driving", Arc::new(provider))
                .with_period(Duration::from_millis(period_ms)),
        )
    }

    #[test]
    fn test_active_vu_counter_increment_decrement() {
        let counter = ActiveVuCounter::new();
        assert_eq!(counter.get(), 0);

        counter.increment();
        counter.increment();
        counter.increment();
        assert_eq!(counter.get(), 3);

        counter.decrement();
        assert_eq!(counter.get(), 2);
        assert_eq!(counter.peak(), 3);
    }

    #[test]
    fn test_pacing_delay() {
        let period = Duration::from_secs(1);
        assert_eq!(
            pacing_delay(period, Duration::from_millis(50)),
            Duration::from_millis(950)
        );
        assert_eq!(pacing_delay(period, period), Duration::ZERO);
        assert_eq!(pacing_delay(period, Duration::from_secs(3)), Duration::ZERO);
    }

    /// Records the level of every event it sees.
    struct LevelLayer {
        levels: Arc<std::sync::Mutex<Vec<tracing::Level>>>,
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for LevelLayer {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            if let Ok(mut levels) = self.levels.lock() {
                levels.push(*event.metadata().level());
            }
        }
    }

    fn logged_levels(outcome: &RequestOutcome) -> Vec<tracing::Level> {
        use tracing_subscriber::layer::SubscriberExt;

        let levels = Arc::new(std::sync::Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(LevelLayer {
            levels: levels.clone(),
        });
        let request = RequestSpec::get("http://osrm.test/route/v1/driving/1,2;3,4");
        tracing::subscriber::with_default(subscriber, || log_failure(7, &request, outcome));
        let captured = levels.lock().unwrap().clone();
        captured
    }

    #[test]
    fn test_transport_errors_log_at_warn() {
        let outcome = RequestOutcome::failure(
            RequestError::Timeout,
            Timings::from_total(Duration::from_secs(10)),
        );
        assert_eq!(logged_levels(&outcome), vec![tracing::Level::WARN]);
    }

    #[test]
    fn test_bad_status_logs_at_warn_and_success_is_silent() {
        let timings = Timings::from_total(Duration::from_millis(5));
        let bad = RequestOutcome::response(500, "boom", timings);
        assert_eq!(logged_levels(&bad), vec![tracing::Level::WARN]);

        let ok = RequestOutcome::response(200, r#"{"routes":[]}"#, timings);
        assert!(logged_levels(&ok).is_empty());
    }

    #[test]
    fn test_excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("short", 512), "short");
        let long = "é".repeat(300); // 600 bytes
        let cut = excerpt(&long, 511);
        assert_eq!(cut.len(), 510);
        assert!(cut.chars().all(|c| c == 'é'));
    }

    #[tokio::test(start_paused = true)]
    async fn test_vu_paces_iterations_to_period() {
        let exec = executor(50, false);
        let (sink, mut rx) = MetricsSink::channel(1024);
        let stop = CancellationToken::new();
        let active = ActiveVuCounter::new();

        let handle = tokio::spawn(vu_loop(
            0,
            scenario(1000),
            exec.clone(),
            sink,
            stop.clone(),
            active.clone(),
        ));

        // Iterations start at 0s, 1s, 2s; the stop lands mid-sleep of the third.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        stop.cancel();
        assert_eq!(active.get(), 1, "third iteration still pacing");
        handle.await.unwrap();

        assert_eq!(exec.calls.load(Ordering::Relaxed), 3);
        assert_eq!(active.get(), 0);

        let mut recorder = MetricsRecorder::new();
        while let Ok(sample) = rx.try_recv() {
            recorder.record(&sample);
        }
        let snap = recorder.snapshot();
        assert_eq!(snap.iterations(), 3);
        assert_eq!(snap.total_requests(), 3);
        let durations = snap.trend(ITERATION_DURATION).unwrap();
        assert_eq!(durations.count(), 3);
        assert_eq!(durations.max(), 1000.0);
        assert_eq!(durations.min(), 1000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_pacing_records_full_iteration() {
        let exec = executor(50, false);
        let (sink, mut rx) = MetricsSink::channel(1024);
        let stop = CancellationToken::new();

        let handle = tokio::spawn(vu_loop(
            0,
            scenario(1000),
            exec.clone(),
            sink,
            stop.clone(),
            ActiveVuCounter::new(),
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        stop.cancel();
        let started = Instant::now();
        handle.await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(790), "{:?}", started.elapsed());

        let mut recorder = MetricsRecorder::new();
        while let Ok(sample) = rx.try_recv() {
            recorder.record(&sample);
        }
        let snap = recorder.snapshot();
        assert_eq!(snap.iterations(), 1);
        assert_eq!(exec.calls.load(Ordering::Relaxed), 1);
        let durations = snap.trend(ITERATION_DURATION).unwrap();
        assert!(durations.min() >= 1000.0, "min: {}", durations.min());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_requests_run_back_to_back() {
        let exec = executor(1500, false);
        let (sink, _rx) = MetricsSink::channel(1024);
        let stop = CancellationToken::new();

        let handle = tokio::spawn(vu_loop(
            0,
            scenario(1000),
            exec.clone(),
            sink,
            stop.clone(),
            ActiveVuCounter::new(),
        ));

        // No sleep between 1.5s requests: starts at 0, 1.5, 3.0, 4.5.
        tokio::time::sleep(Duration::from_millis(4600)).await;
        stop.cancel();
        handle.await.unwrap();
        assert_eq!(exec.calls.load(Ordering::Relaxed), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_never_interrupts_inflight_request() {
        let exec = executor(800, true);
        let (sink, mut rx) = MetricsSink::channel(1024);
        let stop = CancellationToken::new();
        let active = ActiveVuCounter::new();

        let handle = tokio::spawn(vu_loop(
            0,
            scenario(1000),
            exec.clone(),
            sink,
            stop.clone(),
            active.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.cancel();
        assert_eq!(active.get(), 1, "still finishing the request");
        handle.await.unwrap();
        assert_eq!(active.get(), 0);

        let mut recorder = MetricsRecorder::new();
        while let Ok(sample) = rx.try_recv() {
            recorder.record(&sample);
        }
        let snap = recorder.snapshot();
        assert_eq!(snap.total_requests(), 1);
        assert_eq!(snap.rate(HTTP_REQ_FAILED).unwrap().rate(), 1.0);
        assert_eq!(snap.errors.get("connection"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start_runs_nothing() {
        let exec = executor(10, false);
        let (sink, _rx) = MetricsSink::channel(16);
        let stop = CancellationToken::new();
        stop.cancel();

        vu_loop(
            0,
            scenario(1000),
            exec.clone(),
            sink,
            stop,
            ActiveVuCounter::new(),
        )
        .await;
        assert_eq!(exec.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_vu_exits_when_aggregator_is_gone() {
        let exec = executor(0, false);
        let (sink, rx) = MetricsSink::channel(16);
        drop(rx);

        vu_loop(
            0,
            scenario(1000),
            exec.clone(),
            sink,
            CancellationToken::new(),
            ActiveVuCounter::new(),
        )
        .await;
        assert_eq!(exec.calls.load(Ordering::Relaxed), 1);
    }
}
