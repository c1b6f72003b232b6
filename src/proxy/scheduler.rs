//! Bounded worker pool that probes a proxy list and reports results as they complete

use crate::error::{EmitError, ProbeError, Result};
use crate::proxy::cancel::CancelSignal;
use crate::proxy::checker::{CheckerConfig, Prober, ProxyChecker};
use crate::proxy::models::{ProbeOutcome, RunSummary};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Upper bound on concurrent lanes regardless of what the caller asks for
pub const MAX_WORKERS: usize = 50;

/// Clamp a requested worker count to [1, MAX_WORKERS] and to the amount of work
pub fn clamp_workers(requested: usize, total: usize) -> usize {
    requested.clamp(1, MAX_WORKERS).min(total)
}

/// Lifecycle of a single run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Cancelled,
}

/// Cursor and counters shared by the lanes of one run
#[derive(Debug)]
struct ScheduleState {
    next: AtomicUsize,
    completed: AtomicUsize,
    total: usize,
}

impl ScheduleState {
    fn new(total: usize) -> Self {
        Self {
            next: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            total,
        }
    }

    /// Claim the next unassigned index. The cursor never moves past `total`.
    fn claim(&self) -> Option<usize> {
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                (next < self.total).then_some(next + 1)
            })
            .ok()
    }

    fn claimed(&self) -> usize {
        self.next.load(Ordering::Acquire)
    }

    /// Claim the next index for a probe that has not begun yet. An index claimed
    /// after the signal fired is dropped unprobed.
    fn claim_unless_cancelled(&self, cancel: &CancelSignal) -> Option<usize> {
        let index = self.claim()?;
        (!cancel.is_cancelled()).then_some(index)
    }

    fn record_completion(&self) -> usize {
        let completed = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(completed <= self.claimed());
        completed
    }
}

/// What a run produced
#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: RunState,
    /// Outcomes in input order; `None` for indices never probed
    pub results: Vec<Option<ProbeOutcome>>,
    /// Present only when the run completed without cancellation
    pub summary: Option<RunSummary>,
    pub workers_used: usize,
}

impl RunReport {
    /// Outcomes that were produced, in input order
    pub fn outcomes(&self) -> impl Iterator<Item = &ProbeOutcome> {
        self.results.iter().flatten()
    }

    pub fn working_count(&self) -> usize {
        self.outcomes().filter(|o| o.is_working()).count()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == RunState::Cancelled
    }
}

/// Runs probes over a descriptor list with a fixed number of concurrent lanes
pub struct WorkerPool<P: Prober = ProxyChecker> {
    prober: Arc<P>,
    config: Arc<CheckerConfig>,
}

impl WorkerPool<ProxyChecker> {
    /// Create a pool backed by a network [`ProxyChecker`]
    pub fn new(config: CheckerConfig) -> Self {
        Self::with_prober(ProxyChecker::with_config(config.clone()), config)
    }
}

impl<P: Prober> WorkerPool<P> {
    pub fn with_prober(prober: P, config: CheckerConfig) -> Self {
        Self {
            prober: Arc::new(prober),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    /// Probe every descriptor, calling `on_complete(index, outcome)` once per
    /// finished probe in completion order.
    ///
    /// Returns after every lane has exited. An `Err` from `on_complete` means the
    /// consumer is gone and cancels the rest of the run. An empty list is rejected.
    #[instrument(skip_all, fields(run_id = %Uuid::new_v4(), total = descriptors.len()))]
    pub async fn run<F>(
        &self,
        descriptors: Vec<String>,
        on_complete: F,
        cancel: CancelSignal,
    ) -> Result<RunReport>
    where
        F: Fn(usize, &ProbeOutcome) -> std::result::Result<(), EmitError> + Send + Sync + 'static,
    {
        if descriptors.is_empty() {
            return Err(ProbeError::InvalidRequest("no proxies to test".to_string()));
        }

        let total = descriptors.len();
        let workers = clamp_workers(self.config.workers, total);
        let start = Instant::now();

        let descriptors: Arc<[String]> = descriptors.into();
        let state = Arc::new(ScheduleState::new(total));
        let on_complete = Arc::new(on_complete);

        info!("Starting proxy test with {} workers for {} proxies", workers, total);
        debug!("Run state: {:?} -> {:?}", RunState::Idle, RunState::Running);

        let lanes: Vec<_> = (0..workers)
            .map(|lane_id| {
                let lane = Lane {
                    id: lane_id + 1,
                    state: Arc::clone(&state),
                    descriptors: Arc::clone(&descriptors),
                    prober: Arc::clone(&self.prober),
                    config: Arc::clone(&self.config),
                    on_complete: Arc::clone(&on_complete),
                    cancel: cancel.clone(),
                };
                tokio::spawn(lane.run())
            })
            .collect();

        // Join barrier: every lane has exited before results are assembled
        let joined = futures::future::join_all(lanes).await;

        let mut results: Vec<Option<ProbeOutcome>> = vec![None; total];
        for lane in joined {
            let finished = lane.map_err(|e| ProbeError::Internal(format!("lane failed: {}", e)))?;
            for (index, outcome) in finished {
                if results[index].replace(outcome).is_some() {
                    return Err(ProbeError::Internal(format!(
                        "index {} was reported twice",
                        index
                    )));
                }
            }
        }

        let run_state = if cancel.is_cancelled() {
            RunState::Cancelled
        } else {
            RunState::Completed
        };
        debug!("Run state: {:?} -> {:?}", RunState::Running, run_state);

        let working = results.iter().flatten().filter(|o| o.is_working()).count();
        let summary = match run_state {
            RunState::Completed => {
                let summary = RunSummary {
                    total_time_ms: start.elapsed().as_millis() as u64,
                    workers_used: workers,
                    total_proxies: total,
                    working_proxies: working,
                };
                info!(
                    "Completed proxy testing in {}ms, working: {}/{}",
                    summary.total_time_ms, working, total
                );
                Some(summary)
            }
            _ => {
                info!(
                    "Proxy test cancelled after {} of {} proxies",
                    state.completed.load(Ordering::Acquire),
                    total
                );
                None
            }
        };

        Ok(RunReport {
            state: run_state,
            results,
            summary,
            workers_used: workers,
        })
    }

    /// Convenience wrapper that collects results without streaming them
    pub async fn check_proxies(&self, descriptors: Vec<String>) -> Result<RunReport> {
        self.run(descriptors, |_, _| Ok(()), CancelSignal::new()).await
    }
}

/// One concurrently executing claim-probe-report loop
struct Lane<P, F> {
    id: usize,
    state: Arc<ScheduleState>,
    descriptors: Arc<[String]>,
    prober: Arc<P>,
    config: Arc<CheckerConfig>,
    on_complete: Arc<F>,
    cancel: CancelSignal,
}

impl<P, F> Lane<P, F>
where
    P: Prober,
    F: Fn(usize, &ProbeOutcome) -> std::result::Result<(), EmitError> + Send + Sync + 'static,
{
    async fn run(self) -> Vec<(usize, ProbeOutcome)> {
        let mut finished = Vec::new();

        loop {
            if self.cancel.is_cancelled() {
                debug!("Lane {} stopping: run cancelled", self.id);
                break;
            }

            // Checked again after the claim so a cancel racing it never reaches the prober
            let Some(index) = self.state.claim_unless_cancelled(&self.cancel) else {
                break;
            };

            debug!(
                "Lane {} testing proxy {}/{}",
                self.id,
                index + 1,
                self.state.total
            );

            let request = self.config.request(index, &self.descriptors[index]);
            let outcome = self.prober.probe(request, self.cancel.clone()).await;
            self.state.record_completion();

            if let Err(e) = (self.on_complete)(index, &outcome) {
                warn!("Failed to deliver result for proxy {}: {}", index + 1, e);
                self.cancel.cancel();
            }

            finished.push((index, outcome));
        }

        debug!("Lane {} finished", self.id);
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::models::{ProbeRequest, ProbeStatus};
    use crate::proxy::test_support::{closed_port, http_response, spawn_silent_proxy, spawn_static_proxy};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::io;
    use std::time::Duration;

    #[derive(Default)]
    struct Counters {
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    /// Prober that sleeps instead of touching the network
    struct FakeProber {
        delay: Duration,
        counters: Arc<Counters>,
    }

    impl FakeProber {
        fn new(delay: Duration) -> (Self, Arc<Counters>) {
            let counters = Arc::new(Counters::default());
            (
                Self {
                    delay,
                    counters: Arc::clone(&counters),
                },
                counters,
            )
        }
    }

    #[async_trait]
    impl Prober for FakeProber {
        async fn probe(&self, request: ProbeRequest, cancel: CancelSignal) -> ProbeOutcome {
            self.counters.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.peak.fetch_max(active, Ordering::SeqCst);

            let aborted = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(self.delay) => false,
            };
            self.counters.active.fetch_sub(1, Ordering::SeqCst);

            if aborted {
                ProbeOutcome::failure(request.source, "Test aborted by user".to_string(), None)
            } else if request.source.starts_with("ok") {
                ProbeOutcome::success(request.source, "Connected successfully (200)".to_string(), 5)
            } else {
                ProbeOutcome::failure(request.source, "Connection refused".to_string(), None)
            }
        }
    }

    fn descriptors(count: usize) -> Vec<String> {
        (0..count)
            .map(|i| if i % 3 == 0 { format!("ok-{}", i) } else { format!("bad-{}", i) })
            .collect()
    }

    fn fake_pool(delay: Duration, workers: usize) -> (WorkerPool<FakeProber>, Arc<Counters>) {
        let (prober, counters) = FakeProber::new(delay);
        let pool = WorkerPool::with_prober(prober, CheckerConfig::new().with_workers(workers));
        (pool, counters)
    }

    fn recorder() -> (
        Arc<Mutex<Vec<usize>>>,
        impl Fn(usize, &ProbeOutcome) -> std::result::Result<(), EmitError> + Send + Sync + 'static,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |index, _: &ProbeOutcome| {
            sink.lock().push(index);
            Ok(())
        })
    }

    #[test]
    fn test_clamp_workers() {
        assert_eq!(clamp_workers(0, 10), 1);
        assert_eq!(clamp_workers(10, 3), 3);
        assert_eq!(clamp_workers(100, 200), MAX_WORKERS);
        assert_eq!(clamp_workers(7, 7), 7);
        assert_eq!(clamp_workers(5, 0), 0);
    }

    #[test]
    fn test_claim_never_passes_total() {
        let state = ScheduleState::new(2);
        assert_eq!(state.claim(), Some(0));
        assert_eq!(state.claim(), Some(1));
        assert_eq!(state.claim(), None);
        assert_eq!(state.claim(), None);
        assert_eq!(state.claimed(), 2);
    }

    #[test]
    fn test_claim_after_cancel_is_dropped() {
        let state = ScheduleState::new(3);
        let cancel = CancelSignal::new();
        assert_eq!(state.claim_unless_cancelled(&cancel), Some(0));

        cancel.cancel();
        assert_eq!(state.claim_unless_cancelled(&cancel), None);
        assert_eq!(state.claimed(), 2);
    }

    #[tokio::test]
    async fn test_cancel_from_delivery_stops_single_lane() {
        let (pool, counters) = fake_pool(Duration::from_millis(1), 1);
        let cancel = CancelSignal::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let trigger = cancel.clone();
        let sink = Arc::clone(&seen);
        let report = pool
            .run(
                descriptors(10),
                move |index, outcome: &ProbeOutcome| {
                    sink.lock().push((index, outcome.message.clone()));
                    trigger.cancel();
                    Ok(())
                },
                cancel,
            )
            .await
            .unwrap();

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert_ne!(seen[0].1, "Test aborted by user");
        assert_eq!(counters.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.outcomes().count(), 1);
        assert!(report.is_cancelled());
    }

    #[tokio::test]
    async fn test_completed_run_reports_every_index_once() {
        let (pool, counters) = fake_pool(Duration::from_millis(5), 8);
        let (seen, on_complete) = recorder();

        let report = pool.run(descriptors(37), on_complete, CancelSignal::new()).await.unwrap();

        let mut indices = seen.lock().clone();
        indices.sort_unstable();
        assert_eq!(indices, (0..37).collect::<Vec<_>>());
        assert_eq!(counters.calls.load(Ordering::SeqCst), 37);

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.results.len(), 37);
        assert!(report.results.iter().all(Option::is_some));
        for (i, outcome) in report.outcomes().enumerate() {
            assert!(outcome.proxy.ends_with(&format!("-{}", i)));
        }

        let summary = report.summary.as_ref().expect("completed run has a summary");
        assert_eq!(summary.total_proxies, 37);
        assert_eq!(summary.workers_used, 8);
        assert_eq!(summary.working_proxies, 13);
        assert_eq!(summary.working_proxies, report.working_count());
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_workers() {
        let (pool, counters) = fake_pool(Duration::from_millis(20), 5);
        let report = pool.check_proxies(descriptors(30)).await.unwrap();

        assert_eq!(report.workers_used, 5);
        let peak = counters.peak.load(Ordering::SeqCst);
        assert!(peak <= 5, "peak concurrency {}", peak);
        assert!(peak >= 1);
    }

    #[tokio::test]
    async fn test_workers_clamped_to_descriptor_count() {
        let (pool, counters) = fake_pool(Duration::from_millis(20), 50);
        let report = pool.check_proxies(descriptors(3)).await.unwrap();

        assert_eq!(report.workers_used, 3);
        assert_eq!(report.summary.unwrap().workers_used, 3);
        assert!(counters.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_batches_bound_total_time() {
        let (pool, _) = fake_pool(Duration::from_millis(100), 5);
        let report = pool.check_proxies(descriptors(20)).await.unwrap();

        let summary = report.summary.unwrap();
        assert!(summary.total_time_ms >= 380, "total {}ms", summary.total_time_ms);
        assert!(summary.total_time_ms < 2_000, "total {}ms", summary.total_time_ms);
    }

    #[tokio::test]
    async fn test_cancel_mid_run_truncates_results() {
        let (pool, counters) = fake_pool(Duration::from_millis(50), 2);
        let (seen, on_complete) = recorder();
        let cancel = CancelSignal::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            trigger.cancel();
        });

        let report = pool.run(descriptors(50), on_complete, cancel).await.unwrap();

        assert_eq!(report.state, RunState::Cancelled);
        assert!(report.summary.is_none());

        let indices = seen.lock().clone();
        assert!(indices.len() < 50);
        assert_eq!(indices.len(), counters.calls.load(Ordering::SeqCst));

        let mut unique = indices.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), indices.len());

        for (index, result) in report.results.iter().enumerate() {
            assert_eq!(result.is_some(), indices.contains(&index));
        }
    }

    #[tokio::test]
    async fn test_empty_list_is_rejected() {
        let (pool, counters) = fake_pool(Duration::from_millis(1), 4);
        let (seen, on_complete) = recorder();

        let result = pool.run(Vec::new(), on_complete, CancelSignal::new()).await;

        assert!(matches!(result, Err(ProbeError::InvalidRequest(_))));
        assert!(seen.lock().is_empty());
        assert_eq!(counters.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_start_claims_nothing() {
        let (pool, counters) = fake_pool(Duration::from_millis(5), 4);
        let (seen, on_complete) = recorder();
        let cancel = CancelSignal::new();
        cancel.cancel();

        let report = pool.run(descriptors(10), on_complete, cancel).await.unwrap();

        assert!(report.is_cancelled());
        assert!(seen.lock().is_empty());
        assert_eq!(counters.calls.load(Ordering::SeqCst), 0);
        assert!(report.results.iter().all(Option::is_none));
    }

    #[tokio::test]
    async fn test_delivery_failure_cancels_run() {
        let (pool, counters) = fake_pool(Duration::from_millis(10), 2);
        let cancel = CancelSignal::new();

        let report = pool
            .run(
                descriptors(40),
                |_, _| Err(EmitError::Write(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))),
                cancel.clone(),
            )
            .await
            .unwrap();

        assert!(cancel.is_cancelled());
        assert!(report.is_cancelled());
        assert!(report.summary.is_none());
        // Each lane stops after the probe whose delivery failed
        assert!(counters.calls.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_malformed_descriptor_run() {
        let pool = WorkerPool::new(CheckerConfig::new().with_workers(1));
        let report = pool.check_proxies(vec!["not-a-proxy".to_string()]).await.unwrap();

        let outcome = report.results[0].as_ref().unwrap();
        assert_eq!(outcome.status, ProbeStatus::Failure);
        assert!(outcome.message.starts_with("Invalid proxy format"));
        assert!(outcome.response_time_ms.is_none());
        assert_eq!(report.summary.unwrap().working_proxies, 0);
    }

    #[tokio::test]
    async fn test_summary_counts_working_local_proxies() {
        let good = spawn_static_proxy(http_response("200 OK", r#"{"origin":"198.51.100.4"}"#)).await;
        let bad = closed_port().await;
        let pool = WorkerPool::new(
            CheckerConfig::new()
                .with_workers(2)
                .with_timeout(Duration::from_secs(2))
                .with_test_url("http://probe.test/ip".to_string()),
        );

        let report = pool
            .check_proxies(vec![good.to_string(), bad.to_string()])
            .await
            .unwrap();

        assert!(report.results[0].as_ref().unwrap().is_working());
        assert!(!report.results[1].as_ref().unwrap().is_working());
        let summary = report.summary.as_ref().unwrap();
        assert_eq!(summary.workers_used, 2);
        assert_eq!(summary.working_proxies, 1);
        assert_eq!(summary.working_proxies, report.working_count());
    }

    #[tokio::test]
    async fn test_unreachable_proxies_finish_in_batches() {
        let silent = spawn_silent_proxy().await;
        let pool = WorkerPool::new(
            CheckerConfig::new()
                .with_workers(5)
                .with_timeout(Duration::from_secs(1))
                .with_test_url("http://probe.test/ip".to_string()),
        );

        let report = pool.check_proxies(vec![silent.to_string(); 20]).await.unwrap();

        assert_eq!(report.outcomes().count(), 20);
        assert!(report.outcomes().all(|o| o.message == "Connection timeout"));
        let summary = report.summary.unwrap();
        assert_eq!(summary.workers_used, 5);
        assert_eq!(summary.working_proxies, 0);
        assert!(summary.total_time_ms >= 3_500, "total {}ms", summary.total_time_ms);
        assert!(summary.total_time_ms < 10_000, "total {}ms", summary.total_time_ms);
    }
}
