//! Worker loop: reserve, execute, acknowledge.
//!
//! Each worker runs one executable at a time. Stolen work is preferred
//! over fresh work so interrupted units finish first; a background
//! heartbeat task attests ownership while the executable runs; every
//! reserved id is settled (acknowledged or requeued) before the next
//! reservation. Idle workers back off exponentially, and everything here
//! is cooperative: `shutdown()` flips a flag checked at each iteration.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::backend::{QueueBackend, StoreError, WARNING_RESERVED_LOST_TEST};
use crate::clock::Clock;
use crate::config::Config;
use crate::executable::{Executable, Unit, UnitIndex, is_chunk_id};
use crate::master::{MasterCoordinator, MasterError};
use crate::record::{BuildRecord, RecordError};
use crate::timing::TimingStore;

/// Starting idle backoff, doubled up to `Config::max_sleep`.
const INITIAL_IDLE_SLEEP: f64 = 0.5;

/// Bound on joining the heartbeat task after signalling stop.
const HEARTBEAT_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Acknowledge retry schedule on transient transport failures.
const ACKNOWLEDGE_ATTEMPTS: u32 = 5;
const ACKNOWLEDGE_BACKOFF_START: Duration = Duration::from_millis(100);

/// Slack past the store TTL before the queue counts as expired.
const EXPIRY_SLACK_SECONDS: f64 = 600.0;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Master(#[from] MasterError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("settled id {got:?} does not match reserved id {expected:?}")]
    ReservationMismatch { expected: String, got: String },

    #[error("build queue expired (created at {created_at})")]
    QueueExpired { created_at: f64 },
}

pub type WorkerResult<T> = Result<T, WorkerError>;

/// Outcome of executing one unit, reported by the embedding framework.
#[derive(Debug, Clone)]
pub struct UnitOutcome {
    pub passed: bool,
    pub duration_ms: f64,
    /// Opaque failure payload recorded in the error reports.
    pub error: Option<serde_json::Value>,
}

impl UnitOutcome {
    pub fn passed(duration_ms: f64) -> Self {
        Self {
            passed: true,
            duration_ms,
            error: None,
        }
    }

    pub fn failed(duration_ms: f64, error: serde_json::Value) -> Self {
        Self {
            passed: false,
            duration_ms,
            error: Some(error),
        }
    }
}

/// Executes unit bodies. The queue core yields units here and settles the
/// reservation from the returned outcome; framework adapters implement it.
#[async_trait]
pub trait UnitExecutor: Send + Sync {
    async fn execute(&self, unit: &Unit) -> UnitOutcome;
}

/// Counters accumulated over one worker run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    /// Unit bodies executed, including chunk members.
    pub executed: u64,
    /// Executables this worker completed first.
    pub acknowledged: u64,
    /// Acknowledgements that lost the race to another worker.
    pub lost: u64,
    /// Successful requeues issued by this worker.
    pub requeued: u64,
    /// Failures recorded (after requeue attempts).
    pub failures: u64,
    /// Queue was drained when the loop exited.
    pub exhausted: bool,
    /// The failure cap short-circuited the loop.
    pub max_failures_hit: bool,
}

/// One member of the worker fleet.
pub struct Worker<B> {
    backend: Arc<B>,
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    units: Vec<Unit>,
    index: Arc<UnitIndex>,
    record: BuildRecord<B>,
    timing: Option<Arc<TimingStore>>,
    timing_degraded: AtomicBool,
    shutdown: Arc<AtomicBool>,
}

impl<B: QueueBackend + 'static> Worker<B> {
    pub fn new(
        backend: Arc<B>,
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
        units: Vec<Unit>,
    ) -> Self {
        let index = Arc::new(UnitIndex::new(&units));
        let record = BuildRecord::new(Arc::clone(&backend), Arc::clone(&config));
        Self {
            backend,
            config,
            clock,
            units,
            index,
            record,
            timing: None,
            timing_degraded: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attach the EMA store updated after successful completions.
    pub fn with_timing_store(mut self, timing: Arc<TimingStore>) -> Self {
        self.timing = Some(timing);
        self
    }

    /// Cooperative stop: the current executable finishes, then the loop
    /// exits. Safe to call from a signal handler task.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn record(&self) -> &BuildRecord<B> {
        &self.record
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Join the build and process executables until the queue drains, the
    /// failure cap trips, or shutdown is requested.
    pub async fn run(&self, executor: Arc<dyn UnitExecutor>) -> WorkerResult<WorkerSummary> {
        self.backend.register_worker().await?;

        let coordinator = MasterCoordinator::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.config),
            Arc::clone(&self.clock),
        );
        let role = coordinator.ensure_ready(&self.units).await?;
        debug!(worker_id = %self.config.worker_id, ?role, "queue ready");

        let total = self
            .backend
            .total()
            .await?
            .unwrap_or(self.units.len() as u64);
        let global_max_requeues = self.config.global_max_requeues(total);
        let created_at = self.backend.created_at().await?;

        let mut summary = WorkerSummary::default();
        let mut idle_sleep = INITIAL_IDLE_SLEEP;

        while !self.is_shutdown() {
            if let Some(created_at) = created_at {
                let expires_at = created_at + self.config.redis_ttl as f64 + EXPIRY_SLACK_SECONDS;
                if self.clock.now() > expires_at {
                    return Err(WorkerError::QueueExpired { created_at });
                }
            }

            if self.record.max_test_failed_reached().await? {
                info!(
                    cap = self.config.max_test_failed,
                    "too many failed tests; aborting this worker"
                );
                summary.max_failures_hit = true;
                break;
            }

            let reserved = match self.reserve_next().await {
                Ok(reserved) => reserved,
                Err(err) => {
                    // Transient store trouble: let the next iteration retry.
                    warn!(error = %err, "reservation failed");
                    self.idle_pause(&mut idle_sleep).await;
                    continue;
                }
            };

            let Some((id, stolen)) = reserved else {
                if self.backend.is_exhausted().await? {
                    summary.exhausted = true;
                    break;
                }
                self.idle_pause(&mut idle_sleep).await;
                continue;
            };
            idle_sleep = INITIAL_IDLE_SLEEP;

            if stolen {
                debug!(id = %id, "reserved a lost lease");
                self.record
                    .record_warning(
                        WARNING_RESERVED_LOST_TEST,
                        serde_json::json!({ "test": id, "worker": self.config.worker_id }),
                    )
                    .await?;
            }

            let Some(executable) = self.resolve(&id).await? else {
                // The record behind the id is gone (expired chunk body or
                // an id outside the input list): settle it so the queue
                // does not wedge.
                warn!(id = %id, "reserved id did not resolve; acknowledging");
                self.acknowledge_with_retry(&id).await?;
                continue;
            };

            let guard = HeartbeatGuard::spawn(
                Arc::clone(&self.backend),
                Arc::clone(&self.clock),
                id.clone(),
                self.config.heartbeat_interval,
            );
            let settled = self
                .execute_and_settle(&executable, &executor, global_max_requeues, &mut summary)
                .await;
            guard.stop().await;
            settled?;
        }

        self.backend.release().await?;
        self.backend.refresh_exit_ttls().await?;
        info!(
            worker_id = %self.config.worker_id,
            executed = summary.executed,
            acknowledged = summary.acknowledged,
            requeued = summary.requeued,
            failures = summary.failures,
            exhausted = summary.exhausted,
            "worker loop finished"
        );
        Ok(summary)
    }

    /// Stolen work first, then the shared queue.
    async fn reserve_next(&self) -> WorkerResult<Option<(String, bool)>> {
        let now = self.clock.now();
        if let Some(id) = self.backend.reserve_lost(now).await? {
            return Ok(Some((id, true)));
        }
        if let Some(id) = self.backend.reserve(now).await? {
            return Ok(Some((id, false)));
        }
        Ok(None)
    }

    /// Map a reserved id onto a unit or a hydrated chunk.
    async fn resolve(&self, id: &str) -> WorkerResult<Option<Executable>> {
        if is_chunk_id(id) {
            let Some(chunk) = self.backend.fetch_chunk(id).await? else {
                return Ok(None);
            };
            Ok(Some(self.index.hydrate_chunk(id, chunk)))
        } else {
            Ok(self.index.get(id).cloned().map(Executable::Test))
        }
    }

    async fn execute_and_settle(
        &self,
        executable: &Executable,
        executor: &Arc<dyn UnitExecutor>,
        global_max_requeues: u64,
        summary: &mut WorkerSummary,
    ) -> WorkerResult<()> {
        match executable {
            Executable::Test(unit) => {
                let outcome = executor.execute(unit).await;
                summary.executed += 1;
                self.settle_unit(&unit.id, &unit.id, &outcome, global_max_requeues, summary)
                    .await
            }
            Executable::Chunk { id, tests, .. } => {
                let mut samples = Vec::with_capacity(tests.len());
                for unit in tests {
                    if self.is_shutdown() {
                        break;
                    }
                    let outcome = executor.execute(unit).await;
                    summary.executed += 1;
                    if outcome.passed {
                        samples.push((unit.id.clone(), outcome.duration_ms));
                        if self.record.record_success(&unit.id).await? {
                            debug!(id = %unit.id, "flaky unit passed on retry");
                        }
                    } else {
                        // Break the member out of the chunk for isolated
                        // retry; the reservation-match check does not apply
                        // because the member was never reserved by itself.
                        self.settle_failure(&unit.id, &outcome, global_max_requeues, summary)
                            .await?;
                    }
                }
                self.update_timing(&samples).await;
                // The chunk itself is acknowledged as one id.
                if self.acknowledge_with_retry(id).await? {
                    summary.acknowledged += 1;
                } else {
                    summary.lost += 1;
                }
                Ok(())
            }
        }
    }

    /// Settle a reserved unit id from its outcome. `reserved_id` is the id
    /// the worker holds; settling anything else is a programming error.
    async fn settle_unit(
        &self,
        reserved_id: &str,
        id: &str,
        outcome: &UnitOutcome,
        global_max_requeues: u64,
        summary: &mut WorkerSummary,
    ) -> WorkerResult<()> {
        if reserved_id != id {
            return Err(WorkerError::ReservationMismatch {
                expected: reserved_id.to_string(),
                got: id.to_string(),
            });
        }

        if outcome.passed {
            if self.record.record_success(id).await? {
                debug!(id = %id, "flaky unit passed on retry");
            }
            self.update_timing(&[(id.to_string(), outcome.duration_ms)])
                .await;
            if self.acknowledge_with_retry(id).await? {
                summary.acknowledged += 1;
            } else {
                summary.lost += 1;
            }
            return Ok(());
        }

        let requeued = self
            .settle_failure(id, outcome, global_max_requeues, summary)
            .await?;
        if !requeued {
            // The failure stands; the reservation still has to be settled.
            if self.acknowledge_with_retry(id).await? {
                summary.acknowledged += 1;
            } else {
                summary.lost += 1;
            }
        }
        Ok(())
    }

    /// Record a failure and attempt flake mitigation. Returns true when
    /// the unit went back into the queue (which settles its reservation).
    async fn settle_failure(
        &self,
        id: &str,
        outcome: &UnitOutcome,
        global_max_requeues: u64,
        summary: &mut WorkerSummary,
    ) -> WorkerResult<bool> {
        let payload = outcome
            .error
            .clone()
            .unwrap_or_else(|| serde_json::json!({ "test": id, "message": "failed" }));
        self.record.record_error(id, &payload).await?;

        if !self.config.known_flaky_tests.contains(id)
            && self.backend.requeue(id, global_max_requeues).await?
        {
            debug!(id = %id, "requeued failed unit");
            summary.requeued += 1;
            return Ok(true);
        }

        summary.failures += 1;
        // Failures of declared-flaky units never trip the failure cap.
        if !self.config.flaky_tests.contains(id) {
            self.record.increment_test_failed().await?;
        }
        Ok(false)
    }

    /// Acknowledge with bounded retries; losing a completion record to a
    /// transient disconnect is the most expensive failure in the protocol.
    async fn acknowledge_with_retry(&self, id: &str) -> WorkerResult<bool> {
        let mut backoff = ACKNOWLEDGE_BACKOFF_START;
        let mut attempt = 1;
        loop {
            match self.backend.acknowledge(id).await {
                Ok(first) => {
                    if !first {
                        debug!(id = %id, "completion already recorded by another worker");
                    }
                    return Ok(first);
                }
                Err(err) if attempt < ACKNOWLEDGE_ATTEMPTS => {
                    warn!(id = %id, attempt, error = %err, "acknowledge failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(err) => {
                    error!(id = %id, error = %err, "acknowledge failed after retries");
                    return Err(err.into());
                }
            }
        }
    }

    async fn update_timing(&self, samples: &[(String, f64)]) {
        let Some(timing) = &self.timing else {
            return;
        };
        if samples.is_empty() {
            return;
        }
        if let Err(err) = timing.update_many(samples).await {
            if !self.timing_degraded.swap(true, Ordering::SeqCst) {
                warn!(error = %err, "timing store unavailable; estimates will go stale");
            }
        }
    }

    async fn idle_pause(&self, idle_sleep: &mut f64) {
        sleep_with_shutdown(&self.shutdown, Duration::from_secs_f64(*idle_sleep)).await;
        *idle_sleep = (*idle_sleep * 2.0).min(self.config.max_sleep);
    }

    /// Ids this worker reserved that still have a failure recorded; the
    /// local rerun subset after a build, newest reservation first.
    pub async fn retry_queue_ids(&self) -> WorkerResult<Vec<String>> {
        let reserved = self.backend.worker_queue_ids().await?;
        let failed = self.backend.failed_unit_ids().await?;
        let failed: std::collections::HashSet<&str> =
            failed.iter().map(String::as_str).collect();
        Ok(reserved
            .into_iter()
            .filter(|id| failed.contains(id.as_str()))
            .collect())
    }

    /// Rerun this worker's failed subset locally, without touching the
    /// shared queue. Successes clear their error reports (and surface as
    /// flaky); remaining failures keep theirs.
    pub async fn run_retry(&self, executor: Arc<dyn UnitExecutor>) -> WorkerResult<WorkerSummary> {
        let mut summary = WorkerSummary::default();
        for id in self.retry_queue_ids().await? {
            if self.is_shutdown() {
                break;
            }
            let Some(unit) = self.index.get(&id).cloned() else {
                continue;
            };
            let outcome = executor.execute(&unit).await;
            summary.executed += 1;
            if outcome.passed {
                self.record.record_success(&id).await?;
            } else {
                summary.failures += 1;
                let payload = outcome
                    .error
                    .unwrap_or_else(|| serde_json::json!({ "test": id, "message": "failed" }));
                self.record.record_error(&id, &payload).await?;
            }
        }
        Ok(summary)
    }
}

/// Background lease attestation for one reserved id.
struct HeartbeatGuard {
    stop: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl HeartbeatGuard {
    fn spawn<B: QueueBackend + 'static>(
        backend: Arc<B>,
        clock: Arc<dyn Clock>,
        id: String,
        interval_secs: f64,
    ) -> Self {
        let (stop, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs_f64(interval_secs));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a fast unit
            // never heartbeats at all.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match backend.heartbeat(&id, clock.now()).await {
                            Ok(outcome) => debug!(id = %id, ?outcome, "heartbeat"),
                            // Heartbeat trouble never aborts execution.
                            Err(err) => warn!(id = %id, error = %err, "heartbeat failed"),
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        Self { stop, handle }
    }

    async fn stop(self) {
        let _ = self.stop.send(true);
        if tokio::time::timeout(HEARTBEAT_JOIN_TIMEOUT, self.handle)
            .await
            .is_err()
        {
            warn!("heartbeat task did not stop within the join bound");
        }
    }
}

/// Sleep that wakes early when shutdown is requested.
async fn sleep_with_shutdown(shutdown: &AtomicBool, duration: Duration) {
    let step = Duration::from_millis(50);
    let mut remaining = duration;
    while !shutdown.load(Ordering::SeqCst) && remaining > Duration::ZERO {
        let chunk = remaining.min(step);
        tokio::time::sleep(chunk).await;
        remaining = remaining.saturating_sub(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::InMemoryQueue;

    struct ScriptedExecutor {
        fail_always: std::collections::HashSet<String>,
    }

    impl ScriptedExecutor {
        fn passing() -> Self {
            Self {
                fail_always: Default::default(),
            }
        }

        fn failing(ids: &[&str]) -> Self {
            Self {
                fail_always: ids.iter().map(|id| id.to_string()).collect(),
            }
        }
    }

    #[async_trait]
    impl UnitExecutor for ScriptedExecutor {
        async fn execute(&self, unit: &Unit) -> UnitOutcome {
            if self.fail_always.contains(&unit.id) {
                UnitOutcome::failed(5.0, serde_json::json!({ "test": unit.id }))
            } else {
                UnitOutcome::passed(5.0)
            }
        }
    }

    fn worker(config: Config, units: &[&str]) -> Worker<InMemoryQueue> {
        let config = Arc::new(config);
        let backend = Arc::new(InMemoryQueue::new(Arc::clone(&config)));
        let clock = Arc::new(ManualClock::new(1_000.0)) as Arc<dyn Clock>;
        let units: Vec<Unit> = units.iter().map(|s| Unit::new(*s)).collect();
        Worker::new(backend, config, clock, units)
    }

    #[tokio::test]
    async fn drains_three_units_and_reports_exhaustion() {
        let worker = worker(Config::new("b", "w1"), &["A#t1", "A#t2", "B#t1"]);
        let summary = worker
            .run(Arc::new(ScriptedExecutor::passing()))
            .await
            .unwrap();

        assert_eq!(summary.executed, 3);
        assert_eq!(summary.acknowledged, 3);
        assert_eq!(summary.failures, 0);
        assert!(summary.exhausted);
        assert_eq!(worker.backend.queue_len().await.unwrap(), 0);
        assert_eq!(worker.backend.running_len().await.unwrap(), 0);
        assert_eq!(worker.backend.processed_len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn failed_unit_is_recorded_and_counted() {
        let worker = worker(Config::new("b", "w1"), &["A#t1", "A#t2"]);
        let summary = worker
            .run(Arc::new(ScriptedExecutor::failing(&["A#t2"])))
            .await
            .unwrap();

        assert_eq!(summary.failures, 1);
        assert_eq!(summary.acknowledged, 2);
        assert_eq!(
            worker.backend.failed_unit_ids().await.unwrap(),
            vec!["A#t2".to_string()]
        );
        assert_eq!(worker.backend.test_failed_count().await.unwrap(), 1);
        assert!(summary.exhausted);
    }

    #[tokio::test]
    async fn known_flaky_units_are_never_requeued() {
        let mut config = Config::new("b", "w1");
        config.max_requeues = 3;
        config.requeue_tolerance = 1.0;
        config.known_flaky_tests.insert("A#t1".to_string());

        let worker = worker(config, &["A#t1"]);
        let summary = worker
            .run(Arc::new(ScriptedExecutor::failing(&["A#t1"])))
            .await
            .unwrap();

        assert_eq!(summary.requeued, 0);
        assert_eq!(summary.failures, 1);
        assert_eq!(worker.backend.requeue_count("A#t1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn flaky_listed_units_do_not_trip_the_failure_cap() {
        let mut config = Config::new("b", "w1");
        config.flaky_tests.insert("A#t1".to_string());
        config.max_test_failed = Some(1);

        let worker = worker(config, &["A#t1", "A#t2"]);
        let summary = worker
            .run(Arc::new(ScriptedExecutor::failing(&["A#t1"])))
            .await
            .unwrap();

        // Both units ran; the flaky failure never incremented the cap.
        assert_eq!(summary.executed, 2);
        assert!(!summary.max_failures_hit);
        assert_eq!(worker.backend.test_failed_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn requeue_gives_failed_unit_another_run() {
        let mut config = Config::new("b", "w1");
        config.max_requeues = 1;
        config.requeue_tolerance = 1.0;

        let worker = worker(config, &["A#t1", "A#t2"]);
        let summary = worker
            .run(Arc::new(ScriptedExecutor::failing(&["A#t1"])))
            .await
            .unwrap();

        // First failure requeues, second failure stands.
        assert_eq!(summary.requeued, 1);
        assert_eq!(summary.failures, 1);
        assert_eq!(worker.backend.requeue_count("A#t1").await.unwrap(), 1);
        assert!(summary.exhausted);
    }

    #[tokio::test]
    async fn retry_queue_is_reserved_intersect_failed() {
        let worker = worker(Config::new("b", "w1"), &["A#t1", "A#t2", "B#t1"]);
        worker
            .run(Arc::new(ScriptedExecutor::failing(&["A#t2", "B#t1"])))
            .await
            .unwrap();

        let mut retry = worker.retry_queue_ids().await.unwrap();
        retry.sort();
        assert_eq!(retry, vec!["A#t2".to_string(), "B#t1".to_string()]);

        // Local rerun clears the reports it fixes.
        let summary = worker
            .run_retry(Arc::new(ScriptedExecutor::failing(&["B#t1"])))
            .await
            .unwrap();
        assert_eq!(summary.executed, 2);
        assert_eq!(summary.failures, 1);
        assert_eq!(
            worker.backend.failed_unit_ids().await.unwrap(),
            vec!["B#t1".to_string()]
        );
        assert_eq!(
            worker.backend.flaky_unit_ids().await.unwrap(),
            vec!["A#t2".to_string()]
        );
    }

    #[tokio::test]
    async fn shutdown_before_run_exits_promptly() {
        let worker = worker(Config::new("b", "w1"), &["A#t1"]);
        worker.shutdown();
        let summary = worker
            .run(Arc::new(ScriptedExecutor::passing()))
            .await
            .unwrap();
        assert_eq!(summary.executed, 0);
        assert!(!summary.exhausted);
    }
}
