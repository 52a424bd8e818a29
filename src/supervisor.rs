//! Supervisor: global progress observer.
//!
//! A non-executing role that waits for the master's commit, then polls at
//! 1 Hz until the queue drains, a deadline runs out, or the failure cap
//! trips. It is the component that turns distributed progress into one
//! pass/fail decision and, when configured, a failure report artifact.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::backend::{QueueBackend, StoreError};
use crate::clock::Clock;
use crate::config::Config;
use crate::record::{BuildRecord, RecordError};

/// Supervisor poll period.
const POLL_PERIOD: Duration = Duration::from_secs(1);

/// Poll period while waiting for the master commit.
const WAIT_POLL_PERIOD: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("master did not publish the queue within {0} seconds")]
    WaitTimeout(f64),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Why the supervisor stopped observing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Queue and running set drained.
    Exhausted,
    /// The overall deadline ran out.
    ReportTimeout,
    /// No worker showed progress for too long.
    InactiveWorkers,
    /// The failure cap tripped.
    MaxFailures,
}

/// Final observation of one build.
#[derive(Debug, Clone)]
pub struct SupervisorReport {
    pub reason: ExitReason,
    pub failed_count: u64,
    pub processed: u64,
    pub total: Option<u64>,
    /// Number of reports written to the failure file, when configured.
    pub failure_reports_written: Option<usize>,
}

impl SupervisorReport {
    /// The build passed: drained with no recorded failures.
    pub fn passed(&self) -> bool {
        self.reason == ExitReason::Exhausted && self.failed_count == 0
    }
}

/// Observes one build and enforces its deadlines.
pub struct Supervisor<B> {
    backend: Arc<B>,
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    record: BuildRecord<B>,
}

impl<B: QueueBackend + 'static> Supervisor<B> {
    pub fn new(backend: Arc<B>, config: Arc<Config>, clock: Arc<dyn Clock>) -> Self {
        let record = BuildRecord::new(Arc::clone(&backend), Arc::clone(&config));
        Self {
            backend,
            config,
            clock,
            record,
        }
    }

    pub async fn run(&self) -> SupervisorResult<SupervisorReport> {
        self.wait_until_populated().await?;

        let mut time_left = self.config.report_timeout;
        let mut time_left_no_workers = self.config.inactive_workers_timeout;

        let reason = loop {
            if self.backend.is_exhausted().await? {
                break ExitReason::Exhausted;
            }
            if self.record.max_test_failed_reached().await? {
                break ExitReason::MaxFailures;
            }
            if time_left <= 0.0 {
                break ExitReason::ReportTimeout;
            }
            if time_left_no_workers <= 0.0 {
                break ExitReason::InactiveWorkers;
            }

            tokio::time::sleep(POLL_PERIOD).await;
            time_left -= 1.0;
            if self.backend.workers_active(self.clock.now()).await? {
                time_left_no_workers = self.config.inactive_workers_timeout;
            } else {
                time_left_no_workers -= 1.0;
            }
        };

        if reason == ExitReason::Exhausted {
            self.backend.mark_finished().await?;
        } else {
            warn!(?reason, "supervisor exited before the queue drained");
        }

        let failed_count = self.record.test_failed_count().await?;
        let processed = self.backend.processed_len().await?;
        let total = self.backend.total().await?;

        let failure_reports_written = match &self.config.failure_file {
            Some(path) => Some(self.record.write_failure_report(path).await?),
            None => None,
        };

        info!(
            ?reason,
            failed_count,
            processed,
            total,
            "supervision finished"
        );
        Ok(SupervisorReport {
            reason,
            failed_count,
            processed,
            total,
            failure_reports_written,
        })
    }

    async fn wait_until_populated(&self) -> SupervisorResult<()> {
        let deadline = self.clock.now() + self.config.queue_init_timeout;
        loop {
            if let Some(state) = self.backend.master_state().await? {
                if state.is_populated() {
                    return Ok(());
                }
            }
            if self.clock.now() >= deadline {
                return Err(SupervisorError::WaitTimeout(self.config.queue_init_timeout));
            }
            tokio::time::sleep(WAIT_POLL_PERIOD).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::QueuePlan;
    use crate::clock::ManualClock;
    use crate::memory::InMemoryQueue;

    async fn populated_backend(config: &Arc<Config>) -> Arc<InMemoryQueue> {
        let backend = Arc::new(InMemoryQueue::new(Arc::clone(config)));
        assert!(backend.elect_master(0.0).await.unwrap());
        let plan = QueuePlan {
            ids: vec!["A#t1".to_string()],
            ..QueuePlan::default()
        };
        assert!(backend.publish(&plan, 0.0).await.unwrap());
        backend
    }

    #[tokio::test]
    async fn exhausted_build_passes_and_is_marked_finished() {
        let config = Arc::new(Config::new("b", "supervisor"));
        let backend = populated_backend(&config).await;
        // Drain the queue.
        backend.reserve(1.0).await.unwrap();
        backend.acknowledge("A#t1").await.unwrap();

        let clock = Arc::new(ManualClock::new(10.0)) as Arc<dyn Clock>;
        let supervisor = Supervisor::new(Arc::clone(&backend), config, clock);
        let report = supervisor.run().await.unwrap();

        assert_eq!(report.reason, ExitReason::Exhausted);
        assert!(report.passed());
        assert_eq!(report.processed, 1);
        assert_eq!(
            backend.master_state().await.unwrap(),
            Some(crate::backend::MasterState::Finished)
        );
    }

    #[tokio::test]
    async fn failure_cap_short_circuits() {
        let mut config = Config::new("b", "supervisor");
        config.max_test_failed = Some(1);
        let config = Arc::new(config);
        let backend = populated_backend(&config).await;
        backend.increment_test_failed().await.unwrap();

        let clock = Arc::new(ManualClock::new(10.0)) as Arc<dyn Clock>;
        let supervisor = Supervisor::new(Arc::clone(&backend), config, clock);
        let report = supervisor.run().await.unwrap();

        assert_eq!(report.reason, ExitReason::MaxFailures);
        assert!(!report.passed());
        assert_eq!(report.failed_count, 1);
    }

    #[tokio::test]
    async fn inactive_workers_deadline_fires() {
        let mut config = Config::new("b", "supervisor");
        config.inactive_workers_timeout = 1.0;
        config.report_timeout = 60.0;
        let config = Arc::new(config);
        let backend = populated_backend(&config).await;
        // Queue is non-empty and nobody is running anything.

        let clock = Arc::new(ManualClock::new(10.0)) as Arc<dyn Clock>;
        let supervisor = Supervisor::new(Arc::clone(&backend), config, clock);
        let report = supervisor.run().await.unwrap();
        assert_eq!(report.reason, ExitReason::InactiveWorkers);
    }

    #[tokio::test]
    async fn missing_master_commit_times_out() {
        let mut config = Config::new("b", "supervisor");
        config.queue_init_timeout = 0.0;
        let config = Arc::new(config);
        let backend = Arc::new(InMemoryQueue::new(Arc::clone(&config)));

        let clock = Arc::new(ManualClock::new(10.0)) as Arc<dyn Clock>;
        let supervisor = Supervisor::new(backend, config, clock);
        let err = supervisor.run().await.unwrap_err();
        assert!(matches!(err, SupervisorError::WaitTimeout(_)));
    }

    #[tokio::test]
    async fn failure_file_is_written_on_exit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifacts/failures.json");
        let mut config = Config::new("b", "supervisor");
        config.failure_file = Some(path.clone());
        let config = Arc::new(config);
        let backend = populated_backend(&config).await;
        backend.reserve(1.0).await.unwrap();
        backend
            .record_error("A#t1", "{\"message\":\"boom\"}")
            .await
            .unwrap();
        backend.acknowledge("A#t1").await.unwrap();

        let clock = Arc::new(ManualClock::new(10.0)) as Arc<dyn Clock>;
        let supervisor = Supervisor::new(backend, config, clock);
        let report = supervisor.run().await.unwrap();

        assert_eq!(report.failure_reports_written, Some(1));
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("boom"));
    }
}
