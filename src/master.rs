//! Master election and queue population.
//!
//! Exactly one worker per build publishes the queue. Election is a
//! create-if-absent on the master status key; the winner runs ordering
//! (which can take tens of seconds for a large suite) while renewing a
//! setup heartbeat from a background task. Followers poll, and take over
//! atomically once that heartbeat stales. The publish commit is guarded
//! on `master-worker-id`, so a deposed master's commit returns false
//! instead of double-pushing.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::backend::{MasterState, QueueBackend, StoreError};
use crate::clock::Clock;
use crate::config::Config;
use crate::executable::Unit;
use crate::strategy::build_plan;
use crate::timing::TimingOracle;

/// Poll period while waiting for the master to publish.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bound on joining the setup heartbeat task after signalling stop.
const HEARTBEAT_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum MasterError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("master did not publish the queue within {0} seconds")]
    WaitTimeout(f64),

    #[error("store unreachable during setup commit: {0}")]
    CommitFailed(StoreError),
}

pub type MasterResult<T> = Result<T, MasterError>;

/// How this worker came out of queue initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterRole {
    /// This worker committed the queue (elected or by takeover).
    Master,
    /// Another worker committed the queue.
    Follower,
}

/// Runs election, setup, and takeover for one worker.
pub struct MasterCoordinator<B> {
    backend: Arc<B>,
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
}

impl<B: QueueBackend + 'static> MasterCoordinator<B> {
    pub fn new(backend: Arc<B>, config: Arc<Config>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            config,
            clock,
        }
    }

    /// Elect or wait until the queue is published. On election (or
    /// takeover) this worker orders `units` and commits; otherwise it
    /// polls until the master's commit is visible, bounded by
    /// `queue_init_timeout`.
    pub async fn ensure_ready(&self, units: &[Unit]) -> MasterResult<MasterRole> {
        let now = self.clock.now();
        if self.backend.elect_master(now).await? {
            info!(worker_id = %self.config.worker_id, "elected master, populating queue");
            if self.run_setup(units).await? {
                return Ok(MasterRole::Master);
            }
            // Deposed during setup: fall through into the wait loop and do
            // not retry the commit.
            warn!(worker_id = %self.config.worker_id, "setup commit aborted by takeover");
        }
        self.wait_for_master(units).await
    }

    /// Order the units and commit the queue while renewing the setup
    /// heartbeat in the background. Returns false when the guard failed.
    async fn run_setup(&self, units: &[Unit]) -> MasterResult<bool> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let heartbeat = self.spawn_setup_heartbeat(stop_rx);

        let oracle = TimingOracle::load(&self.config).await;
        let plan = build_plan(units, &self.config, &oracle);
        debug!(
            executables = plan.ids.len(),
            chunks = plan.chunks.len(),
            strategy = %self.config.strategy,
            "ordered queue contents"
        );

        let committed = self
            .backend
            .publish(&plan, self.clock.now())
            .await
            .map_err(MasterError::CommitFailed);

        let _ = stop_tx.send(true);
        if tokio::time::timeout(HEARTBEAT_JOIN_TIMEOUT, heartbeat).await.is_err() {
            warn!("setup heartbeat task did not stop within the join bound");
        }

        let committed = committed?;
        if committed {
            info!(executables = plan.ids.len(), "queue published, build ready");
        }
        Ok(committed)
    }

    /// Renew the setup heartbeat until stopped. Transient write failures
    /// are logged and skipped; the master does not abdicate over one.
    fn spawn_setup_heartbeat(
        &self,
        mut stop: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let backend = Arc::clone(&self.backend);
        let clock = Arc::clone(&self.clock);
        let period = Duration::from_secs_f64(self.config.master_setup_heartbeat_interval);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(err) = backend.write_setup_heartbeat(clock.now()).await {
                            error!(error = %err, "setup heartbeat write failed");
                        }
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Poll until the queue is published, attempting takeover whenever the
    /// current master's setup heartbeat is stale or missing.
    async fn wait_for_master(&self, units: &[Unit]) -> MasterResult<MasterRole> {
        let deadline = self.clock.now() + self.config.queue_init_timeout;
        loop {
            match self.backend.master_state().await? {
                Some(state) if state.is_populated() => return Ok(MasterRole::Follower),
                Some(MasterState::Setup) => {
                    if self.setup_heartbeat_stale().await? {
                        let now = self.clock.now();
                        if self.backend.try_takeover(now).await? {
                            info!(worker_id = %self.config.worker_id, "took over stale master setup");
                            if self.run_setup(units).await? {
                                return Ok(MasterRole::Master);
                            }
                            warn!("takeover commit aborted by a further takeover");
                        }
                    }
                }
                Some(_) => {}
                None => {
                    // No master at all (first arrival raced, or the setup
                    // keys expired): stand for election again.
                    let now = self.clock.now();
                    if self.backend.elect_master(now).await? && self.run_setup(units).await? {
                        return Ok(MasterRole::Master);
                    }
                }
            }

            if self.clock.now() >= deadline {
                return Err(MasterError::WaitTimeout(self.config.queue_init_timeout));
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    async fn setup_heartbeat_stale(&self) -> MasterResult<bool> {
        match self.backend.setup_heartbeat().await? {
            None => Ok(true),
            Some(beat) => {
                Ok(self.clock.now() - beat >= self.config.master_setup_heartbeat_timeout)
            }
        }
    }
}
