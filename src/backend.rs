//! Storage seam for the distribution protocol.
//!
//! The protocol only needs a key-value store with atomic server-side
//! scripting. [`QueueBackend`] captures exactly the operations the worker
//! loop, master coordinator, supervisor, and build record perform; the
//! production implementation speaks Redis, the in-memory implementation
//! runs the same transitions under one lock for tests and single-process
//! runs.
//!
//! A backend instance is bound to one worker identity; operations that
//! depend on "this worker" (reserve, heartbeat, release) act on the
//! identity the backend was built with.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executable::Chunk;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("malformed record for {id}: {reason}")]
    Malformed { id: String, reason: String },

    #[error("build queue expired (created at {created_at})")]
    Expired { created_at: f64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Master state machine value. The store holds the raw string; an embedded
/// generation suffix (`setup:3`) still reads as `Setup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Setup,
    Ready,
    Finished,
}

impl MasterState {
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.starts_with("setup") {
            Some(Self::Setup)
        } else {
            match raw {
                "ready" => Some(Self::Ready),
                "finished" => Some(Self::Finished),
                _ => None,
            }
        }
    }

    /// Ready or finished: the queue contents are committed.
    pub fn is_populated(self) -> bool {
        matches!(self, Self::Ready | Self::Finished)
    }
}

/// Result of a heartbeat attestation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeartbeatOutcome {
    /// The unit is processed, unowned, or owned by another worker.
    NotOwner,
    /// Ownership confirmed; the deadline was far enough away to leave.
    Unchanged,
    /// Ownership confirmed and the deadline moved.
    Extended { old_deadline: f64, new_deadline: f64 },
}

/// Warning kind recorded when a worker successfully steals a lease.
pub const WARNING_RESERVED_LOST_TEST: &str = "RESERVED_LOST_TEST";

/// Non-fatal condition recorded store-side for the supervisor to drain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    #[serde(rename = "type")]
    pub kind: String,
    pub attrs: serde_json::Value,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

impl Warning {
    pub fn new(kind: impl Into<String>, attrs: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            attrs,
            recorded_at: chrono::Utc::now(),
        }
    }
}

/// Everything published by the master in the ready commit's surroundings.
#[derive(Debug, Clone, Default)]
pub struct QueuePlan {
    /// Executable ids in consumption order.
    pub ids: Vec<String>,
    /// Chunk records to store at `chunk:{id}`.
    pub chunks: Vec<(String, Chunk)>,
    /// Dynamic per-executable timeouts, in seconds.
    pub group_timeouts: Vec<(String, f64)>,
}

/// Atomic-scripting store operations used by the protocol.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    // --- lifecycle -------------------------------------------------------

    /// Add this worker to the build's worker set.
    async fn register_worker(&self) -> StoreResult<()>;

    /// Give up every lease this worker holds (expired-lease form: units
    /// stay in the running set for reserve_lost to reclaim).
    async fn release(&self) -> StoreResult<()>;

    /// Final TTL refresh on this worker's queue and the processed set,
    /// performed on loop exit.
    async fn refresh_exit_ttls(&self) -> StoreResult<()>;

    // --- master coordination ---------------------------------------------

    /// Create-if-absent election; returns true when this worker is master.
    async fn elect_master(&self, now: f64) -> StoreResult<bool>;

    /// Replace a master whose setup heartbeat staled; returns true when
    /// this worker took over.
    async fn try_takeover(&self, now: f64) -> StoreResult<bool>;

    async fn master_state(&self) -> StoreResult<Option<MasterState>>;

    async fn master_worker_id(&self) -> StoreResult<Option<String>>;

    /// Single-command setup heartbeat write (allowed outside scripts).
    async fn write_setup_heartbeat(&self, now: f64) -> StoreResult<()>;

    async fn setup_heartbeat(&self) -> StoreResult<Option<f64>>;

    /// Store chunk records and dynamic timeouts, then atomically commit
    /// queue contents + total + ready, guarded on master-worker-id still
    /// naming this worker. Returns false when the guard failed because a
    /// takeover happened; the caller must demote itself and not retry.
    async fn publish(&self, plan: &QueuePlan, now: f64) -> StoreResult<bool>;

    /// Flip master state to finished.
    async fn mark_finished(&self) -> StoreResult<()>;

    // --- leasing ---------------------------------------------------------

    /// Tail-pop one id from the queue and lease it to this worker.
    async fn reserve(&self, now: f64) -> StoreResult<Option<String>>;

    /// Steal one expired lease whose owner stopped heartbeating.
    async fn reserve_lost(&self, now: f64) -> StoreResult<Option<String>>;

    /// Attest ownership and extend the deadline when near expiry.
    async fn heartbeat(&self, id: &str, now: f64) -> StoreResult<HeartbeatOutcome>;

    /// Record completion; returns false when another worker completed the
    /// unit first.
    async fn acknowledge(&self, id: &str) -> StoreResult<bool>;

    /// Put a unit back into the queue at the configured interior offset,
    /// bounded by the per-unit cap and the supplied build-wide budget.
    async fn requeue(&self, id: &str, global_max_requeues: u64) -> StoreResult<bool>;

    // --- progress --------------------------------------------------------

    async fn queue_len(&self) -> StoreResult<u64>;

    async fn running_len(&self) -> StoreResult<u64>;

    async fn processed_len(&self) -> StoreResult<u64>;

    /// Number of published executables, once the ready commit happened.
    async fn total(&self) -> StoreResult<Option<u64>>;

    async fn created_at(&self) -> StoreResult<Option<f64>>;

    /// Queue and running set both empty after the ready commit.
    async fn is_exhausted(&self) -> StoreResult<bool>;

    /// Whether any running entry has a deadline within the lease window,
    /// i.e. some worker made progress recently.
    async fn workers_active(&self, now: f64) -> StoreResult<bool>;

    async fn fetch_chunk(&self, id: &str) -> StoreResult<Option<Chunk>>;

    async fn group_timeout(&self, id: &str) -> StoreResult<Option<f64>>;

    /// Ids ever reserved by this worker, newest first.
    async fn worker_queue_ids(&self) -> StoreResult<Vec<String>>;

    async fn requeue_count(&self, id: &str) -> StoreResult<u64>;

    // --- build record ----------------------------------------------------

    async fn record_error(&self, id: &str, payload: &str) -> StoreResult<()>;

    /// Clear a unit's error report; returns true when the unit turned out
    /// flaky (failed before or was requeued, now passed).
    async fn record_success(&self, id: &str) -> StoreResult<bool>;

    async fn failed_unit_ids(&self) -> StoreResult<Vec<String>>;

    async fn error_reports(&self) -> StoreResult<Vec<(String, String)>>;

    async fn flaky_unit_ids(&self) -> StoreResult<Vec<String>>;

    async fn increment_test_failed(&self) -> StoreResult<u64>;

    async fn test_failed_count(&self) -> StoreResult<u64>;

    async fn record_warning(&self, warning: &Warning) -> StoreResult<()>;

    /// Read and clear the warnings list atomically.
    async fn pop_warnings(&self) -> StoreResult<Vec<Warning>>;
}
