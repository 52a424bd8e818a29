//! Convoy - a distributed test queue over an atomic-scripting store
//!
//! A build fans a fixed batch of named test units out across an ephemeral
//! worker fleet that coordinates only through a Redis-like store. One
//! worker is elected master and publishes the ordered queue; every worker
//! then reserves, executes, and acknowledges units until the queue drains;
//! a supervisor enforces the overall deadline.
//!
//! ## Protocol
//!
//! - [`master`]: leader election, setup heartbeat, liveness-based takeover,
//!   guarded queue commit
//! - [`worker`]: reserve / execute / acknowledge loop with heartbeat-extended
//!   leases and steal-on-silence
//! - [`supervisor`]: exhaustion and deadline observer, failure report artifact
//!
//! ## State
//!
//! - [`backend`]: the storage seam ([`QueueBackend`]) every role runs against
//! - [`store`]: production Redis implementation (Lua scripts in `src/lua/`)
//! - [`memory`]: in-memory implementation for tests and single-process runs
//! - [`record`]: error reports, flaky detection, warnings, counters
//!
//! ## Planning
//!
//! - [`strategy`]: random, timing-sorted, and suite bin-packing orderings
//! - [`timing`]: asymmetric-EMA duration oracle with JSON file fallback
//! - [`executable`]: units, chunks, and the id classification between them

pub mod backend;
pub mod clock;
pub mod config;
pub mod executable;
pub mod keys;
pub mod master;
pub mod memory;
pub mod record;
pub mod scripts;
pub mod store;
pub mod strategy;
pub mod supervisor;
pub mod timing;
pub mod worker;

// Configuration & time
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigError};

// Storage seam
pub use backend::{
    HeartbeatOutcome, MasterState, QueueBackend, QueuePlan, StoreError, StoreResult, Warning,
    WARNING_RESERVED_LOST_TEST,
};
pub use memory::InMemoryQueue;
pub use store::RedisQueue;

// Model
pub use executable::{CHUNK_MARKER, Chunk, Executable, Unit, UnitIndex, is_chunk_id, suite_of};

// Planning
pub use strategy::{Strategy, build_plan, chunk_budget_ms};
pub use timing::{TimingOracle, TimingStore};

// Roles
pub use master::{MasterCoordinator, MasterError, MasterRole};
pub use record::{BuildRecord, RecordError};
pub use supervisor::{ExitReason, Supervisor, SupervisorError, SupervisorReport};
pub use worker::{UnitExecutor, UnitOutcome, Worker, WorkerError, WorkerSummary};
