//! Build configuration.
//!
//! Every knob of the distribution protocol lives here, with the defaults
//! the protocol was tuned for. Configuration can be assembled directly,
//! loaded from environment variables, or parsed from a store URI of the
//! form `redis://host:6379/0?worker=1&build=12345`.

use std::collections::HashSet;
use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::strategy::Strategy;

/// Default lease duration in seconds.
pub const DEFAULT_TIMEOUT: f64 = 30.0;

/// Default TTL applied to every build key, in seconds (8 hours).
pub const DEFAULT_REDIS_TTL: u64 = 28_800;

/// Default worker heartbeat period while executing, in seconds.
pub const DEFAULT_HEARTBEAT_INTERVAL: f64 = 10.0;

/// Default tolerance before a silent owner's lease may be stolen.
pub const DEFAULT_HEARTBEAT_GRACE_PERIOD: f64 = 30.0;

/// Default master setup heartbeat period, in seconds.
pub const DEFAULT_MASTER_SETUP_HEARTBEAT_INTERVAL: f64 = 5.0;

/// Default staleness threshold for setup takeover, in seconds.
pub const DEFAULT_MASTER_SETUP_HEARTBEAT_TIMEOUT: f64 = 30.0;

/// Default chunk budget headroom, percent.
pub const DEFAULT_BUFFER_PERCENT: f64 = 10.0;

/// Default lower bound on the per-chunk duration budget, in milliseconds.
pub const DEFAULT_MINIMUM_MAX_CHUNK_DURATION: f64 = 120_000.0;

/// Default upper bound on the per-chunk duration budget, in milliseconds.
pub const DEFAULT_MAXIMUM_MAX_CHUNK_DURATION: f64 = 300_000.0;

/// Duration assumed for units the timing oracle has never seen, in ms.
pub const DEFAULT_TIMING_FALLBACK_DURATION: f64 = 100.0;

/// Cap on the idle backoff sleep, in seconds.
pub const DEFAULT_MAX_SLEEP: f64 = 2.0;

/// Default interior queue position for requeued units.
pub const DEFAULT_REQUEUE_OFFSET: usize = 42;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported store URI scheme in {0:?} (expected redis:// or rediss://)")]
    UnsupportedScheme(String),

    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("{0} must be set")]
    Missing(&'static str),
}

/// All knobs for one build participant.
#[derive(Debug, Clone)]
pub struct Config {
    /// Keyspace namespacing: which build this participant belongs to.
    pub build_id: String,
    /// Keyspace namespacing: this participant's identity.
    pub worker_id: String,
    /// Extra keyspace prefix replacing the `build:` default.
    pub namespace: Option<String>,
    /// Store URL for the shared queue state.
    pub redis_url: String,

    /// Default lease duration in seconds.
    pub timeout: f64,
    /// Per-unit requeue cap. Zero disables requeueing.
    pub max_requeues: u32,
    /// Global requeue budget as a fraction of the published total.
    pub requeue_tolerance: f64,
    /// TTL refreshed on every build-key write, in seconds.
    pub redis_ttl: u64,
    /// Max wait for the master to publish the queue, in seconds.
    pub queue_init_timeout: f64,
    /// Supervisor overall deadline, in seconds.
    pub report_timeout: f64,
    /// Supervisor no-active-workers deadline, in seconds.
    pub inactive_workers_timeout: f64,
    /// Early-abort threshold on recorded failures.
    pub max_test_failed: Option<u64>,

    /// Worker heartbeat period while executing, in seconds.
    pub heartbeat_interval: f64,
    /// Reserve-lost tolerance for a silent owner, in seconds.
    pub heartbeat_grace_period: f64,
    /// Master setup heartbeat period, in seconds.
    pub master_setup_heartbeat_interval: f64,
    /// Staleness threshold before a follower attempts takeover, in seconds.
    pub master_setup_heartbeat_timeout: f64,

    /// Ordering strategy for the published queue.
    pub strategy: Strategy,
    /// Seed for the deterministic shuffle.
    pub seed: u64,
    /// Chunk budget headroom, percent.
    pub buffer_percent: f64,
    /// Lower bound on the per-chunk duration budget, in milliseconds.
    pub minimum_max_chunk_duration: f64,
    /// Upper bound on the per-chunk duration budget, in milliseconds.
    pub maximum_max_chunk_duration: f64,
    /// Duration assumed for unknown units, in milliseconds.
    pub timing_fallback_duration: f64,
    /// Store URL for the timing oracle.
    pub timing_redis_url: Option<String>,
    /// JSON timing file consulted when the oracle store is unavailable.
    pub timing_file: Option<PathBuf>,
    /// Parallelism hint used to scale the chunk budget.
    pub parallel_job_count: Option<u32>,

    /// Units never requeued on failure.
    pub known_flaky_tests: HashSet<String>,
    /// Units whose failures are recorded as flaky instead of failed.
    pub flaky_tests: HashSet<String>,

    /// Supervisor failure report destination.
    pub failure_file: Option<PathBuf>,
    /// Cap on the idle backoff sleep, in seconds.
    pub max_sleep: f64,
    /// Interior queue position for requeued units.
    pub requeue_offset: usize,
}

impl Config {
    /// Configuration with protocol defaults for the given identity.
    pub fn new(build_id: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            build_id: build_id.into(),
            worker_id: worker_id.into(),
            namespace: None,
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            timeout: DEFAULT_TIMEOUT,
            max_requeues: 0,
            requeue_tolerance: 0.0,
            redis_ttl: DEFAULT_REDIS_TTL,
            queue_init_timeout: DEFAULT_TIMEOUT,
            report_timeout: DEFAULT_TIMEOUT,
            inactive_workers_timeout: DEFAULT_TIMEOUT,
            max_test_failed: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_grace_period: DEFAULT_HEARTBEAT_GRACE_PERIOD,
            master_setup_heartbeat_interval: DEFAULT_MASTER_SETUP_HEARTBEAT_INTERVAL,
            master_setup_heartbeat_timeout: DEFAULT_MASTER_SETUP_HEARTBEAT_TIMEOUT,
            strategy: Strategy::Random,
            seed: 0,
            buffer_percent: DEFAULT_BUFFER_PERCENT,
            minimum_max_chunk_duration: DEFAULT_MINIMUM_MAX_CHUNK_DURATION,
            maximum_max_chunk_duration: DEFAULT_MAXIMUM_MAX_CHUNK_DURATION,
            timing_fallback_duration: DEFAULT_TIMING_FALLBACK_DURATION,
            timing_redis_url: None,
            timing_file: None,
            parallel_job_count: None,
            known_flaky_tests: HashSet::new(),
            flaky_tests: HashSet::new(),
            failure_file: None,
            max_sleep: DEFAULT_MAX_SLEEP,
            requeue_offset: DEFAULT_REQUEUE_OFFSET,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// `CONVOY_*` variables are consulted first; when identity is absent,
    /// CI-provided variables fill in `build_id`, `worker_id`, and the
    /// shuffle seed.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let build_id = env_string("CONVOY_BUILD_ID")
            .or_else(|| env_string("BUILDKITE_BUILD_ID"))
            .or_else(|| env_string("CIRCLE_BUILD_NUM"))
            .or_else(|| env_string("GITHUB_RUN_ID"))
            .ok_or(ConfigError::Missing("CONVOY_BUILD_ID"))?;

        let worker_id = env_string("CONVOY_WORKER_ID")
            .or_else(|| env_string("BUILDKITE_PARALLEL_JOB"))
            .or_else(|| env_string("CIRCLE_NODE_INDEX"))
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut config = Self::new(build_id, worker_id);

        if let Some(url) = env_string("CONVOY_REDIS_URL") {
            config.redis_url = url;
        }
        if let Some(ns) = env_string("CONVOY_NAMESPACE") {
            config.namespace = Some(ns);
        }
        if let Some(raw) = env_string("CONVOY_SEED") {
            config.seed = parse_value("CONVOY_SEED", &raw)?;
        } else if let Some(commit) = env_string("BUILDKITE_COMMIT") {
            config.seed = seed_from_text(&commit);
        }
        if let Some(raw) = env_string("CONVOY_TIMEOUT") {
            config.timeout = parse_value("CONVOY_TIMEOUT", &raw)?;
            config.queue_init_timeout = config.timeout;
            config.report_timeout = config.timeout;
            config.inactive_workers_timeout = config.timeout;
        }
        if let Some(raw) = env_string("CONVOY_QUEUE_INIT_TIMEOUT") {
            config.queue_init_timeout = parse_value("CONVOY_QUEUE_INIT_TIMEOUT", &raw)?;
        }
        if let Some(raw) = env_string("CONVOY_REPORT_TIMEOUT") {
            config.report_timeout = parse_value("CONVOY_REPORT_TIMEOUT", &raw)?;
        }
        if let Some(raw) = env_string("CONVOY_INACTIVE_WORKERS_TIMEOUT") {
            config.inactive_workers_timeout =
                parse_value("CONVOY_INACTIVE_WORKERS_TIMEOUT", &raw)?;
        }
        if let Some(raw) = env_string("CONVOY_MAX_REQUEUES") {
            config.max_requeues = parse_value("CONVOY_MAX_REQUEUES", &raw)?;
        }
        if let Some(raw) = env_string("CONVOY_REQUEUE_TOLERANCE") {
            config.requeue_tolerance = parse_value("CONVOY_REQUEUE_TOLERANCE", &raw)?;
        }
        if let Some(raw) = env_string("CONVOY_REDIS_TTL") {
            config.redis_ttl = parse_value("CONVOY_REDIS_TTL", &raw)?;
        }
        if let Some(raw) = env_string("CONVOY_MAX_TEST_FAILED") {
            config.max_test_failed = Some(parse_value("CONVOY_MAX_TEST_FAILED", &raw)?);
        }
        if let Some(raw) = env_string("CONVOY_STRATEGY") {
            config.strategy = raw.parse().map_err(|_| ConfigError::InvalidValue {
                name: "CONVOY_STRATEGY",
                value: raw,
            })?;
        }
        if let Some(raw) = env_string("BUILDKITE_PARALLEL_JOB_COUNT") {
            let count: u32 = parse_value("BUILDKITE_PARALLEL_JOB_COUNT", &raw)?;
            if count > 0 {
                config.parallel_job_count = Some(count);
            }
        }
        if let Some(url) = env_string("CONVOY_TIMING_REDIS_URL") {
            config.timing_redis_url = Some(url);
        }
        if let Some(path) = env_string("CONVOY_TIMING_FILE") {
            config.timing_file = Some(PathBuf::from(path));
        }
        if let Some(path) = env_string("CONVOY_FAILURE_FILE") {
            config.failure_file = Some(PathBuf::from(path));
        }
        if let Some(raw) = env_string("CONVOY_KNOWN_FLAKY_TESTS") {
            config.known_flaky_tests = split_id_list(&raw);
        }
        if let Some(raw) = env_string("CONVOY_FLAKY_TESTS") {
            config.flaky_tests = split_id_list(&raw);
        }

        Ok(config)
    }

    /// Parse a store URI with identity query parameters, the form
    /// deployments pass around:
    /// `redis://host:6379/0?worker=1&build=12345&timeout=40`.
    ///
    /// Both `redis://` and `rediss://` are accepted; the query string is
    /// consumed and the rest of the URI becomes `redis_url`.
    pub fn from_uri(uri: &str) -> Result<Self, ConfigError> {
        if !uri.starts_with("redis://") && !uri.starts_with("rediss://") {
            return Err(ConfigError::UnsupportedScheme(uri.to_string()));
        }

        let (base, query) = match uri.split_once('?') {
            Some((base, query)) => (base, Some(query)),
            None => (uri, None),
        };

        let mut build_id = None;
        let mut worker_id = None;
        let mut timeout = None;
        let mut max_requeues = None;
        let mut requeue_tolerance = None;

        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
                match name {
                    "build" => build_id = Some(value.to_string()),
                    "worker" => worker_id = Some(value.to_string()),
                    "timeout" => timeout = Some(parse_value::<f64>("timeout", value)?),
                    "max_requeues" => {
                        max_requeues = Some(parse_value::<u32>("max_requeues", value)?)
                    }
                    "requeue_tolerance" => {
                        requeue_tolerance =
                            Some(parse_value::<f64>("requeue_tolerance", value)?)
                    }
                    // Unknown parameters are tolerated so deployments can
                    // carry reporter-specific settings in the same URI.
                    _ => {}
                }
            }
        }

        let build_id = build_id.ok_or(ConfigError::Missing("build"))?;
        let worker_id = worker_id.ok_or(ConfigError::Missing("worker"))?;

        let mut config = Self::new(build_id, worker_id);
        config.redis_url = base.to_string();
        if let Some(timeout) = timeout {
            config.timeout = timeout;
            config.queue_init_timeout = timeout;
            config.report_timeout = timeout;
            config.inactive_workers_timeout = timeout;
        }
        if let Some(max_requeues) = max_requeues {
            config.max_requeues = max_requeues;
        }
        if let Some(tolerance) = requeue_tolerance {
            config.requeue_tolerance = tolerance;
        }
        Ok(config)
    }

    /// Build-wide requeue budget: `⌈total · requeue_tolerance⌉`.
    pub fn global_max_requeues(&self, total: u64) -> u64 {
        (total as f64 * self.requeue_tolerance).ceil() as u64
    }

    /// Whether per-executable dynamic deadlines are in play. Only the
    /// bin-packing strategy publishes `test-group-timeout` entries.
    pub fn use_dynamic_timeouts(&self) -> bool {
        self.strategy == Strategy::SuiteBinPacking
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_value<T: std::str::FromStr>(name: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        name,
        value: raw.to_string(),
    })
}

fn split_id_list(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Stable seed derived from CI-provided text such as a commit SHA.
fn seed_from_text(text: &str) -> u64 {
    // FNV-1a; the seed only needs to be stable across workers of one build.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in text.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_tuning() {
        let config = Config::new("b1", "w1");
        assert_eq!(config.timeout, 30.0);
        assert_eq!(config.max_requeues, 0);
        assert_eq!(config.requeue_tolerance, 0.0);
        assert_eq!(config.redis_ttl, 28_800);
        assert_eq!(config.queue_init_timeout, config.timeout);
        assert_eq!(config.report_timeout, config.timeout);
        assert_eq!(config.inactive_workers_timeout, config.timeout);
        assert_eq!(config.heartbeat_interval, 10.0);
        assert_eq!(config.heartbeat_grace_period, 30.0);
        assert_eq!(config.master_setup_heartbeat_interval, 5.0);
        assert_eq!(config.master_setup_heartbeat_timeout, 30.0);
        assert_eq!(config.strategy, Strategy::Random);
        assert_eq!(config.buffer_percent, 10.0);
        assert_eq!(config.minimum_max_chunk_duration, 120_000.0);
        assert_eq!(config.maximum_max_chunk_duration, 300_000.0);
        assert_eq!(config.timing_fallback_duration, 100.0);
        assert_eq!(config.requeue_offset, 42);
    }

    #[test]
    fn from_uri_extracts_identity_and_keeps_base_url() {
        let config = Config::from_uri("redis://localhost:6379/0?worker=1&build=12345").unwrap();
        assert_eq!(config.build_id, "12345");
        assert_eq!(config.worker_id, "1");
        assert_eq!(config.redis_url, "redis://localhost:6379/0");
    }

    #[test]
    fn from_uri_accepts_tls_scheme() {
        let config =
            Config::from_uri("rediss://queue.internal:6379/0?worker=7&build=99&timeout=45")
                .unwrap();
        assert_eq!(config.redis_url, "rediss://queue.internal:6379/0");
        assert_eq!(config.timeout, 45.0);
        assert_eq!(config.report_timeout, 45.0);
    }

    #[test]
    fn from_uri_rejects_other_schemes() {
        let err = Config::from_uri("postgres://x?worker=1&build=2").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedScheme(_)));
    }

    #[test]
    fn from_uri_requires_identity() {
        let err = Config::from_uri("redis://localhost:6379/0?worker=1").unwrap_err();
        assert!(matches!(err, ConfigError::Missing("build")));
    }

    #[test]
    fn global_requeue_budget_rounds_up() {
        let mut config = Config::new("b", "w");
        config.requeue_tolerance = 0.05;
        assert_eq!(config.global_max_requeues(100), 5);
        assert_eq!(config.global_max_requeues(101), 6);
        assert_eq!(config.global_max_requeues(0), 0);
    }

    #[test]
    fn seed_from_text_is_stable() {
        assert_eq!(seed_from_text("abc123"), seed_from_text("abc123"));
        assert_ne!(seed_from_text("abc123"), seed_from_text("abc124"));
    }
}
