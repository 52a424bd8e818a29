//! Execution-time oracle.
//!
//! Per-unit exponential moving averages, kept in a keyspace independent of
//! any single build so estimates survive across builds. Smoothing is
//! asymmetric: a slower sample widens the estimate with α = 0.2, a faster
//! sample tightens it with α = 0.01, so deadline budgets trend toward the
//! worst case without overreacting to noise.
//!
//! Planners read the store through [`TimingOracle`], which resolves each
//! id with the precedence EMA value > JSON timing file > constant
//! fallback, degrading silently when a source is unavailable.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use redis::AsyncCommands;
use tracing::warn;

use crate::backend::{StoreError, StoreResult};
use crate::config::Config;

/// Smoothing factor applied when a sample is slower than the average.
pub const ALPHA_FAST: f64 = 0.2;

/// Smoothing factor applied when a sample is faster than the average.
pub const ALPHA_SLOW: f64 = 0.01;

/// Hash key holding the averages.
pub const DEFAULT_TIMING_KEY: &str = "timing_data";

/// Default page size for the incremental scan.
pub const DEFAULT_SCAN_COUNT: usize = 1000;

/// One smoothing step. The first observation stores the raw sample.
pub fn smooth(previous: Option<f64>, sample_ms: f64) -> f64 {
    match previous {
        None => sample_ms,
        Some(previous) if sample_ms > previous => {
            ALPHA_FAST * sample_ms + (1.0 - ALPHA_FAST) * previous
        }
        Some(previous) => ALPHA_SLOW * sample_ms + (1.0 - ALPHA_SLOW) * previous,
    }
}

enum Inner {
    Redis {
        conn: redis::aio::MultiplexedConnection,
        key: String,
        update: redis::Script,
    },
    Memory(Arc<Mutex<HashMap<String, f64>>>),
}

/// EMA store for unit durations, in milliseconds.
pub struct TimingStore {
    inner: Inner,
}

impl TimingStore {
    /// Connect to the timing keyspace at `url`.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            inner: Inner::Redis {
                conn,
                key: DEFAULT_TIMING_KEY.to_string(),
                update: crate::scripts::Scripts::new().ema_update,
            },
        })
    }

    /// Process-local store for tests and single-process runs.
    pub fn in_memory() -> Self {
        Self {
            inner: Inner::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    pub async fn update(&self, id: &str, duration_ms: f64) -> StoreResult<()> {
        self.update_many(&[(id.to_string(), duration_ms)]).await
    }

    /// Fold a batch of samples in one server-side evaluation.
    pub async fn update_many(&self, samples: &[(String, f64)]) -> StoreResult<()> {
        if samples.is_empty() {
            return Ok(());
        }
        match &self.inner {
            Inner::Redis { conn, key, update } => {
                let mut conn = conn.clone();
                let script = update.clone();
                let mut invocation = script.key(key);
                invocation.arg(ALPHA_FAST);
                invocation.arg(ALPHA_SLOW);
                for (id, duration) in samples {
                    invocation.arg(id);
                    invocation.arg(duration);
                }
                invocation.invoke_async::<()>(&mut conn).await?;
                Ok(())
            }
            Inner::Memory(map) => {
                let mut map = map.lock().expect("timing map poisoned");
                for (id, duration) in samples {
                    let previous = map.get(id).copied();
                    map.insert(id.clone(), smooth(previous, *duration));
                }
                Ok(())
            }
        }
    }

    /// Load the whole store through an incremental cursor scan.
    pub async fn load_all(&self, count: usize) -> StoreResult<HashMap<String, f64>> {
        match &self.inner {
            Inner::Redis { conn, key, .. } => {
                let mut conn = conn.clone();
                let mut durations = HashMap::new();
                let mut cursor: u64 = 0;
                loop {
                    let (next, fields): (u64, Vec<String>) = redis::cmd("HSCAN")
                        .arg(key)
                        .arg(cursor)
                        .arg("COUNT")
                        .arg(count)
                        .query_async(&mut conn)
                        .await?;
                    for pair in fields.chunks_exact(2) {
                        let id = &pair[0];
                        match pair[1].parse::<f64>() {
                            Ok(duration) => {
                                durations.insert(id.clone(), duration);
                            }
                            Err(_) => {
                                return Err(StoreError::Malformed {
                                    id: id.clone(),
                                    reason: format!("non-numeric duration {:?}", pair[1]),
                                });
                            }
                        }
                    }
                    if next == 0 {
                        break;
                    }
                    cursor = next;
                }
                Ok(durations)
            }
            Inner::Memory(map) => Ok(map.lock().expect("timing map poisoned").clone()),
        }
    }

    pub async fn size(&self) -> StoreResult<u64> {
        match &self.inner {
            Inner::Redis { conn, key, .. } => {
                let mut conn = conn.clone();
                Ok(conn.hlen(key).await?)
            }
            Inner::Memory(map) => Ok(map.lock().expect("timing map poisoned").len() as u64),
        }
    }

    pub async fn exists(&self) -> StoreResult<bool> {
        Ok(self.size().await? > 0)
    }
}

/// Immutable duration lookup used by the ordering strategies.
#[derive(Debug, Clone, Default)]
pub struct TimingOracle {
    durations: HashMap<String, f64>,
    fallback_ms: f64,
}

impl TimingOracle {
    pub fn from_map(durations: HashMap<String, f64>, fallback_ms: f64) -> Self {
        Self {
            durations,
            fallback_ms,
        }
    }

    /// Assemble the oracle for one build: JSON timing file first, EMA
    /// store values layered on top, constant fallback for the rest. Each
    /// unavailable source degrades with a single warning.
    pub async fn load(config: &Config) -> Self {
        let mut durations = HashMap::new();

        if let Some(path) = &config.timing_file {
            match load_timing_file(path) {
                Ok(from_file) => durations.extend(from_file),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "timing file unavailable, falling back");
                }
            }
        }

        if let Some(url) = &config.timing_redis_url {
            match TimingStore::connect(url).await {
                Ok(store) => match store.load_all(DEFAULT_SCAN_COUNT).await {
                    Ok(from_store) => durations.extend(from_store),
                    Err(err) => {
                        warn!(error = %err, "timing store scan failed, falling back");
                    }
                },
                Err(err) => {
                    warn!(error = %err, "timing store unreachable, falling back");
                }
            }
        }

        Self {
            durations,
            fallback_ms: config.timing_fallback_duration,
        }
    }

    /// Estimated duration for one unit, in milliseconds.
    pub fn duration_ms(&self, id: &str) -> f64 {
        self.durations.get(id).copied().unwrap_or(self.fallback_ms)
    }

    pub fn known(&self, id: &str) -> Option<f64> {
        self.durations.get(id).copied()
    }

    pub fn total_ms<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> f64 {
        ids.into_iter().map(|id| self.duration_ms(id)).sum()
    }
}

fn load_timing_file(path: &Path) -> Result<HashMap<String, f64>, StoreError> {
    let raw = std::fs::read_to_string(path).map_err(|err| StoreError::Malformed {
        id: path.display().to_string(),
        reason: err.to_string(),
    })?;
    Ok(serde_json::from_str(&raw)?)
}
