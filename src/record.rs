//! Build record: error reports, flaky detection, warnings, counters.
//!
//! Store-side bookkeeping shared by every worker of a build. Failures are
//! keyed by unit id so a later pass on the same id clears the failure; a
//! unit observed to both fail and pass in one build is flaky.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::backend::{QueueBackend, StoreError, StoreResult, Warning};
use crate::config::Config;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failure report io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failure report serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type RecordResult<T> = Result<T, RecordError>;

/// Handle on the build's shared bookkeeping.
pub struct BuildRecord<B> {
    backend: Arc<B>,
    config: Arc<Config>,
}

impl<B: QueueBackend> BuildRecord<B> {
    pub fn new(backend: Arc<B>, config: Arc<Config>) -> Self {
        Self { backend, config }
    }

    /// Store an opaque failure payload for a unit.
    pub async fn record_error(&self, id: &str, payload: &serde_json::Value) -> RecordResult<()> {
        let raw = serde_json::to_string(payload)?;
        self.backend.record_error(id, &raw).await?;
        Ok(())
    }

    /// Clear a unit's failure; returns true when the unit turned out
    /// flaky (a previous failure was cleared, or the unit was requeued).
    pub async fn record_success(&self, id: &str) -> RecordResult<bool> {
        Ok(self.backend.record_success(id).await?)
    }

    pub async fn failed_tests(&self) -> RecordResult<Vec<String>> {
        Ok(self.backend.failed_unit_ids().await?)
    }

    pub async fn flaky_tests(&self) -> RecordResult<Vec<String>> {
        Ok(self.backend.flaky_unit_ids().await?)
    }

    pub async fn record_warning(
        &self,
        kind: &str,
        attrs: serde_json::Value,
    ) -> RecordResult<()> {
        self.backend
            .record_warning(&Warning::new(kind, attrs))
            .await?;
        Ok(())
    }

    /// Read and clear the warnings list atomically.
    pub async fn pop_warnings(&self) -> RecordResult<Vec<Warning>> {
        Ok(self.backend.pop_warnings().await?)
    }

    pub async fn increment_test_failed(&self) -> RecordResult<u64> {
        Ok(self.backend.increment_test_failed().await?)
    }

    pub async fn test_failed_count(&self) -> RecordResult<u64> {
        Ok(self.backend.test_failed_count().await?)
    }

    /// Whether the configured failure cap has been reached.
    pub async fn max_test_failed_reached(&self) -> RecordResult<bool> {
        let Some(cap) = self.config.max_test_failed else {
            return Ok(false);
        };
        Ok(self.backend.test_failed_count().await? >= cap)
    }

    /// Serialize the error reports as a JSON array at `path`, creating
    /// parent directories as needed. Returns the number of reports.
    pub async fn write_failure_report(&self, path: &Path) -> RecordResult<usize> {
        let reports = self.backend.error_reports().await?;
        let payloads: Vec<serde_json::Value> = reports
            .iter()
            .map(|(id, raw)| {
                // Unparsable payloads are preserved verbatim rather than lost.
                serde_json::from_str(raw)
                    .unwrap_or_else(|_| serde_json::json!({ "test": id, "payload": raw }))
            })
            .collect();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(&payloads)?;
        std::fs::write(path, body)?;
        debug!(path = %path.display(), count = payloads.len(), "wrote failure report");
        Ok(payloads.len())
    }
}
