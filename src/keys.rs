//! Key schema for the shared store.
//!
//! Every build owns a namespaced slice of the keyspace:
//! `build:{build_id}:<entity>`, or `{namespace}:{build_id}:<entity>` when a
//! namespace is configured. The timing store lives in its own keyspace and
//! is not covered here.

/// Builds the namespaced keys for one build.
#[derive(Debug, Clone)]
pub struct KeySchema {
    prefix: String,
}

impl KeySchema {
    pub fn new(build_id: &str, namespace: Option<&str>) -> Self {
        let prefix = match namespace {
            Some(ns) if !ns.is_empty() => format!("{ns}:{build_id}"),
            _ => format!("build:{build_id}"),
        };
        Self { prefix }
    }

    pub fn key(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }

    pub fn queue(&self) -> String {
        self.key("queue")
    }

    pub fn running(&self) -> String {
        self.key("running")
    }

    pub fn processed(&self) -> String {
        self.key("processed")
    }

    pub fn owners(&self) -> String {
        self.key("owners")
    }

    pub fn heartbeats(&self) -> String {
        self.key("heartbeats")
    }

    pub fn workers(&self) -> String {
        self.key("workers")
    }

    pub fn worker_queue(&self, worker_id: &str) -> String {
        self.key(&format!("worker:{worker_id}:queue"))
    }

    pub fn master_status(&self) -> String {
        self.key("master-status")
    }

    pub fn master_worker_id(&self) -> String {
        self.key("master-worker-id")
    }

    pub fn master_setup_heartbeat(&self) -> String {
        self.key("master-setup-heartbeat")
    }

    pub fn total(&self) -> String {
        self.key("total")
    }

    pub fn created_at(&self) -> String {
        self.key("created-at")
    }

    pub fn test_failed_count(&self) -> String {
        self.key("test_failed_count")
    }

    pub fn requeues_count(&self) -> String {
        self.key("requeues-count")
    }

    pub fn error_reports(&self) -> String {
        self.key("error-reports")
    }

    pub fn flaky_reports(&self) -> String {
        self.key("flaky-reports")
    }

    pub fn warnings(&self) -> String {
        self.key("warnings")
    }

    pub fn chunks(&self) -> String {
        self.key("chunks")
    }

    pub fn chunk(&self, chunk_id: &str) -> String {
        self.key(&format!("chunk:{chunk_id}"))
    }

    pub fn test_group_timeout(&self) -> String {
        self.key("test-group-timeout")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prefix_uses_build_id() {
        let keys = KeySchema::new("12345", None);
        assert_eq!(keys.queue(), "build:12345:queue");
        assert_eq!(keys.worker_queue("w1"), "build:12345:worker:w1:queue");
        assert_eq!(keys.chunk("SuiteA:chunk_0"), "build:12345:chunk:SuiteA:chunk_0");
    }

    #[test]
    fn namespace_replaces_build_prefix() {
        let keys = KeySchema::new("12345", Some("acme-ci"));
        assert_eq!(keys.running(), "acme-ci:12345:running");
        assert_eq!(keys.master_status(), "acme-ci:12345:master-status");
    }

    #[test]
    fn empty_namespace_falls_back_to_default() {
        let keys = KeySchema::new("b", Some(""));
        assert_eq!(keys.total(), "build:b:total");
    }
}
