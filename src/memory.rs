//! In-memory queue store.
//!
//! Executes the same state transitions as the Lua scripts, each under a
//! single lock acquisition so atomicity matches the server-side scripts.
//! Multiple handles bound to different worker identities can share one
//! state, which is how multi-worker protocol tests run in-process.
//!
//! TTLs are accepted and ignored: the state dies with the process.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::backend::{
    HeartbeatOutcome, MasterState, QueueBackend, QueuePlan, StoreError, StoreResult, Warning,
};
use crate::config::Config;
use crate::executable::Chunk;
use crate::keys::KeySchema;

#[derive(Debug, Clone)]
struct OwnerEntry {
    worker_queue: String,
    reserved_at: f64,
    last_beat: f64,
}

#[derive(Debug, Default)]
struct MemoryState {
    queue: VecDeque<String>,
    running: HashMap<String, f64>,
    processed: HashSet<String>,
    owners: HashMap<String, OwnerEntry>,
    heartbeats: HashMap<String, f64>,
    worker_queues: HashMap<String, VecDeque<String>>,
    workers: HashSet<String>,
    master_status: Option<String>,
    master_worker_id: Option<String>,
    master_setup_heartbeat: Option<f64>,
    total: Option<u64>,
    created_at: Option<f64>,
    test_failed_count: u64,
    requeues: HashMap<String, u64>,
    requeues_total: u64,
    error_reports: HashMap<String, String>,
    flaky_reports: HashSet<String>,
    warnings: Vec<Warning>,
    chunks: HashMap<String, Chunk>,
    group_timeouts: HashMap<String, f64>,
}

/// [`QueueBackend`] for tests and single-process runs.
#[derive(Clone)]
pub struct InMemoryQueue {
    config: Arc<Config>,
    keys: KeySchema,
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryQueue {
    pub fn new(config: Arc<Config>) -> Self {
        let keys = KeySchema::new(&config.build_id, config.namespace.as_deref());
        Self {
            config,
            keys,
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// A handle over the same state under a different worker identity.
    pub fn attach(&self, config: Arc<Config>) -> Self {
        let keys = KeySchema::new(&config.build_id, config.namespace.as_deref());
        Self {
            config,
            keys,
            state: Arc::clone(&self.state),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn worker_queue_key(&self) -> String {
        self.keys.worker_queue(&self.config.worker_id)
    }

    /// Deadline-ordered ids with score at or below `horizon`, matching
    /// ZRANGEBYSCORE iteration order.
    fn expired_candidates(state: &MemoryState, horizon: f64) -> Vec<String> {
        let mut candidates: Vec<(&String, f64)> = state
            .running
            .iter()
            .filter(|(_, score)| **score <= horizon)
            .map(|(id, score)| (id, *score))
            .collect();
        candidates.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        candidates.into_iter().map(|(id, _)| id.clone()).collect()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
    async fn register_worker(&self) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.workers.insert(self.config.worker_id.clone());
        Ok(())
    }

    async fn release(&self) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let mine = self.worker_queue_key();
        let ids: Vec<String> = state
            .worker_queues
            .get(&mine)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default();
        for id in ids {
            let owned_here = state
                .owners
                .get(&id)
                .is_some_and(|owner| owner.worker_queue == mine);
            if owned_here {
                if let Some(score) = state.running.get_mut(&id) {
                    *score = 0.0;
                }
                state.owners.remove(&id);
            }
        }
        Ok(())
    }

    async fn refresh_exit_ttls(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn elect_master(&self, now: f64) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state.master_status.is_some() {
            return Ok(false);
        }
        state.master_status = Some("setup".to_string());
        state.master_worker_id = Some(self.config.worker_id.clone());
        state.master_setup_heartbeat = Some(now);
        Ok(true)
    }

    async fn try_takeover(&self, now: f64) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match &state.master_status {
            Some(status) if status.starts_with("setup") => {}
            _ => return Ok(false),
        }
        if let Some(beat) = state.master_setup_heartbeat {
            if now - beat < self.config.master_setup_heartbeat_timeout {
                return Ok(false);
            }
        }
        state.master_status = Some("setup".to_string());
        state.master_worker_id = Some(self.config.worker_id.clone());
        state.master_setup_heartbeat = Some(now);
        Ok(true)
    }

    async fn master_state(&self) -> StoreResult<Option<MasterState>> {
        let state = self.state.lock().await;
        match &state.master_status {
            None => Ok(None),
            Some(raw) => MasterState::parse(raw)
                .map(Some)
                .ok_or_else(|| StoreError::Malformed {
                    id: "master-status".to_string(),
                    reason: format!("unknown state {raw:?}"),
                }),
        }
    }

    async fn master_worker_id(&self) -> StoreResult<Option<String>> {
        Ok(self.state.lock().await.master_worker_id.clone())
    }

    async fn write_setup_heartbeat(&self, now: f64) -> StoreResult<()> {
        self.state.lock().await.master_setup_heartbeat = Some(now);
        Ok(())
    }

    async fn setup_heartbeat(&self) -> StoreResult<Option<f64>> {
        Ok(self.state.lock().await.master_setup_heartbeat)
    }

    async fn publish(&self, plan: &QueuePlan, now: f64) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        for (id, chunk) in &plan.chunks {
            state.chunks.insert(id.clone(), chunk.clone());
        }
        for (id, timeout) in &plan.group_timeouts {
            state.group_timeouts.insert(id.clone(), *timeout);
        }
        if state.master_worker_id.as_deref() != Some(self.config.worker_id.as_str()) {
            return Ok(false);
        }
        for id in &plan.ids {
            state.queue.push_front(id.clone());
        }
        state.total = Some(plan.ids.len() as u64);
        state.created_at.get_or_insert(now);
        state.master_status = Some("ready".to_string());
        Ok(true)
    }

    async fn mark_finished(&self) -> StoreResult<()> {
        self.state.lock().await.master_status = Some("finished".to_string());
        Ok(())
    }

    async fn reserve(&self, now: f64) -> StoreResult<Option<String>> {
        let mut state = self.state.lock().await;
        let Some(id) = state.queue.pop_back() else {
            return Ok(None);
        };
        let mut timeout = self.config.timeout;
        if self.config.use_dynamic_timeouts() {
            if let Some(dynamic) = state.group_timeouts.get(&id) {
                timeout = *dynamic;
            }
        }
        let mine = self.worker_queue_key();
        state.running.insert(id.clone(), now + timeout);
        state
            .worker_queues
            .entry(mine.clone())
            .or_default()
            .push_front(id.clone());
        state.owners.insert(
            id.clone(),
            OwnerEntry {
                worker_queue: mine,
                reserved_at: now,
                last_beat: now,
            },
        );
        Ok(Some(id))
    }

    async fn reserve_lost(&self, now: f64) -> StoreResult<Option<String>> {
        let mut state = self.state.lock().await;
        let use_dynamic = self.config.use_dynamic_timeouts();
        let horizon = if use_dynamic {
            now
        } else {
            now - self.config.timeout
        };
        let candidates = Self::expired_candidates(&state, horizon);
        for id in candidates {
            if state.processed.contains(&id) {
                continue;
            }
            if let Some(beat) = state.heartbeats.get(&id) {
                if now - beat < self.config.heartbeat_grace_period {
                    continue;
                }
            }
            let timeout = if use_dynamic {
                state
                    .group_timeouts
                    .get(&id)
                    .copied()
                    .unwrap_or(self.config.timeout)
            } else {
                self.config.timeout
            };
            let mine = self.worker_queue_key();
            state.running.insert(id.clone(), now + timeout);
            state
                .worker_queues
                .entry(mine.clone())
                .or_default()
                .push_front(id.clone());
            state.owners.insert(
                id.clone(),
                OwnerEntry {
                    worker_queue: mine,
                    reserved_at: now,
                    last_beat: now,
                },
            );
            state.heartbeats.remove(&id);
            return Ok(Some(id));
        }
        Ok(None)
    }

    async fn heartbeat(&self, id: &str, now: f64) -> StoreResult<HeartbeatOutcome> {
        let mut state = self.state.lock().await;
        if state.processed.contains(id) {
            return Ok(HeartbeatOutcome::NotOwner);
        }
        let mine = self.worker_queue_key();
        let reserved_at = match state.owners.get_mut(id) {
            Some(owner) if owner.worker_queue == mine => {
                owner.last_beat = now;
                owner.reserved_at
            }
            _ => return Ok(HeartbeatOutcome::NotOwner),
        };
        state.heartbeats.insert(id.to_string(), now);

        let timeout = state
            .group_timeouts
            .get(id)
            .copied()
            .unwrap_or(self.config.timeout);
        let Some(deadline) = state.running.get(id).copied() else {
            return Ok(HeartbeatOutcome::Unchanged);
        };
        if deadline < now + 20.0 {
            let capped = reserved_at + 3.0 * timeout;
            let extended = (now + 60.0).min(capped);
            if extended > deadline {
                state.running.insert(id.to_string(), extended);
                return Ok(HeartbeatOutcome::Extended {
                    old_deadline: deadline,
                    new_deadline: extended,
                });
            }
        }
        Ok(HeartbeatOutcome::Unchanged)
    }

    async fn acknowledge(&self, id: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state.processed.contains(id) {
            return Ok(false);
        }
        state.processed.insert(id.to_string());
        state.running.remove(id);
        state.owners.remove(id);
        Ok(true)
    }

    async fn requeue(&self, id: &str, global_max_requeues: u64) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state.processed.contains(id) {
            return Ok(false);
        }
        if state.requeues_total >= global_max_requeues {
            return Ok(false);
        }
        let count = state.requeues.get(id).copied().unwrap_or(0);
        if count >= u64::from(self.config.max_requeues) {
            return Ok(false);
        }
        state.requeues_total += 1;
        *state.requeues.entry(id.to_string()).or_insert(0) += 1;

        let offset = self.config.requeue_offset;
        let len = state.queue.len();
        if offset == 0 {
            state.queue.push_back(id.to_string());
        } else if offset <= len {
            state.queue.insert(len - offset, id.to_string());
        } else {
            state.queue.push_front(id.to_string());
        }

        state.running.remove(id);
        let mine = self.worker_queue_key();
        if let Some(queue) = state.worker_queues.get_mut(&mine) {
            queue.retain(|queued| queued != id);
        }
        state.owners.remove(id);
        Ok(true)
    }

    async fn queue_len(&self) -> StoreResult<u64> {
        Ok(self.state.lock().await.queue.len() as u64)
    }

    async fn running_len(&self) -> StoreResult<u64> {
        Ok(self.state.lock().await.running.len() as u64)
    }

    async fn processed_len(&self) -> StoreResult<u64> {
        Ok(self.state.lock().await.processed.len() as u64)
    }

    async fn total(&self) -> StoreResult<Option<u64>> {
        Ok(self.state.lock().await.total)
    }

    async fn created_at(&self) -> StoreResult<Option<f64>> {
        Ok(self.state.lock().await.created_at)
    }

    async fn is_exhausted(&self) -> StoreResult<bool> {
        let state = self.state.lock().await;
        Ok(state.total.is_some() && state.queue.is_empty() && state.running.is_empty())
    }

    async fn workers_active(&self, now: f64) -> StoreResult<bool> {
        let state = self.state.lock().await;
        let horizon = now - self.config.timeout;
        Ok(state.running.values().any(|score| *score >= horizon))
    }

    async fn fetch_chunk(&self, id: &str) -> StoreResult<Option<Chunk>> {
        Ok(self.state.lock().await.chunks.get(id).cloned())
    }

    async fn group_timeout(&self, id: &str) -> StoreResult<Option<f64>> {
        Ok(self.state.lock().await.group_timeouts.get(id).copied())
    }

    async fn worker_queue_ids(&self) -> StoreResult<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state
            .worker_queues
            .get(&self.worker_queue_key())
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn requeue_count(&self, id: &str) -> StoreResult<u64> {
        Ok(self.state.lock().await.requeues.get(id).copied().unwrap_or(0))
    }

    async fn record_error(&self, id: &str, payload: &str) -> StoreResult<()> {
        self.state
            .lock()
            .await
            .error_reports
            .insert(id.to_string(), payload.to_string());
        Ok(())
    }

    async fn record_success(&self, id: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let removed = state.error_reports.remove(id).is_some();
        let requeued = state.requeues.get(id).copied().unwrap_or(0) > 0;
        if removed || requeued {
            state.flaky_reports.insert(id.to_string());
            return Ok(true);
        }
        Ok(false)
    }

    async fn failed_unit_ids(&self) -> StoreResult<Vec<String>> {
        Ok(self.state.lock().await.error_reports.keys().cloned().collect())
    }

    async fn error_reports(&self) -> StoreResult<Vec<(String, String)>> {
        Ok(self
            .state
            .lock()
            .await
            .error_reports
            .iter()
            .map(|(id, payload)| (id.clone(), payload.clone()))
            .collect())
    }

    async fn flaky_unit_ids(&self) -> StoreResult<Vec<String>> {
        Ok(self.state.lock().await.flaky_reports.iter().cloned().collect())
    }

    async fn increment_test_failed(&self) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        state.test_failed_count += 1;
        Ok(state.test_failed_count)
    }

    async fn test_failed_count(&self) -> StoreResult<u64> {
        Ok(self.state.lock().await.test_failed_count)
    }

    async fn record_warning(&self, warning: &Warning) -> StoreResult<()> {
        self.state.lock().await.warnings.push(warning.clone());
        Ok(())
    }

    async fn pop_warnings(&self) -> StoreResult<Vec<Warning>> {
        Ok(std::mem::take(&mut self.state.lock().await.warnings))
    }
}
