//! Redis-backed queue store.
//!
//! Thin wrapper that binds the key schema, the script handles, and a
//! multiplexed connection together. Every multi-step transition goes
//! through a script; the remaining writes are single commands paired with
//! a TTL refresh.

use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::warn;

use crate::backend::{
    HeartbeatOutcome, MasterState, QueueBackend, QueuePlan, StoreError, StoreResult, Warning,
};
use crate::config::Config;
use crate::executable::Chunk;
use crate::keys::KeySchema;
use crate::scripts::Scripts;

/// Production [`QueueBackend`] speaking Redis.
#[derive(Clone)]
pub struct RedisQueue {
    config: Arc<Config>,
    keys: KeySchema,
    conn: redis::aio::MultiplexedConnection,
    scripts: Scripts,
}

impl RedisQueue {
    /// Connect to the store named by `config.redis_url`.
    pub async fn connect(config: Arc<Config>) -> StoreResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self::with_connection(config, conn))
    }

    /// Wrap an existing connection (used by tests sharing one server).
    pub fn with_connection(
        config: Arc<Config>,
        conn: redis::aio::MultiplexedConnection,
    ) -> Self {
        let keys = KeySchema::new(&config.build_id, config.namespace.as_deref());
        Self {
            config,
            keys,
            conn,
            scripts: Scripts::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn keys(&self) -> &KeySchema {
        &self.keys
    }

    fn ttl(&self) -> i64 {
        self.config.redis_ttl as i64
    }

    fn worker_queue_key(&self) -> String {
        self.keys.worker_queue(&self.config.worker_id)
    }

    fn use_dynamic_flag(&self) -> &'static str {
        if self.config.use_dynamic_timeouts() {
            "1"
        } else {
            "0"
        }
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn register_worker(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.sadd(self.keys.workers(), &self.config.worker_id);
        pipe.expire(self.keys.workers(), self.ttl());
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn release(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let script = self.scripts.release.clone();
        let mut invocation = script.key(self.keys.running());
        invocation.key(self.worker_queue_key());
        invocation.key(self.keys.owners());
        invocation.invoke_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn refresh_exit_ttls(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.expire(self.worker_queue_key(), self.ttl());
        pipe.expire(self.keys.processed(), self.ttl());
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn elect_master(&self, now: f64) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let script = self.scripts.elect_master.clone();
        let mut invocation = script.key(self.keys.master_status());
        invocation.key(self.keys.master_worker_id());
        invocation.key(self.keys.master_setup_heartbeat());
        invocation.arg(now);
        invocation.arg(&self.config.worker_id);
        invocation.arg(self.ttl());
        let elected: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(elected == 1)
    }

    async fn try_takeover(&self, now: f64) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let script = self.scripts.takeover_master.clone();
        let mut invocation = script.key(self.keys.master_status());
        invocation.key(self.keys.master_worker_id());
        invocation.key(self.keys.master_setup_heartbeat());
        invocation.arg(now);
        invocation.arg(self.config.master_setup_heartbeat_timeout);
        invocation.arg(&self.config.worker_id);
        invocation.arg(self.ttl());
        let taken: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(taken == 1)
    }

    async fn master_state(&self) -> StoreResult<Option<MasterState>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.keys.master_status()).await?;
        match raw {
            None => Ok(None),
            Some(raw) => MasterState::parse(&raw)
                .map(Some)
                .ok_or_else(|| StoreError::Malformed {
                    id: "master-status".to_string(),
                    reason: format!("unknown state {raw:?}"),
                }),
        }
    }

    async fn master_worker_id(&self) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(self.keys.master_worker_id()).await?)
    }

    async fn write_setup_heartbeat(&self, now: f64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(
            self.keys.master_setup_heartbeat(),
            now,
            self.config.redis_ttl,
        )
        .await?;
        Ok(())
    }

    async fn setup_heartbeat(&self) -> StoreResult<Option<f64>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(self.keys.master_setup_heartbeat()).await?)
    }

    async fn publish(&self, plan: &QueuePlan, now: f64) -> StoreResult<bool> {
        let mut conn = self.conn.clone();

        // Chunk records and dynamic timeouts go in first; they only become
        // observable once the guarded commit flips master-status to ready.
        if !plan.chunks.is_empty() {
            let mut pipe = redis::pipe();
            for (id, chunk) in &plan.chunks {
                let record = chunk.to_json()?;
                pipe.set_ex(self.keys.chunk(id), record, self.config.redis_ttl);
                pipe.sadd(self.keys.chunks(), id);
            }
            pipe.expire(self.keys.chunks(), self.ttl());
            pipe.query_async::<()>(&mut conn).await?;
        }
        if !plan.group_timeouts.is_empty() {
            let mut pipe = redis::pipe();
            for (id, timeout) in &plan.group_timeouts {
                pipe.hset(self.keys.test_group_timeout(), id, timeout);
            }
            pipe.expire(self.keys.test_group_timeout(), self.ttl());
            pipe.query_async::<()>(&mut conn).await?;
        }

        let script = self.scripts.publish_queue.clone();
        let mut invocation = script.key(self.keys.master_status());
        invocation.key(self.keys.master_worker_id());
        invocation.key(self.keys.queue());
        invocation.key(self.keys.total());
        invocation.key(self.keys.created_at());
        invocation.arg(&self.config.worker_id);
        invocation.arg(now);
        invocation.arg(self.ttl());
        for id in &plan.ids {
            invocation.arg(id);
        }
        let committed: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(committed == 1)
    }

    async fn mark_finished(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(self.keys.master_status(), "finished", self.config.redis_ttl)
            .await?;
        Ok(())
    }

    async fn reserve(&self, now: f64) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let script = self.scripts.reserve.clone();
        let mut invocation = script.key(self.keys.queue());
        invocation.key(self.keys.running());
        invocation.key(self.keys.processed());
        invocation.key(self.worker_queue_key());
        invocation.key(self.keys.owners());
        invocation.key(self.keys.test_group_timeout());
        invocation.arg(now);
        invocation.arg(self.use_dynamic_flag());
        invocation.arg(self.config.timeout);
        invocation.arg(self.ttl());
        Ok(invocation.invoke_async(&mut conn).await?)
    }

    async fn reserve_lost(&self, now: f64) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let script = self.scripts.reserve_lost.clone();
        let mut invocation = script.key(self.keys.running());
        invocation.key(self.keys.processed());
        invocation.key(self.worker_queue_key());
        invocation.key(self.keys.owners());
        invocation.key(self.keys.heartbeats());
        invocation.key(self.keys.test_group_timeout());
        invocation.arg(now);
        invocation.arg(self.config.timeout);
        invocation.arg(self.use_dynamic_flag());
        invocation.arg(self.config.timeout);
        invocation.arg(self.config.heartbeat_grace_period);
        invocation.arg(self.ttl());
        Ok(invocation.invoke_async(&mut conn).await?)
    }

    async fn heartbeat(&self, id: &str, now: f64) -> StoreResult<HeartbeatOutcome> {
        let mut conn = self.conn.clone();
        let script = self.scripts.heartbeat.clone();
        let mut invocation = script.key(self.keys.running());
        invocation.key(self.keys.processed());
        invocation.key(self.keys.owners());
        invocation.key(self.worker_queue_key());
        invocation.key(self.keys.heartbeats());
        invocation.key(self.keys.test_group_timeout());
        invocation.arg(now);
        invocation.arg(id);
        invocation.arg(self.config.timeout);
        invocation.arg(self.ttl());
        let value: redis::Value = invocation.invoke_async(&mut conn).await?;
        decode_heartbeat(id, value)
    }

    async fn acknowledge(&self, id: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let script = self.scripts.acknowledge.clone();
        let mut invocation = script.key(self.keys.running());
        invocation.key(self.keys.processed());
        invocation.key(self.keys.owners());
        invocation.arg(id);
        invocation.arg(self.ttl());
        let first: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(first == 1)
    }

    async fn requeue(&self, id: &str, global_max_requeues: u64) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let script = self.scripts.requeue.clone();
        let mut invocation = script.key(self.keys.processed());
        invocation.key(self.keys.requeues_count());
        invocation.key(self.keys.queue());
        invocation.key(self.keys.running());
        invocation.key(self.worker_queue_key());
        invocation.key(self.keys.owners());
        invocation.arg(self.config.max_requeues);
        invocation.arg(global_max_requeues);
        invocation.arg(id);
        invocation.arg(self.config.requeue_offset);
        invocation.arg(self.ttl());
        let requeued: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(requeued == 1)
    }

    async fn queue_len(&self) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(self.keys.queue()).await?)
    }

    async fn running_len(&self) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.zcard(self.keys.running()).await?)
    }

    async fn processed_len(&self) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.scard(self.keys.processed()).await?)
    }

    async fn total(&self) -> StoreResult<Option<u64>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(self.keys.total()).await?)
    }

    async fn created_at(&self) -> StoreResult<Option<f64>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(self.keys.created_at()).await?)
    }

    async fn is_exhausted(&self) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.exists(self.keys.total());
        pipe.llen(self.keys.queue());
        pipe.zcard(self.keys.running());
        let (populated, queued, running): (bool, u64, u64) =
            pipe.query_async(&mut conn).await?;
        Ok(populated && queued == 0 && running == 0)
    }

    async fn workers_active(&self, now: f64) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let horizon = now - self.config.timeout;
        let active: Vec<String> = conn
            .zrangebyscore_limit(self.keys.running(), horizon, "+inf", 0, 1)
            .await?;
        Ok(!active.is_empty())
    }

    async fn fetch_chunk(&self, id: &str) -> StoreResult<Option<Chunk>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.keys.chunk(id)).await?;
        match raw {
            None => Ok(None),
            Some(raw) => Chunk::from_json(&raw)
                .map(Some)
                .map_err(|err| StoreError::Malformed {
                    id: id.to_string(),
                    reason: err.to_string(),
                }),
        }
    }

    async fn group_timeout(&self, id: &str) -> StoreResult<Option<f64>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(self.keys.test_group_timeout(), id).await?)
    }

    async fn worker_queue_ids(&self) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.lrange(self.worker_queue_key(), 0, -1).await?)
    }

    async fn requeue_count(&self, id: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let count: Option<u64> = conn.hget(self.keys.requeues_count(), id).await?;
        Ok(count.unwrap_or(0))
    }

    async fn record_error(&self, id: &str, payload: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.hset(self.keys.error_reports(), id, payload);
        pipe.expire(self.keys.error_reports(), self.ttl());
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn record_success(&self, id: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let script = self.scripts.record_success.clone();
        let mut invocation = script.key(self.keys.error_reports());
        invocation.key(self.keys.requeues_count());
        invocation.key(self.keys.flaky_reports());
        invocation.arg(id);
        invocation.arg(self.ttl());
        let flaky: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(flaky == 1)
    }

    async fn failed_unit_ids(&self) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hkeys(self.keys.error_reports()).await?)
    }

    async fn error_reports(&self) -> StoreResult<Vec<(String, String)>> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(self.keys.error_reports()).await?)
    }

    async fn flaky_unit_ids(&self) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(self.keys.flaky_reports()).await?)
    }

    async fn increment_test_failed(&self) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.incr(self.keys.test_failed_count(), 1u64);
        pipe.expire(self.keys.test_failed_count(), self.ttl()).ignore();
        let (count,): (u64,) = pipe.query_async(&mut conn).await?;
        Ok(count)
    }

    async fn test_failed_count(&self) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let count: Option<u64> = conn.get(self.keys.test_failed_count()).await?;
        Ok(count.unwrap_or(0))
    }

    async fn record_warning(&self, warning: &Warning) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(warning)?;
        let mut pipe = redis::pipe();
        pipe.rpush(self.keys.warnings(), payload);
        pipe.expire(self.keys.warnings(), self.ttl());
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn pop_warnings(&self) -> StoreResult<Vec<Warning>> {
        let mut conn = self.conn.clone();
        let script = self.scripts.pop_warnings.clone();
        let mut invocation = script.key(self.keys.warnings());
        let raw: Vec<String> = invocation.invoke_async(&mut conn).await?;
        let mut warnings = Vec::with_capacity(raw.len());
        for item in raw {
            match serde_json::from_str(&item) {
                Ok(warning) => warnings.push(warning),
                Err(err) => warn!(error = %err, "dropping malformed warning payload"),
            }
        }
        Ok(warnings)
    }
}

/// Maps the heartbeat script's mixed reply (nil | 0 | [old, new]) into a
/// typed outcome.
fn decode_heartbeat(id: &str, value: redis::Value) -> StoreResult<HeartbeatOutcome> {
    match value {
        redis::Value::Nil => Ok(HeartbeatOutcome::NotOwner),
        redis::Value::Int(_) => Ok(HeartbeatOutcome::Unchanged),
        redis::Value::Array(items) if items.len() == 2 => {
            let old_deadline = decode_f64(&items[0], id)?;
            let new_deadline = decode_f64(&items[1], id)?;
            Ok(HeartbeatOutcome::Extended {
                old_deadline,
                new_deadline,
            })
        }
        other => Err(StoreError::Malformed {
            id: id.to_string(),
            reason: format!("unexpected heartbeat reply {other:?}"),
        }),
    }
}

fn decode_f64(value: &redis::Value, id: &str) -> StoreResult<f64> {
    match value {
        redis::Value::BulkString(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| StoreError::Malformed {
                id: id.to_string(),
                reason: "non-numeric deadline in heartbeat reply".to_string(),
            }),
        redis::Value::Int(n) => Ok(*n as f64),
        other => Err(StoreError::Malformed {
            id: id.to_string(),
            reason: format!("unexpected deadline value {other:?}"),
        }),
    }
}
