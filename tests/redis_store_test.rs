//! Redis-backed store tests.
//!
//! These exercise the Lua scripts against a real server and are skipped
//! unless `CONVOY_TEST_REDIS_URL` points at one (for example
//! `redis://127.0.0.1:6379/15`). Each test namespaces its keys under a
//! fresh build id so parallel runs never collide.

use std::sync::Arc;

use convoy::backend::{HeartbeatOutcome, MasterState, QueueBackend, QueuePlan};
use convoy::config::Config;
use convoy::executable::Chunk;
use convoy::scripts::Scripts;
use convoy::store::RedisQueue;
use uuid::Uuid;

fn test_url() -> Option<String> {
    match std::env::var("CONVOY_TEST_REDIS_URL") {
        Ok(url) if !url.is_empty() => Some(url),
        _ => {
            eprintln!("skipping: CONVOY_TEST_REDIS_URL is not set");
            None
        }
    }
}

fn test_config(build_id: &str, worker_id: &str, url: &str) -> Config {
    let mut config = Config::new(build_id, worker_id);
    config.redis_url = url.to_string();
    config.timeout = 0.2;
    config.max_requeues = 1;
    config.requeue_tolerance = 1.0;
    config
}

async fn connect(config: Config) -> RedisQueue {
    RedisQueue::connect(Arc::new(config))
        .await
        .expect("redis test server reachable")
}

fn plan(ids: &[&str]) -> QueuePlan {
    QueuePlan {
        ids: ids.iter().map(|id| id.to_string()).collect(),
        ..QueuePlan::default()
    }
}

fn now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs_f64()
}

#[tokio::test]
async fn scripts_compile_on_the_server() {
    let Some(url) = test_url() else { return };
    let client = redis::Client::open(url.as_str()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();

    for source in Scripts::sources() {
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(source)
            .query_async(&mut conn)
            .await
            .unwrap();
        assert_eq!(sha.len(), 40);
    }
}

#[tokio::test]
async fn election_publish_and_drain() {
    let Some(url) = test_url() else { return };
    let build = format!("it-{}", Uuid::new_v4());
    let store = connect(test_config(&build, "w1", &url)).await;

    assert!(store.elect_master(now()).await.unwrap());
    assert_eq!(store.master_state().await.unwrap(), Some(MasterState::Setup));
    assert!(store.publish(&plan(&["A#t1", "A#t2", "B#t1"]), now()).await.unwrap());
    assert_eq!(store.master_state().await.unwrap(), Some(MasterState::Ready));
    assert_eq!(store.total().await.unwrap(), Some(3));
    assert!(store.created_at().await.unwrap().is_some());

    // Consumption order matches the published order.
    assert_eq!(store.reserve(now()).await.unwrap().as_deref(), Some("A#t1"));
    assert_eq!(store.reserve(now()).await.unwrap().as_deref(), Some("A#t2"));
    assert_eq!(store.reserve(now()).await.unwrap().as_deref(), Some("B#t1"));
    assert_eq!(store.reserve(now()).await.unwrap(), None);

    for id in ["A#t1", "A#t2", "B#t1"] {
        assert!(store.acknowledge(id).await.unwrap());
        assert!(!store.acknowledge(id).await.unwrap());
    }
    assert!(store.is_exhausted().await.unwrap());
}

#[tokio::test]
async fn steal_after_silence_and_late_acknowledge_loses() {
    let Some(url) = test_url() else { return };
    let build = format!("it-{}", Uuid::new_v4());
    let w1 = connect(test_config(&build, "w1", &url)).await;
    let w2 = connect(test_config(&build, "w2", &url)).await;

    assert!(w1.elect_master(now()).await.unwrap());
    assert!(w1.publish(&plan(&["A#t1"]), now()).await.unwrap());

    let reserved_at = now();
    assert_eq!(w1.reserve(reserved_at).await.unwrap().as_deref(), Some("A#t1"));

    // Within the lease the unit is invisible to reserve_lost.
    assert_eq!(w2.reserve_lost(reserved_at + 0.05).await.unwrap(), None);

    // Past the lease and with no heartbeat the steal succeeds.
    let stolen = w2.reserve_lost(reserved_at + 1.0).await.unwrap();
    assert_eq!(stolen.as_deref(), Some("A#t1"));

    assert!(w2.acknowledge("A#t1").await.unwrap());
    assert!(!w1.acknowledge("A#t1").await.unwrap());
}

#[tokio::test]
async fn heartbeat_extends_and_respects_ownership() {
    let Some(url) = test_url() else { return };
    let build = format!("it-{}", Uuid::new_v4());
    let w1 = connect(test_config(&build, "w1", &url)).await;
    let w2 = connect(test_config(&build, "w2", &url)).await;

    assert!(w1.elect_master(now()).await.unwrap());
    assert!(w1.publish(&plan(&["A#t1"]), now()).await.unwrap());

    let reserved_at = now();
    w1.reserve(reserved_at).await.unwrap();

    // Deadline (0.2 s away) is within the 20 s near-expiry gate.
    match w1.heartbeat("A#t1", reserved_at + 0.1).await.unwrap() {
        HeartbeatOutcome::Extended {
            old_deadline,
            new_deadline,
        } => {
            assert!(new_deadline > old_deadline);
            // Bounded by reserved_at + 3 * timeout.
            assert!(new_deadline <= reserved_at + 3.0 * 0.2 + 1e-6);
        }
        other => panic!("expected extension, got {other:?}"),
    }

    assert_eq!(
        w2.heartbeat("A#t1", now()).await.unwrap(),
        HeartbeatOutcome::NotOwner
    );
}

#[tokio::test]
async fn requeue_offset_positions_the_retry() {
    let Some(url) = test_url() else { return };
    let build = format!("it-{}", Uuid::new_v4());
    let mut config = test_config(&build, "w1", &url);
    config.requeue_offset = 2;
    let store = connect(config).await;

    let ids: Vec<String> = (1..=10).map(|i| format!("S#t{i}")).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    assert!(store.elect_master(now()).await.unwrap());
    assert!(store.publish(&plan(&id_refs), now()).await.unwrap());

    let first = store.reserve(now()).await.unwrap().unwrap();
    assert_eq!(first, "S#t1");
    assert!(store.requeue(&first, 100).await.unwrap());

    assert_eq!(store.reserve(now()).await.unwrap().as_deref(), Some("S#t2"));
    assert_eq!(store.reserve(now()).await.unwrap().as_deref(), Some("S#t3"));
    assert_eq!(store.reserve(now()).await.unwrap().as_deref(), Some("S#t1"));
}

#[tokio::test]
async fn release_makes_leases_stealable_and_keeps_worker_queue() {
    let Some(url) = test_url() else { return };
    let build = format!("it-{}", Uuid::new_v4());
    let w1 = connect(test_config(&build, "w1", &url)).await;
    let w2 = connect(test_config(&build, "w2", &url)).await;

    assert!(w1.elect_master(now()).await.unwrap());
    assert!(w1.publish(&plan(&["A#t1"]), now()).await.unwrap());
    w1.reserve(now()).await.unwrap();

    w1.release().await.unwrap();
    assert_eq!(w1.running_len().await.unwrap(), 1);
    assert_eq!(w1.worker_queue_ids().await.unwrap(), vec!["A#t1".to_string()]);

    let stolen = w2.reserve_lost(now() + 1.0).await.unwrap();
    assert_eq!(stolen.as_deref(), Some("A#t1"));
}

#[tokio::test]
async fn takeover_rewrites_master_identity_and_blocks_the_old_commit() {
    let Some(url) = test_url() else { return };
    let build = format!("it-{}", Uuid::new_v4());
    let mut w1_config = test_config(&build, "w1", &url);
    w1_config.master_setup_heartbeat_timeout = 0.1;
    let mut w2_config = test_config(&build, "w2", &url);
    w2_config.master_setup_heartbeat_timeout = 0.1;
    let w1 = connect(w1_config).await;
    let w2 = connect(w2_config).await;

    let start = now();
    assert!(w1.elect_master(start).await.unwrap());

    // Heartbeat stale after 0.1 s: the follower takes over.
    assert!(w2.try_takeover(start + 1.0).await.unwrap());
    assert_eq!(w1.master_worker_id().await.unwrap().as_deref(), Some("w2"));

    assert!(!w1.publish(&plan(&["A#t1"]), now()).await.unwrap());
    assert!(w2.publish(&plan(&["A#t1"]), now()).await.unwrap());
    assert_eq!(w2.total().await.unwrap(), Some(1));
}

#[tokio::test]
async fn chunk_records_and_dynamic_timeouts_round_trip() {
    let Some(url) = test_url() else { return };
    let build = format!("it-{}", Uuid::new_v4());
    let mut config = test_config(&build, "w1", &url);
    config.strategy = convoy::strategy::Strategy::SuiteBinPacking;
    let store = connect(config).await;

    let chunk = Chunk::new(
        "SuiteX",
        vec!["SuiteX#a".to_string(), "SuiteX#b".to_string()],
        60_000.0,
    );
    let published = QueuePlan {
        ids: vec!["SuiteX:chunk_0".to_string()],
        chunks: vec![("SuiteX:chunk_0".to_string(), chunk.clone())],
        group_timeouts: vec![("SuiteX:chunk_0".to_string(), 66.0)],
    };
    assert!(store.elect_master(now()).await.unwrap());
    assert!(store.publish(&published, now()).await.unwrap());

    assert_eq!(
        store.fetch_chunk("SuiteX:chunk_0").await.unwrap(),
        Some(chunk)
    );
    assert_eq!(
        store.group_timeout("SuiteX:chunk_0").await.unwrap(),
        Some(66.0)
    );

    // The reservation picks up the dynamic deadline: a probe shortly
    // after must not see an expired lease.
    let reserved_at = now();
    assert_eq!(
        store.reserve(reserved_at).await.unwrap().as_deref(),
        Some("SuiteX:chunk_0")
    );
    assert_eq!(store.reserve_lost(reserved_at + 1.0).await.unwrap(), None);
}

#[tokio::test]
async fn record_flow_and_warnings_drain() {
    let Some(url) = test_url() else { return };
    let build = format!("it-{}", Uuid::new_v4());
    let store = connect(test_config(&build, "w1", &url)).await;

    store.record_error("S#a", "{\"message\":\"boom\"}").await.unwrap();
    assert_eq!(store.failed_unit_ids().await.unwrap(), vec!["S#a".to_string()]);
    assert!(store.record_success("S#a").await.unwrap());
    assert_eq!(store.flaky_unit_ids().await.unwrap(), vec!["S#a".to_string()]);

    assert_eq!(store.increment_test_failed().await.unwrap(), 1);
    assert_eq!(store.test_failed_count().await.unwrap(), 1);

    let warning = convoy::backend::Warning::new(
        convoy::backend::WARNING_RESERVED_LOST_TEST,
        serde_json::json!({ "test": "S#a" }),
    );
    store.record_warning(&warning).await.unwrap();
    let drained = store.pop_warnings().await.unwrap();
    assert_eq!(drained, vec![warning]);
    assert!(store.pop_warnings().await.unwrap().is_empty());
}

#[tokio::test]
async fn timing_store_ema_and_scan() {
    let Some(url) = test_url() else { return };
    let store = convoy::timing::TimingStore::connect(&url)
        .await
        .expect("redis test server reachable");

    let id = format!("it-timing-{}", Uuid::new_v4());
    store.update(&id, 100.0).await.unwrap();
    store.update(&id, 200.0).await.unwrap();

    let all = store.load_all(1000).await.unwrap();
    let value = all.get(&id).copied().unwrap();
    // 0.2 * 200 + 0.8 * 100
    assert!((value - 120.0).abs() < 1e-6);
    assert!(store.exists().await.unwrap());
}
