mod common;

use common::{client_factory, chain_json, ClientStats, FakeClient, FakeClientNode};
use pretty_assertions::assert_eq;
use rulego_rs::shared::{SharedKey, SharedNode};
use rulego_rs::{EngineConfig, EngineSettings, Message, MsgOptions, RuleEngine, RuleEngineTrait, RuleError};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const SERVER: &str = "host:1883";

fn key() -> SharedKey {
    SharedKey::new("fakeClient", SERVER)
}

async fn holder(config: &EngineConfig, stats: &ClientStats, delay: Duration, init_now: bool) -> SharedNode<FakeClient> {
    let mut node = SharedNode::default();
    node.init(config, "fakeClient", SERVER, init_now, client_factory(stats, SERVER, delay))
        .await
        .unwrap();
    node
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn concurrent_gets_construct_once() {
    let config = EngineConfig::default();
    let stats = ClientStats::default();
    let node = Arc::new(holder(&config, &stats, Duration::from_millis(50), false).await);
    assert!(!node.is_init());

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let node = node.clone();
            tokio::spawn(async move { node.get().await })
        })
        .collect();

    let mut clients = Vec::new();
    for handle in handles {
        clients.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(stats.built(), 1);
    assert!(clients.iter().all(|c| Arc::ptr_eq(c, &clients[0])));
    assert!(node.is_init());
}

#[test_log::test(tokio::test)]
async fn same_key_shares_one_instance_until_last_release() {
    let config = EngineConfig::default();
    let stats = ClientStats::default();
    let first = holder(&config, &stats, Duration::ZERO, true).await;
    let second = holder(&config, &stats, Duration::ZERO, false).await;

    let a = first.get().await.unwrap();
    let b = second.get().await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(stats.built(), 1);
    assert_eq!(config.pool.holders(&key()).await, 2);

    first.release().await;
    first.release().await;
    assert_eq!(config.pool.holders(&key()).await, 1);
    assert_eq!(stats.closed(), 0);
    assert!(second.get().await.is_ok());

    second.release().await;
    assert!(!config.pool.contains(&key()).await);
    assert_eq!(stats.closed(), 1);
}

#[test_log::test(tokio::test)]
async fn construction_times_out() {
    let config = EngineConfig::new(EngineSettings {
        shared_init_timeout_ms: 30,
        ..EngineSettings::default()
    });
    let stats = ClientStats::default();
    let node = holder(&config, &stats, Duration::from_millis(500), false).await;

    assert!(matches!(node.get().await, Err(RuleError::SharedInitTimeout(_))));
    assert!(!node.is_init());
    assert_eq!(stats.built(), 0);
}

#[test_log::test(tokio::test)]
async fn eager_construction_failure_fails_init() {
    let config = EngineConfig::default();
    let stats = ClientStats::default();
    let mut node: SharedNode<FakeClient> = SharedNode::default();

    let result = node
        .init(&config, "fakeClient", "fail", true, client_factory(&stats, "fail", Duration::ZERO))
        .await;

    assert!(matches!(result, Err(RuleError::SharedResource(_))));
    assert!(config.pool.is_empty().await);
}

#[test_log::test(tokio::test)]
async fn deferred_construction_failure_is_retried() {
    let config = EngineConfig::default();
    let stats = ClientStats::default();
    let mut node: SharedNode<FakeClient> = SharedNode::default();
    node.init(&config, "fakeClient", "fail", false, client_factory(&stats, "fail", Duration::ZERO))
        .await
        .unwrap();

    assert!(node.get().await.is_err());
    assert!(node.get().await.is_err());
    assert!(!node.is_init());
}

#[test_log::test(tokio::test)]
async fn forced_close_rebuilds_on_next_get() {
    let config = EngineConfig::default();
    let stats = ClientStats::default();
    let node = holder(&config, &stats, Duration::ZERO, true).await;

    config.pool.close(&key()).await.unwrap();
    assert_eq!(stats.closed(), 1);
    assert!(!config.pool.is_init(&key()).await);

    node.get().await.unwrap();
    assert_eq!(stats.built(), 2);

    node.restart().await.unwrap();
    assert_eq!(stats.built(), 3);
    assert_eq!(stats.closed(), 2);
}

#[test_log::test(tokio::test)]
async fn closed_pool_refuses_to_rebuild() {
    let config = EngineConfig::default();
    let stats = ClientStats::default();
    let deferred = holder(&config, &stats, Duration::ZERO, false).await;
    let built = holder(&config, &stats, Duration::ZERO, true).await;
    assert_eq!(stats.built(), 1);

    config.pool.close_all().await;
    assert!(config.pool.is_empty().await);
    assert_eq!(stats.closed(), 1);

    assert!(matches!(deferred.get().await, Err(RuleError::SharedResource(_))));
    assert!(matches!(built.get().await, Err(RuleError::SharedResource(_))));
    assert!(built.restart().await.is_err());
    assert_eq!(stats.built(), 1);

    // 资源池本身仍可登记新的持有者
    let fresh = holder(&config, &stats, Duration::ZERO, true).await;
    assert!(fresh.get().await.is_ok());
    assert_eq!(stats.built(), 2);
}

#[test_log::test(tokio::test)]
async fn private_instance_is_not_pooled() {
    let config = EngineConfig::default();
    let stats = ClientStats::default();
    let mut node: SharedNode<FakeClient> = SharedNode::default();
    node.init(&config, "fakeClient", "", true, client_factory(&stats, "", Duration::ZERO))
        .await
        .unwrap();

    assert!(config.pool.is_empty().await);
    node.release().await;
    assert_eq!(stats.closed(), 1);
    assert!(node.get().await.is_err());
}

fn client_chain(id: &str) -> String {
    chain_json(
        id,
        json!([{"id": "client", "type_name": "fakeClient", "config": {"server": SERVER}}]),
        json!([]),
    )
}

#[test_log::test(tokio::test)]
async fn chains_referencing_same_server_share_one_client() {
    let stats = ClientStats::default();
    let engine = RuleEngine::new().await;
    engine
        .register_node_type(Box::new(FakeClientNode::new(stats.clone())))
        .await;

    engine.load_chain(&client_chain("first")).await.unwrap();
    engine.load_chain(&client_chain("second")).await.unwrap();

    let pool = engine.pool();
    assert_eq!(pool.len().await, 1);
    assert_eq!(pool.holders(&key()).await, 2);
    assert_eq!(stats.built(), 1);

    engine.remove_chain("first").await.unwrap();
    assert!(pool.contains(&key()).await);
    assert_eq!(stats.closed(), 0);

    let outcome = engine
        .on_msg_and_wait("second", Message::new("T", json!({})), MsgOptions::new())
        .await
        .unwrap();
    assert_eq!(outcome.msg.get_metadata("server"), Some(SERVER));

    engine.remove_chain("second").await.unwrap();
    assert!(!pool.contains(&key()).await);
    assert_eq!(stats.closed(), 1);
}

#[test_log::test(tokio::test)]
async fn reload_keeps_shared_client_alive() {
    let stats = ClientStats::default();
    let engine = RuleEngine::new().await;
    engine
        .register_node_type(Box::new(FakeClientNode::new(stats.clone())))
        .await;
    engine.load_chain(&client_chain("first")).await.unwrap();

    let node = json!({"id": "client", "type_name": "fakeClient", "config": {"server": SERVER}, "debug_mode": true});
    engine
        .reload_node("first", "client", &node.to_string())
        .await
        .unwrap();

    assert_eq!(stats.built(), 1);
    assert_eq!(stats.closed(), 0);
    assert_eq!(engine.pool().holders(&key()).await, 1);
}

#[test_log::test(tokio::test)]
async fn engine_shutdown_closes_pool() {
    let stats = ClientStats::default();
    let engine = RuleEngine::new().await;
    engine
        .register_node_type(Box::new(FakeClientNode::new(stats.clone())))
        .await;
    engine.load_chain(&client_chain("first")).await.unwrap();

    engine.shutdown().await;
    assert!(engine.pool().is_empty().await);
    assert_eq!(stats.closed(), 1);
    assert!(engine.get_loaded_chains().await.is_empty());
}
