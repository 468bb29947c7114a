use rulego_rs::endpoint::{Endpoint, RestConfig, RestEndpoint, Router, RouterTo};
use rulego_rs::{RuleEngine, RuleEngineTrait};
use tracing::info;
use tracing_subscriber::EnvFilter;

const RULE_CHAIN: &str = r#"{
    "id": "temperature",
    "name": "温度告警",
    "root": true,
    "nodes": [
        {
            "id": "filter",
            "type_name": "jsFilter",
            "config": {
                "js_script": "return msg.temperature > 50;"
            }
        },
        {
            "id": "alarm",
            "type_name": "jsTransform",
            "config": {
                "js_script": "msg.alarm = true; metadata.level = 'high'; return {'msg': msg, 'metadata': metadata, 'msgType': 'ALARM'};"
            }
        },
        {
            "id": "log_alarm",
            "type_name": "log",
            "config": {
                "template": "温度告警 ${deviceId}: ${msg.temperature}°C"
            }
        },
        {
            "id": "log_normal",
            "type_name": "log",
            "config": {
                "template": "温度正常 ${deviceId}: ${msg.temperature}°C"
            }
        }
    ],
    "connections": [
        { "from_id": "filter", "to_id": "alarm", "type_name": "True" },
        { "from_id": "filter", "to_id": "log_normal", "type_name": "False" },
        { "from_id": "alarm", "to_id": "log_alarm", "type_name": "Success" }
    ]
}"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let engine = RuleEngine::new().await;
    let loaded = engine.load_chain(RULE_CHAIN).await?;
    info!("规则链已加载: {} (版本 {})", loaded.id, loaded.version);

    let endpoint = RestEndpoint::new(&engine, RestConfig::default()).await?;

    // 同步等待处理结果
    let id = endpoint
        .add_router(
            Router::new("/api/v1/devices/{deviceId}/telemetry").to(RouterTo::new("temperature").wait(true)),
            &["POST"],
        )
        .await?;
    info!("路由已添加: {}", id);

    // 异步处理, 立即返回
    endpoint
        .add_router(
            Router::new("/api/v1/devices/{deviceId}/events").to(RouterTo::new("temperature")),
            &["POST"],
        )
        .await?;

    endpoint.start().await?;
    info!(
        "curl -X POST -H 'Content-Type: application/json' -d '{{\"temperature\": 60}}' http://{}/api/v1/devices/d1/telemetry",
        RestConfig::default().server
    );

    tokio::signal::ctrl_c().await?;
    endpoint.close().await?;
    engine.shutdown().await;
    Ok(())
}
