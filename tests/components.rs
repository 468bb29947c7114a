mod common;

use axum::http::StatusCode;
use axum::routing::post;
use axum::Json;
use common::{chain_json, test_engine, Trace};
use pretty_assertions::assert_eq;
use rulego_rs::components::STATUS_CODE_METADATA_KEY;
use rulego_rs::{Message, MsgOptions, Outcome, RuleEngine, RuleEngineTrait, RuleError};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

async fn upstream() -> SocketAddr {
    let app = axum::Router::new()
        .route(
            "/ok",
            post(|Json(body): Json<Value>| async move { Json(json!({"reply": "ok", "echo": body})) }),
        )
        .route(
            "/fail",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn rest_engine(trace: &Trace, addr: SocketAddr) -> RuleEngine {
    let engine = test_engine(trace).await;
    let chain = chain_json(
        "rest",
        json!([
            {"id": "call", "type_name": "restApiCall", "config": {
                "url": format!("http://{}/${{path}}", addr),
                "method": "POST",
                "timeout_ms": 2000
            }},
            {"id": "ok", "type_name": "record", "config": {"relation": ""}},
            {"id": "bad", "type_name": "record", "config": {"relation": ""}}
        ]),
        json!([
            {"from_id": "call", "to_id": "ok", "type_name": "Success"},
            {"from_id": "call", "to_id": "bad", "type_name": "Failure"}
        ]),
    );
    engine.load_chain(&chain).await.unwrap();
    engine
}

/// 发送消息并等待处理完成, 返回结束分支的结果及整体错误
async fn send(engine: &RuleEngine, path: &str) -> (Vec<Outcome>, Option<RuleError>) {
    let (end_tx, mut end_rx) = mpsc::unbounded_channel();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let opts = MsgOptions::new()
        .on_end(move |outcome| {
            let _ = end_tx.send(outcome.clone());
        })
        .on_completed(move |err| {
            let _ = done_tx.send(err.cloned());
        });
    let msg = Message::new("TELEMETRY", json!({"temperature": 41})).with_metadata("path", path);
    engine.on_msg("rest", msg, opts).await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let mut outcomes = Vec::new();
    while let Ok(outcome) = end_rx.try_recv() {
        outcomes.push(outcome);
    }
    (outcomes, err)
}

#[test_log::test(tokio::test)]
async fn rest_call_success_follows_success_relation() {
    let trace = Trace::new();
    let engine = rest_engine(&trace, upstream().await).await;

    let (outcomes, err) = send(&engine, "ok").await;

    assert!(err.is_none());
    assert_eq!(trace.hits(), vec!["ok"]);
    assert_eq!(outcomes.len(), 1);
    let out = &outcomes[0].msg;
    assert_eq!(out.get_metadata(STATUS_CODE_METADATA_KEY), Some("200"));
    assert_eq!(out.data, json!({"reply": "ok", "echo": {"temperature": 41}}));
}

#[test_log::test(tokio::test)]
async fn rest_call_error_status_follows_failure_relation() {
    let trace = Trace::new();
    let engine = rest_engine(&trace, upstream().await).await;

    let (outcomes, err) = send(&engine, "fail").await;

    assert!(matches!(err, Some(RuleError::NodeExecutionError(ref reason)) if reason.contains("500")));
    assert_eq!(trace.hits(), vec!["bad"]);
    assert_eq!(outcomes.len(), 1);
    let out = &outcomes[0].msg;
    assert_eq!(outcomes[0].node_id, "bad");
    assert_eq!(out.get_metadata(STATUS_CODE_METADATA_KEY), Some("500"));
    assert_eq!(out.data, json!("boom"));
}

#[test_log::test(tokio::test)]
async fn unreachable_upstream_follows_failure_relation() {
    let trace = Trace::new();
    let closed = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let engine = rest_engine(&trace, closed).await;

    let (outcomes, err) = send(&engine, "ok").await;

    assert!(matches!(err, Some(RuleError::NodeExecutionError(_))));
    assert_eq!(trace.hits(), vec!["bad"]);
    assert_eq!(outcomes[0].msg.get_metadata(STATUS_CODE_METADATA_KEY), None);
}
