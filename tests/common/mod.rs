#![allow(dead_code)]

use async_trait::async_trait;
use futures::FutureExt;
use rulego_rs::shared::{SharedFactory, SharedNode, SharedResource};
use rulego_rs::{
    EngineConfig, Message, Node, NodeConfiguration, NodeDescriptor, RuleContext, RuleEngine,
    RuleEngineTrait, RuleError,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 记录被执行的节点
#[derive(Clone, Default)]
pub struct Trace {
    hits: Arc<Mutex<Vec<String>>>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hit(&self, id: impl Into<String>) {
        self.hits.lock().unwrap().push(id.into());
    }

    pub fn hits(&self) -> Vec<String> {
        self.hits.lock().unwrap().clone()
    }

    pub fn sorted(&self) -> Vec<String> {
        let mut hits = self.hits();
        hits.sort();
        hits
    }

    pub fn count(&self, id: &str) -> usize {
        self.hits.lock().unwrap().iter().filter(|h| *h == id).count()
    }

    pub fn clear(&self) {
        self.hits.lock().unwrap().clear();
    }
}

fn descriptor(type_name: &str) -> NodeDescriptor {
    NodeDescriptor {
        type_name: type_name.to_string(),
        ..Default::default()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RecordConfig {
    relation: Option<String>,
    tag: String,
    fail: bool,
}

/// 记录节点 ID (带标签时记录 `id:tag`) 后按配置的关系继续, 关系为空字符串时结束;
/// `fail` 为真时以错误走 Failure
pub struct RecordNode {
    trace: Trace,
    relation: Option<String>,
    tag: String,
    fail: bool,
    inits: Arc<AtomicUsize>,
    destroys: Arc<AtomicUsize>,
}

impl RecordNode {
    pub fn new(trace: Trace) -> Self {
        Self::with_counters(trace, Arc::default(), Arc::default())
    }

    pub fn with_counters(trace: Trace, inits: Arc<AtomicUsize>, destroys: Arc<AtomicUsize>) -> Self {
        Self {
            trace,
            relation: None,
            tag: String::new(),
            fail: false,
            inits,
            destroys,
        }
    }
}

#[async_trait]
impl Node for RecordNode {
    fn type_name(&self) -> &str {
        "record"
    }

    fn new_instance(&self) -> Box<dyn Node> {
        Box::new(RecordNode::with_counters(
            self.trace.clone(),
            self.inits.clone(),
            self.destroys.clone(),
        ))
    }

    fn get_descriptor(&self) -> NodeDescriptor {
        descriptor("record")
    }

    async fn init(&mut self, _config: &EngineConfig, configuration: NodeConfiguration) -> Result<(), RuleError> {
        let config: RecordConfig = configuration.decode()?;
        self.relation = config.relation;
        self.tag = config.tag;
        self.fail = config.fail;
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_msg(&self, ctx: &RuleContext, msg: Message) -> Result<(), RuleError> {
        if self.tag.is_empty() {
            self.trace.hit(ctx.self_id());
        } else {
            self.trace.hit(format!("{}:{}", ctx.self_id(), self.tag));
        }
        if self.fail {
            let err = RuleError::NodeExecutionError(format!("{} 处理失败", ctx.self_id()));
            ctx.tell_failure(msg, err);
            return Ok(());
        }
        match self.relation.as_deref() {
            None => ctx.tell_success(msg),
            Some("") => ctx.tell_end(msg),
            Some(relation) => ctx.tell_next(msg, [relation]),
        }
        Ok(())
    }

    async fn destroy(&self) {
        self.destroys.fetch_add(1, Ordering::SeqCst);
    }
}

/// `temperature > 50` 走 Success, 否则走 Failure; 负载不是含数值温度的对象时返回错误
pub struct ThresholdNode {
    trace: Trace,
}

impl ThresholdNode {
    pub fn new(trace: Trace) -> Self {
        Self { trace }
    }
}

#[async_trait]
impl Node for ThresholdNode {
    fn type_name(&self) -> &str {
        "threshold"
    }

    fn new_instance(&self) -> Box<dyn Node> {
        Box::new(ThresholdNode::new(self.trace.clone()))
    }

    fn get_descriptor(&self) -> NodeDescriptor {
        descriptor("threshold")
    }

    async fn init(&mut self, _config: &EngineConfig, _configuration: NodeConfiguration) -> Result<(), RuleError> {
        Ok(())
    }

    async fn on_msg(&self, ctx: &RuleContext, msg: Message) -> Result<(), RuleError> {
        self.trace.hit(ctx.self_id());
        let temperature = msg
            .data
            .get("temperature")
            .and_then(Value::as_f64)
            .ok_or_else(|| RuleError::NodeExecutionError(format!("无法解析温度: {}", msg.data_as_string())))?;
        if temperature > 50.0 {
            ctx.tell_success(msg);
        } else {
            ctx.tell_next(msg, ["Failure"]);
        }
        Ok(())
    }
}

pub struct PanicNode {
    trace: Trace,
}

impl PanicNode {
    pub fn new(trace: Trace) -> Self {
        Self { trace }
    }
}

#[async_trait]
impl Node for PanicNode {
    fn type_name(&self) -> &str {
        "panic"
    }

    fn new_instance(&self) -> Box<dyn Node> {
        Box::new(PanicNode::new(self.trace.clone()))
    }

    fn get_descriptor(&self) -> NodeDescriptor {
        descriptor("panic")
    }

    async fn init(&mut self, _config: &EngineConfig, _configuration: NodeConfiguration) -> Result<(), RuleError> {
        Ok(())
    }

    async fn on_msg(&self, ctx: &RuleContext, _msg: Message) -> Result<(), RuleError> {
        self.trace.hit(ctx.self_id());
        panic!("component exploded");
    }
}

/// 不上报任何关系
pub struct StallNode {
    trace: Trace,
}

impl StallNode {
    pub fn new(trace: Trace) -> Self {
        Self { trace }
    }
}

#[async_trait]
impl Node for StallNode {
    fn type_name(&self) -> &str {
        "stall"
    }

    fn new_instance(&self) -> Box<dyn Node> {
        Box::new(StallNode::new(self.trace.clone()))
    }

    fn get_descriptor(&self) -> NodeDescriptor {
        descriptor("stall")
    }

    async fn init(&mut self, _config: &EngineConfig, _configuration: NodeConfiguration) -> Result<(), RuleError> {
        Ok(())
    }

    async fn on_msg(&self, ctx: &RuleContext, _msg: Message) -> Result<(), RuleError> {
        self.trace.hit(ctx.self_id());
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SlowConfig {
    delay_ms: u64,
}

impl Default for SlowConfig {
    fn default() -> Self {
        Self { delay_ms: 100 }
    }
}

/// 等待一段时间后走 Success, 结束时记录 `id:done`
pub struct SlowNode {
    trace: Trace,
    delay: Duration,
}

impl SlowNode {
    pub fn new(trace: Trace) -> Self {
        Self {
            trace,
            delay: Duration::from_millis(100),
        }
    }
}

#[async_trait]
impl Node for SlowNode {
    fn type_name(&self) -> &str {
        "slow"
    }

    fn new_instance(&self) -> Box<dyn Node> {
        Box::new(SlowNode::new(self.trace.clone()))
    }

    fn get_descriptor(&self) -> NodeDescriptor {
        descriptor("slow")
    }

    async fn init(&mut self, _config: &EngineConfig, configuration: NodeConfiguration) -> Result<(), RuleError> {
        let config: SlowConfig = configuration.decode()?;
        self.delay = Duration::from_millis(config.delay_ms);
        Ok(())
    }

    async fn on_msg(&self, ctx: &RuleContext, msg: Message) -> Result<(), RuleError> {
        tokio::time::sleep(self.delay).await;
        self.trace.hit(format!("{}:done", ctx.self_id()));
        ctx.tell_success(msg);
        Ok(())
    }
}

/// 把元数据作为负载返回
pub struct EchoMetadataNode;

#[async_trait]
impl Node for EchoMetadataNode {
    fn type_name(&self) -> &str {
        "echoMetadata"
    }

    fn new_instance(&self) -> Box<dyn Node> {
        Box::new(EchoMetadataNode)
    }

    fn get_descriptor(&self) -> NodeDescriptor {
        descriptor("echoMetadata")
    }

    async fn init(&mut self, _config: &EngineConfig, _configuration: NodeConfiguration) -> Result<(), RuleError> {
        Ok(())
    }

    async fn on_msg(&self, ctx: &RuleContext, mut msg: Message) -> Result<(), RuleError> {
        let metadata = json!(msg.metadata);
        msg.set_data(metadata);
        ctx.tell_success(msg);
        Ok(())
    }
}

/// 构建与关闭次数
#[derive(Clone, Default)]
pub struct ClientStats {
    pub built: Arc<AtomicUsize>,
    pub closed: Arc<AtomicUsize>,
}

impl ClientStats {
    pub fn built(&self) -> usize {
        self.built.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct FakeClient {
    pub server: String,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl SharedResource for FakeClient {
    async fn close(&self) -> Result<(), RuleError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// 构建一个客户端; `delay` 模拟连接耗时, 服务器地址为 `fail` 时构建失败
pub fn client_factory(stats: &ClientStats, server: &str, delay: Duration) -> SharedFactory<FakeClient> {
    let stats = stats.clone();
    let server = server.to_string();
    Arc::new(move || {
        let stats = stats.clone();
        let server = server.clone();
        async move {
            tokio::time::sleep(delay).await;
            if server == "fail" {
                anyhow::bail!("connection refused");
            }
            stats.built.fetch_add(1, Ordering::SeqCst);
            Ok(FakeClient {
                server,
                closed: stats.closed.clone(),
            })
        }
        .boxed()
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FakeClientConfig {
    server: String,
}

/// 通过资源池共享 [`FakeClient`] 的组件
pub struct FakeClientNode {
    stats: ClientStats,
    shared: SharedNode<FakeClient>,
}

impl FakeClientNode {
    pub fn new(stats: ClientStats) -> Self {
        Self {
            stats,
            shared: SharedNode::default(),
        }
    }
}

#[async_trait]
impl Node for FakeClientNode {
    fn type_name(&self) -> &str {
        "fakeClient"
    }

    fn new_instance(&self) -> Box<dyn Node> {
        Box::new(FakeClientNode::new(self.stats.clone()))
    }

    fn get_descriptor(&self) -> NodeDescriptor {
        descriptor("fakeClient")
    }

    async fn init(&mut self, config: &EngineConfig, configuration: NodeConfiguration) -> Result<(), RuleError> {
        let client: FakeClientConfig = configuration.decode()?;
        let factory = client_factory(&self.stats, &client.server, Duration::ZERO);
        self.shared
            .init(config, "fakeClient", &client.server, true, factory)
            .await
    }

    async fn on_msg(&self, ctx: &RuleContext, mut msg: Message) -> Result<(), RuleError> {
        let client = self.shared.get().await?;
        msg.put_metadata("server", client.server.clone());
        ctx.tell_success(msg);
        Ok(())
    }

    async fn destroy(&self) {
        self.shared.release().await;
    }
}

/// 注册全部测试组件的引擎
pub async fn test_engine(trace: &Trace) -> RuleEngine {
    let engine = RuleEngine::new().await;
    register_test_nodes(&engine, trace).await;
    engine
}

pub async fn register_test_nodes(engine: &RuleEngine, trace: &Trace) {
    engine.register_node_type(Box::new(RecordNode::new(trace.clone()))).await;
    engine.register_node_type(Box::new(ThresholdNode::new(trace.clone()))).await;
    engine.register_node_type(Box::new(PanicNode::new(trace.clone()))).await;
    engine.register_node_type(Box::new(StallNode::new(trace.clone()))).await;
    engine.register_node_type(Box::new(SlowNode::new(trace.clone()))).await;
    engine.register_node_type(Box::new(EchoMetadataNode)).await;
}

/// 规则链定义 JSON
pub fn chain_json(id: &str, nodes: Value, connections: Value) -> String {
    json!({
        "id": id,
        "name": id,
        "nodes": nodes,
        "connections": connections
    })
    .to_string()
}

/// `A -(Success)-> B`, `A -(Failure)-> C`
pub fn scenario_chain(id: &str) -> String {
    chain_json(
        id,
        json!([
            {"id": "A", "type_name": "threshold"},
            {"id": "B", "type_name": "record", "config": {"relation": ""}},
            {"id": "C", "type_name": "record", "config": {"relation": ""}}
        ]),
        json!([
            {"from_id": "A", "to_id": "B", "type_name": "Success"},
            {"from_id": "A", "to_id": "C", "type_name": "Failure"}
        ]),
    )
}
