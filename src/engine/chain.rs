use crate::aop::AspectList;
use crate::components::FLOW_NODE_TYPE;
use crate::engine::flow::{execute, MsgFlow, MsgOptions};
use crate::engine::{NodeCtx, NodeInitError, NodeKind, RuleNodeCtx, RuleNodeId, VersionManager};
use crate::types::{
    ChainScope, Connection, EngineConfig, Message, Outcome, RelationType, RuleChain, RuleError,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};

/// 引擎持有的规则链集合
pub(crate) type ChainMap = RwLock<HashMap<String, Arc<RuleChainCtx>>>;

/// `flow` 组件引用子规则链的配置字段
const FLOW_TARGET_FIELD: &str = "target_id";

struct ChainState {
    definition: RuleChain,
    nodes: HashMap<String, Arc<RuleNodeCtx>>,
    /// 源节点 -> 出边, 保持定义中的顺序
    relations: HashMap<String, Vec<Connection>>,
    scope: ChainScope,
    aspects: AspectList,
    node_errors: Vec<(String, RuleError)>,
}

/// 规则链: 编译后的节点与带标签的有向边
pub struct RuleChainCtx {
    id: String,
    me: Weak<RuleChainCtx>,
    config: EngineConfig,
    chains: Weak<ChainMap>,
    versions: Arc<VersionManager>,
    state: RwLock<Arc<ChainState>>,
}

impl std::fmt::Debug for RuleChainCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleChainCtx").field("id", &self.id).finish()
    }
}

impl RuleChainCtx {
    /// 编译规则链定义; 节点初始化失败不影响其余节点
    pub(crate) async fn new(
        config: EngineConfig,
        mut def: RuleChain,
        chains: Weak<ChainMap>,
        versions: Arc<VersionManager>,
    ) -> Result<Arc<Self>, RuleError> {
        validate(&def)?;
        let created_at = def.metadata.created_at;
        stamp_version(&versions, &mut def, created_at);

        let chain = Arc::new_cyclic(|me| Self {
            id: def.id.clone(),
            me: me.clone(),
            config,
            chains,
            versions,
            state: RwLock::new(Arc::new(ChainState {
                definition: def.clone(),
                nodes: HashMap::new(),
                relations: HashMap::new(),
                scope: ChainScope::default(),
                aspects: AspectList::new(),
                node_errors: Vec::new(),
            })),
        });

        let state = chain.compile(def, None, chain.config.aspects.clone()).await;
        *chain.state.write().await = Arc::new(state);
        info!(chain = %chain.id, "规则链已加载");
        Ok(chain)
    }

    /// 独立使用的规则链, 不属于任何引擎
    pub async fn standalone(config: EngineConfig, def: RuleChain) -> Result<Arc<Self>, RuleError> {
        Self::new(config, def, Weak::new(), Arc::new(VersionManager::new())).await
    }

    async fn compile(&self, def: RuleChain, previous: Option<&ChainState>, aspects: AspectList) -> ChainState {
        let scope = ChainScope {
            chain_id: def.id.clone(),
            vars: def.vars.clone(),
            secrets: def.secrets.clone(),
        };

        let mut nodes = HashMap::new();
        let mut node_errors = Vec::new();
        for node_def in &def.nodes {
            if let Some(existing) = reusable(previous, &scope, node_def).await {
                debug!(chain = %self.id, node = %node_def.id, "节点定义未变化, 沿用原节点");
                nodes.insert(node_def.id.clone(), existing);
                continue;
            }

            let node = match RuleNodeCtx::init(
                &self.config,
                self.me.clone(),
                Some(&scope),
                aspects.clone(),
                node_def.clone(),
                false,
            )
            .await
            {
                Ok(node) => node,
                Err(NodeInitError { error, inert }) => {
                    warn!(chain = %self.id, node = %node_def.id, "节点初始化失败, 节点不可用: {}", error);
                    node_errors.push((node_def.id.clone(), error));
                    inert
                }
            };
            nodes.insert(node_def.id.clone(), Arc::new(node));
        }

        let mut relations: HashMap<String, Vec<Connection>> = HashMap::new();
        for connection in &def.connections {
            relations
                .entry(connection.from_id.clone())
                .or_default()
                .push(connection.clone());
        }

        ChainState {
            definition: def,
            nodes,
            relations,
            scope,
            aspects,
            node_errors,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// 当前定义, 节点部分取各节点当前的定义
    pub async fn definition(&self) -> RuleChain {
        let state = self.state.read().await.clone();
        let mut def = state.definition.clone();
        for node_def in def.nodes.iter_mut() {
            if let Some(node) = state.nodes.get(&node_def.id) {
                *node_def = node.definition().await.as_ref().clone();
            }
        }
        def
    }

    pub async fn version(&self) -> u64 {
        self.state.read().await.definition.metadata.version
    }

    pub async fn node(&self, id: &str) -> Option<Arc<RuleNodeCtx>> {
        self.state.read().await.nodes.get(id).cloned()
    }

    /// 加载时初始化失败的节点
    pub async fn node_errors(&self) -> Vec<(String, RuleError)> {
        self.state.read().await.node_errors.clone()
    }

    pub(crate) async fn scope(&self) -> ChainScope {
        self.state.read().await.scope.clone()
    }

    pub(crate) async fn aspects(&self) -> AspectList {
        self.state.read().await.aspects.clone()
    }

    /// 按关系顺序、再按连线定义顺序列出后续节点
    pub(crate) async fn targets(&self, from: &str, relations: &[RelationType]) -> Vec<Arc<RuleNodeCtx>> {
        let state = self.state.read().await.clone();
        let Some(edges) = state.relations.get(from) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for relation in relations {
            if !seen.insert(relation) {
                continue;
            }
            for edge in edges.iter().filter(|e| *relation == e.type_name.as_str()) {
                if let Some(node) = state.nodes.get(&edge.to_id) {
                    targets.push(node.clone());
                }
            }
        }
        targets
    }

    pub async fn entry_node(&self, start: Option<&str>) -> Result<Arc<RuleNodeCtx>, RuleError> {
        let state = self.state.read().await.clone();
        let entry = start
            .or_else(|| state.definition.entry_id())
            .ok_or_else(|| RuleError::NodeNotFound(format!("规则链 {} 没有入口节点", self.id)))?;
        state
            .nodes
            .get(entry)
            .cloned()
            .ok_or_else(|| RuleError::NodeNotFound(entry.to_string()))
    }

    /// 在引擎中查找规则链
    pub(crate) async fn find_chain(&self, id: &str) -> Result<Arc<RuleChainCtx>, RuleError> {
        if id == self.id {
            if let Some(me) = self.me.upgrade() {
                return Ok(me);
            }
        }
        let chains = self
            .chains
            .upgrade()
            .ok_or_else(|| RuleError::ChainNotFound(id.to_string()))?;
        let found = chains.read().await.get(id).cloned();
        found.ok_or_else(|| RuleError::ChainNotFound(id.to_string()))
    }

    /// 异步处理消息, 派发后立即返回
    pub async fn on_msg(self: &Arc<Self>, msg: Message, opts: MsgOptions) -> Result<(), RuleError> {
        let entry = self.entry_node(opts.start_node.as_deref()).await?;
        let aspects = self.aspects().await;
        aspects.before_process(&self.id, &msg).await;
        let flow = MsgFlow::new(&self.id, msg.clone(), false, &opts, &self.config.shutdown, aspects);
        tokio::spawn(execute(flow, self.clone(), entry, msg, 0));
        Ok(())
    }

    /// 处理消息并等待入口节点及其第一跳分支执行完毕
    ///
    /// 返回入口节点上报的结果; 处理中记录的第一个错误优先返回。
    /// 更深的分支在后台继续执行。
    pub async fn on_msg_and_wait(self: &Arc<Self>, msg: Message, opts: MsgOptions) -> Result<Outcome, RuleError> {
        let entry = self.entry_node(opts.start_node.as_deref()).await?;
        let aspects = self.aspects().await;
        aspects.before_process(&self.id, &msg).await;
        let flow = MsgFlow::new(&self.id, msg.clone(), true, &opts, &self.config.shutdown, aspects);
        let outcome = execute(flow.clone(), self.clone(), entry.clone(), msg, 0).await;
        if let Some(err) = flow.error() {
            return Err(err);
        }
        outcome.ok_or_else(|| RuleError::NoRelation(entry.id().to_string()))
    }

    /// 处理消息并等待所有分支结束, 返回每个分支的最终结果
    ///
    /// 有节点不上报关系时不会返回, 调用方应通过 `MsgOptions::cancel` 控制等待。
    pub async fn on_msg_and_wait_all(
        self: &Arc<Self>,
        msg: Message,
        opts: MsgOptions,
    ) -> Result<Vec<Outcome>, RuleError> {
        let entry = self.entry_node(opts.start_node.as_deref()).await?;
        let caller = opts.cancel.clone().unwrap_or_default();

        let collected = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = oneshot::channel::<Option<RuleError>>();
        let tx = Mutex::new(Some(tx));

        let sink = collected.clone();
        let user_on_end = opts.on_end.clone();
        let user_on_completed = opts.on_completed.clone();
        let opts = MsgOptions {
            on_end: Some(Arc::new(move |outcome: &Outcome| {
                if let Ok(mut outcomes) = sink.lock() {
                    outcomes.push(outcome.clone());
                }
                if let Some(f) = &user_on_end {
                    f(outcome);
                }
            })),
            on_completed: Some(Arc::new(move |err: Option<&RuleError>| {
                if let Some(f) = &user_on_completed {
                    f(err);
                }
                if let Some(tx) = tx.lock().ok().and_then(|mut tx| tx.take()) {
                    let _ = tx.send(err.cloned());
                }
            })),
            cancel: None,
            start_node: opts.start_node,
        };

        let aspects = self.aspects().await;
        aspects.before_process(&self.id, &msg).await;
        let flow = MsgFlow::new(&self.id, msg.clone(), false, &opts, &self.config.shutdown, aspects);
        tokio::spawn(execute(flow.clone(), self.clone(), entry, msg, 0));

        tokio::select! {
            done = rx => match done {
                Ok(Some(err)) => Err(err),
                Ok(None) => Ok(collected.lock().map(|o| o.clone()).unwrap_or_default()),
                Err(_) => Err(RuleError::NodeExecutionError("消息处理中断".into())),
            },
            _ = caller.cancelled() => {
                flow.stop();
                Err(RuleError::Canceled)
            }
        }
    }

    /// 以新定义重新加载; 定义指纹未变化的节点沿用原实例
    ///
    /// 任一节点初始化失败时整体放弃: 销毁新建的节点, 原定义继续运行。
    pub async fn reload_from_def(&self, def: RuleChain) -> Result<(), RuleError> {
        let aspects = self.aspects().await;
        self.reload_with_aspects(def, aspects).await
    }

    /// 以新定义和新的切面列表重新加载
    pub async fn reload_with_aspects(&self, def: RuleChain, aspects: AspectList) -> Result<(), RuleError> {
        if def.id != self.id {
            return Err(RuleError::ReloadError(format!(
                "规则链 ID 不能修改: {} -> {}",
                self.id, def.id
            )));
        }
        validate(&def)?;
        if let Some(chains) = self.chains.upgrade() {
            check_chain_cycles(&chains, &def).await?;
        }

        let previous = self.state.read().await.clone();
        let mut next = self.compile(def, Some(&previous), aspects).await;
        if !next.node_errors.is_empty() {
            for (id, node) in &next.nodes {
                let reused = previous
                    .nodes
                    .get(id)
                    .map(|n| Arc::ptr_eq(n, node))
                    .unwrap_or(false);
                if !reused {
                    node.destroy().await;
                }
            }
            let failed: Vec<String> = next
                .node_errors
                .iter()
                .map(|(id, e)| format!("{}: {}", id, e))
                .collect();
            warn!(chain = %self.id, "规则链重新加载失败, 保留原定义");
            return Err(RuleError::ReloadError(format!(
                "规则链 {} 节点初始化失败: {}",
                self.id,
                failed.join("; ")
            )));
        }
        stamp_version(
            &self.versions,
            &mut next.definition,
            previous.definition.metadata.created_at,
        );
        let next = Arc::new(next);
        *self.state.write().await = next.clone();

        for (id, node) in &previous.nodes {
            let kept = next
                .nodes
                .get(id)
                .map(|n| Arc::ptr_eq(n, node))
                .unwrap_or(false);
            if !kept {
                node.destroy().await;
            }
        }
        info!(chain = %self.id, version = next.definition.metadata.version, "规则链已重新加载");
        Ok(())
    }
}

#[async_trait]
impl NodeCtx for RuleChainCtx {
    fn node_id(&self) -> RuleNodeId {
        RuleNodeId::chain(&self.id)
    }

    async fn is_debug_mode(&self) -> bool {
        self.state.read().await.definition.debug_mode
    }

    async fn dsl(&self) -> Result<Vec<u8>, RuleError> {
        let def = self.definition().await;
        self.config.parser.encode_rule_chain(&def)
    }

    async fn reload_self(&self, def: &[u8]) -> Result<(), RuleError> {
        let def = self.config.parser.decode_rule_chain(def)?;
        self.reload_from_def(def).await
    }

    async fn reload_child(&self, child: &RuleNodeId, def: &[u8]) -> Result<(), RuleError> {
        match child.kind {
            NodeKind::Node => {
                let node = self
                    .node(&child.id)
                    .await
                    .ok_or_else(|| RuleError::NodeNotFound(child.id.clone()))?;
                node.reload_self(def).await
            }
            NodeKind::Chain => self.find_chain(&child.id).await?.reload_self(def).await,
        }
    }

    async fn get_node_by_id(&self, id: &RuleNodeId) -> Result<Arc<dyn NodeCtx>, RuleError> {
        match id.kind {
            NodeKind::Node => self
                .node(&id.id)
                .await
                .map(|n| n as Arc<dyn NodeCtx>)
                .ok_or_else(|| RuleError::NodeNotFound(id.id.clone())),
            NodeKind::Chain => Ok(self.find_chain(&id.id).await? as Arc<dyn NodeCtx>),
        }
    }

    async fn destroy(&self) {
        let state = self.state.read().await.clone();
        for node in state.nodes.values() {
            node.destroy().await;
        }
        info!(chain = %self.id, "规则链已销毁");
    }
}

async fn reusable(
    previous: Option<&ChainState>,
    scope: &ChainScope,
    def: &crate::types::RuleNode,
) -> Option<Arc<RuleNodeCtx>> {
    let previous = previous?;
    if previous.scope != *scope {
        return None;
    }
    let existing = previous.nodes.get(&def.id)?;
    if !existing.is_initialized().await {
        return None;
    }
    if existing.definition().await.fingerprint() != def.fingerprint() {
        return None;
    }
    Some(existing.clone())
}

fn stamp_version(versions: &VersionManager, def: &mut RuleChain, created_at: i64) {
    let version = versions.create_version(def);
    def.metadata.version = version.version;
    def.metadata.updated_at = version.timestamp;
    def.metadata.created_at = if created_at == 0 {
        version.timestamp
    } else {
        created_at
    };
}

/// 校验定义: 节点 ID 唯一, 连线端点与入口存在, 节点之间无环
pub(crate) fn validate(def: &RuleChain) -> Result<(), RuleError> {
    if def.id.trim().is_empty() {
        return Err(RuleError::ConfigError("规则链 ID 不能为空".into()));
    }
    if def.nodes.is_empty() {
        return Err(RuleError::ConfigError(format!("规则链 {} 没有节点", def.id)));
    }

    let mut ids = HashSet::new();
    for node in &def.nodes {
        if node.id.trim().is_empty() {
            return Err(RuleError::ConfigError("节点 ID 不能为空".into()));
        }
        if !ids.insert(node.id.as_str()) {
            return Err(RuleError::ConfigError(format!("节点 ID 重复: {}", node.id)));
        }
    }
    if let Some(entry) = &def.entry {
        if !ids.contains(entry.as_str()) {
            return Err(RuleError::ConfigError(format!("入口节点不存在: {}", entry)));
        }
    }
    for connection in &def.connections {
        for end in [&connection.from_id, &connection.to_id] {
            if !ids.contains(end.as_str()) {
                return Err(RuleError::ConfigError(format!(
                    "连线引用了不存在的节点: {} -> {}",
                    connection.from_id, connection.to_id
                )));
            }
        }
    }

    let mut graph: HashMap<&str, Vec<&str>> = HashMap::new();
    for connection in &def.connections {
        graph
            .entry(connection.from_id.as_str())
            .or_default()
            .push(connection.to_id.as_str());
    }
    let mut done = HashSet::new();
    for node in &def.nodes {
        let mut path = Vec::new();
        find_cycle(&graph, node.id.as_str(), &mut path, &mut done)?;
    }
    Ok(())
}

fn find_cycle<'a>(
    graph: &HashMap<&'a str, Vec<&'a str>>,
    current: &'a str,
    path: &mut Vec<&'a str>,
    done: &mut HashSet<&'a str>,
) -> Result<(), RuleError> {
    if let Some(pos) = path.iter().position(|id| *id == current) {
        let mut cycle = path[pos..].to_vec();
        cycle.push(current);
        return Err(RuleError::CircularDependency(cycle.join(" -> ")));
    }
    if done.contains(current) {
        return Ok(());
    }
    path.push(current);
    for next in graph.get(current).into_iter().flatten() {
        find_cycle(graph, *next, path, done)?;
    }
    path.pop();
    done.insert(current);
    Ok(())
}

/// `flow` 节点引用的子规则链
pub(crate) fn sub_chain_targets(def: &RuleChain) -> Vec<String> {
    def.nodes
        .iter()
        .filter(|n| n.type_name == FLOW_NODE_TYPE)
        .filter_map(|n| n.config.get(FLOW_TARGET_FIELD).and_then(|v| v.as_str()))
        .map(str::to_string)
        .collect()
}

/// 检查通过 `flow` 节点形成的规则链之间的循环引用
pub(crate) async fn check_chain_cycles(chains: &ChainMap, def: &RuleChain) -> Result<(), RuleError> {
    let others: Vec<Arc<RuleChainCtx>> = chains
        .read()
        .await
        .values()
        .filter(|c| c.id() != def.id)
        .cloned()
        .collect();

    let mut graph: HashMap<String, Vec<String>> = HashMap::new();
    for chain in others {
        let other = chain.definition().await;
        graph.insert(other.id.clone(), sub_chain_targets(&other));
    }
    graph.insert(def.id.clone(), sub_chain_targets(def));

    let mut stack = vec![(def.id.clone(), vec![def.id.clone()])];
    let mut visited = HashSet::new();
    while let Some((current, path)) = stack.pop() {
        for next in graph.get(&current).into_iter().flatten() {
            if *next == def.id {
                let mut cycle = path.clone();
                cycle.push(next.clone());
                return Err(RuleError::CircularDependency(cycle.join(" -> ")));
            }
            if visited.insert(next.clone()) {
                let mut next_path = path.clone();
                next_path.push(next.clone());
                stack.push((next.clone(), next_path));
            }
        }
    }
    Ok(())
}
