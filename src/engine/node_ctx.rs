use crate::aop::AspectList;
use crate::engine::RuleChainCtx;
use crate::types::{ChainScope, EngineConfig, Node, NodeConfiguration, RuleError, RuleNode};
use crate::utils::template::{init_env, process_variables};
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Node,
    Chain,
}

/// 节点或规则链的标识
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleNodeId {
    pub id: String,
    pub kind: NodeKind,
}

impl RuleNodeId {
    pub fn node(id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: NodeKind::Node,
        }
    }

    pub fn chain(id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: NodeKind::Chain,
        }
    }
}

/// 节点与规则链共有的运行时接口
#[async_trait]
pub trait NodeCtx: Send + Sync {
    fn node_id(&self) -> RuleNodeId;

    async fn is_debug_mode(&self) -> bool;

    /// 当前定义的序列化结果
    async fn dsl(&self) -> Result<Vec<u8>, RuleError>;

    async fn reload_self(&self, def: &[u8]) -> Result<(), RuleError>;

    async fn reload_child(&self, child: &RuleNodeId, def: &[u8]) -> Result<(), RuleError>;

    async fn get_node_by_id(&self, id: &RuleNodeId) -> Result<Arc<dyn NodeCtx>, RuleError>;

    async fn destroy(&self);
}

pub(crate) struct NodeState {
    pub(crate) node: Option<Arc<dyn Node>>,
    pub(crate) definition: Arc<RuleNode>,
    pub(crate) aspects: AspectList,
}

/// 节点包装: 一个组件实例及其定义
///
/// 重新加载时在新包装上完整执行初始化, 成功后在锁内整体替换, 再销毁旧实例;
/// 失败时运行中的节点不受影响。
pub struct RuleNodeCtx {
    id: String,
    chain: Weak<RuleChainCtx>,
    config: EngineConfig,
    init_net_resource: bool,
    state: RwLock<NodeState>,
}

/// 节点初始化失败, 附带一个没有组件实例的节点包装
pub struct NodeInitError {
    pub error: RuleError,
    pub inert: RuleNodeCtx,
}

impl fmt::Debug for NodeInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeInitError")
            .field("error", &self.error)
            .field("node", &self.inert.id)
            .finish()
    }
}

impl fmt::Debug for RuleNodeCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleNodeCtx").field("id", &self.id).finish()
    }
}

impl RuleNodeCtx {
    /// 初始化节点
    ///
    /// 依次执行初始化前切面、变量替换、配置校验与组件初始化。
    pub async fn init(
        config: &EngineConfig,
        chain: Weak<RuleChainCtx>,
        scope: Option<&ChainScope>,
        aspects: AspectList,
        def: RuleNode,
        init_net_resource: bool,
    ) -> Result<Self, NodeInitError> {
        match build_state(config, scope, &aspects, &def, init_net_resource).await {
            Ok(state) => Ok(Self {
                id: def.id.clone(),
                chain,
                config: config.clone(),
                init_net_resource,
                state: RwLock::new(state),
            }),
            Err(error) => Err(NodeInitError {
                error,
                inert: Self::inert(config, chain, aspects, def, init_net_resource),
            }),
        }
    }

    fn inert(
        config: &EngineConfig,
        chain: Weak<RuleChainCtx>,
        aspects: AspectList,
        def: RuleNode,
        init_net_resource: bool,
    ) -> Self {
        Self {
            id: def.id.clone(),
            chain,
            config: config.clone(),
            init_net_resource,
            state: RwLock::new(NodeState {
                node: None,
                definition: Arc::new(def),
                aspects,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn definition(&self) -> Arc<RuleNode> {
        self.state.read().await.definition.clone()
    }

    /// 是否持有已初始化的组件实例
    pub async fn is_initialized(&self) -> bool {
        self.state.read().await.node.is_some()
    }

    pub(crate) async fn snapshot(&self) -> (Option<Arc<dyn Node>>, Arc<RuleNode>, AspectList) {
        let state = self.state.read().await;
        (
            state.node.clone(),
            state.definition.clone(),
            state.aspects.clone(),
        )
    }

    /// 以结构化定义重新加载
    pub async fn reload_from_def(&self, def: RuleNode) -> Result<(), RuleError> {
        if def.id != self.id {
            return Err(RuleError::ReloadError(format!(
                "节点 ID 不能修改: {} -> {}",
                self.id, def.id
            )));
        }

        let chain = self.chain.upgrade();
        let (scope, aspects) = match &chain {
            Some(chain) => (Some(chain.scope().await), chain.aspects().await),
            None => (None, self.state.read().await.aspects.clone()),
        };

        let fresh = build_state(&self.config, scope.as_ref(), &aspects, &def, self.init_net_resource).await?;

        let chain_id = scope.map(|s| s.chain_id).unwrap_or_default();
        {
            let mut state = self.state.write().await;
            if let Some(old) = state.node.take() {
                old.destroy().await;
            }
            *state = fresh;
        }
        info!(chain = %chain_id, node = %self.id, "节点已重新加载");
        aspects.node_reloaded(&chain_id, &self.id).await;
        Ok(())
    }

    fn chain_id(&self) -> String {
        self.chain
            .upgrade()
            .map(|c| c.id().to_string())
            .unwrap_or_default()
    }
}

#[async_trait]
impl NodeCtx for RuleNodeCtx {
    fn node_id(&self) -> RuleNodeId {
        RuleNodeId::node(&self.id)
    }

    async fn is_debug_mode(&self) -> bool {
        self.state.read().await.definition.debug_mode
    }

    async fn dsl(&self) -> Result<Vec<u8>, RuleError> {
        let def = self.definition().await;
        self.config.parser.encode_rule_node(&def)
    }

    async fn reload_self(&self, def: &[u8]) -> Result<(), RuleError> {
        let def = self.config.parser.decode_rule_node(def)?;
        self.reload_from_def(def).await
    }

    async fn reload_child(&self, _child: &RuleNodeId, _def: &[u8]) -> Result<(), RuleError> {
        Err(RuleError::Unsupported("节点不支持 reload_child".into()))
    }

    async fn get_node_by_id(&self, _id: &RuleNodeId) -> Result<Arc<dyn NodeCtx>, RuleError> {
        Err(RuleError::Unsupported("节点不支持 get_node_by_id".into()))
    }

    async fn destroy(&self) {
        let (old, aspects) = {
            let mut state = self.state.write().await;
            (state.node.take(), state.aspects.clone())
        };
        if let Some(node) = old {
            node.destroy().await;
            debug!(node = %self.id, "节点已销毁");
            aspects.node_destroyed(&self.chain_id(), &self.id).await;
        }
    }
}

async fn build_state(
    config: &EngineConfig,
    scope: Option<&ChainScope>,
    aspects: &AspectList,
    def: &RuleNode,
    init_net_resource: bool,
) -> Result<NodeState, RuleError> {
    aspects.node_before_init(config, def)?;

    let mut node = config.registry.new_node(&def.type_name).await?;

    let env = init_env(&config.settings.properties, scope);
    let values = process_variables(&def.config, &env);

    if let Some(schema) = node.get_descriptor().config_schema {
        validate_config(&def.id, &schema, &serde_json::Value::Object(values.clone()))?;
    }

    let configuration = NodeConfiguration {
        values,
        self_definition: def.clone(),
        chain: scope.cloned(),
        init_net_resource,
    };
    node.init(config, configuration).await.map_err(|e| {
        warn!(node = %def.id, type_name = %def.type_name, "节点初始化失败: {}", e);
        e
    })?;

    Ok(NodeState {
        node: Some(Arc::from(node)),
        definition: Arc::new(def.clone()),
        aspects: aspects.clone(),
    })
}

fn validate_config(
    node_id: &str,
    schema: &serde_json::Value,
    values: &serde_json::Value,
) -> Result<(), RuleError> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| RuleError::ConfigError(format!("节点 {} 的配置模式无效: {}", node_id, e)))?;
    let errors: Vec<String> = validator.iter_errors(values).map(|e| e.to_string()).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(RuleError::ConfigError(format!(
            "节点 {} 配置校验失败: {}",
            node_id,
            errors.join("; ")
        )))
    }
}
