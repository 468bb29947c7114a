use crate::aop::{AspectList, DebugAspect, MessageAspect, NodeAspect};
use crate::components;
use crate::engine::chain::{check_chain_cycles, sub_chain_targets, ChainMap};
use crate::engine::{MsgOptions, NodeCtx, RuleChainCtx, RuleNodeId, VersionManager};
use crate::shared::ResourcePool;
use crate::types::{
    EngineConfig, Message, Node, NodeDescriptor, Outcome, RuleChain, RuleError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use tokio::sync::RwLock;
use tracing::{info, warn};

pub type DynRuleEngine = Arc<dyn RuleEngineTrait + Send + Sync>;

/// 规则链加载结果
#[derive(Debug, Clone)]
pub struct LoadedChain {
    pub id: String,
    pub version: u64,
    /// 初始化失败的节点及原因, 这些节点不可用但规则链其余部分正常运行
    pub node_errors: Vec<(String, RuleError)>,
}

#[async_trait]
pub trait RuleEngineTrait: Debug + Send + Sync {
    async fn load_chain(&self, content: &str) -> Result<LoadedChain, RuleError>;
    async fn load_chain_from_file(&self, path: &str) -> Result<LoadedChain, RuleError>;
    async fn reload_chain(&self, id: &str, content: &str) -> Result<(), RuleError>;
    async fn reload_node(&self, chain_id: &str, node_id: &str, content: &str) -> Result<(), RuleError>;
    async fn on_msg(&self, chain_id: &str, msg: Message, opts: MsgOptions) -> Result<(), RuleError>;
    async fn on_msg_and_wait(&self, chain_id: &str, msg: Message, opts: MsgOptions) -> Result<Outcome, RuleError>;
    async fn process_msg(&self, msg: Message) -> Result<Outcome, RuleError>;
    async fn get_current_version(&self) -> u64;
    async fn get_registered_components(&self) -> Vec<NodeDescriptor>;
    async fn get_loaded_chains(&self) -> Vec<Arc<RuleChainCtx>>;
    async fn get_chain(&self, id: &str) -> Option<Arc<RuleChainCtx>>;
    async fn remove_chain(&self, id: &str) -> Result<(), RuleError>;
    async fn register_node_type(&self, prototype: Box<dyn Node>);
}

/// 规则引擎: 规则链池及其共享的引擎配置
#[derive(Clone)]
pub struct RuleEngine {
    pub(crate) chains: Arc<ChainMap>,
    config: EngineConfig,
    /// 所有克隆共享的切面列表
    aspects: Arc<StdRwLock<AspectList>>,
    version_manager: Arc<VersionManager>,
}

impl Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("config", &self.config)
            .finish()
    }
}

impl RuleEngine {
    pub async fn new() -> Self {
        Self::with_config(EngineConfig::default()).await
    }

    pub async fn with_config(mut config: EngineConfig) -> Self {
        // 注册内置组件
        components::register_builtins(&config.registry).await;

        // 注册调试切面
        config.aspects.register_node_aspect(Arc::new(DebugAspect));

        Self {
            chains: Arc::new(RwLock::new(HashMap::new())),
            aspects: Arc::new(StdRwLock::new(config.aspects.clone())),
            config,
            version_manager: Arc::new(VersionManager::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.config.pool
    }

    /// 添加节点切面
    ///
    /// 引擎的所有克隆共享切面列表; 之后加载或重新加载的规则链生效,
    /// 已加载的规则链在下次重新加载前沿用原切面。
    pub fn add_node_aspect(&self, aspect: Arc<dyn NodeAspect>) {
        self.aspects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register_node_aspect(aspect);
    }

    /// 添加消息切面, 生效时机同 [`RuleEngine::add_node_aspect`]
    pub fn add_msg_aspect(&self, aspect: Arc<dyn MessageAspect>) {
        self.aspects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register_msg_aspect(aspect);
    }

    /// 当前切面列表的快照
    pub fn aspects(&self) -> AspectList {
        self.aspects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 加载规则链; 已存在同 ID 的规则链时重新加载
    pub async fn load_chain_def(&self, def: RuleChain) -> Result<LoadedChain, RuleError> {
        check_chain_cycles(&self.chains, &def).await?;

        if let Some(existing) = self.get_chain(&def.id).await {
            existing.reload_with_aspects(def, self.aspects()).await?;
            return Ok(LoadedChain {
                id: existing.id().to_string(),
                version: existing.version().await,
                node_errors: existing.node_errors().await,
            });
        }

        let mut config = self.config.clone();
        config.aspects = self.aspects();
        let chain = RuleChainCtx::new(
            config,
            def,
            Arc::downgrade(&self.chains),
            self.version_manager.clone(),
        )
        .await?;

        let loaded = LoadedChain {
            id: chain.id().to_string(),
            version: chain.version().await,
            node_errors: chain.node_errors().await,
        };

        let replaced = self
            .chains
            .write()
            .await
            .insert(loaded.id.clone(), chain);
        if let Some(old) = replaced {
            // 并发加载同一 ID 时后加载者生效
            old.destroy().await;
        }
        Ok(loaded)
    }

    /// 重新加载单个节点
    pub async fn reload_node_def(&self, chain_id: &str, node_id: &str, content: &[u8]) -> Result<(), RuleError> {
        let chain = self
            .get_chain(chain_id)
            .await
            .ok_or_else(|| RuleError::ChainNotFound(chain_id.to_string()))?;
        chain.reload_child(&RuleNodeId::node(node_id), content).await
    }

    /// 在指定规则链上处理消息并等待所有分支结束
    pub async fn on_msg_and_wait_all(
        &self,
        chain_id: &str,
        msg: Message,
        opts: MsgOptions,
    ) -> Result<Vec<Outcome>, RuleError> {
        self.require_chain(chain_id)
            .await?
            .on_msg_and_wait_all(msg, opts)
            .await
    }

    /// 关闭引擎: 取消所有未完成的消息处理, 销毁规则链并关闭共享资源
    pub async fn shutdown(&self) {
        self.config.shutdown.cancel();
        let chains: Vec<_> = self.chains.write().await.drain().map(|(_, c)| c).collect();
        for chain in chains {
            chain.destroy().await;
        }
        self.config.pool.close_all().await;
        info!("规则引擎已关闭");
    }

    async fn require_chain(&self, id: &str) -> Result<Arc<RuleChainCtx>, RuleError> {
        self.get_chain(id)
            .await
            .ok_or_else(|| RuleError::ChainNotFound(id.to_string()))
    }
}

#[async_trait]
impl RuleEngineTrait for RuleEngine {
    async fn load_chain(&self, content: &str) -> Result<LoadedChain, RuleError> {
        let def = self.config.parser.decode_rule_chain(content.as_bytes())?;
        self.load_chain_def(def).await
    }

    async fn load_chain_from_file(&self, path: &str) -> Result<LoadedChain, RuleError> {
        let content = tokio::fs::read_to_string(Path::new(path))
            .await
            .map_err(|e| RuleError::ConfigError(e.to_string()))?;

        self.load_chain(&content).await
    }

    async fn reload_chain(&self, id: &str, content: &str) -> Result<(), RuleError> {
        let def = self.config.parser.decode_rule_chain(content.as_bytes())?;
        if def.id != id {
            return Err(RuleError::ReloadError(format!("规则链 ID 不匹配: {} != {}", def.id, id)));
        }
        self.require_chain(id)
            .await?
            .reload_with_aspects(def, self.aspects())
            .await
    }

    async fn reload_node(&self, chain_id: &str, node_id: &str, content: &str) -> Result<(), RuleError> {
        self.reload_node_def(chain_id, node_id, content.as_bytes()).await
    }

    async fn on_msg(&self, chain_id: &str, msg: Message, opts: MsgOptions) -> Result<(), RuleError> {
        self.require_chain(chain_id).await?.on_msg(msg, opts).await
    }

    async fn on_msg_and_wait(&self, chain_id: &str, msg: Message, opts: MsgOptions) -> Result<Outcome, RuleError> {
        self.require_chain(chain_id)
            .await?
            .on_msg_and_wait(msg, opts)
            .await
    }

    /// 在根规则链上处理消息
    async fn process_msg(&self, msg: Message) -> Result<Outcome, RuleError> {
        let mut root = None;
        for chain in self.get_loaded_chains().await {
            if chain.definition().await.root {
                root = Some(chain);
                break;
            }
        }
        let root = root.ok_or_else(|| RuleError::ChainNotFound("root".into()))?;
        root.on_msg_and_wait(msg, MsgOptions::new()).await
    }

    async fn get_current_version(&self) -> u64 {
        self.version_manager.get_current_version()
    }

    /// 获取所有已注册的组件类型
    async fn get_registered_components(&self) -> Vec<NodeDescriptor> {
        self.config.registry.get_descriptors().await
    }

    /// 获取所有已加载的规则链
    async fn get_loaded_chains(&self) -> Vec<Arc<RuleChainCtx>> {
        self.chains.read().await.values().cloned().collect()
    }

    /// 获取指定ID的规则链
    async fn get_chain(&self, id: &str) -> Option<Arc<RuleChainCtx>> {
        self.chains.read().await.get(id).cloned()
    }

    /// 删除规则链
    async fn remove_chain(&self, id: &str) -> Result<(), RuleError> {
        // 检查是否被其他规则链引用
        for chain in self.get_loaded_chains().await {
            if chain.id() == id {
                continue;
            }
            let def = chain.definition().await;
            if sub_chain_targets(&def).iter().any(|target| target == id) {
                return Err(RuleError::ConfigError(format!(
                    "规则链 {} 被规则链 {} 引用",
                    id, def.id
                )));
            }
        }

        let removed = self
            .chains
            .write()
            .await
            .remove(id)
            .ok_or_else(|| RuleError::ChainNotFound(id.to_string()))?;
        removed.destroy().await;
        Ok(())
    }

    /// 注册自定义节点类型
    async fn register_node_type(&self, prototype: Box<dyn Node>) {
        let type_name = prototype.type_name().to_string();
        if self.config.registry.contains(&type_name).await {
            warn!("组件类型 {} 已存在, 将被覆盖", type_name);
        }
        self.config.registry.register(prototype).await;
    }
}
