use crate::types::{EngineConfig, Message, Node, Outcome, RuleContext, RuleError, RuleNode};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[cfg(feature = "metrics")]
mod metrics;
#[cfg(feature = "metrics")]
pub use metrics::MetricsAspect;

/// 节点切面,在节点初始化与执行的不同阶段进行拦截处理
#[async_trait]
pub trait NodeAspect: Send + Sync + std::fmt::Debug {
    /// 执行顺序, 值小的在外层
    fn order(&self) -> i32 {
        0
    }

    /// 是否作用于本次执行
    fn point_cut(&self, _ctx: &RuleContext, _msg: &Message) -> bool {
        true
    }

    /// 节点初始化前的拦截处理, 返回错误会中止初始化
    ///
    /// # Arguments
    /// * `config` - 引擎配置
    /// * `def` - 节点定义
    fn on_node_before_init(&self, _config: &EngineConfig, _def: &RuleNode) -> Result<(), RuleError> {
        Ok(())
    }

    /// 节点执行前的拦截处理
    async fn before(&self, _ctx: &RuleContext, _msg: &Message) -> Result<(), RuleError> {
        Ok(())
    }

    /// 包裹节点执行, 不调用 `next.run` 即可短路
    async fn around(&self, _ctx: &RuleContext, msg: Message, next: Next<'_>) -> Result<(), RuleError> {
        next.run(msg).await
    }

    /// 节点执行后的拦截处理
    ///
    /// # Arguments
    /// * `ctx` - 节点执行上下文
    /// * `outcome` - 节点上报的结果, 未上报时为 `None`
    async fn after(&self, _ctx: &RuleContext, _outcome: Option<&Outcome>) -> Result<(), RuleError> {
        Ok(())
    }

    /// 节点执行出错时的拦截处理
    async fn error(&self, _ctx: &RuleContext, _error: &RuleError) -> Result<(), RuleError> {
        Ok(())
    }

    /// 节点重新加载后
    async fn on_reload(&self, _chain_id: &str, _node_id: &str) {}

    /// 节点销毁后
    async fn on_destroy(&self, _chain_id: &str, _node_id: &str) {}
}

/// 消息切面,在一条消息处理开始与全部分支结束时调用
#[async_trait]
pub trait MessageAspect: Send + Sync + std::fmt::Debug {
    /// 消息处理前
    async fn before_process(&self, _chain_id: &str, _msg: &Message) -> Result<(), RuleError> {
        Ok(())
    }

    /// 所有分支结束后
    ///
    /// # Arguments
    /// * `err` - 处理过程中记录的第一个错误
    async fn after_process(
        &self,
        _chain_id: &str,
        _msg: &Message,
        _err: Option<&RuleError>,
    ) -> Result<(), RuleError> {
        Ok(())
    }
}

/// 环绕切面链的后续部分, 最内层为节点本身
pub struct Next<'a> {
    aspects: &'a [Arc<dyn NodeAspect>],
    node: &'a dyn Node,
    ctx: &'a RuleContext,
}

impl<'a> Next<'a> {
    pub(crate) fn new(aspects: &'a [Arc<dyn NodeAspect>], node: &'a dyn Node, ctx: &'a RuleContext) -> Self {
        Self { aspects, node, ctx }
    }

    pub async fn run(self, msg: Message) -> Result<(), RuleError> {
        match self.aspects.split_first() {
            Some((aspect, rest)) => {
                let next = Next::new(rest, self.node, self.ctx);
                aspect.around(self.ctx, msg, next).await
            }
            None => self.node.on_msg(self.ctx, msg).await,
        }
    }
}

/// 切面列表,按 `order` 排序保存节点切面与消息切面
#[derive(Debug, Clone, Default)]
pub struct AspectList {
    node_aspects: Vec<Arc<dyn NodeAspect>>,
    msg_aspects: Vec<Arc<dyn MessageAspect>>,
}

impl AspectList {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册节点切面
    pub fn register_node_aspect(&mut self, aspect: Arc<dyn NodeAspect>) {
        self.node_aspects.push(aspect);
        self.node_aspects.sort_by_key(|a| a.order());
    }

    /// 注册消息切面
    pub fn register_msg_aspect(&mut self, aspect: Arc<dyn MessageAspect>) {
        self.msg_aspects.push(aspect);
    }

    pub fn node_aspects(&self) -> &[Arc<dyn NodeAspect>] {
        &self.node_aspects
    }

    pub fn is_empty(&self) -> bool {
        self.node_aspects.is_empty() && self.msg_aspects.is_empty()
    }

    /// 作用于本次执行的切面
    pub(crate) fn select(&self, ctx: &RuleContext, msg: &Message) -> Vec<Arc<dyn NodeAspect>> {
        self.node_aspects
            .iter()
            .filter(|a| a.point_cut(ctx, msg))
            .cloned()
            .collect()
    }

    /// 执行所有初始化前切面, 第一个错误中止
    pub fn node_before_init(&self, config: &EngineConfig, def: &RuleNode) -> Result<(), RuleError> {
        for aspect in &self.node_aspects {
            aspect.on_node_before_init(config, def)?;
        }
        Ok(())
    }

    pub(crate) async fn before_node(aspects: &[Arc<dyn NodeAspect>], ctx: &RuleContext, msg: &Message) {
        for aspect in aspects {
            if let Err(e) = aspect.before(ctx, msg).await {
                warn!(node = %ctx.self_id(), "前置切面执行失败: {}", e);
            }
        }
    }

    pub(crate) async fn after_node(
        aspects: &[Arc<dyn NodeAspect>],
        ctx: &RuleContext,
        outcome: Option<&Outcome>,
    ) {
        for aspect in aspects.iter().rev() {
            if let Err(e) = aspect.after(ctx, outcome).await {
                warn!(node = %ctx.self_id(), "后置切面执行失败: {}", e);
            }
        }
    }

    pub(crate) async fn node_error(aspects: &[Arc<dyn NodeAspect>], ctx: &RuleContext, error: &RuleError) {
        for aspect in aspects.iter().rev() {
            if let Err(e) = aspect.error(ctx, error).await {
                warn!(node = %ctx.self_id(), "错误切面执行失败: {}", e);
            }
        }
    }

    pub(crate) async fn node_reloaded(&self, chain_id: &str, node_id: &str) {
        for aspect in &self.node_aspects {
            aspect.on_reload(chain_id, node_id).await;
        }
    }

    pub(crate) async fn node_destroyed(&self, chain_id: &str, node_id: &str) {
        for aspect in &self.node_aspects {
            aspect.on_destroy(chain_id, node_id).await;
        }
    }

    pub(crate) async fn before_process(&self, chain_id: &str, msg: &Message) {
        for aspect in &self.msg_aspects {
            if let Err(e) = aspect.before_process(chain_id, msg).await {
                warn!(chain = %chain_id, "消息切面执行失败: {}", e);
            }
        }
    }

    pub(crate) async fn after_process(&self, chain_id: &str, msg: &Message, err: Option<&RuleError>) {
        for aspect in &self.msg_aspects {
            if let Err(e) = aspect.after_process(chain_id, msg, err).await {
                warn!(chain = %chain_id, "消息切面执行失败: {}", e);
            }
        }
    }
}

/// 调试切面,记录开启 `debug_mode` 的节点的输入输出
#[derive(Debug, Default)]
pub struct DebugAspect;

#[async_trait]
impl NodeAspect for DebugAspect {
    fn order(&self) -> i32 {
        900
    }

    fn point_cut(&self, ctx: &RuleContext, _msg: &Message) -> bool {
        ctx.self_definition().debug_mode
    }

    async fn before(&self, ctx: &RuleContext, msg: &Message) -> Result<(), RuleError> {
        info!(
            chain = %ctx.chain_id(),
            node = %ctx.self_id(),
            msg_id = %msg.id,
            "节点输入: type={} data={}",
            msg.msg_type,
            msg.data_as_string()
        );
        Ok(())
    }

    async fn after(&self, ctx: &RuleContext, outcome: Option<&Outcome>) -> Result<(), RuleError> {
        match outcome {
            Some(outcome) => info!(
                chain = %ctx.chain_id(),
                node = %ctx.self_id(),
                msg_id = %outcome.msg.id,
                "节点输出: relations={:?} data={}",
                outcome.relations,
                outcome.msg.data_as_string()
            ),
            None => debug!(node = %ctx.self_id(), "节点未上报关系"),
        }
        Ok(())
    }

    async fn error(&self, ctx: &RuleContext, error: &RuleError) -> Result<(), RuleError> {
        info!(chain = %ctx.chain_id(), node = %ctx.self_id(), "节点执行出错: {}", error);
        Ok(())
    }
}
