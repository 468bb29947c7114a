use crate::engine::{MsgFlow, MsgOptions, RuleChainCtx, RuleNodeCtx};
use crate::types::{EngineConfig, Message, RelationType, RuleError, RuleNode};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// 一次节点执行的结果: 输出消息与上报的关系
#[derive(Debug, Clone)]
pub struct Outcome {
    pub node_id: String,
    pub msg: Message,
    /// 为空表示分支显式结束
    pub relations: Vec<RelationType>,
    pub err: Option<RuleError>,
}

impl Outcome {
    /// 首个关系
    pub fn relation(&self) -> Option<&RelationType> {
        self.relations.first()
    }
}

/// 组件在 `on_msg` 中看到的执行上下文
pub struct RuleContext {
    flow: Arc<MsgFlow>,
    chain: Arc<RuleChainCtx>,
    node: Arc<RuleNodeCtx>,
    definition: Arc<RuleNode>,
    depth: usize,
    outcome: OnceLock<Outcome>,
}

impl RuleContext {
    pub(crate) fn new(
        flow: Arc<MsgFlow>,
        chain: Arc<RuleChainCtx>,
        node: Arc<RuleNodeCtx>,
        definition: Arc<RuleNode>,
        depth: usize,
    ) -> Self {
        Self {
            flow,
            chain,
            node,
            definition,
            depth,
            outcome: OnceLock::new(),
        }
    }

    pub fn tell_success(&self, msg: Message) {
        self.report(msg, vec![RelationType::SUCCESS], None);
    }

    /// 上报失败: 沿 Failure 关系路由, 并把错误记录到本次消息处理
    pub fn tell_failure(&self, msg: Message, err: RuleError) {
        self.report(msg, vec![RelationType::FAILURE], Some(err));
    }

    pub fn tell_next<R: Into<RelationType>>(
        &self,
        msg: Message,
        relations: impl IntoIterator<Item = R>,
    ) {
        let relations = relations.into_iter().map(Into::into).collect();
        self.report(msg, relations, None);
    }

    /// 不经过任何关系, 直接结束该分支
    pub fn tell_end(&self, msg: Message) {
        self.report(msg, Vec::new(), None);
    }

    /// 停止整个消息处理, 未开始的分支不再执行
    pub fn stop(&self) {
        self.flow.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.flow.is_stopped()
    }

    /// 当前节点所在作用域的取消信号
    pub fn cancel_token(&self) -> CancellationToken {
        self.flow.scope(self.depth)
    }

    /// 在另一条规则链上处理消息, 等待其全部分支结束
    pub async fn tell_flow(&self, chain_id: &str, msg: Message) -> Result<Vec<Outcome>, RuleError> {
        let target = self.chain.find_chain(chain_id).await?;
        let opts = MsgOptions::new().cancel(self.cancel_token());
        target.on_msg_and_wait_all(msg, opts).await
    }

    pub fn self_id(&self) -> &str {
        &self.definition.id
    }

    pub fn self_definition(&self) -> &RuleNode {
        &self.definition
    }

    pub fn chain_id(&self) -> &str {
        self.chain.id()
    }

    pub fn config(&self) -> &EngineConfig {
        self.node.config()
    }

    /// 距入口节点的跳数, 入口为 0
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub(crate) fn take_outcome(&mut self) -> Option<Outcome> {
        self.outcome.take()
    }

    fn report(&self, msg: Message, relations: Vec<RelationType>, err: Option<RuleError>) {
        let outcome = Outcome {
            node_id: self.definition.id.clone(),
            msg,
            relations,
            err,
        };
        if self.outcome.set(outcome).is_err() {
            warn!(
                chain = %self.chain.id(),
                node = %self.definition.id,
                "节点重复上报关系, 已忽略"
            );
        }
    }
}
