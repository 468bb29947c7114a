use crate::types::{
    EngineConfig, Message, Node, NodeConfiguration, NodeDescriptor, RuleContext, RuleError,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

pub const FLOW_NODE_TYPE: &str = "flow";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubchainConfig {
    /// 子规则链 ID
    pub target_id: String,
}

/// 子规则链节点: 在目标规则链上处理消息, 等待其全部分支结束后
/// 以最后结束的分支的输出与关系继续路由
#[derive(Debug, Default)]
pub struct SubchainNode {
    target_id: String,
}

impl SubchainNode {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Node for SubchainNode {
    fn type_name(&self) -> &str {
        FLOW_NODE_TYPE
    }

    fn new_instance(&self) -> Box<dyn Node> {
        Box::new(SubchainNode::new())
    }

    fn get_descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            type_name: FLOW_NODE_TYPE.to_string(),
            name: "子规则链".to_string(),
            description: "在另一条规则链上处理消息".to_string(),
            relations: vec!["Success".into(), "Failure".into()],
            config_schema: Some(json!({
                "type": "object",
                "required": ["target_id"],
                "properties": {"target_id": {"type": "string", "minLength": 1}}
            })),
        }
    }

    async fn init(&mut self, _config: &EngineConfig, configuration: NodeConfiguration) -> Result<(), RuleError> {
        let config: SubchainConfig = configuration.decode()?;
        if config.target_id.is_empty() {
            return Err(RuleError::ConfigError(format!(
                "节点 {} 未配置子规则链",
                configuration.node_id()
            )));
        }
        self.target_id = config.target_id;
        Ok(())
    }

    async fn on_msg(&self, ctx: &RuleContext, msg: Message) -> Result<(), RuleError> {
        match ctx.tell_flow(&self.target_id, msg.clone()).await {
            Ok(mut outcomes) => match outcomes.pop() {
                Some(last) if last.relations.is_empty() => ctx.tell_success(last.msg),
                Some(last) => ctx.tell_next(last.msg, last.relations),
                None => ctx.tell_success(msg),
            },
            Err(e) => ctx.tell_failure(msg, e),
        }
        Ok(())
    }
}
