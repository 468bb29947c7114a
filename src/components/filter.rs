use super::js_engine::JsEngine;
use crate::types::{
    EngineConfig, Message, Node, NodeConfiguration, NodeDescriptor, RelationType, RuleContext,
    RuleError,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// 函数体, 参数为 msg、metadata、msgType, 返回 true 时走 True 关系
    pub js_script: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            js_script: "return msg.temperature > 50;".to_string(),
        }
    }
}

/// 脚本过滤器
#[derive(Default)]
pub struct FilterNode {
    engine: Option<JsEngine>,
}

impl FilterNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// 脚本返回布尔真时为 True, 其余返回值为 False
    fn evaluate(&self, msg: &Message) -> Result<RelationType, RuleError> {
        let engine = self
            .engine
            .as_ref()
            .ok_or_else(|| RuleError::NodeNotInit("jsFilter".into()))?;
        match engine.call(msg)? {
            Value::Bool(true) => Ok(RelationType::TRUE),
            _ => Ok(RelationType::FALSE),
        }
    }
}

#[async_trait]
impl Node for FilterNode {
    fn type_name(&self) -> &str {
        "jsFilter"
    }

    fn new_instance(&self) -> Box<dyn Node> {
        Box::new(FilterNode::new())
    }

    fn get_descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            type_name: "jsFilter".to_string(),
            name: "脚本过滤器".to_string(),
            description: "使用JavaScript判断消息走 True 或 False".to_string(),
            relations: vec!["True".into(), "False".into(), "Failure".into()],
            config_schema: Some(json!({
                "type": "object",
                "properties": {"js_script": {"type": "string", "minLength": 1}}
            })),
        }
    }

    async fn init(&mut self, _config: &EngineConfig, configuration: NodeConfiguration) -> Result<(), RuleError> {
        let config: FilterConfig = configuration.decode()?;
        self.engine = Some(JsEngine::new("filter", &config.js_script)?);
        Ok(())
    }

    async fn on_msg(&self, ctx: &RuleContext, msg: Message) -> Result<(), RuleError> {
        if self.engine.is_none() {
            return Err(RuleError::NodeNotInit(ctx.self_id().to_string()));
        }
        match self.evaluate(&msg) {
            Ok(relation) => ctx.tell_next(msg, [relation]),
            Err(e) => ctx.tell_failure(msg, e),
        }
        Ok(())
    }
}
