use super::js_engine::JsEngine;
use crate::types::{
    EngineConfig, Message, Node, NodeConfiguration, NodeDescriptor, RuleContext, RuleError,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransformJsConfig {
    /// 函数体, 返回 `{msg, metadata, msgType}`, 缺省的字段保持不变
    pub js_script: String,
}

impl Default for TransformJsConfig {
    fn default() -> Self {
        Self {
            js_script: "return {'msg': msg, 'metadata': metadata, 'msgType': msgType};".to_string(),
        }
    }
}

/// 脚本转换器
#[derive(Default)]
pub struct TransformJsNode {
    engine: Option<JsEngine>,
}

impl TransformJsNode {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(mut msg: Message, result: Value) -> Result<Message, RuleError> {
        let Value::Object(mut result) = result else {
            return Err(RuleError::NodeExecutionError("脚本必须返回对象".into()));
        };
        if let Some(data) = result.remove("msg") {
            msg.set_data(data);
        }
        if let Some(Value::Object(metadata)) = result.remove("metadata") {
            msg.metadata = metadata
                .into_iter()
                .map(|(k, v)| match v {
                    Value::String(s) => (k, s),
                    other => (k, other.to_string()),
                })
                .collect();
        }
        if let Some(Value::String(msg_type)) = result.remove("msgType") {
            msg.msg_type = msg_type;
        }
        Ok(msg)
    }
}

#[async_trait]
impl Node for TransformJsNode {
    fn type_name(&self) -> &str {
        "jsTransform"
    }

    fn new_instance(&self) -> Box<dyn Node> {
        Box::new(TransformJsNode::new())
    }

    fn get_descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            type_name: "jsTransform".to_string(),
            name: "JS转换器".to_string(),
            description: "使用JavaScript转换消息".to_string(),
            relations: vec!["Success".into(), "Failure".into()],
            config_schema: Some(json!({
                "type": "object",
                "properties": {"js_script": {"type": "string", "minLength": 1}}
            })),
        }
    }

    async fn init(&mut self, _config: &EngineConfig, configuration: NodeConfiguration) -> Result<(), RuleError> {
        let config: TransformJsConfig = configuration.decode()?;
        self.engine = Some(JsEngine::new("transform", &config.js_script)?);
        Ok(())
    }

    async fn on_msg(&self, ctx: &RuleContext, msg: Message) -> Result<(), RuleError> {
        let engine = self
            .engine
            .as_ref()
            .ok_or_else(|| RuleError::NodeNotInit(ctx.self_id().to_string()))?;

        match engine.call(&msg).and_then(|result| Self::apply(msg.clone(), result)) {
            Ok(msg) => ctx.tell_success(msg),
            Err(e) => ctx.tell_failure(msg, e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn applies_script_result_fields() {
        let msg = Message::new("IN", json!({"a": 1})).with_metadata("k", "v");
        let out = TransformJsNode::apply(
            msg,
            json!({"msg": {"b": 2}, "metadata": {"k": "w", "n": 3}, "msgType": "OUT"}),
        )
        .unwrap();
        assert_eq!(out.data, json!({"b": 2}));
        assert_eq!(out.get_metadata("k"), Some("w"));
        assert_eq!(out.get_metadata("n"), Some("3"));
        assert_eq!(out.msg_type, "OUT");
    }

    #[test]
    fn rejects_non_object_result() {
        let msg = Message::new("IN", json!({}));
        assert!(TransformJsNode::apply(msg, json!(42)).is_err());
    }
}
