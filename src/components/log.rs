use crate::types::{
    EngineConfig, Message, Node, NodeConfiguration, NodeDescriptor, RuleContext, RuleError,
};
use crate::utils::template::{message_env, Template};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub template: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            template: "${msgType}: ${msg}".to_string(),
        }
    }
}

/// 日志组件: 按模板输出消息后沿 Success 继续
#[derive(Default)]
pub struct LogNode {
    template: Template,
}

impl LogNode {
    pub fn new() -> Self {
        Self::default()
    }

    fn format_message(&self, msg: &Message) -> String {
        self.template.execute(&message_env(msg))
    }
}

#[async_trait]
impl Node for LogNode {
    fn type_name(&self) -> &str {
        "log"
    }

    fn new_instance(&self) -> Box<dyn Node> {
        Box::new(LogNode::new())
    }

    fn get_descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            type_name: "log".to_string(),
            name: "日志节点".to_string(),
            description: "输出格式化日志".to_string(),
            relations: vec!["Success".to_string()],
            config_schema: None,
        }
    }

    async fn init(&mut self, _config: &EngineConfig, configuration: NodeConfiguration) -> Result<(), RuleError> {
        let config: LogConfig = configuration.decode()?;
        self.template = Template::new(config.template);
        Ok(())
    }

    async fn on_msg(&self, ctx: &RuleContext, msg: Message) -> Result<(), RuleError> {
        let log_message = self.format_message(&msg);
        info!(chain = %ctx.chain_id(), node = %ctx.self_id(), "{}", log_message);
        ctx.tell_success(msg);
        Ok(())
    }
}
