use crate::shared::{SharedFactory, SharedNode, SharedResource};
use crate::types::{
    EngineConfig, Message, Node, NodeConfiguration, NodeDescriptor, RuleContext, RuleError,
};
use crate::utils::template::{message_env, Template};
use async_trait::async_trait;
use futures::FutureExt;
use redis::aio::ConnectionManager;
use redis::Value as RedisValue;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

pub const REDIS_CLIENT_TYPE: &str = "redisClient";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// 服务器地址 `host:port`, 同一地址的节点共享一个连接
    pub server: String,
    pub password: String,
    pub db: i64,
    /// 命令, 可以包含 `${...}` 占位符
    pub cmd: String,
    /// 命令参数, 可以包含 `${...}` 占位符
    pub params: Vec<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:6379".to_string(),
            password: String::new(),
            db: 0,
            cmd: "GET".to_string(),
            params: Vec::new(),
        }
    }
}

impl RedisConfig {
    fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}/{}", self.server, self.db)
        } else {
            format!("redis://:{}@{}/{}", self.password, self.server, self.db)
        }
    }
}

/// 共享的 Redis 连接
pub struct RedisConnection {
    manager: ConnectionManager,
}

impl SharedResource for RedisConnection {}

/// Redis 客户端组件, 结果写入消息负载后走 Success
#[derive(Default)]
pub struct RedisNode {
    shared: SharedNode<RedisConnection>,
    cmd: Template,
    params: Vec<Template>,
}

impl RedisNode {
    pub fn new() -> Self {
        Self::default()
    }

    fn connection_factory(config: &RedisConfig) -> SharedFactory<RedisConnection> {
        let url = config.url();
        Arc::new(move || {
            let url = url.clone();
            async move {
                let client = redis::Client::open(url)?;
                let manager = ConnectionManager::new(client).await?;
                Ok::<_, anyhow::Error>(RedisConnection { manager })
            }
            .boxed()
        })
    }

    async fn execute(&self, msg: &Message) -> Result<serde_json::Value, RuleError> {
        let connection = self.shared.get().await?;
        let mut manager = connection.manager.clone();

        let env = message_env(msg);
        let cmd = self.cmd.execute(&env);
        let mut command = redis::cmd(&cmd);
        for param in &self.params {
            command.arg(param.execute(&env));
        }

        let value: RedisValue = command
            .query_async(&mut manager)
            .await
            .map_err(|e| RuleError::NodeExecutionError(format!("Redis命令 {} 执行失败: {}", cmd, e)))?;
        Ok(redis_value_to_json(value))
    }
}

pub(crate) fn redis_value_to_json(value: RedisValue) -> serde_json::Value {
    match value {
        RedisValue::Nil => json!(null),
        RedisValue::Int(i) => json!(i),
        RedisValue::Okay => json!("OK"),
        RedisValue::SimpleString(s) => json!(s),
        RedisValue::Boolean(b) => json!(b),
        RedisValue::Double(d) => json!(d),
        RedisValue::BulkString(bytes) => match String::from_utf8(bytes) {
            Ok(s) => json!(s),
            Err(_) => json!("<binary data>"),
        },
        RedisValue::Array(values) | RedisValue::Set(values) => {
            json!(values.into_iter().map(redis_value_to_json).collect::<Vec<_>>())
        }
        RedisValue::Map(map) => {
            let mut result = HashMap::new();
            for (k, v) in map {
                let key = match k {
                    RedisValue::SimpleString(s) => s,
                    RedisValue::BulkString(bytes) => {
                        String::from_utf8(bytes).unwrap_or_else(|_| "<binary key>".to_string())
                    }
                    other => format!("{:?}", other),
                };
                result.insert(key, redis_value_to_json(v));
            }
            json!(result)
        }
        other => json!(format!("{:?}", other)),
    }
}

#[async_trait]
impl Node for RedisNode {
    fn type_name(&self) -> &str {
        REDIS_CLIENT_TYPE
    }

    fn new_instance(&self) -> Box<dyn Node> {
        Box::new(RedisNode::new())
    }

    fn get_descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            type_name: REDIS_CLIENT_TYPE.to_string(),
            name: "Redis客户端".to_string(),
            description: "执行Redis命令".to_string(),
            relations: vec!["Success".into(), "Failure".into()],
            config_schema: Some(json!({
                "type": "object",
                "properties": {
                    "server": {"type": "string", "minLength": 1},
                    "cmd": {"type": "string", "minLength": 1},
                    "params": {"type": "array", "items": {"type": "string"}},
                    "db": {"type": "integer", "minimum": 0}
                }
            })),
        }
    }

    async fn init(&mut self, config: &EngineConfig, configuration: NodeConfiguration) -> Result<(), RuleError> {
        let redis_config: RedisConfig = configuration.decode()?;
        let init_now = config.settings.node_client_init_now || configuration.init_net_resource;

        self.cmd = Template::new(redis_config.cmd.clone());
        self.params = redis_config.params.iter().cloned().map(Template::new).collect();
        self.shared
            .init(
                config,
                REDIS_CLIENT_TYPE,
                &redis_config.server,
                init_now,
                Self::connection_factory(&redis_config),
            )
            .await
    }

    async fn on_msg(&self, ctx: &RuleContext, msg: Message) -> Result<(), RuleError> {
        match self.execute(&msg).await {
            Ok(data) => {
                let mut out = msg;
                out.set_data(data);
                ctx.tell_success(out);
            }
            Err(e) => ctx.tell_failure(msg, e),
        }
        Ok(())
    }

    async fn destroy(&self) {
        self.shared.release().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn converts_nested_replies() {
        let value = RedisValue::Array(vec![
            RedisValue::Int(1),
            RedisValue::BulkString(b"hello".to_vec()),
            RedisValue::Nil,
            RedisValue::Okay,
        ]);
        assert_eq!(redis_value_to_json(value), json!([1, "hello", null, "OK"]));
    }

    #[test]
    fn builds_url_with_password() {
        let config = RedisConfig {
            password: "pw".into(),
            db: 2,
            ..RedisConfig::default()
        };
        assert_eq!(config.url(), "redis://:pw@127.0.0.1:6379/2");
    }
}
