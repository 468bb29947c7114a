use crate::types::{EngineConfig, Message, NodeDescriptor, RuleContext, RuleError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// 节点配置: 字段名到任意 JSON 值, 字符串中可以包含 `${...}` 占位符
pub type Configuration = Map<String, Value>;

/// 节点定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleNode {
    pub id: String,
    pub type_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub debug_mode: bool,
    #[serde(default)]
    pub config: Configuration,
}

impl RuleNode {
    pub fn new(id: &str, type_name: &str, config: Value) -> Self {
        let config = match config {
            Value::Object(map) => map,
            _ => Configuration::new(),
        };
        Self {
            id: id.to_string(),
            type_name: type_name.to_string(),
            name: String::new(),
            debug_mode: false,
            config,
        }
    }

    /// 定义指纹, 用于判断重新加载时节点是否变化
    pub fn fingerprint(&self) -> blake3::Hash {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        blake3::hash(&bytes)
    }
}

/// 节点所在规则链的作用域: 链 ID、变量与密钥
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainScope {
    pub chain_id: String,
    pub vars: HashMap<String, String>,
    pub secrets: HashMap<String, String>,
}

/// 传给组件 `init` 的配置
#[derive(Debug, Clone)]
pub struct NodeConfiguration {
    /// 完成变量替换后的配置
    pub values: Configuration,
    pub self_definition: RuleNode,
    pub chain: Option<ChainScope>,
    /// 是否要求立即建立网络资源
    pub init_net_resource: bool,
}

impl NodeConfiguration {
    /// 将配置反序列化为组件自己的配置结构
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, RuleError> {
        serde_json::from_value(Value::Object(self.values.clone())).map_err(|e| {
            RuleError::ConfigError(format!("节点 {} 配置无效: {}", self.self_definition.id, e))
        })
    }

    pub fn node_id(&self) -> &str {
        &self.self_definition.id
    }

    pub fn chain_id(&self) -> Option<&str> {
        self.chain.as_ref().map(|c| c.chain_id.as_str())
    }
}

/// 组件契约
///
/// 注册表保存一个原型, 通过 `new_instance` 得到未初始化的新实例,
/// 随后 `init` 一次, 之后可并发调用 `on_msg`。
/// `on_msg` 每次调用必须恰好调用一次 `tell_success`、`tell_failure`、
/// `tell_next` 或 `tell_end`, 都不调用时该分支静默停止。
#[async_trait]
pub trait Node: Send + Sync {
    fn type_name(&self) -> &str;

    fn new_instance(&self) -> Box<dyn Node>;

    fn get_descriptor(&self) -> NodeDescriptor;

    async fn init(
        &mut self,
        config: &EngineConfig,
        configuration: NodeConfiguration,
    ) -> Result<(), RuleError>;

    async fn on_msg(&self, ctx: &RuleContext, msg: Message) -> Result<(), RuleError>;

    async fn destroy(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_tracks_configuration() {
        let a = RuleNode::new("s1", "log", json!({"template": "x"}));
        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.config.insert("template".into(), json!("y"));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn decode_reports_node_id() {
        #[derive(Debug, Deserialize)]
        struct Cfg {
            #[allow(dead_code)]
            port: u16,
        }
        let def = RuleNode::new("n1", "test", json!({"port": "abc"}));
        let configuration = NodeConfiguration {
            values: def.config.clone(),
            self_definition: def,
            chain: None,
            init_net_resource: false,
        };
        let err = configuration.decode::<Cfg>().unwrap_err();
        assert!(err.to_string().contains("n1"));
    }
}
