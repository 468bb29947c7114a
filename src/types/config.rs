use crate::aop::{AspectList, MessageAspect, NodeAspect};
use crate::engine::{JsonParser, NodeRegistry, Parser};
use crate::shared::ResourcePool;
use crate::types::RuleError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 可从文件加载的引擎设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// 全局属性, 节点配置中以 `${global.key}` 引用
    pub properties: HashMap<String, String>,
    /// 初始化节点时立即建立共享客户端
    pub node_client_init_now: bool,
    /// 共享资源构建超时
    pub shared_init_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            properties: HashMap::new(),
            node_client_init_now: false,
            shared_init_timeout_ms: 4000,
        }
    }
}

impl EngineSettings {
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| RuleError::ConfigError(format!("读取配置文件失败: {}", e)))?;
        serde_json::from_str(&content)
            .map_err(|e| RuleError::ConfigError(format!("配置文件格式错误: {}", e)))
    }
}

/// 引擎级配置, 克隆后共享同一注册表、资源池与关闭信号
#[derive(Clone)]
pub struct EngineConfig {
    pub settings: EngineSettings,
    pub registry: Arc<NodeRegistry>,
    pub pool: Arc<ResourcePool>,
    pub aspects: AspectList,
    pub parser: Arc<dyn Parser>,
    pub shutdown: CancellationToken,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(EngineSettings::default())
    }
}

impl EngineConfig {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            registry: Arc::new(NodeRegistry::new()),
            pool: Arc::new(ResourcePool::new()),
            aspects: AspectList::new(),
            parser: Arc::new(JsonParser),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_node_aspect(mut self, aspect: Arc<dyn NodeAspect>) -> Self {
        self.aspects.register_node_aspect(aspect);
        self
    }

    pub fn with_msg_aspect(mut self, aspect: Arc<dyn MessageAspect>) -> Self {
        self.aspects.register_msg_aspect(aspect);
        self
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.settings
            .properties
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn shared_init_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.shared_init_timeout_ms)
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("settings", &self.settings)
            .field("aspects", &self.aspects)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn settings_from_file_fills_defaults() {
        let path = std::env::temp_dir().join(format!("rulego-settings-{}.json", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, r#"{"properties": {"server": "127.0.0.1:6379"}}"#)
            .await
            .unwrap();
        let settings = EngineSettings::from_file(&path).await.unwrap();
        assert_eq!(settings.properties["server"], "127.0.0.1:6379");
        assert_eq!(settings.shared_init_timeout_ms, 4000);
        assert!(!settings.node_client_init_now);
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn missing_settings_file_is_config_error() {
        let err = EngineSettings::from_file("/nonexistent/rulego.json")
            .await
            .unwrap_err();
        assert!(matches!(err, RuleError::ConfigError(_)));
    }
}
