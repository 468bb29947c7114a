use crate::types::{Node, NodeDescriptor, RuleError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// 组件工厂, 每次调用返回一个未初始化的新实例
pub type NodeFactory = Arc<dyn Fn() -> Box<dyn Node> + Send + Sync>;

/// 组件注册表: 组件类型到工厂的映射
#[derive(Default)]
pub struct NodeRegistry {
    factories: RwLock<HashMap<String, NodeFactory>>,
    descriptors: RwLock<HashMap<String, NodeDescriptor>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以原型注册组件, 原型的 `new_instance` 作为工厂
    pub async fn register(&self, prototype: Box<dyn Node>) {
        let type_name = prototype.type_name().to_string();
        let descriptor = prototype.get_descriptor();
        let factory: NodeFactory = Arc::new(move || prototype.new_instance());
        self.register_factory(&type_name, descriptor, factory).await;
    }

    pub async fn register_factory(&self, type_name: &str, descriptor: NodeDescriptor, factory: NodeFactory) {
        self.factories
            .write()
            .await
            .insert(type_name.to_string(), factory);
        self.descriptors
            .write()
            .await
            .insert(type_name.to_string(), descriptor);
    }

    pub async fn unregister(&self, type_name: &str) -> Result<(), RuleError> {
        self.descriptors.write().await.remove(type_name);
        self.factories
            .write()
            .await
            .remove(type_name)
            .map(|_| ())
            .ok_or_else(|| RuleError::NodeTypeNotFound(type_name.to_string()))
    }

    /// 创建组件实例
    pub async fn new_node(&self, type_name: &str) -> Result<Box<dyn Node>, RuleError> {
        let factories = self.factories.read().await;
        match factories.get(type_name) {
            Some(factory) => Ok(factory()),
            None => {
                tracing::error!("Node type not found: {}", type_name);
                Err(RuleError::NodeTypeNotFound(type_name.to_string()))
            }
        }
    }

    pub async fn contains(&self, type_name: &str) -> bool {
        self.factories.read().await.contains_key(type_name)
    }

    pub async fn get_descriptor(&self, type_name: &str) -> Option<NodeDescriptor> {
        self.descriptors.read().await.get(type_name).cloned()
    }

    pub async fn get_descriptors(&self) -> Vec<NodeDescriptor> {
        let mut descriptors: Vec<_> = self.descriptors.read().await.values().cloned().collect();
        descriptors.sort_by(|a, b| a.type_name.cmp(&b.type_name));
        descriptors
    }

    pub async fn get_registered_types(&self) -> Vec<String> {
        self.factories.read().await.keys().cloned().collect()
    }
}
