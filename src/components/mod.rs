mod filter;
mod js_engine;
mod log;
mod mqtt_client;
mod redis_client;
mod rest_client;
mod ssh;
mod subchain;
mod transform_js;

pub use filter::{FilterConfig, FilterNode};
pub use log::{LogConfig, LogNode};
pub use mqtt_client::{MqttClientConfig, MqttClientNode, MqttConnection, MQTT_CLIENT_TYPE};
pub use redis_client::{RedisConfig, RedisConnection, RedisNode, REDIS_CLIENT_TYPE};
pub use rest_client::{RestClientConfig, RestClientNode, STATUS_CODE_METADATA_KEY, STATUS_METADATA_KEY};
pub use ssh::{SshConfig, SshNode, SshSession, SSH_TYPE};
pub use subchain::{SubchainConfig, SubchainNode, FLOW_NODE_TYPE};
pub use transform_js::{TransformJsConfig, TransformJsNode};

use crate::engine::NodeRegistry;
use crate::types::Node;

/// 向注册表注册所有内置组件
pub async fn register_builtins(registry: &NodeRegistry) {
    let builtins: Vec<Box<dyn Node>> = vec![
        Box::new(LogNode::new()),
        Box::new(FilterNode::new()),
        Box::new(TransformJsNode::new()),
        Box::new(RestClientNode::new()),
        Box::new(RedisNode::new()),
        Box::new(MqttClientNode::new()),
        Box::new(SshNode::new()),
        Box::new(SubchainNode::new()),
    ];
    for node in builtins {
        registry.register(node).await;
    }
}
