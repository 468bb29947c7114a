use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 组件描述, 供注册表列出已注册组件
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct NodeDescriptor {
    pub type_name: String,
    pub name: String,
    pub description: String,
    /// 组件可能上报的关系
    #[serde(default)]
    pub relations: Vec<String>,
    /// 配置的 JSON Schema, 存在时初始化前校验配置
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_schema: Option<Value>,
}
