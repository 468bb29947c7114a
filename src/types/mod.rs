mod config;
mod context;
mod descriptor;
mod error;
mod message;
mod node;
mod relation;

pub use config::*;
pub use context::*;
pub use descriptor::*;
pub use error::*;
pub use message::*;
pub use node::*;
pub use relation::*;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// 规则链定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleChain {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub root: bool,
    #[serde(default)]
    pub debug_mode: bool,
    #[serde(default)]
    pub vars: HashMap<String, String>,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
    /// 入口节点, 缺省为第一个节点
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    pub nodes: Vec<RuleNode>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl RuleChain {
    pub fn entry_id(&self) -> Option<&str> {
        self.entry
            .as_deref()
            .or_else(|| self.nodes.first().map(|n| n.id.as_str()))
    }

    pub fn node(&self, id: &str) -> Option<&RuleNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

// 连接定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub from_id: String,
    pub to_id: String,
    pub type_name: String,
}

// 元数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub version: u64,
    pub created_at: i64,
    pub updated_at: i64,
}
