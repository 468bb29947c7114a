use crate::types::RuleChain;
use std::sync::atomic::{AtomicU64, Ordering};

/// 规则链版本号, 引擎内单调递增
#[derive(Debug, Default)]
pub struct VersionManager {
    current_version: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub version: u64,
    pub timestamp: i64,
}

impl VersionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 生成新版本, 保证大于定义中已有的版本号
    pub fn create_version(&self, chain: &RuleChain) -> Version {
        self.current_version
            .fetch_max(chain.metadata.version, Ordering::SeqCst);
        let version = self.current_version.fetch_add(1, Ordering::SeqCst) + 1;
        Version {
            version,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn get_current_version(&self) -> u64 {
        self.current_version.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_with_version(version: u64) -> RuleChain {
        serde_json::from_value(serde_json::json!({
            "id": "c1",
            "nodes": [],
            "metadata": {"version": version, "created_at": 0, "updated_at": 0}
        }))
        .unwrap()
    }

    #[test]
    fn versions_are_monotonic_and_above_definition() {
        let manager = VersionManager::new();
        let v1 = manager.create_version(&chain_with_version(0));
        let v2 = manager.create_version(&chain_with_version(0));
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
        let v3 = manager.create_version(&chain_with_version(10));
        assert_eq!(v3.version, 11);
        assert_eq!(manager.get_current_version(), 11);
    }
}
