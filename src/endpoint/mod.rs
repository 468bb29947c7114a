//! 输入端点
//!
//! 端点把外部请求转换为消息并交给规则链处理。路由表保存 `来源 -> 规则链`
//! 的映射, 删除路由只打上禁用标记, 重启端点时重放所有仍启用的路由。

pub mod rest;

pub use rest::{RestConfig, RestEndpoint, RestServer, REST_ENDPOINT_TYPE};

use crate::types::RuleError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// 路由目标
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterTo {
    pub chain_id: String,
    /// 起始节点, 缺省为规则链入口
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// 同步等待规则链处理结果
    #[serde(default)]
    pub wait: bool,
}

impl RouterTo {
    pub fn new(chain_id: &str) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            node_id: None,
            wait: false,
        }
    }

    pub fn with_node(mut self, node_id: &str) -> Self {
        self.node_id = Some(node_id.to_string());
        self
    }

    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }
}

/// 路由: 来源 (如 HTTP 路径) 到规则链的映射
#[derive(Debug, Default)]
pub struct Router {
    id: String,
    from: String,
    to: Option<RouterTo>,
    params: Vec<String>,
    disabled: AtomicBool,
    /// 添加到路由表时生成, 重放时保留
    registration: Uuid,
}

impl Router {
    pub fn new(from: &str) -> Self {
        Self {
            from: from.to_string(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn to(mut self, to: RouterTo) -> Self {
        self.to = Some(to);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn target(&self) -> Option<&RouterTo> {
        self.to.as_ref()
    }

    /// 注册时的参数, HTTP 端点为请求方法
    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn registration(&self) -> Uuid {
        self.registration
    }

    /// 复制一份启用状态的路由, 用于重放
    pub fn replay(&self) -> Router {
        Router {
            id: self.id.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
            params: self.params.clone(),
            disabled: AtomicBool::new(false),
            registration: self.registration,
        }
    }
}

/// 端点的路由表
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<Vec<Arc<Router>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加路由, 返回路由 ID 以及被替换的旧路由
    ///
    /// 未指定 ID 时使用 `METHOD:path`; 同 ID 的路由被替换。
    pub async fn add(
        &self,
        router: Router,
        params: &[&str],
    ) -> Result<(String, Option<Arc<Router>>), RuleError> {
        let (router, previous) = self.insert(router, params).await?;
        Ok((router.id.clone(), previous))
    }

    /// 同 [`RouteTable::add`], 返回表中保存的路由
    pub async fn insert(
        &self,
        mut router: Router,
        params: &[&str],
    ) -> Result<(Arc<Router>, Option<Arc<Router>>), RuleError> {
        if params.is_empty() {
            return Err(RuleError::RouterInvalid(format!(
                "路由 {} 至少需要一个请求方法",
                router.from
            )));
        }
        if router.from.is_empty() {
            return Err(RuleError::RouterInvalid("路由来源不能为空".into()));
        }
        if router.to.is_none() {
            return Err(RuleError::RouterInvalid(format!(
                "路由 {} 未配置目标规则链",
                router.from
            )));
        }

        router.params = params.iter().map(|p| p.trim().to_uppercase()).collect();
        if router.id.is_empty() {
            router.id = format!("{}:{}", router.params.join(","), router.from);
        }
        router.disabled = AtomicBool::new(false);
        if router.registration.is_nil() {
            router.registration = Uuid::new_v4();
        }

        let router = Arc::new(router);
        let mut routes = self.routes.write().await;
        let previous = match routes.iter_mut().find(|r| r.id == router.id) {
            Some(slot) => Some(std::mem::replace(slot, router.clone())),
            None => {
                routes.push(router.clone());
                None
            }
        };
        debug!(route = %router.id, replaced = previous.is_some(), "添加路由");
        Ok((router, previous))
    }

    /// 禁用路由; 路由不存在或已禁用时返回错误
    pub async fn remove(&self, id: &str) -> Result<Arc<Router>, RuleError> {
        let routes = self.routes.read().await;
        match routes.iter().find(|r| r.id == id) {
            Some(route) if !route.disabled.swap(true, Ordering::AcqRel) => Ok(route.clone()),
            _ => Err(RuleError::RouterNotFound(id.to_string())),
        }
    }

    /// 查找启用的路由
    pub async fn get(&self, id: &str) -> Option<Arc<Router>> {
        self.routes
            .read()
            .await
            .iter()
            .find(|r| r.id == id && !r.is_disabled())
            .cloned()
    }

    pub async fn enabled(&self) -> Vec<Arc<Router>> {
        self.routes
            .read()
            .await
            .iter()
            .filter(|r| !r.is_disabled())
            .cloned()
            .collect()
    }

    /// 清空路由表, 返回清空前仍启用的路由; 已禁用的路由在此丢弃
    pub async fn reset(&self) -> Vec<Arc<Router>> {
        let mut routes = self.routes.write().await;
        std::mem::take(&mut *routes)
            .into_iter()
            .filter(|r| !r.is_disabled())
            .collect()
    }

    /// 仅当表中的路由仍是指定登记号时删除, 路由已被他人替换时保留
    pub async fn delete_registered(&self, id: &str, registration: Uuid) -> Option<Arc<Router>> {
        let mut routes = self.routes.write().await;
        let index = routes
            .iter()
            .position(|r| r.id == id && r.registration == registration)?;
        Some(routes.remove(index))
    }

    /// 撤销一次 `add`
    pub async fn restore(&self, id: &str, previous: Option<Arc<Router>>) {
        let mut routes = self.routes.write().await;
        let index = routes.iter().position(|r| r.id == id);
        match (index, previous) {
            (Some(index), Some(previous)) => routes[index] = previous,
            (Some(index), None) => {
                routes.remove(index);
            }
            (None, Some(previous)) => routes.push(previous),
            (None, None) => {}
        }
    }

    /// 路由总数, 包括已禁用的路由
    pub async fn len(&self) -> usize {
        self.routes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.routes.read().await.is_empty()
    }
}

/// 输入端点
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn id(&self) -> &str;

    async fn start(&self) -> Result<(), RuleError>;

    /// 添加路由, 返回路由 ID
    async fn add_router(&self, router: Router, params: &[&str]) -> Result<String, RuleError>;

    async fn remove_router(&self, id: &str) -> Result<(), RuleError>;

    /// 重建服务并重放所有启用的路由
    async fn restart(&self) -> Result<(), RuleError>;

    async fn close(&self) -> Result<(), RuleError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn route(from: &str) -> Router {
        Router::new(from).to(RouterTo::new("chain"))
    }

    #[tokio::test]
    async fn assigns_method_path_id() {
        let table = RouteTable::new();
        let (id, previous) = table.add(route("/api/msg"), &["post"]).await.unwrap();
        assert_eq!(id, "POST:/api/msg");
        assert!(previous.is_none());

        let stored = table.get(&id).await.unwrap();
        assert_eq!(stored.params(), &["POST".to_string()]);
    }

    #[tokio::test]
    async fn rejects_route_without_method_or_target() {
        let table = RouteTable::new();
        assert!(matches!(
            table.add(route("/a"), &[]).await,
            Err(RuleError::RouterInvalid(_))
        ));
        assert!(matches!(
            table.add(Router::new("/a"), &["GET"]).await,
            Err(RuleError::RouterInvalid(_))
        ));
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn replaces_route_with_same_id() {
        let table = RouteTable::new();
        table.add(route("/a"), &["GET"]).await.unwrap();
        let replacement = Router::new("/a").to(RouterTo::new("other"));
        let (_, previous) = table.add(replacement, &["GET"]).await.unwrap();

        assert_eq!(previous.unwrap().target().unwrap().chain_id, "chain");
        assert_eq!(table.len().await, 1);
        assert_eq!(table.get("GET:/a").await.unwrap().target().unwrap().chain_id, "other");
    }

    #[tokio::test]
    async fn remove_is_soft_and_not_repeatable() {
        let table = RouteTable::new();
        let (id, _) = table.add(route("/a"), &["GET"]).await.unwrap();

        table.remove(&id).await.unwrap();
        assert!(table.get(&id).await.is_none());
        assert_eq!(table.len().await, 1);

        assert!(matches!(table.remove(&id).await, Err(RuleError::RouterNotFound(_))));
        assert!(matches!(table.remove("GET:/missing").await, Err(RuleError::RouterNotFound(_))));
    }

    #[tokio::test]
    async fn reset_drops_disabled_routes() {
        let table = RouteTable::new();
        let (a, _) = table.add(route("/a"), &["GET"]).await.unwrap();
        let (b, _) = table.add(route("/b"), &["POST"]).await.unwrap();
        table.remove(&a).await.unwrap();

        let kept: Vec<_> = table.reset().await.iter().map(|r| r.id().to_string()).collect();
        assert_eq!(kept, vec![b]);
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn registered_delete_skips_replaced_route() {
        let table = RouteTable::new();
        let (mine, _) = table.insert(route("/a"), &["GET"]).await.unwrap();
        let (theirs, _) = table.insert(route("/a"), &["GET"]).await.unwrap();
        assert_ne!(mine.registration(), theirs.registration());

        assert!(table.delete_registered("GET:/a", mine.registration()).await.is_none());
        assert!(table.get("GET:/a").await.is_some());

        let replayed = theirs.replay();
        assert_eq!(replayed.registration(), theirs.registration());
        table.reset().await;
        table.insert(replayed, &["GET"]).await.unwrap();
        assert!(table
            .delete_registered("GET:/a", theirs.registration())
            .await
            .is_some());
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn restore_undoes_add() {
        let table = RouteTable::new();
        let (id, previous) = table.add(route("/a"), &["GET"]).await.unwrap();
        table.restore(&id, previous).await;
        assert!(table.is_empty().await);
    }
}
