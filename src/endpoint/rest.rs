//! HTTP 端点
//!
//! 同一监听地址的端点通过资源池共享一个服务器。每次路由变化时重新生成
//! axum 路由并原子替换, 已建立的连接不受影响。

use super::{Endpoint, RouteTable, Router};
use crate::engine::{MsgOptions, RuleEngine, RuleEngineTrait};
use crate::shared::{SharedFactory, SharedNode, SharedResource};
use crate::types::{DataType, Message, RuleError};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Path, Query, Request};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodFilter, MethodRouter};
use futures::FutureExt;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const REST_ENDPOINT_TYPE: &str = "endpoint/http";

const STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    /// 监听地址
    pub server: String,
    /// 允许跨域
    pub allow_cors: bool,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:9090".to_string(),
            allow_cors: false,
        }
    }
}

struct Running {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// 共享的 HTTP 服务器
pub struct RestServer {
    config: RestConfig,
    engine: RuleEngine,
    routes: Arc<RouteTable>,
    surface: Arc<RwLock<axum::Router>>,
    running: Mutex<Option<Running>>,
}

impl RestServer {
    pub fn new(config: RestConfig, engine: RuleEngine) -> Self {
        Self {
            config,
            engine,
            routes: Arc::new(RouteTable::new()),
            surface: Arc::new(RwLock::new(axum::Router::new())),
            running: Mutex::new(None),
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// 启动服务器; 已启动时直接返回监听地址
    pub async fn start(&self) -> Result<SocketAddr, RuleError> {
        let mut running = self.running.lock().await;
        if let Some(r) = running.as_ref() {
            return Ok(r.local_addr);
        }

        self.rebuild_surface().await?;

        let listener = TcpListener::bind(&self.config.server)
            .await
            .map_err(|e| RuleError::ServerError(format!("监听 {} 失败: {}", self.config.server, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RuleError::ServerError(e.to_string()))?;

        let surface = self.surface.clone();
        let app = axum::Router::new().fallback(move |req: Request| {
            let surface = surface.clone();
            async move {
                let router = surface.read().await.clone();
                match router.oneshot(req).await {
                    Ok(response) => response,
                    Err(never) => match never {},
                }
            }
        });

        let shutdown = self.engine.config().shutdown.child_token();
        let signal = shutdown.clone();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await });
            if let Err(e) = server.await {
                error!(addr = %local_addr, "HTTP服务异常退出: {}", e);
            }
        });

        info!(addr = %local_addr, "HTTP端点已启动");
        *running = Some(Running {
            shutdown,
            handle,
            local_addr,
        });
        Ok(local_addr)
    }

    /// 停止服务器, 等待在途请求结束, 超时后强制中止
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.shutdown.cancel();
        let mut handle = running.handle;
        if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
            warn!(addr = %running.local_addr, "HTTP端点停止超时, 强制中止");
            handle.abort();
        }
        info!(addr = %running.local_addr, "HTTP端点已停止");
    }

    pub async fn add_router(&self, router: Router, methods: &[&str]) -> Result<String, RuleError> {
        self.insert_router(router, methods)
            .await
            .map(|route| route.id().to_string())
    }

    /// 添加路由并返回表中保存的路由
    pub async fn insert_router(&self, router: Router, methods: &[&str]) -> Result<Arc<Router>, RuleError> {
        let (route, previous) = self.routes.insert(router, methods).await?;
        if let Err(e) = self.rebuild_surface().await {
            self.routes.restore(route.id(), previous).await;
            if let Err(e) = self.rebuild_surface().await {
                error!("恢复路由失败: {}", e);
            }
            return Err(e);
        }
        Ok(route)
    }

    pub async fn remove_router(&self, id: &str) -> Result<(), RuleError> {
        self.routes.remove(id).await?;
        info!(route = %id, "路由已禁用");
        Ok(())
    }

    /// 彻底删除路由并更新服务; 同 ID 但已被重新添加的路由不受影响
    pub async fn delete_routers(&self, routes: &[(String, Uuid)]) -> Result<(), RuleError> {
        for (id, registration) in routes {
            if self.routes.delete_registered(id, *registration).await.is_none() {
                debug!(route = %id, "路由已被替换, 跳过删除");
            }
        }
        self.rebuild_surface().await
    }

    /// 重启: 停止服务并重新监听, 成功后清空路由表并重放之前启用的路由
    ///
    /// 监听失败时路由表保持不变, 可以再次重启。
    pub async fn restart(&self) -> Result<SocketAddr, RuleError> {
        self.stop().await;
        let local_addr = self.start().await?;
        let previous = self.routes.reset().await;

        for route in previous {
            let methods: Vec<String> = if route.params().is_empty() {
                vec![Method::GET.to_string()]
            } else {
                route.params().to_vec()
            };
            let methods: Vec<&str> = methods.iter().map(String::as_str).collect();
            if let Err(e) = self.add_router(route.replay(), &methods).await {
                warn!(route = %route.id(), "重放路由失败: {}", e);
            }
        }
        Ok(local_addr)
    }

    async fn rebuild_surface(&self) -> Result<(), RuleError> {
        let mut surface = self.surface.write().await;

        let mut by_path: BTreeMap<String, Vec<(MethodFilter, String)>> = BTreeMap::new();
        let mut seen = HashSet::new();
        for route in self.routes.enabled().await {
            let path = to_axum_path(route.from())?;
            for method in route.params() {
                let filter = method_filter(method)?;
                if !seen.insert((path.clone(), method.clone())) {
                    return Err(RuleError::RouterInvalid(format!(
                        "路由冲突: {} {}",
                        method,
                        route.from()
                    )));
                }
                by_path
                    .entry(path.clone())
                    .or_default()
                    .push((filter, route.id().to_string()));
            }
        }

        let routes = self.routes.clone();
        let engine = self.engine.clone();
        let built = std::panic::catch_unwind(AssertUnwindSafe(move || {
            let mut app = axum::Router::new();
            for (path, entries) in by_path {
                let mut method_router = MethodRouter::new();
                for (filter, id) in entries {
                    let handler = RouteHandler {
                        id,
                        routes: routes.clone(),
                        engine: engine.clone(),
                    };
                    method_router = method_router.on(
                        filter,
                        move |method: Method,
                              headers: HeaderMap,
                              params: Option<Path<HashMap<String, String>>>,
                              Query(query): Query<HashMap<String, String>>,
                              body: Bytes| {
                            let handler = handler.clone();
                            async move {
                                let params = params.map(|Path(p)| p).unwrap_or_default();
                                handler.handle(method, headers, params, query, body).await
                            }
                        },
                    );
                }
                app = app.route(&path, method_router);
            }
            app
        }))
        .map_err(|panic| RuleError::RouterInvalid(panic_message(panic.as_ref())))?;

        let mut app = built.layer(TraceLayer::new_for_http());
        if self.config.allow_cors {
            app = app.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );
        }
        *surface = app;
        Ok(())
    }
}

#[async_trait]
impl SharedResource for RestServer {
    async fn close(&self) -> Result<(), RuleError> {
        self.stop().await;
        Ok(())
    }
}

#[derive(Clone)]
struct RouteHandler {
    id: String,
    routes: Arc<RouteTable>,
    engine: RuleEngine,
}

impl RouteHandler {
    async fn handle(
        self,
        method: Method,
        headers: HeaderMap,
        params: HashMap<String, String>,
        query: HashMap<String, String>,
        body: Bytes,
    ) -> Response {
        let Some(route) = self.routes.get(&self.id).await else {
            return StatusCode::NOT_FOUND.into_response();
        };
        let Some(to) = route.target() else {
            return StatusCode::NOT_FOUND.into_response();
        };

        let msg = build_message(route.from(), &method, &headers, params, query, &body);
        let mut opts = MsgOptions::new();
        if let Some(node_id) = &to.node_id {
            opts = opts.start_at(node_id);
        }

        if !to.wait {
            return match self.engine.on_msg(&to.chain_id, msg, opts).await {
                Ok(()) => StatusCode::OK.into_response(),
                Err(e) => error_response(e),
            };
        }

        // 请求被客户端中断时, 处理任务随之被丢弃, 守卫取消等待中的分支
        let token = CancellationToken::new();
        let _guard = token.clone().drop_guard();
        match self
            .engine
            .on_msg_and_wait(&to.chain_id, msg, opts.cancel(token))
            .await
        {
            Ok(outcome) => match outcome.err {
                Some(e) => error_response(e),
                None => message_response(outcome.msg),
            },
            Err(e) => error_response(e),
        }
    }
}

/// GET 请求以查询参数为负载; 其他请求使用请求体, JSON 内容类型解析为 JSON
fn build_message(
    from: &str,
    method: &Method,
    headers: &HeaderMap,
    params: HashMap<String, String>,
    query: HashMap<String, String>,
    body: &Bytes,
) -> Message {
    let mut msg = if *method == Method::GET {
        Message::new(from, serde_json::json!(query))
    } else {
        let is_json = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/json"));
        let text = String::from_utf8_lossy(body).into_owned();
        match is_json.then(|| serde_json::from_str::<Value>(&text).ok()).flatten() {
            Some(data) => Message::new(from, data),
            None => Message::text(from, text),
        }
    };

    for (key, value) in params.into_iter().chain(query) {
        msg.put_metadata(key, value);
    }
    msg
}

fn message_response(msg: Message) -> Response {
    match msg.data_type {
        DataType::Json => axum::Json(msg.data).into_response(),
        DataType::Text => msg.data_as_string().into_response(),
    }
}

fn error_response(err: RuleError) -> Response {
    let status = match &err {
        RuleError::ChainNotFound(_) | RuleError::NodeNotFound(_) | RuleError::RouterNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        RuleError::ConfigError(_) | RuleError::ParseError(_) => StatusCode::BAD_REQUEST,
        RuleError::Canceled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

fn method_filter(method: &str) -> Result<MethodFilter, RuleError> {
    let parsed = Method::from_bytes(method.as_bytes())
        .map_err(|_| RuleError::RouterInvalid(format!("无效的请求方法: {}", method)))?;
    MethodFilter::try_from(parsed)
        .map_err(|e| RuleError::RouterInvalid(format!("不支持的请求方法 {}: {}", method, e)))
}

/// `/users/{id}` 转换为 `/users/:id`, `{*rest}` 转换为 `*rest`
fn to_axum_path(path: &str) -> Result<String, RuleError> {
    if !path.starts_with('/') {
        return Err(RuleError::RouterInvalid(format!("路径必须以 / 开头: {}", path)));
    }
    let segments: Vec<String> = path
        .split('/')
        .map(|segment| match segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            Some(name) => match name.strip_prefix('*') {
                Some(rest) => format!("*{}", rest),
                None => format!(":{}", name),
            },
            None => segment.to_string(),
        })
        .collect();
    Ok(segments.join("/"))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "无效的路由".to_string()
    }
}

/// HTTP 端点, 同一监听地址的端点共享一个 [`RestServer`]
pub struct RestEndpoint {
    id: String,
    shared: SharedNode<RestServer>,
    /// 本端点添加的路由 ID 及登记号
    own_routes: Mutex<Vec<(String, Uuid)>>,
}

impl RestEndpoint {
    pub async fn new(engine: &RuleEngine, config: RestConfig) -> Result<Self, RuleError> {
        let mut shared = SharedNode::default();
        shared
            .init(
                engine.config(),
                REST_ENDPOINT_TYPE,
                &config.server,
                false,
                Self::server_factory(engine, &config),
            )
            .await?;
        Ok(Self {
            id: config.server.clone(),
            shared,
            own_routes: Mutex::new(Vec::new()),
        })
    }

    fn server_factory(engine: &RuleEngine, config: &RestConfig) -> SharedFactory<RestServer> {
        let engine = engine.clone();
        let config = config.clone();
        Arc::new(move || {
            let server = RestServer::new(config.clone(), engine.clone());
            async move { Ok::<_, anyhow::Error>(server) }.boxed()
        })
    }

    pub async fn server(&self) -> Result<Arc<RestServer>, RuleError> {
        self.shared.get().await
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match self.shared.get().await {
            Ok(server) => server.local_addr().await,
            Err(_) => None,
        }
    }
}

#[async_trait]
impl Endpoint for RestEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self) -> Result<(), RuleError> {
        self.server().await?.start().await.map(|_| ())
    }

    async fn add_router(&self, router: Router, params: &[&str]) -> Result<String, RuleError> {
        let route = self.server().await?.insert_router(router, params).await?;
        let id = route.id().to_string();
        let mut own = self.own_routes.lock().await;
        own.retain(|(owned, _)| owned != &id);
        own.push((id.clone(), route.registration()));
        Ok(id)
    }

    async fn remove_router(&self, id: &str) -> Result<(), RuleError> {
        self.server().await?.remove_router(id).await
    }

    async fn restart(&self) -> Result<(), RuleError> {
        self.server().await?.restart().await.map(|_| ())
    }

    /// 删除本端点添加的路由并释放服务器, 最后一个持有者释放时服务器停止
    async fn close(&self) -> Result<(), RuleError> {
        let own = std::mem::take(&mut *self.own_routes.lock().await);
        if self.shared.is_init() {
            if let Ok(server) = self.server().await {
                if let Err(e) = server.delete_routers(&own).await {
                    warn!(endpoint = %self.id, "删除路由失败: {}", e);
                }
            }
        }
        self.shared.release().await;
        Ok(())
    }
}
