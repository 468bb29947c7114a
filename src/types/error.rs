use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("解析失败: {0}")]
    ParseError(String),

    #[error("找不到组件类型: {0}")]
    NodeTypeNotFound(String),

    #[error("节点未初始化: {0}")]
    NodeNotInit(String),

    #[error("节点不存在: {0}")]
    NodeNotFound(String),

    #[error("节点执行失败: {0}")]
    NodeExecutionError(String),

    #[error("节点 {0} 没有上报任何关系")]
    NoRelation(String),

    #[error("规则链未找到: {0}")]
    ChainNotFound(String),

    #[error("循环依赖: {0}")]
    CircularDependency(String),

    #[error("重新加载失败: {0}")]
    ReloadError(String),

    #[error("共享资源初始化超时: {0}")]
    SharedInitTimeout(String),

    #[error("共享资源错误: {0}")]
    SharedResource(String),

    #[error("路由未找到: {0}")]
    RouterNotFound(String),

    #[error("路由无效: {0}")]
    RouterInvalid(String),

    #[error("服务错误: {0}")]
    ServerError(String),

    #[error("不支持的操作: {0}")]
    Unsupported(String),

    #[error("消息处理已取消")]
    Canceled,
}

impl From<serde_json::Error> for RuleError {
    fn from(err: serde_json::Error) -> Self {
        RuleError::ParseError(err.to_string())
    }
}
