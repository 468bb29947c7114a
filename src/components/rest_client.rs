use crate::types::{
    EngineConfig, Message, Node, NodeConfiguration, NodeDescriptor, RuleContext, RuleError,
};
use crate::utils::template::{message_env, Template};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestClientConfig {
    /// 请求地址, 可以包含 `${...}` 占位符
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub timeout_ms: u64,
    /// 不发送请求体
    pub without_request_body: bool,
}

impl Default for RestClientConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost".to_string(),
            method: "POST".to_string(),
            headers: HashMap::from([("Content-Type".to_string(), "application/json".to_string())]),
            timeout_ms: 5000,
            without_request_body: false,
        }
    }
}

pub const STATUS_METADATA_KEY: &str = "status";
pub const STATUS_CODE_METADATA_KEY: &str = "statusCode";

/// HTTP 调用组件: 2xx 响应走 Success, 其余响应或网络错误走 Failure
#[derive(Default)]
pub struct RestClientNode {
    url: Template,
    method: Option<Method>,
    headers: Vec<(String, Template)>,
    without_request_body: bool,
    client: Option<Client>,
}

impl RestClientNode {
    pub fn new() -> Self {
        Self::default()
    }

    async fn make_request(&self, client: &Client, method: &Method, msg: &Message) -> Result<(u16, Message), RuleError> {
        let env = message_env(msg);
        let url = self.url.execute(&env);

        let mut request = client.request(method.clone(), &url);

        // 添加请求头
        for (key, value) in &self.headers {
            request = request.header(key, value.execute(&env));
        }

        if !self.without_request_body && ![Method::GET, Method::DELETE, Method::HEAD].contains(method) {
            request = request.body(msg.data_as_string());
        }

        // 发送请求
        let response = request
            .send()
            .await
            .map_err(|e| RuleError::NodeExecutionError(format!("HTTP请求失败: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RuleError::NodeExecutionError(format!("读取响应失败: {}", e)))?;

        let mut out = msg.clone();
        out.set_data(serde_json::from_str::<Value>(&body).unwrap_or(Value::String(body)));
        out.put_metadata(STATUS_METADATA_KEY, status.to_string());
        out.put_metadata(STATUS_CODE_METADATA_KEY, status.as_u16().to_string());
        Ok((status.as_u16(), out))
    }
}

#[async_trait]
impl Node for RestClientNode {
    fn type_name(&self) -> &str {
        "restApiCall"
    }

    fn new_instance(&self) -> Box<dyn Node> {
        Box::new(RestClientNode::new())
    }

    fn get_descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            type_name: "restApiCall".to_string(),
            name: "HTTP客户端".to_string(),
            description: "调用外部REST接口".to_string(),
            relations: vec!["Success".into(), "Failure".into()],
            config_schema: Some(json!({
                "type": "object",
                "required": ["url"],
                "properties": {
                    "url": {"type": "string", "minLength": 1},
                    "method": {"type": "string"},
                    "timeout_ms": {"type": "integer", "minimum": 0}
                }
            })),
        }
    }

    async fn init(&mut self, _config: &EngineConfig, configuration: NodeConfiguration) -> Result<(), RuleError> {
        let config: RestClientConfig = configuration.decode()?;

        let method = config
            .method
            .to_uppercase()
            .parse::<Method>()
            .map_err(|e| RuleError::ConfigError(format!("无效的HTTP方法 {}: {}", config.method, e)))?;

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| RuleError::ConfigError(format!("创建HTTP客户端失败: {}", e)))?;

        self.url = Template::new(config.url);
        self.method = Some(method);
        self.headers = config
            .headers
            .into_iter()
            .map(|(k, v)| (k, Template::new(v)))
            .collect();
        self.without_request_body = config.without_request_body;
        self.client = Some(client);
        Ok(())
    }

    async fn on_msg(&self, ctx: &RuleContext, msg: Message) -> Result<(), RuleError> {
        let (Some(client), Some(method)) = (&self.client, &self.method) else {
            return Err(RuleError::NodeNotInit(ctx.self_id().to_string()));
        };

        match self.make_request(client, method, &msg).await {
            Ok((status, out)) if (200..300).contains(&status) => ctx.tell_success(out),
            Ok((status, out)) => ctx.tell_failure(
                out,
                RuleError::NodeExecutionError(format!("HTTP请求返回错误状态码: {}", status)),
            ),
            Err(e) => ctx.tell_failure(msg, e),
        }
        Ok(())
    }
}
