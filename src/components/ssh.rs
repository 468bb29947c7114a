use crate::shared::{SharedFactory, SharedNode, SharedResource};
use crate::types::{
    EngineConfig, Message, Node, NodeConfiguration, NodeDescriptor, RuleContext, RuleError,
};
use crate::utils::template::{message_env, Template};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use futures::FutureExt;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const SSH_TYPE: &str = "ssh";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// shell 命令, 可以包含 `${...}` 占位符
    pub cmd: String,
    /// 连接空闲超时, 单位秒
    pub inactivity_timeout: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 22,
            username: "root".to_string(),
            password: String::new(),
            cmd: String::new(),
            inactivity_timeout: 300,
        }
    }
}

impl SshConfig {
    fn validate(&self) -> Result<(), RuleError> {
        if self.host.trim().is_empty() || self.port == 0 || self.username.is_empty() || self.password.is_empty() {
            return Err(RuleError::ConfigError("SSH主机、端口、用户名和密码不能为空".into()));
        }
        if self.cmd.trim().is_empty() {
            return Err(RuleError::ConfigError("SSH命令不能为空".into()));
        }
        Ok(())
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host.trim(), self.port)
    }
}

/// 不校验主机密钥
struct AcceptAnyHost;

#[async_trait]
impl client::Handler for AcceptAnyHost {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// 已认证的 SSH 会话, 每条命令打开一个新通道
pub struct SshSession {
    address: String,
    handle: Handle<AcceptAnyHost>,
}

impl SshSession {
    async fn connect(config: SshConfig) -> anyhow::Result<Self> {
        let address = config.address();
        let settings = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(config.inactivity_timeout.max(1))),
            ..Default::default()
        });
        let mut handle = client::connect(settings, address.as_str(), AcceptAnyHost)
            .await
            .map_err(|e| anyhow!("连接SSH主机 {} 失败: {}", address, e))?;
        let authenticated = handle
            .authenticate_password(config.username.as_str(), config.password.as_str())
            .await
            .map_err(|e| anyhow!("SSH认证失败: {}", e))?;
        if !authenticated {
            bail!("SSH主机 {} 拒绝用户 {} 的密码", address, config.username);
        }
        info!(address = %address, "SSH会话已建立");
        Ok(Self { address, handle })
    }

    /// 执行命令, 返回合并后的标准输出与标准错误以及退出码
    pub async fn exec(&self, cmd: &str) -> Result<(String, Option<u32>), RuleError> {
        let failed = |e: russh::Error| RuleError::NodeExecutionError(format!("SSH命令执行失败: {}", e));
        let mut channel = self.handle.channel_open_session().await.map_err(failed)?;
        channel.exec(true, cmd).await.map_err(failed)?;

        let mut output = Vec::new();
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, .. } => output.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                _ => {}
            }
        }
        debug!(address = %self.address, status = ?exit_status, "SSH命令结束");
        Ok((String::from_utf8_lossy(&output).into_owned(), exit_status))
    }
}

#[async_trait]
impl SharedResource for SshSession {
    async fn close(&self) -> Result<(), RuleError> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "zh")
            .await
            .map_err(|e| RuleError::SharedResource(format!("关闭SSH会话 {} 失败: {}", self.address, e)))
    }
}

/// 通过 SSH 执行远程 shell 命令, 输出作为文本负载
///
/// 退出码非零时负载仍为命令输出, 走 Failure。
#[derive(Default)]
pub struct SshNode {
    session: SharedNode<SshSession>,
    cmd: Template,
}

impl SshNode {
    pub fn new() -> Self {
        Self::default()
    }

    fn session_factory(config: &SshConfig) -> SharedFactory<SshSession> {
        let config = config.clone();
        Arc::new(move || SshSession::connect(config.clone()).boxed())
    }

    fn render_cmd(&self, msg: &Message) -> String {
        self.cmd.execute(&message_env(msg))
    }
}

#[async_trait]
impl Node for SshNode {
    fn type_name(&self) -> &str {
        SSH_TYPE
    }

    fn new_instance(&self) -> Box<dyn Node> {
        Box::new(SshNode::new())
    }

    fn get_descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            type_name: SSH_TYPE.to_string(),
            name: "SSH".to_string(),
            description: "通过SSH执行远程shell命令".to_string(),
            relations: vec!["Success".into(), "Failure".into()],
            config_schema: Some(json!({
                "type": "object",
                "required": ["cmd"],
                "properties": {
                    "host": {"type": "string", "minLength": 1},
                    "port": {"type": "integer", "minimum": 1, "maximum": 65535},
                    "username": {"type": "string", "minLength": 1},
                    "cmd": {"type": "string", "minLength": 1}
                }
            })),
        }
    }

    async fn init(&mut self, config: &EngineConfig, configuration: NodeConfiguration) -> Result<(), RuleError> {
        let ssh_config: SshConfig = configuration.decode()?;
        ssh_config.validate()?;
        let init_now = config.settings.node_client_init_now || configuration.init_net_resource;

        self.cmd = Template::new(ssh_config.cmd.clone());
        // 会话为节点私有
        self.session
            .init(config, SSH_TYPE, "", init_now, Self::session_factory(&ssh_config))
            .await
    }

    async fn on_msg(&self, ctx: &RuleContext, msg: Message) -> Result<(), RuleError> {
        let cmd = self.render_cmd(&msg);
        let result = match self.session.get().await {
            Ok(session) => session.exec(&cmd).await,
            Err(e) => Err(e),
        };

        match result {
            Ok((output, status)) => {
                let mut out = msg;
                out.set_data(Value::String(output));
                match status {
                    Some(0) | None => ctx.tell_success(out),
                    Some(code) => ctx.tell_failure(
                        out,
                        RuleError::NodeExecutionError(format!("SSH命令退出码: {}", code)),
                    ),
                }
            }
            Err(e) => {
                // 会话可能已断开, 下一条消息重新连接
                if let Err(close_err) = self.session.invalidate().await {
                    debug!("关闭SSH会话失败: {}", close_err);
                }
                ctx.tell_failure(msg, e)
            }
        }
        Ok(())
    }

    async fn destroy(&self) {
        self.session.release().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RuleNode;
    use pretty_assertions::assert_eq;

    fn configuration(config: Value) -> NodeConfiguration {
        let def = RuleNode::new("shell", SSH_TYPE, config);
        NodeConfiguration {
            values: def.config.clone(),
            self_definition: def,
            chain: None,
            init_net_resource: false,
        }
    }

    #[tokio::test]
    async fn requires_credentials_and_command() {
        let config = EngineConfig::default();

        let mut node = SshNode::new();
        let missing_password = node
            .init(&config, configuration(json!({"cmd": "uptime"})))
            .await;
        assert!(matches!(missing_password, Err(RuleError::ConfigError(_))));

        let mut node = SshNode::new();
        let missing_cmd = node
            .init(&config, configuration(json!({"password": "pw"})))
            .await;
        assert!(matches!(missing_cmd, Err(RuleError::ConfigError(_))));
    }

    #[tokio::test]
    async fn renders_command_and_stays_out_of_pool() {
        let config = EngineConfig::default();
        let mut node = SshNode::new();
        node.init(
            &config,
            configuration(json!({
                "host": "10.0.0.8",
                "password": "pw",
                "cmd": "sh count.sh ${fileName} ${msg.word}"
            })),
        )
        .await
        .unwrap();

        let msg = Message::new("CMD", json!({"word": "hello"})).with_metadata("fileName", "test.txt");
        assert_eq!(node.render_cmd(&msg), "sh count.sh test.txt hello");
        assert!(config.pool.is_empty().await);
        node.destroy().await;
    }

    #[tokio::test]
    async fn unreachable_host_fails_eager_init() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut configuration = configuration(json!({
            "host": "127.0.0.1",
            "port": port,
            "password": "pw",
            "cmd": "uptime"
        }));
        configuration.init_net_resource = true;

        let mut node = SshNode::new();
        let result = node.init(&EngineConfig::default(), configuration).await;
        assert!(matches!(result, Err(RuleError::SharedResource(_))));
    }
}
