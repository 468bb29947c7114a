use crate::shared::{SharedFactory, SharedNode, SharedResource};
use crate::types::{
    EngineConfig, Message, Node, NodeConfiguration, NodeDescriptor, RuleContext, RuleError,
};
use crate::utils::template::{message_env, Template};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use futures::FutureExt;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const MQTT_CLIENT_TYPE: &str = "mqttClient";

const DEFAULT_PORT: u16 = 1883;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttClientConfig {
    /// 服务器地址 `host:port`, 同一地址的节点共享一个连接
    pub server: String,
    pub username: String,
    pub password: String,
    /// 发布主题, 可以包含 `${...}` 占位符
    pub topic: String,
    pub qos: u8,
    pub clean_session: bool,
    /// 为空时自动生成
    pub client_id: String,
    /// 断线后的重连间隔, 单位秒
    pub max_reconnect_interval: u64,
    pub keep_alive: u64,
}

impl Default for MqttClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:1883".to_string(),
            username: String::new(),
            password: String::new(),
            topic: "/device/msg".to_string(),
            qos: 0,
            clean_session: true,
            client_id: String::new(),
            max_reconnect_interval: 60,
            keep_alive: 30,
        }
    }
}

impl MqttClientConfig {
    /// 拆分服务器地址, 允许 `tcp://`、`mqtt://` 前缀, 缺省端口 1883
    fn host_port(&self) -> Result<(String, u16), RuleError> {
        let server = self
            .server
            .trim()
            .trim_start_matches("tcp://")
            .trim_start_matches("mqtt://");
        if server.is_empty() {
            return Err(RuleError::ConfigError("MQTT服务器地址不能为空".into()));
        }
        match server.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| RuleError::ConfigError(format!("无效的MQTT端口: {}", self.server)))?;
                Ok((host.to_string(), port))
            }
            None => Ok((server.to_string(), DEFAULT_PORT)),
        }
    }

    fn options(&self) -> Result<MqttOptions, RuleError> {
        let (host, port) = self.host_port()?;
        let client_id = if self.client_id.trim().is_empty() {
            format!("rulego-{}", uuid::Uuid::new_v4().simple())
        } else {
            self.client_id.trim().to_string()
        };
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(self.keep_alive.max(5)));
        options.set_clean_session(self.clean_session);
        if !self.username.is_empty() {
            options.set_credentials(self.username.clone(), self.password.clone());
        }
        Ok(options)
    }
}

fn qos_level(qos: u8) -> Result<QoS, RuleError> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(RuleError::ConfigError(format!("无效的QOS: {}", other))),
    }
}

/// 共享的 MQTT 连接, 后台任务驱动事件循环并在断线后重连
pub struct MqttConnection {
    client: AsyncClient,
    stop: CancellationToken,
}

impl MqttConnection {
    async fn connect(server: String, options: MqttOptions, reconnect: Duration) -> anyhow::Result<Self> {
        let (client, mut eventloop) = AsyncClient::new(options, 64);

        // 等待连接确认
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        bail!("MQTT服务器 {} 拒绝连接: {:?}", server, ack.code);
                    }
                    break;
                }
                Ok(_) => continue,
                Err(e) => return Err(anyhow!("连接MQTT服务器 {} 失败: {}", server, e)),
            }
        }
        info!(server = %server, "MQTT客户端已连接");

        let stop = CancellationToken::new();
        let token = stop.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = eventloop.poll() => match event {
                        Ok(event) => debug!(server = %server, "MQTT事件: {:?}", event),
                        Err(e) => {
                            warn!(server = %server, "MQTT连接中断, {:?} 后重连: {}", reconnect, e);
                            tokio::select! {
                                _ = token.cancelled() => break,
                                _ = tokio::time::sleep(reconnect) => {}
                            }
                        }
                    }
                }
            }
            debug!(server = %server, "MQTT事件循环已退出");
        });

        Ok(Self { client, stop })
    }

    pub async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), RuleError> {
        self.client
            .publish(topic, qos, false, payload)
            .await
            .map_err(|e| RuleError::NodeExecutionError(format!("MQTT发布到 {} 失败: {}", topic, e)))
    }
}

#[async_trait]
impl SharedResource for MqttConnection {
    async fn close(&self) -> Result<(), RuleError> {
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT断开连接: {}", e);
        }
        self.stop.cancel();
        Ok(())
    }
}

/// MQTT 推送组件: 把消息负载发布到渲染后的主题
#[derive(Default)]
pub struct MqttClientNode {
    shared: SharedNode<MqttConnection>,
    topic: Template,
    qos: Option<QoS>,
}

impl MqttClientNode {
    pub fn new() -> Self {
        Self::default()
    }

    fn connection_factory(config: &MqttClientConfig) -> Result<SharedFactory<MqttConnection>, RuleError> {
        let config = config.clone();
        config.options()?;
        let reconnect = Duration::from_secs(config.max_reconnect_interval.max(1));
        Ok(Arc::new(move || {
            let server = config.server.clone();
            let options = config.options();
            async move {
                let options = options.map_err(|e| anyhow!(e))?;
                MqttConnection::connect(server, options, reconnect).await
            }
            .boxed()
        }))
    }

    fn render_topic(&self, msg: &Message) -> String {
        self.topic.execute(&message_env(msg))
    }
}

#[async_trait]
impl Node for MqttClientNode {
    fn type_name(&self) -> &str {
        MQTT_CLIENT_TYPE
    }

    fn new_instance(&self) -> Box<dyn Node> {
        Box::new(MqttClientNode::new())
    }

    fn get_descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            type_name: MQTT_CLIENT_TYPE.to_string(),
            name: "MQTT客户端".to_string(),
            description: "把消息发布到MQTT主题".to_string(),
            relations: vec!["Success".into(), "Failure".into()],
            config_schema: Some(json!({
                "type": "object",
                "properties": {
                    "server": {"type": "string", "minLength": 1},
                    "topic": {"type": "string", "minLength": 1},
                    "qos": {"type": "integer", "minimum": 0, "maximum": 2}
                }
            })),
        }
    }

    async fn init(&mut self, config: &EngineConfig, configuration: NodeConfiguration) -> Result<(), RuleError> {
        let mqtt_config: MqttClientConfig = configuration.decode()?;
        let init_now = config.settings.node_client_init_now || configuration.init_net_resource;

        self.qos = Some(qos_level(mqtt_config.qos)?);
        self.topic = Template::new(mqtt_config.topic.clone());
        self.shared
            .init(
                config,
                MQTT_CLIENT_TYPE,
                &mqtt_config.server,
                init_now,
                Self::connection_factory(&mqtt_config)?,
            )
            .await
    }

    async fn on_msg(&self, ctx: &RuleContext, msg: Message) -> Result<(), RuleError> {
        let Some(qos) = self.qos else {
            return Err(RuleError::NodeNotInit(ctx.self_id().to_string()));
        };
        let topic = self.render_topic(&msg);
        let published = match self.shared.get().await {
            Ok(connection) => {
                connection
                    .publish(&topic, qos, msg.data_as_string().into_bytes())
                    .await
            }
            Err(e) => Err(e),
        };
        match published {
            Ok(()) => ctx.tell_success(msg),
            Err(e) => ctx.tell_failure(msg, e),
        }
        Ok(())
    }

    async fn destroy(&self) {
        self.shared.release().await;
    }
}
