use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// 消息负载的内容类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub msg_type: String,
    #[serde(default)]
    pub data_type: DataType,
    pub metadata: HashMap<String, String>,
    pub data: Value,
    pub timestamp: i64,
}

impl Message {
    pub fn new(msg_type: &str, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            msg_type: msg_type.to_string(),
            data_type: DataType::Json,
            metadata: HashMap::new(),
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 文本消息, 负载按原样保存为字符串
    pub fn text(msg_type: &str, text: impl Into<String>) -> Self {
        Self {
            data_type: DataType::Text,
            ..Self::new(msg_type, Value::String(text.into()))
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn put_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// 负载的字符串形式: 文本消息返回原文, JSON 消息返回序列化结果
    pub fn data_as_string(&self) -> String {
        match (&self.data_type, &self.data) {
            (DataType::Text, Value::String(s)) => s.clone(),
            (_, data) => data.to_string(),
        }
    }

    /// 替换负载, 根据值推断内容类型
    pub fn set_data(&mut self, data: Value) {
        self.data_type = match data {
            Value::String(_) => DataType::Text,
            _ => DataType::Json,
        };
        self.data = data;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_message_keeps_raw_payload() {
        let msg = Message::text("TELEMETRY", "AA").with_metadata("deviceId", "d1");
        assert_eq!(msg.data_type, DataType::Text);
        assert_eq!(msg.data_as_string(), "AA");
        assert_eq!(msg.get_metadata("deviceId"), Some("d1"));
        assert_eq!(msg.get_metadata("missing"), None);
    }

    #[test]
    fn set_data_infers_type() {
        let mut msg = Message::new("TELEMETRY", json!({"temperature": 41}));
        assert_eq!(msg.data_as_string(), r#"{"temperature":41}"#);
        msg.set_data(json!("plain"));
        assert_eq!(msg.data_type, DataType::Text);
        msg.set_data(json!([1, 2]));
        assert_eq!(msg.data_type, DataType::Json);
    }
}
