//! `${...}` 占位符替换
//!
//! 初始化时用全局属性、链变量与密钥替换节点配置;
//! 运行时用消息负载与元数据渲染组件字段 (url、命令等)。
//! 未知占位符原样保留。

use crate::types::{ChainScope, Configuration, DataType, Message};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

lazy_static! {
    static ref PLACEHOLDER: Regex =
        Regex::new(r"\$\{\s*([^${}\s]+)\s*\}").expect("placeholder pattern");
}

pub const SCOPE_GLOBAL: &str = "global";
pub const SCOPE_VARS: &str = "vars";
pub const SCOPE_SECRETS: &str = "secrets";

/// 预先判断是否含占位符的模板
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Template {
    raw: String,
    has_var: bool,
}

impl Template {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let has_var = PLACEHOLDER.is_match(&raw);
        Self { raw, has_var }
    }

    pub fn has_var(&self) -> bool {
        self.has_var
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn execute(&self, env: &Value) -> String {
        if self.has_var {
            render(&self.raw, env)
        } else {
            self.raw.clone()
        }
    }
}

/// 用环境替换字符串中的占位符, 支持 `a.b.c` 形式的路径
pub fn render(template: &str, env: &Value) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| match lookup(env, &caps[1]) {
            Some(value) => value_to_string(value),
            None => caps[0].to_string(),
        })
        .into_owned()
}

fn lookup<'a>(env: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(value) = env.get(path) {
        return Some(value);
    }
    let mut current = env;
    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// 初始化阶段的替换环境
pub fn init_env(properties: &HashMap<String, String>, scope: Option<&ChainScope>) -> Value {
    let (vars, secrets) = match scope {
        Some(scope) => (json!(scope.vars), json!(scope.secrets)),
        None => (json!({}), json!({})),
    };
    json!({
        SCOPE_GLOBAL: properties,
        SCOPE_VARS: vars,
        SCOPE_SECRETS: secrets,
    })
}

/// 替换配置中所有字符串值 (包括嵌套对象与数组) 的占位符, 返回新配置
pub fn process_variables(config: &Configuration, env: &Value) -> Configuration {
    config
        .iter()
        .map(|(key, value)| (key.clone(), substitute(value, env)))
        .collect()
}

fn substitute(value: &Value, env: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(render(s, env)),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, env)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, env)))
                .collect::<Map<String, Value>>(),
        ),
        other => other.clone(),
    }
}

/// 运行时渲染环境: 元数据键平铺在顶层, 另有 `msg`、`metadata`、`msgType`、`id`
pub fn message_env(msg: &Message) -> Value {
    let mut env: Map<String, Value> = msg
        .metadata
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    let data = match (msg.data_type, &msg.data) {
        (DataType::Text, Value::String(s)) => {
            serde_json::from_str::<Value>(s).unwrap_or_else(|_| Value::String(s.clone()))
        }
        (_, data) => data.clone(),
    };
    env.insert("msg".into(), data);
    env.insert("metadata".into(), json!(msg.metadata));
    env.insert("msgType".into(), Value::String(msg.msg_type.clone()));
    env.insert("id".into(), Value::String(msg.id.to_string()));
    Value::Object(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn scope() -> ChainScope {
        ChainScope {
            chain_id: "c1".into(),
            vars: HashMap::from([("topic".into(), "sensors".into())]),
            secrets: HashMap::from([("password".into(), "s3cret".into())]),
        }
    }

    #[test]
    fn substitutes_all_scopes_and_keeps_unknown() {
        let props = HashMap::from([("server".to_string(), "127.0.0.1:1883".to_string())]);
        let env = init_env(&props, Some(&scope()));
        let config = json!({
            "server": "${global.server}",
            "topic": "/${vars.topic}/${ vars.topic }",
            "password": "${secrets.password}",
            "other": "${vars.missing}",
            "nested": {"list": ["${vars.topic}", 3]},
            "port": 1883
        });
        let Value::Object(config) = config else { unreachable!() };
        let out = process_variables(&config, &env);
        assert_eq!(
            Value::Object(out),
            json!({
                "server": "127.0.0.1:1883",
                "topic": "/sensors/sensors",
                "password": "s3cret",
                "other": "${vars.missing}",
                "nested": {"list": ["sensors", 3]},
                "port": 1883
            })
        );
    }

    #[test]
    fn renders_message_fields() {
        let msg = Message::new("TELEMETRY", json!({"temperature": 41, "tags": ["a", "b"]}))
            .with_metadata("deviceId", "d1");
        let env = message_env(&msg);
        let tpl = Template::new("/api/${deviceId}/${msg.temperature}/${msg.tags.1}/${msgType}");
        assert!(tpl.has_var());
        assert_eq!(tpl.execute(&env), "/api/d1/41/b/TELEMETRY");
        assert_eq!(render("${metadata.deviceId}", &env), "d1");
    }

    #[test]
    fn text_payload_is_parsed_when_json() {
        let msg = Message::text("T", r#"{"a": 1}"#);
        assert_eq!(render("${msg.a}", &message_env(&msg)), "1");
        let raw = Message::text("T", "AA");
        assert_eq!(render("${msg}", &message_env(&raw)), "AA");
    }

    #[test]
    fn plain_template_is_untouched() {
        let tpl = Template::new("no vars here");
        assert!(!tpl.has_var());
        assert_eq!(tpl.execute(&json!({})), "no vars here");
    }
}
