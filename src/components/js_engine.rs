use crate::types::{Message, RuleError};
use rquickjs::{Context, Runtime};
use serde_json::{json, Value};

/// 包装一个 QuickJS 运行时, 脚本在初始化时编译为函数 `name(msg, metadata, msgType)`
pub(crate) struct JsEngine {
    _runtime: Runtime,
    context: Context,
    func: String,
}

impl JsEngine {
    pub(crate) fn new(func: &str, script: &str) -> Result<Self, RuleError> {
        if script.trim().is_empty() {
            return Err(RuleError::ConfigError("脚本不能为空".into()));
        }
        let runtime =
            Runtime::new().map_err(|e| RuleError::ConfigError(format!("创建JS运行时失败: {}", e)))?;
        let context = Context::full(&runtime)
            .map_err(|e| RuleError::ConfigError(format!("创建JS上下文失败: {}", e)))?;

        let source = format!("function {}(msg, metadata, msgType) {{\n{}\n}}", func, script);
        context
            .with(|ctx| ctx.eval::<(), _>(source))
            .map_err(|e| RuleError::ConfigError(format!("脚本编译失败: {}", e)))?;

        Ok(Self {
            _runtime: runtime,
            context,
            func: func.to_string(),
        })
    }

    /// 以消息调用脚本函数, 返回值经 JSON 往返转换
    pub(crate) fn call(&self, msg: &Message) -> Result<Value, RuleError> {
        let code = format!(
            "JSON.stringify({}({}, {}, {}))",
            self.func,
            msg.data,
            json!(msg.metadata),
            Value::String(msg.msg_type.clone())
        );
        let result: Option<String> = self
            .context
            .with(|ctx| ctx.eval::<Option<String>, _>(code))
            .map_err(|e| RuleError::NodeExecutionError(format!("脚本执行失败: {}", e)))?;

        match result {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| RuleError::NodeExecutionError(format!("脚本结果解析失败: {}", e))),
            None => Ok(Value::Null),
        }
    }
}
