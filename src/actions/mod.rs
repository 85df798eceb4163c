use serde_json::Value;
use crate::runtime::context::Context;
use anyhow::Result;
use std::fmt::Debug;

pub mod builtin;

/// 插件接口：服务任务通过名称调用的处理器
/// Runs inside the interpreter, so it must not block on I/O. Returning a
/// [`BpmnError`](crate::error::BpmnError) hands the failure to error boundary events.
pub trait ServiceHandler: Send + Sync + Debug {
    fn name(&self) -> &str;
    fn validate(&self, params: &Value) -> Result<()>;
    fn execute(&self, params: Value, ctx: &mut Context<'_>) -> Result<Value>;
}

/// Replaces `"${name}"` parameter values with the variable `name`.
pub fn resolve_params(params: &Value, ctx: &Context<'_>) -> Value {
    let mut resolved = params.clone();
    if let Some(obj) = resolved.as_object_mut() {
        for (_, v) in obj.iter_mut() {
            let var_name = v
                .as_str()
                .and_then(|s| s.strip_prefix("${"))
                .and_then(|s| s.strip_suffix('}'))
                .map(str::to_string);
            if let Some(var_name) = var_name {
                if let Some(val) = ctx.get_var(&var_name) {
                    *v = val;
                }
            }
        }
    }
    resolved
}
