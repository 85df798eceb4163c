use serde_json::Value;
use crate::actions::ServiceHandler;
use crate::error::BpmnError;
use crate::runtime::context::Context;
use anyhow::{Result, anyhow};
use tracing::info;

#[derive(Debug)]
pub struct LogAction;

impl ServiceHandler for LogAction {
    fn name(&self) -> &str {
        "log"
    }

    fn validate(&self, _params: &Value) -> Result<()> {
        Ok(())
    }

    fn execute(&self, params: Value, ctx: &mut Context<'_>) -> Result<Value> {
        let activity = ctx.activity_id.unwrap_or_default();
        if let Some(msg) = params.get("msg").and_then(|v| v.as_str()) {
            info!(instance_id = %ctx.instance_id, activity, "[LOG] {}", msg);
        } else {
            info!(instance_id = %ctx.instance_id, activity, "[LOG] {:?}", params);
        }
        Ok(Value::Null)
    }
}

#[derive(Debug)]
pub struct AssignAction;

impl ServiceHandler for AssignAction {
    fn name(&self) -> &str {
        "assign"
    }

    fn validate(&self, params: &Value) -> Result<()> {
        match params.get("assignments") {
            None | Some(Value::Array(_)) => Ok(()),
            Some(other) => Err(anyhow!("'assignments' must be a list, got {}", other)),
        }
    }

    fn execute(&self, params: Value, ctx: &mut Context<'_>) -> Result<Value> {
        // 1. Handle "assignments" list
        if let Some(list) = params.get("assignments").and_then(|v| v.as_array()) {
            for item in list {
                if let (Some(k), Some(v)) = (item.get("key").and_then(|s| s.as_str()), item.get("value")) {
                    ctx.set_var(k, v.clone());
                }
            }
        }

        // 2. Handle "value"
        if let Some(val) = params.get("value") {
            Ok(val.clone())
        } else {
            Ok(Value::Null)
        }
    }
}

/// Fails on purpose: with `error_code` as a BPMN error, otherwise as a technical failure.
#[derive(Debug)]
pub struct FailAction;

impl ServiceHandler for FailAction {
    fn name(&self) -> &str {
        "fail"
    }

    fn validate(&self, _params: &Value) -> Result<()> {
        Ok(())
    }

    fn execute(&self, params: Value, _ctx: &mut Context<'_>) -> Result<Value> {
        if let Some(code) = params.get("error_code").and_then(|v| v.as_str()) {
            return Err(BpmnError::new(code).into());
        }
        let message = params
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("service failed");
        Err(anyhow!("{}", message))
    }
}
