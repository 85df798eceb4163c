use crate::actions::resolve_params;
use crate::definition::ActivityKind;
use crate::runtime::context::Context;
use crate::runtime::execution::ExecutionId;
use crate::runtime::interpreter::Interpreter;
use crate::runtime::node::ActivityBehavior;
use anyhow::{Result, anyhow};
use serde_json::Value;

/// Invokes the [`ServiceHandler`](crate::actions::ServiceHandler) named by the
/// activity and leaves right away.
#[derive(Debug)]
pub struct ServiceTaskBehavior;

impl ActivityBehavior for ServiceTaskBehavior {
    fn kind(&self) -> ActivityKind {
        ActivityKind::ServiceTask
    }

    fn execute(&self, pvm: &mut Interpreter<'_>, execution: ExecutionId) -> Result<()> {
        let definition = pvm.definition;
        let services = pvm.services;
        let activity = pvm.current_activity(execution)?;
        let handler_name = activity
            .handler
            .as_deref()
            .ok_or_else(|| anyhow!("Service task '{}' has no handler", activity.id))?;
        let handler = services
            .handler(handler_name)
            .ok_or_else(|| anyhow!("Service handler not found: {}", handler_name))?;

        {
            let mut ctx = Context::new(&mut *pvm.tree, definition, execution, Some(&activity.id));

            // 1. Resolve Variables in Params
            let params = resolve_params(&activity.params, &ctx);

            // 2. Execute Logic
            let result = handler.execute(params, &mut ctx)?;

            // 3. Write Output
            if let Some(out_key) = activity.params.get("result_variable").and_then(|v| v.as_str()) {
                ctx.set_var(out_key, result);
            }
        }

        // 4. Leave
        Ok(pvm.leave(execution)?)
    }
}

/// Creates a task record and waits until the task is completed.
#[derive(Debug)]
pub struct UserTaskBehavior;

impl ActivityBehavior for UserTaskBehavior {
    fn kind(&self) -> ActivityKind {
        ActivityKind::UserTask
    }

    fn execute(&self, pvm: &mut Interpreter<'_>, execution: ExecutionId) -> Result<()> {
        let activity = pvm.current_activity(execution)?;
        let name = activity.name.as_deref().unwrap_or(&activity.id);
        pvm.tree.create_task(execution, &activity.id, name);
        Ok(())
    }

    fn signal(&self, pvm: &mut Interpreter<'_>, execution: ExecutionId, _signal: &str, _payload: &Value) -> Result<()> {
        pvm.tree.tasks.retain(|_, t| t.execution != Some(execution));
        Ok(pvm.leave(execution)?)
    }
}

/// Publishes an external task on the activity's topic and waits for its completion.
#[derive(Debug)]
pub struct ExternalTaskBehavior;

impl ActivityBehavior for ExternalTaskBehavior {
    fn kind(&self) -> ActivityKind {
        ActivityKind::ExternalTask
    }

    fn execute(&self, pvm: &mut Interpreter<'_>, execution: ExecutionId) -> Result<()> {
        let activity = pvm.current_activity(execution)?;
        let topic = activity.topic.as_deref().unwrap_or(&activity.id);
        pvm.tree.create_external_task(execution, &activity.id, topic);
        Ok(())
    }

    fn signal(&self, pvm: &mut Interpreter<'_>, execution: ExecutionId, _signal: &str, _payload: &Value) -> Result<()> {
        pvm.tree.external_tasks.retain(|_, t| t.execution != Some(execution));
        Ok(pvm.leave(execution)?)
    }
}
