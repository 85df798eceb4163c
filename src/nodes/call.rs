use crate::definition::ActivityKind;
use crate::runtime::context::Context;
use crate::runtime::execution::ExecutionId;
use crate::runtime::interpreter::{Effect, Interpreter};
use crate::runtime::node::ActivityBehavior;
use crate::runtime::operation::AtomicOperation;
use anyhow::{Result, anyhow};
use serde_json::Value;

pub const CALLED_INSTANCE_COMPLETED: &str = "called-instance-completed";

/// Call activity: asks the engine to start the called process with a copy of
/// the visible variables and waits until that instance ends.
#[derive(Debug)]
pub struct CallActivityBehavior;

impl ActivityBehavior for CallActivityBehavior {
    fn kind(&self) -> ActivityKind {
        ActivityKind::CallActivity
    }

    fn execute(&self, pvm: &mut Interpreter<'_>, execution: ExecutionId) -> Result<()> {
        let definition = pvm.definition;
        let activity = pvm.current_activity(execution)?;
        let called = activity
            .called_element
            .as_deref()
            .ok_or_else(|| anyhow!("Call activity '{}' has no called element", activity.id))?;
        let variables = Context::new(&mut *pvm.tree, definition, execution, Some(&activity.id)).get_all_vars();
        let record = pvm.tree.create_called_instance(execution, &activity.id, called);
        pvm.emit(Effect::StartCalledInstance {
            record,
            execution,
            definition_id: called.to_string(),
            variables,
        });
        Ok(())
    }

    fn signal(&self, pvm: &mut Interpreter<'_>, execution: ExecutionId, signal: &str, payload: &Value) -> Result<()> {
        if signal != CALLED_INSTANCE_COMPLETED {
            return Err(anyhow!("Call activity cannot handle signal '{}'", signal));
        }
        if let Some(outputs) = payload.as_object() {
            for (name, value) in outputs {
                pvm.tree.set_variable(execution, name, value.clone());
            }
        }
        pvm.tree.called_instances.retain(|_, r| r.execution != Some(execution));
        pvm.push(execution, AtomicOperation::ActivityLeave);
        Ok(())
    }
}
