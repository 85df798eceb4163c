use crate::definition::ActivityKind;
use crate::runtime::execution::ExecutionId;
use crate::runtime::interpreter::Interpreter;
use crate::runtime::node::ActivityBehavior;
use crate::runtime::records::EventSubscriptionKind;
use anyhow::Result;
use serde_json::Value;

/// Intermediate message catch event: subscribes and waits for correlation.
#[derive(Debug)]
pub struct MessageCatchEventBehavior;

impl ActivityBehavior for MessageCatchEventBehavior {
    fn kind(&self) -> ActivityKind {
        ActivityKind::MessageCatchEvent
    }

    fn execute(&self, pvm: &mut Interpreter<'_>, execution: ExecutionId) -> Result<()> {
        let activity = pvm.current_activity(execution)?;
        let message = activity.message.as_deref().unwrap_or(&activity.id);
        pvm.tree
            .create_event_subscription(execution, EventSubscriptionKind::Message, Some(message), &activity.id);
        Ok(())
    }

    fn signal(&self, pvm: &mut Interpreter<'_>, execution: ExecutionId, _signal: &str, _payload: &Value) -> Result<()> {
        Ok(pvm.leave(execution)?)
    }
}

/// Boundary events only run once fired; they continue along their outgoing flow.
#[derive(Debug)]
pub struct BoundaryEventBehavior {
    kind: ActivityKind,
}

impl BoundaryEventBehavior {
    pub fn new(kind: ActivityKind) -> Self {
        Self { kind }
    }
}

impl ActivityBehavior for BoundaryEventBehavior {
    fn kind(&self) -> ActivityKind {
        self.kind
    }

    fn execute(&self, pvm: &mut Interpreter<'_>, execution: ExecutionId) -> Result<()> {
        Ok(pvm.leave(execution)?)
    }
}
