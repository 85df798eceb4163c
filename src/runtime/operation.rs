use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::definition::ProcessDefinition;
use crate::runtime::execution::ExecutionId;
use crate::runtime::job::AsyncResumePoint;
use crate::runtime::tree::ExecutionTree;

/// The closed vocabulary of interpreter steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AtomicOperation {
    ProcessStart,
    ProcessEnd,
    ActivityStartCreateScope,
    ActivityStart,
    ActivityExecute,
    ActivityNotifyListenerEnd,
    ActivityEnd,
    ActivityLeave,
    ActivityStartConcurrent,
    ActivityStartCancelScope,
    TransitionNotifyListenerEnd,
    TransitionDestroyScope,
    TransitionNotifyListenerTake,
    TransitionCreateScope,
    TransitionNotifyListenerStart,
    TransitionCancelScope,
    DeleteCascade,
    DeleteCascadeFireActivityEnd,
}

impl AtomicOperation {
    pub const ALL: [AtomicOperation; 18] = [
        AtomicOperation::ProcessStart,
        AtomicOperation::ProcessEnd,
        AtomicOperation::ActivityStartCreateScope,
        AtomicOperation::ActivityStart,
        AtomicOperation::ActivityExecute,
        AtomicOperation::ActivityNotifyListenerEnd,
        AtomicOperation::ActivityEnd,
        AtomicOperation::ActivityLeave,
        AtomicOperation::ActivityStartConcurrent,
        AtomicOperation::ActivityStartCancelScope,
        AtomicOperation::TransitionNotifyListenerEnd,
        AtomicOperation::TransitionDestroyScope,
        AtomicOperation::TransitionNotifyListenerTake,
        AtomicOperation::TransitionCreateScope,
        AtomicOperation::TransitionNotifyListenerStart,
        AtomicOperation::TransitionCancelScope,
        AtomicOperation::DeleteCascade,
        AtomicOperation::DeleteCascadeFireActivityEnd,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AtomicOperation::ProcessStart => "process-start",
            AtomicOperation::ProcessEnd => "process-end",
            AtomicOperation::ActivityStartCreateScope => "activity-start-create-scope",
            AtomicOperation::ActivityStart => "activity-start",
            AtomicOperation::ActivityExecute => "activity-execute",
            AtomicOperation::ActivityNotifyListenerEnd => "activity-notify-listener-end",
            AtomicOperation::ActivityEnd => "activity-end",
            AtomicOperation::ActivityLeave => "activity-leave",
            AtomicOperation::ActivityStartConcurrent => "activity-start-concurrent",
            AtomicOperation::ActivityStartCancelScope => "activity-start-cancel-scope",
            AtomicOperation::TransitionNotifyListenerEnd => "transition-notify-listener-end",
            AtomicOperation::TransitionDestroyScope => "transition-destroy-scope",
            AtomicOperation::TransitionNotifyListenerTake => "transition-notify-listener-take",
            AtomicOperation::TransitionCreateScope => "transition-create-scope",
            AtomicOperation::TransitionNotifyListenerStart => "transition-notify-listener-start",
            AtomicOperation::TransitionCancelScope => "transition-cancel-scope",
            AtomicOperation::DeleteCascade => "delete-cascade",
            AtomicOperation::DeleteCascadeFireActivityEnd => "delete-cascade-fire-activity-end",
        }
    }

    /// Whether the operation suspends into an asynchronous continuation job
    /// instead of running when reached through normal flow.
    pub fn is_async(&self, definition: &ProcessDefinition, tree: &ExecutionTree, execution: ExecutionId) -> bool {
        let Some(activity) = tree
            .get(execution)
            .and_then(|e| e.activity.as_deref())
            .and_then(|id| definition.activity(id))
        else {
            return false;
        };
        match self {
            AtomicOperation::ProcessStart
            | AtomicOperation::ActivityStartCreateScope
            | AtomicOperation::TransitionCreateScope => activity.async_before,
            AtomicOperation::TransitionNotifyListenerTake => activity.async_after,
            AtomicOperation::ActivityEnd => activity.async_after && definition.outgoing(&activity.id).is_empty(),
            _ => false,
        }
    }

    /// Resume point stored in the job created when this operation suspends.
    pub fn resume_point(&self, tree: &ExecutionTree, execution: ExecutionId) -> Option<AsyncResumePoint> {
        match self {
            AtomicOperation::ProcessStart => Some(AsyncResumePoint::ProcessStart),
            AtomicOperation::ActivityStartCreateScope => Some(AsyncResumePoint::ActivityStartCreateScope),
            AtomicOperation::TransitionCreateScope => Some(AsyncResumePoint::TransitionCreateScope),
            AtomicOperation::TransitionNotifyListenerTake => tree
                .get(execution)
                .and_then(|e| e.transition.clone())
                .map(AsyncResumePoint::Transition),
            AtomicOperation::ActivityEnd => Some(AsyncResumePoint::ActivityEnd),
            _ => None,
        }
    }

    /// Failures of these operations are first offered to error boundary events.
    pub fn handles_failure_as_bpmn_error(&self) -> bool {
        matches!(
            self,
            AtomicOperation::ActivityStart
                | AtomicOperation::ActivityExecute
                | AtomicOperation::TransitionNotifyListenerStart
        )
    }
}

impl fmt::Display for AtomicOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AtomicOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AtomicOperation::ALL
            .iter()
            .find(|op| op.name() == s)
            .copied()
            .ok_or_else(|| format!("unknown atomic operation '{}'", s))
    }
}
