use std::fmt;

use serde::{Deserialize, Serialize};

use crate::definition::ScopeRef;

/// Stable arena index of an execution inside its [`ExecutionTree`](crate::runtime::tree::ExecutionTree).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(pub u64);

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exec-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ActivityInstanceState {
    #[default]
    Default,
    ScopeComplete,
    Canceled,
}

/// 执行节点: one token of control in a running process instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub parent: Option<ExecutionId>,
    pub children: Vec<ExecutionId>,
    pub process_definition_id: String,

    pub is_scope: bool,
    pub is_concurrent: bool,
    pub is_active: bool,
    pub is_event_scope: bool,
    pub is_ended: bool,

    /// Activity the execution currently executes or waits in.
    pub activity: Option<String>,
    /// Instance of `activity` while the execution is inside it.
    pub activity_instance_id: Option<String>,
    pub transition: Option<String>,
    pub transitions_to_take: Vec<String>,
    /// Activity started by the concurrent and cancel-scope start operations.
    pub next_activity: Option<String>,

    /// Scope this execution was created for; only set on scope executions.
    pub scope_activity: Option<ScopeRef>,
    /// Activity instance of `scope_activity`; cleared once that instance is left.
    pub scope_instance_id: Option<String>,

    pub activity_instance_state: ActivityInstanceState,
    pub delete_root: bool,
    pub delete_reason: Option<String>,
    pub skip_custom_listeners: bool,
    pub skip_io_mappings: bool,
}

impl Execution {
    pub(crate) fn new(id: ExecutionId, parent: Option<ExecutionId>, process_definition_id: &str) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            process_definition_id: process_definition_id.to_string(),
            is_scope: false,
            is_concurrent: false,
            is_active: false,
            is_event_scope: false,
            is_ended: false,
            activity: None,
            activity_instance_id: None,
            transition: None,
            transitions_to_take: Vec::new(),
            next_activity: None,
            scope_activity: None,
            scope_instance_id: None,
            activity_instance_state: ActivityInstanceState::Default,
            delete_root: false,
            delete_reason: None,
            skip_custom_listeners: false,
            skip_io_mappings: false,
        }
    }

    pub fn is_process_instance(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_canceled(&self) -> bool {
        self.activity_instance_state == ActivityInstanceState::Canceled
    }

    pub fn is_complete_scope(&self) -> bool {
        self.activity_instance_state == ActivityInstanceState::ScopeComplete
    }

    pub fn activity_id(&self) -> Option<&str> {
        self.activity.as_deref()
    }
}

impl fmt::Display for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        if let Some(activity) = &self.activity {
            write!(f, " @{}", activity)?;
        }
        let mut flags = Vec::new();
        if self.is_scope {
            flags.push("scope");
        }
        if self.is_concurrent {
            flags.push("concurrent");
        }
        if self.is_event_scope {
            flags.push("event-scope");
        }
        if self.is_active {
            flags.push("active");
        }
        if !flags.is_empty() {
            write!(f, " [{}]", flags.join(","))?;
        }
        Ok(())
    }
}
