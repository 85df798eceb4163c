use std::fmt;

use serde::{Deserialize, Serialize};

use crate::definition::ScopeRef;
use crate::runtime::execution::ExecutionId;
use crate::runtime::tree::ExecutionTree;

/// Snapshot of one activity instance and everything running inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityInstance {
    pub id: String,
    /// Activity id, or the process definition id for the process instance.
    pub activity_id: String,
    pub execution_ids: Vec<ExecutionId>,
    pub child_activity_instances: Vec<ActivityInstance>,
    pub child_transition_instances: Vec<TransitionInstance>,
}

/// An execution parked in an asynchronous continuation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionInstance {
    pub id: String,
    pub activity_id: String,
    pub execution_id: ExecutionId,
}

impl ActivityInstance {
    /// Depth-first search by activity id, this instance included.
    pub fn instances_for_activity(&self, activity_id: &str) -> Vec<&ActivityInstance> {
        let mut found = Vec::new();
        self.collect_instances(activity_id, &mut found);
        found
    }

    fn collect_instances<'a>(&'a self, activity_id: &str, found: &mut Vec<&'a ActivityInstance>) {
        if self.activity_id == activity_id {
            found.push(self);
        }
        for child in &self.child_activity_instances {
            child.collect_instances(activity_id, found);
        }
    }

    pub fn transition_instances_for_activity(&self, activity_id: &str) -> Vec<&TransitionInstance> {
        let mut found: Vec<&TransitionInstance> = self
            .child_transition_instances
            .iter()
            .filter(|t| t.activity_id == activity_id)
            .collect();
        for child in &self.child_activity_instances {
            found.extend(child.transition_instances_for_activity(activity_id));
        }
        found
    }

    pub fn find(&self, id: &str) -> Option<&ActivityInstance> {
        if self.id == id {
            return Some(self);
        }
        self.child_activity_instances.iter().find_map(|c| c.find(id))
    }

    fn render_into(&self, depth: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}{} ({})", "  ".repeat(depth), self.activity_id, self.id)?;
        for child in &self.child_activity_instances {
            child.render_into(depth + 1, f)?;
        }
        for transition in &self.child_transition_instances {
            writeln!(
                f,
                "{}~{} ({})",
                "  ".repeat(depth + 1),
                transition.activity_id,
                transition.id
            )?;
        }
        Ok(())
    }
}

impl fmt::Display for ActivityInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render_into(0, f)
    }
}

impl ExecutionTree {
    /// Derives the activity instance tree. Event-scope executions are left out.
    pub fn activity_instance_tree(&self, process_definition_id: &str) -> ActivityInstance {
        let root = self.root();
        let mut instance = ActivityInstance {
            id: self
                .get(root)
                .and_then(|e| e.scope_instance_id.clone())
                .unwrap_or_else(|| self.process_instance_id().to_string()),
            activity_id: process_definition_id.to_string(),
            execution_ids: vec![root],
            child_activity_instances: Vec::new(),
            child_transition_instances: Vec::new(),
        };
        self.collect_region(root, root, &mut instance);
        instance
    }

    /// Adds what runs inside the scope execution `scope` to `instance`:
    /// leaf instances, transition instances, and nested scope instances.
    fn collect_region(&self, scope: ExecutionId, current: ExecutionId, instance: &mut ActivityInstance) {
        let Some(execution) = self.get(current) else {
            return;
        };
        if execution.is_event_scope {
            return;
        }

        if current != scope && execution.is_scope {
            match (&execution.scope_instance_id, &execution.scope_activity) {
                (Some(scope_instance_id), Some(ScopeRef::Activity(activity_id))) => {
                    let mut child = ActivityInstance {
                        id: scope_instance_id.clone(),
                        activity_id: activity_id.clone(),
                        execution_ids: vec![current],
                        child_activity_instances: Vec::new(),
                        child_transition_instances: Vec::new(),
                    };
                    self.collect_region(current, current, &mut child);
                    instance.child_activity_instances.push(child);
                }
                _ => {
                    self.collect_leaf(current, instance);
                    for child in &execution.children {
                        self.collect_region(scope, *child, instance);
                    }
                }
            }
            return;
        }

        self.collect_leaf(current, instance);
        for child in &execution.children {
            self.collect_region(scope, *child, instance);
        }
    }

    fn collect_leaf(&self, current: ExecutionId, instance: &mut ActivityInstance) {
        let Some(execution) = self.get(current) else {
            return;
        };
        let owns_scope_leaf = execution.activity.is_some()
            && execution.scope_activity.as_ref().and_then(|s| s.activity_id()) == execution.activity.as_deref();
        if let (Some(activity_id), Some(activity_instance_id)) = (&execution.activity, &execution.activity_instance_id) {
            if !owns_scope_leaf {
                instance.child_activity_instances.push(ActivityInstance {
                    id: activity_instance_id.clone(),
                    activity_id: activity_id.clone(),
                    execution_ids: vec![current],
                    child_activity_instances: Vec::new(),
                    child_transition_instances: Vec::new(),
                });
            }
        }
        for job in self.jobs.values() {
            if job.execution == Some(current) && job.is_async_continuation() {
                instance.child_transition_instances.push(TransitionInstance {
                    id: current.to_string(),
                    activity_id: job.activity_id.clone(),
                    execution_id: current,
                });
            }
        }
    }
}
