use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::definition::ScopeRef;
use crate::error::PvmError;
use crate::runtime::execution::{Execution, ExecutionId};
use crate::runtime::records::{
    CalledInstance, EventSubscription, EventSubscriptionKind, ExternalTask, Incident, Job, JobKind,
    RecordCounts, RecordId, Task, Variable,
};

/// 执行树: arena of executions plus the records they own.
///
/// Parent and child links are ids; [`ExecutionTree::set_parent`] updates both
/// sides in one step. Ids are never reused, so a removed execution that was
/// replaced during tree compaction keeps resolving through
/// [`ExecutionTree::resolve_replaced_by`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTree {
    process_instance_id: Uuid,
    root: ExecutionId,
    executions: BTreeMap<ExecutionId, Execution>,
    replaced_by: BTreeMap<ExecutionId, ExecutionId>,
    next_execution: u64,
    next_record: u64,
    next_activity_instance: u64,

    pub variables: BTreeMap<RecordId, Variable>,
    pub tasks: BTreeMap<RecordId, Task>,
    pub jobs: BTreeMap<RecordId, Job>,
    pub incidents: BTreeMap<RecordId, Incident>,
    pub event_subscriptions: BTreeMap<RecordId, EventSubscription>,
    pub external_tasks: BTreeMap<RecordId, ExternalTask>,
    pub called_instances: BTreeMap<RecordId, CalledInstance>,
    /// Called process instances whose calling execution was removed.
    #[serde(default)]
    pub orphaned_called_instances: Vec<Uuid>,
}

impl ExecutionTree {
    pub fn new(process_instance_id: Uuid, process_definition_id: &str) -> Self {
        let root = ExecutionId(0);
        let mut execution = Execution::new(root, None, process_definition_id);
        execution.is_scope = true;
        execution.is_active = true;
        execution.scope_activity = Some(ScopeRef::Process);
        execution.scope_instance_id = Some(process_instance_id.to_string());

        let mut executions = BTreeMap::new();
        executions.insert(root, execution);

        Self {
            process_instance_id,
            root,
            executions,
            replaced_by: BTreeMap::new(),
            next_execution: 1,
            next_record: 1,
            next_activity_instance: 1,
            variables: BTreeMap::new(),
            tasks: BTreeMap::new(),
            jobs: BTreeMap::new(),
            incidents: BTreeMap::new(),
            event_subscriptions: BTreeMap::new(),
            external_tasks: BTreeMap::new(),
            called_instances: BTreeMap::new(),
            orphaned_called_instances: Vec::new(),
        }
    }

    pub fn process_instance_id(&self) -> Uuid {
        self.process_instance_id
    }

    pub fn root(&self) -> ExecutionId {
        self.root
    }

    pub fn get(&self, id: ExecutionId) -> Option<&Execution> {
        self.executions.get(&id)
    }

    pub fn get_mut(&mut self, id: ExecutionId) -> Option<&mut Execution> {
        self.executions.get_mut(&id)
    }

    pub fn execution(&self, id: ExecutionId) -> Result<&Execution, PvmError> {
        self.executions.get(&id).ok_or(PvmError::ExecutionNotFound(id))
    }

    pub fn execution_mut(&mut self, id: ExecutionId) -> Result<&mut Execution, PvmError> {
        self.executions.get_mut(&id).ok_or(PvmError::ExecutionNotFound(id))
    }

    pub fn contains(&self, id: ExecutionId) -> bool {
        self.executions.contains_key(&id)
    }

    pub fn executions(&self) -> impl Iterator<Item = &Execution> {
        self.executions.values()
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    pub fn parent(&self, id: ExecutionId) -> Option<ExecutionId> {
        self.executions.get(&id).and_then(|e| e.parent)
    }

    pub fn children(&self, id: ExecutionId) -> Vec<ExecutionId> {
        self.executions.get(&id).map(|e| e.children.clone()).unwrap_or_default()
    }

    pub fn non_event_scope_children(&self, id: ExecutionId) -> Vec<ExecutionId> {
        self.children(id)
            .into_iter()
            .filter(|c| self.executions.get(c).map(|e| !e.is_event_scope).unwrap_or(false))
            .collect()
    }

    pub fn event_scope_children(&self, id: ExecutionId) -> Vec<ExecutionId> {
        self.children(id)
            .into_iter()
            .filter(|c| self.executions.get(c).map(|e| e.is_event_scope).unwrap_or(false))
            .collect()
    }

    /// Creates a child that starts at the parent's current activity.
    pub fn create_child(&mut self, parent: ExecutionId) -> ExecutionId {
        let id = ExecutionId(self.next_execution);
        self.next_execution += 1;

        let (definition_id, activity) = match self.executions.get(&parent) {
            Some(p) => (p.process_definition_id.clone(), p.activity.clone()),
            None => (String::new(), None),
        };
        let mut execution = Execution::new(id, Some(parent), &definition_id);
        execution.activity = activity;
        execution.is_active = true;
        self.executions.insert(id, execution);
        if let Some(p) = self.executions.get_mut(&parent) {
            p.children.push(id);
        }
        id
    }

    /// Moves `child` below `parent`, or detaches it when `parent` is `None`.
    pub fn set_parent(&mut self, child: ExecutionId, parent: Option<ExecutionId>) {
        if let Some(old) = self.parent(child) {
            if let Some(p) = self.executions.get_mut(&old) {
                p.children.retain(|c| *c != child);
            }
        }
        if let Some(new) = parent {
            if let Some(p) = self.executions.get_mut(&new) {
                p.children.push(child);
            }
        }
        if let Some(c) = self.executions.get_mut(&child) {
            c.parent = parent;
        }
    }

    /// Removes an execution, its remaining children (event scopes in
    /// particular) and every record it owns.
    pub fn remove(&mut self, id: ExecutionId) {
        let Some(execution) = self.executions.get(&id) else {
            return;
        };
        let children = execution.children.clone();
        let parent = execution.parent;

        for child in children {
            self.remove(child);
        }

        if let Some(parent) = parent {
            if let Some(p) = self.executions.get_mut(&parent) {
                p.children.retain(|c| *c != id);
            }
        }
        self.remove_records_of(id, false);
        self.executions.remove(&id);
    }

    pub(crate) fn remove_records_of(&mut self, id: ExecutionId, keep_variables: bool) {
        let owner = Some(id);
        if !keep_variables {
            self.variables.retain(|_, r| r.execution != owner);
        }
        self.tasks.retain(|_, r| r.execution != owner);
        self.jobs.retain(|_, r| r.execution != owner);
        self.incidents.retain(|_, r| r.execution != owner);
        self.event_subscriptions.retain(|_, r| r.execution != owner);
        self.external_tasks.retain(|_, r| r.execution != owner);

        let orphaned: Vec<Uuid> = self
            .called_instances
            .values()
            .filter(|r| r.execution == owner)
            .filter_map(|r| r.process_instance_id)
            .collect();
        self.orphaned_called_instances.extend(orphaned);
        self.called_instances.retain(|_, r| r.execution != owner);
    }

    pub fn resolve_replaced_by(&self, id: ExecutionId) -> ExecutionId {
        let mut current = id;
        for _ in 0..=self.replaced_by.len() {
            if self.executions.contains_key(&current) {
                return current;
            }
            match self.replaced_by.get(&current) {
                Some(next) => current = *next,
                None => return current,
            }
        }
        current
    }

    /// `replacement` takes over the activity instance and the activity-local
    /// records of `replaced`.
    pub fn replace(&mut self, replacement: ExecutionId, replaced: ExecutionId) {
        let owns_scope_instance = self
            .executions
            .get(&replaced)
            .map(|e| {
                e.activity.is_some()
                    && e.scope_activity.as_ref().and_then(|s| s.activity_id()) == e.activity.as_deref()
            })
            .unwrap_or(false);
        if owns_scope_instance {
            return;
        }
        let activity_instance_id = self
            .executions
            .get_mut(&replaced)
            .and_then(|e| e.activity_instance_id.take());
        if let Some(e) = self.executions.get_mut(&replacement) {
            e.activity_instance_id = activity_instance_id;
        }
        self.move_activity_local_records(replaced, replacement);
    }

    pub fn set_replaced_by(&mut self, replaced: ExecutionId, replacement: ExecutionId) {
        let activity_instance_id = self
            .executions
            .get(&replaced)
            .and_then(|e| e.activity_instance_id.clone());
        if let Some(e) = self.executions.get_mut(&replacement) {
            e.activity_instance_id = activity_instance_id;
        }
        self.move_activity_local_records(replaced, replacement);
        self.replaced_by.insert(replaced, replacement);
    }

    fn move_activity_local_records(&mut self, from: ExecutionId, to: ExecutionId) {
        let (from, to) = (Some(from), Some(to));
        for r in self.tasks.values_mut().filter(|r| r.execution == from) {
            r.execution = to;
        }
        for r in self.jobs.values_mut().filter(|r| r.execution == from) {
            r.execution = to;
        }
        for r in self.incidents.values_mut().filter(|r| r.execution == from) {
            r.execution = to;
        }
        for r in self.external_tasks.values_mut().filter(|r| r.execution == from) {
            r.execution = to;
        }
        for r in self.called_instances.values_mut().filter(|r| r.execution == from) {
            r.execution = to;
        }
        for r in self
            .event_subscriptions
            .values_mut()
            .filter(|r| r.execution == from && r.kind != EventSubscriptionKind::Compensate)
        {
            r.execution = to;
        }
    }

    /// Creates a new concurrent child of a scope execution, expanding the
    /// tree first when it is compacted or has a single scope child.
    pub fn create_concurrent_execution(&mut self, scope: ExecutionId) -> Result<ExecutionId, PvmError> {
        if !self.execution(scope)?.is_scope {
            return Err(PvmError::NotAScope(scope));
        }

        let children = self.non_event_scope_children(scope);
        if children.is_empty() {
            // compacted tree: a replacing child takes over the scope's activity
            let (activity, transition, active) = {
                let s = self.execution(scope)?;
                (s.activity.clone(), s.transition.clone(), s.is_active)
            };
            let replacing = self.create_child(scope);
            {
                let r = self.execution_mut(replacing)?;
                r.is_concurrent = true;
                r.activity = activity;
                r.transition = transition;
                r.is_active = active;
            }
            self.replace(replacing, scope);
            let s = self.execution_mut(scope)?;
            s.activity = None;
            s.transition = None;
            s.is_active = false;
        } else if children.len() == 1 {
            // a single scope child gets wrapped in a concurrent execution
            let child = children[0];
            let wrapper = self.create_child(scope);
            {
                let w = self.execution_mut(wrapper)?;
                w.is_concurrent = true;
                w.is_active = false;
                w.activity = None;
            }
            self.set_parent(child, Some(wrapper));
        }

        let concurrent = self.create_child(scope);
        let c = self.execution_mut(concurrent)?;
        c.is_concurrent = true;
        c.is_active = false;
        c.activity = None;
        Ok(concurrent)
    }

    /// Merges the last remaining concurrent child back into its scope
    /// execution. Returns `true` if the tree was compacted.
    pub fn try_prune_last_concurrent_child(&mut self, scope: ExecutionId) -> bool {
        let children = self.non_event_scope_children(scope);
        if children.len() != 1 {
            return false;
        }
        let last = children[0];
        let Some(last_execution) = self.executions.get(&last) else {
            return false;
        };
        if !last_execution.is_concurrent || last_execution.is_scope {
            return false;
        }

        let activity = last_execution.activity.clone();
        let transition = last_execution.transition.clone();
        let transitions_to_take = last_execution.transitions_to_take.clone();
        let active = last_execution.is_active;
        let grandchildren = last_execution.children.clone();

        if let Some(s) = self.executions.get_mut(&scope) {
            s.activity = activity;
            s.transition = transition;
            s.transitions_to_take = transitions_to_take;
            if !s.is_active && active {
                s.is_active = true;
            }
        }

        for child in grandchildren {
            self.set_parent(child, Some(scope));
        }

        // local variables of the last child overwrite those of the scope
        let moved: Vec<(RecordId, String)> = self
            .variables
            .values()
            .filter(|v| v.execution == Some(last))
            .map(|v| (v.id, v.name.clone()))
            .collect();
        for (id, name) in moved {
            self.variables
                .retain(|other, v| *other == id || !(v.execution == Some(scope) && v.name == name));
            if let Some(v) = self.variables.get_mut(&id) {
                v.execution = Some(scope);
            }
        }

        self.set_replaced_by(last, scope);
        self.remove(last);
        true
    }

    pub fn left_most_leaf(&self, id: ExecutionId) -> ExecutionId {
        let mut leaf = id;
        while let Some(first) = self.executions.get(&leaf).and_then(|e| e.children.first()) {
            leaf = *first;
        }
        leaf
    }

    /// Nearest scope execution at or above `id`.
    pub fn scope_execution(&self, id: ExecutionId) -> Option<ExecutionId> {
        let mut current = Some(id);
        while let Some(c) = current {
            let execution = self.executions.get(&c)?;
            if execution.is_scope {
                return Some(c);
            }
            current = execution.parent;
        }
        None
    }

    /// Nearest execution at or above `from` created for `scope`.
    pub fn find_scope_execution(&self, from: ExecutionId, scope: &ScopeRef) -> Option<ExecutionId> {
        let mut current = Some(from);
        while let Some(c) = current {
            let execution = self.executions.get(&c)?;
            if execution.is_scope && !execution.is_event_scope && execution.scope_activity.as_ref() == Some(scope) {
                return Some(c);
            }
            current = execution.parent;
        }
        None
    }

    pub fn find_executions(&self, activity_id: &str) -> Vec<ExecutionId> {
        self.executions
            .values()
            .filter(|e| e.activity.as_deref() == Some(activity_id))
            .map(|e| e.id)
            .collect()
    }

    pub fn active_activity_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        self.collect_active_activity_ids(self.root, &mut ids);
        ids
    }

    fn collect_active_activity_ids(&self, id: ExecutionId, ids: &mut Vec<String>) {
        let Some(execution) = self.executions.get(&id) else {
            return;
        };
        if execution.is_active {
            if let Some(activity) = &execution.activity {
                ids.push(activity.clone());
            }
        }
        for child in &execution.children {
            self.collect_active_activity_ids(*child, ids);
        }
    }

    pub fn next_activity_instance_id(&mut self, activity_id: &str) -> String {
        let id = format!("{}:{}", activity_id, self.next_activity_instance);
        self.next_activity_instance += 1;
        id
    }

    /// Starts a new instance of the execution's current activity.
    pub fn enter_activity_instance(&mut self, id: ExecutionId) -> Result<String, PvmError> {
        let activity = self.execution(id)?.activity.clone().ok_or(PvmError::NoActivity(id))?;
        let instance_id = self.next_activity_instance_id(&activity);
        let execution = self.execution_mut(id)?;
        let owns_scope = execution.scope_activity.as_ref().and_then(|s| s.activity_id()) == Some(activity.as_str());
        execution.activity_instance_id = Some(instance_id.clone());
        if owns_scope {
            execution.scope_instance_id = Some(instance_id.clone());
        }
        Ok(instance_id)
    }

    pub fn leave_activity_instance(&mut self, id: ExecutionId) {
        if let Some(execution) = self.executions.get_mut(&id) {
            let owns_scope = execution.activity.is_some()
                && execution.scope_activity.as_ref().and_then(|s| s.activity_id()) == execution.activity.as_deref();
            execution.activity_instance_id = None;
            if owns_scope {
                execution.scope_instance_id = None;
            }
        }
    }

    // records ///////////////////////////////////////////////////////////

    pub fn next_record_id(&mut self) -> RecordId {
        let id = RecordId(self.next_record);
        self.next_record += 1;
        id
    }

    fn definition_id_of(&self, id: ExecutionId) -> String {
        self.executions
            .get(&id)
            .map(|e| e.process_definition_id.clone())
            .unwrap_or_default()
    }

    pub fn set_variable_local(&mut self, execution: ExecutionId, name: &str, value: Value) {
        if let Some(var) = self
            .variables
            .values_mut()
            .find(|v| v.execution == Some(execution) && v.name == name)
        {
            var.value = value;
            return;
        }
        let id = self.next_record_id();
        let process_definition_id = self.definition_id_of(execution);
        self.variables.insert(
            id,
            Variable {
                id,
                name: name.to_string(),
                value,
                execution: Some(execution),
                process_definition_id,
            },
        );
    }

    /// Sets a variable where it is already defined, or on the process instance.
    pub fn set_variable(&mut self, execution: ExecutionId, name: &str, value: Value) {
        let mut current = Some(execution);
        while let Some(c) = current {
            if self.variable_local(c, name).is_some() {
                self.set_variable_local(c, name, value);
                return;
            }
            current = self.parent(c);
        }
        let root = self.root;
        self.set_variable_local(root, name, value);
    }

    pub fn variable_local(&self, execution: ExecutionId, name: &str) -> Option<&Value> {
        self.variables
            .values()
            .find(|v| v.execution == Some(execution) && v.name == name)
            .map(|v| &v.value)
    }

    /// Looks a variable up along the parent chain.
    pub fn variable(&self, execution: ExecutionId, name: &str) -> Option<&Value> {
        let mut current = Some(execution);
        while let Some(c) = current {
            if let Some(value) = self.variable_local(c, name) {
                return Some(value);
            }
            current = self.parent(c);
        }
        None
    }

    pub fn variables_local(&self, execution: ExecutionId) -> BTreeMap<String, Value> {
        self.variables
            .values()
            .filter(|v| v.execution == Some(execution))
            .map(|v| (v.name.clone(), v.value.clone()))
            .collect()
    }

    pub fn remove_variable_local(&mut self, execution: ExecutionId, name: &str) {
        self.variables
            .retain(|_, v| !(v.execution == Some(execution) && v.name == name));
    }

    pub fn create_task(&mut self, execution: ExecutionId, activity_id: &str, name: &str) -> RecordId {
        let id = self.next_record_id();
        let process_definition_id = self.definition_id_of(execution);
        self.tasks.insert(
            id,
            Task {
                id,
                activity_id: activity_id.to_string(),
                name: name.to_string(),
                assignee: None,
                execution: Some(execution),
                process_definition_id,
            },
        );
        id
    }

    pub fn create_job(&mut self, execution: ExecutionId, activity_id: &str, kind: JobKind, retries: u32) -> RecordId {
        let id = self.next_record_id();
        let process_definition_id = self.definition_id_of(execution);
        self.jobs.insert(
            id,
            Job {
                id,
                kind,
                activity_id: activity_id.to_string(),
                execution: Some(execution),
                retries,
                exception_message: None,
                process_definition_id,
            },
        );
        id
    }

    pub fn create_incident(
        &mut self,
        execution: ExecutionId,
        activity_id: &str,
        incident_type: &str,
        message: &str,
        job: Option<RecordId>,
    ) -> RecordId {
        let id = self.next_record_id();
        let process_definition_id = self.definition_id_of(execution);
        self.incidents.insert(
            id,
            Incident {
                id,
                incident_type: incident_type.to_string(),
                message: message.to_string(),
                activity_id: activity_id.to_string(),
                execution: Some(execution),
                job,
                process_definition_id,
            },
        );
        id
    }

    pub fn create_event_subscription(
        &mut self,
        execution: ExecutionId,
        kind: EventSubscriptionKind,
        event_name: Option<&str>,
        activity_id: &str,
    ) -> RecordId {
        let id = self.next_record_id();
        let process_definition_id = self.definition_id_of(execution);
        self.event_subscriptions.insert(
            id,
            EventSubscription {
                id,
                kind,
                event_name: event_name.map(str::to_string),
                activity_id: activity_id.to_string(),
                execution: Some(execution),
                configuration: None,
                process_definition_id,
            },
        );
        id
    }

    pub fn create_external_task(&mut self, execution: ExecutionId, activity_id: &str, topic: &str) -> RecordId {
        let id = self.next_record_id();
        let process_definition_id = self.definition_id_of(execution);
        self.external_tasks.insert(
            id,
            ExternalTask {
                id,
                topic: topic.to_string(),
                activity_id: activity_id.to_string(),
                execution: Some(execution),
                process_definition_id,
            },
        );
        id
    }

    pub fn create_called_instance(
        &mut self,
        execution: ExecutionId,
        activity_id: &str,
        called_definition_id: &str,
    ) -> RecordId {
        let id = self.next_record_id();
        self.called_instances.insert(
            id,
            CalledInstance {
                id,
                process_instance_id: None,
                called_definition_id: called_definition_id.to_string(),
                activity_id: activity_id.to_string(),
                execution: Some(execution),
            },
        );
        id
    }

    pub fn jobs_of(&self, execution: ExecutionId) -> Vec<RecordId> {
        self.jobs
            .values()
            .filter(|j| j.execution == Some(execution))
            .map(|j| j.id)
            .collect()
    }

    pub fn subscriptions_of(&self, execution: ExecutionId, kind: EventSubscriptionKind) -> Vec<RecordId> {
        self.event_subscriptions
            .values()
            .filter(|s| s.execution == Some(execution) && s.kind == kind)
            .map(|s| s.id)
            .collect()
    }

    /// Points every execution and record at `process_definition_id`.
    /// Called process instances keep their own definition.
    pub fn set_process_definition(&mut self, process_definition_id: &str) {
        let id = process_definition_id.to_string();
        for e in self.executions.values_mut() {
            e.process_definition_id = id.clone();
        }
        for r in self.variables.values_mut() {
            r.process_definition_id = id.clone();
        }
        for r in self.tasks.values_mut() {
            r.process_definition_id = id.clone();
        }
        for r in self.jobs.values_mut() {
            r.process_definition_id = id.clone();
        }
        for r in self.incidents.values_mut() {
            r.process_definition_id = id.clone();
        }
        for r in self.event_subscriptions.values_mut() {
            r.process_definition_id = id.clone();
        }
        for r in self.external_tasks.values_mut() {
            r.process_definition_id = id.clone();
        }
    }

    pub fn record_counts(&self) -> RecordCounts {
        RecordCounts {
            variables: self.variables.len(),
            tasks: self.tasks.len(),
            jobs: self.jobs.len(),
            incidents: self.incidents.len(),
            event_subscriptions: self.event_subscriptions.len(),
            external_tasks: self.external_tasks.len(),
            called_instances: self.called_instances.len(),
        }
    }

    /// Lists every structural violation of the tree; empty when well formed.
    pub fn check_well_formed(&self) -> Vec<String> {
        let mut violations = Vec::new();

        match self.executions.get(&self.root) {
            Some(root) if root.parent.is_some() => violations.push(format!("root {} has a parent", self.root)),
            None => violations.push(format!("root {} is missing", self.root)),
            _ => {}
        }

        let mut instance_owners: HashMap<&str, ExecutionId> = HashMap::new();
        for execution in self.executions.values() {
            if let Some(parent) = execution.parent {
                match self.executions.get(&parent) {
                    Some(p) => {
                        let occurrences = p.children.iter().filter(|c| **c == execution.id).count();
                        if occurrences != 1 {
                            violations.push(format!(
                                "{} appears {} times among the children of {}",
                                execution.id, occurrences, parent
                            ));
                        }
                    }
                    None => violations.push(format!("{} references missing parent {}", execution.id, parent)),
                }
            } else if execution.id != self.root {
                violations.push(format!("{} is detached from the tree", execution.id));
            }

            let mut seen = HashSet::new();
            for child in &execution.children {
                if !seen.insert(*child) {
                    violations.push(format!("{} lists child {} twice", execution.id, child));
                }
                match self.executions.get(child) {
                    Some(c) if c.parent != Some(execution.id) => violations.push(format!(
                        "{} lists child {} whose parent is {:?}",
                        execution.id, child, c.parent
                    )),
                    None => violations.push(format!("{} lists missing child {}", execution.id, child)),
                    _ => {}
                }
            }

            if execution.is_concurrent {
                let parent_is_scope = execution
                    .parent
                    .and_then(|p| self.executions.get(&p))
                    .map(|p| p.is_scope)
                    .unwrap_or(false);
                if !parent_is_scope {
                    violations.push(format!("concurrent {} is not below a scope execution", execution.id));
                }
            }
            if execution.is_scope {
                let children = self.non_event_scope_children(execution.id);
                if children.len() == 1 && self.executions.get(&children[0]).map(|c| c.is_concurrent).unwrap_or(false) {
                    violations.push(format!("{} has a single concurrent child", execution.id));
                }
            }

            let mut owned: Vec<&str> = Vec::new();
            if let Some(id) = execution.activity_instance_id.as_deref() {
                owned.push(id);
            }
            if let Some(id) = execution.scope_instance_id.as_deref() {
                if !owned.contains(&id) {
                    owned.push(id);
                }
            }
            for instance_id in owned {
                if let Some(other) = instance_owners.insert(instance_id, execution.id) {
                    violations.push(format!(
                        "activity instance {} is owned by {} and {}",
                        instance_id, other, execution.id
                    ));
                }
            }
        }

        let owners = self
            .variables
            .values()
            .map(|r| (r.id, r.execution))
            .chain(self.tasks.values().map(|r| (r.id, r.execution)))
            .chain(self.jobs.values().map(|r| (r.id, r.execution)))
            .chain(self.incidents.values().map(|r| (r.id, r.execution)))
            .chain(self.event_subscriptions.values().map(|r| (r.id, r.execution)))
            .chain(self.external_tasks.values().map(|r| (r.id, r.execution)))
            .chain(self.called_instances.values().map(|r| (r.id, r.execution)));
        for (record, owner) in owners {
            match owner {
                Some(owner) if !self.executions.contains_key(&owner) => {
                    violations.push(format!("record {} references missing execution {}", record, owner))
                }
                None => violations.push(format!("record {} is detached", record)),
                _ => {}
            }
        }

        violations
    }

    /// Indented rendering of the execution tree, one execution per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(self.root, 0, &mut out);
        out
    }

    fn render_into(&self, id: ExecutionId, depth: usize, out: &mut String) {
        let Some(execution) = self.executions.get(&id) else {
            return;
        };
        out.push_str(&"  ".repeat(depth));
        out.push_str(&execution.to_string());
        out.push('\n');
        for child in &execution.children {
            self.render_into(*child, depth + 1, out);
        }
    }
}

impl Index<ExecutionId> for ExecutionTree {
    type Output = Execution;

    fn index(&self, id: ExecutionId) -> &Execution {
        match self.executions.get(&id) {
            Some(execution) => execution,
            None => panic!("execution {} not found", id),
        }
    }
}

impl IndexMut<ExecutionId> for ExecutionTree {
    fn index_mut(&mut self, id: ExecutionId) -> &mut Execution {
        match self.executions.get_mut(&id) {
            Some(execution) => execution,
            None => panic!("execution {} not found", id),
        }
    }
}
