use std::collections::BTreeMap;

use serde_json::Value;
use uuid::Uuid;

use crate::definition::ProcessDefinition;
use crate::runtime::execution::ExecutionId;
use crate::runtime::tree::ExecutionTree;

/// 运行时上下文 (Runtime Context)
/// Variable view handed to service handlers and execution listeners. Reads
/// walk up the execution chain, writes land where the variable already lives.
pub struct Context<'a> {
    pub instance_id: Uuid,
    pub definition_id: &'a str,
    pub activity_id: Option<&'a str>,
    tree: &'a mut ExecutionTree,
    execution: ExecutionId,
}

impl<'a> Context<'a> {
    pub fn new(
        tree: &'a mut ExecutionTree,
        definition: &'a ProcessDefinition,
        execution: ExecutionId,
        activity_id: Option<&'a str>,
    ) -> Self {
        Self {
            instance_id: tree.process_instance_id(),
            definition_id: &definition.id,
            activity_id,
            tree,
            execution,
        }
    }

    pub fn execution(&self) -> ExecutionId {
        self.execution
    }

    pub fn get_var(&self, key: &str) -> Option<Value> {
        self.tree.variable(self.execution, key).cloned()
    }

    pub fn set_var(&mut self, key: &str, value: Value) {
        self.tree.set_variable(self.execution, key, value);
    }

    pub fn set_var_local(&mut self, key: &str, value: Value) {
        self.tree.set_variable_local(self.execution, key, value);
    }

    /// All visible variables; nearer executions shadow outer ones.
    pub fn get_all_vars(&self) -> BTreeMap<String, Value> {
        let mut chain = Vec::new();
        let mut current = Some(self.execution);
        while let Some(c) = current {
            chain.push(c);
            current = self.tree.parent(c);
        }
        let mut vars = BTreeMap::new();
        for execution in chain.into_iter().rev() {
            vars.extend(self.tree.variables_local(execution));
        }
        vars
    }
}
