use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::runtime::records::RecordId;
use crate::runtime::tree::ExecutionTree;

/// Link from a called process instance back to the call activity that started it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperExecution {
    pub process_instance_id: Uuid,
    pub called_instance: RecordId,
}

/// 流程实例
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: Uuid,
    pub definition_id: String,
    pub business_key: Option<String>,
    pub tree: ExecutionTree,
    pub ended: bool,
    pub super_execution: Option<SuperExecution>,
}

impl ProcessInstance {
    pub fn new(definition_id: &str, business_key: Option<String>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            definition_id: definition_id.to_string(),
            business_key,
            tree: ExecutionTree::new(id, definition_id),
            ended: false,
            super_execution: None,
        }
    }

    /// Syncs `ended` with the state of the root execution.
    pub fn refresh_state(&mut self) {
        self.ended = self.tree.get(self.tree.root()).map(|r| r.is_ended).unwrap_or(true);
    }
}
