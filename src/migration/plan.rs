use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::definition::{ProcessDefinition, ScopeRef};
use crate::error::MigrationError;
use crate::migration::validation;

/// Maps one source activity onto one target activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationInstruction {
    pub source_activity_id: String,
    pub target_activity_id: String,
    /// Take the event trigger (message name, timer duration) from the target activity.
    #[serde(default)]
    pub update_event_trigger: bool,
}

impl MigrationInstruction {
    pub fn new(source_activity_id: &str, target_activity_id: &str) -> Self {
        Self {
            source_activity_id: source_activity_id.to_string(),
            target_activity_id: target_activity_id.to_string(),
            update_event_trigger: false,
        }
    }
}

/// 迁移计划
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub source_definition_id: String,
    pub target_definition_id: String,
    #[serde(default)]
    pub instructions: Vec<MigrationInstruction>,
}

impl MigrationPlan {
    pub fn builder<'a>(source: &'a ProcessDefinition, target: &'a ProcessDefinition) -> MigrationPlanBuilder<'a> {
        MigrationPlanBuilder::new(source, target)
    }

    pub fn instruction_for(&self, source_activity_id: &str) -> Option<&MigrationInstruction> {
        self.instructions
            .iter()
            .find(|i| i.source_activity_id == source_activity_id)
    }

    /// Target of `scope`; the process always maps onto the target process.
    pub fn target_of(&self, scope: &ScopeRef) -> Option<ScopeRef> {
        match scope {
            ScopeRef::Process => Some(ScopeRef::Process),
            ScopeRef::Activity(id) => self
                .instruction_for(id)
                .map(|i| ScopeRef::Activity(i.target_activity_id.clone())),
        }
    }
}

/// Flags applied to every instance removed during a migration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationOptions {
    pub skip_custom_listeners: bool,
    pub skip_io_mappings: bool,
}

pub struct MigrationPlanBuilder<'a> {
    source: &'a ProcessDefinition,
    target: &'a ProcessDefinition,
    instructions: Vec<MigrationInstruction>,
}

impl<'a> MigrationPlanBuilder<'a> {
    pub fn new(source: &'a ProcessDefinition, target: &'a ProcessDefinition) -> Self {
        Self {
            source,
            target,
            instructions: Vec::new(),
        }
    }

    pub fn map_activities(mut self, source_activity_id: &str, target_activity_id: &str) -> Self {
        self.instructions
            .push(MigrationInstruction::new(source_activity_id, target_activity_id));
        self
    }

    /// Sets `update_event_trigger` on the instruction added last.
    pub fn update_event_trigger(mut self) -> Self {
        if let Some(last) = self.instructions.last_mut() {
            last.update_event_trigger = true;
        }
        self
    }

    /// Maps every activity onto the target activity with the same id and
    /// kind, provided their flow scopes are mapped onto each other as well.
    pub fn map_equal_activities(mut self) -> Self {
        let mut mapped: HashSet<String> = self
            .instructions
            .iter()
            .map(|i| i.source_activity_id.clone())
            .collect();
        for activity in &self.source.activities {
            if mapped.contains(&activity.id) {
                continue;
            }
            let Some(candidate) = self.target.activity(&activity.id) else {
                continue;
            };
            if candidate.kind != activity.kind || !self.equal_flow_scopes(&activity.flow_scope(), &candidate.flow_scope())
            {
                continue;
            }
            mapped.insert(activity.id.clone());
            self.instructions
                .push(MigrationInstruction::new(&activity.id, &candidate.id));
        }
        self
    }

    fn equal_flow_scopes(&self, source: &ScopeRef, target: &ScopeRef) -> bool {
        match (source, target) {
            (ScopeRef::Process, ScopeRef::Process) => true,
            (ScopeRef::Activity(s), ScopeRef::Activity(t)) if s == t => {
                match (self.source.activity(s), self.target.activity(t)) {
                    (Some(s), Some(t)) => s.kind == t.kind && self.equal_flow_scopes(&s.flow_scope(), &t.flow_scope()),
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// Validates the instructions against both definitions.
    pub fn build(self) -> Result<MigrationPlan, MigrationError> {
        let plan = MigrationPlan {
            source_definition_id: self.source.id.clone(),
            target_definition_id: self.target.id.clone(),
            instructions: self.instructions,
        };
        validation::validate_plan(&plan, self.source, self.target)?;
        Ok(plan)
    }
}
