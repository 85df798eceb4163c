use std::collections::HashSet;

use crate::definition::{ActivityKind, ProcessDefinition};
use crate::error::MigrationError;
use crate::migration::plan::MigrationPlan;
use crate::runtime::job::AsyncResumePoint;

/// Checks every instruction against both definitions and reports all failures at once.
pub fn validate_plan(
    plan: &MigrationPlan,
    source: &ProcessDefinition,
    target: &ProcessDefinition,
) -> Result<(), MigrationError> {
    let mut failures = Vec::new();

    if plan.source_definition_id != source.id {
        failures.push(format!(
            "plan source definition '{}' does not match '{}'",
            plan.source_definition_id, source.id
        ));
    }
    if plan.target_definition_id != target.id {
        failures.push(format!(
            "plan target definition '{}' does not match '{}'",
            plan.target_definition_id, target.id
        ));
    }

    let mut seen = HashSet::new();
    for instruction in &plan.instructions {
        let source_id = &instruction.source_activity_id;
        let target_id = &instruction.target_activity_id;
        if !seen.insert(source_id.as_str()) {
            failures.push(format!("activity '{}' is mapped more than once", source_id));
            continue;
        }

        let source_activity = source.activity(source_id);
        let target_activity = target.activity(target_id);
        if source_activity.is_none() {
            failures.push(format!("source activity '{}' does not exist", source_id));
        }
        if target_activity.is_none() {
            failures.push(format!("target activity '{}' does not exist", target_id));
        }
        let (Some(source_activity), Some(target_activity)) = (source_activity, target_activity) else {
            continue;
        };

        if source_activity.kind != target_activity.kind {
            failures.push(format!(
                "'{}' ({}) cannot be mapped to '{}' ({})",
                source_id, source_activity.kind, target_id, target_activity.kind
            ));
            continue;
        }

        if instruction.update_event_trigger && !has_event_trigger(target_activity.kind) {
            failures.push(format!(
                "'{}' has no event trigger that could be updated",
                target_id
            ));
        }

        if source_activity.kind.is_boundary_event() {
            let source_host = source_activity.attached_to.as_deref().unwrap_or_default();
            let target_host = target_activity.attached_to.as_deref().unwrap_or_default();
            let host_target = plan
                .instruction_for(source_host)
                .map(|i| i.target_activity_id.as_str());
            if host_target != Some(target_host) {
                failures.push(format!(
                    "boundary event '{}' is attached to '{}', which is not mapped to '{}'",
                    source_id, source_host, target_host
                ));
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(MigrationError::InvalidPlan {
            source_definition: source.id.clone(),
            target_definition: target.id.clone(),
            failures,
        })
    }
}

fn has_event_trigger(kind: ActivityKind) -> bool {
    matches!(
        kind,
        ActivityKind::BoundaryMessage | ActivityKind::BoundaryTimer | ActivityKind::MessageCatchEvent
    )
}

/// Recomputes where an asynchronous continuation resumes once its activity
/// is `target_activity_id` in `target`.
pub fn migrate_resume_point(
    point: &AsyncResumePoint,
    target: &ProcessDefinition,
    target_activity_id: &str,
) -> Result<AsyncResumePoint, String> {
    match point {
        AsyncResumePoint::ProcessStart => Ok(AsyncResumePoint::ProcessStart),
        AsyncResumePoint::ActivityStartCreateScope | AsyncResumePoint::TransitionCreateScope => {
            if target.incoming(target_activity_id).is_empty() {
                Ok(AsyncResumePoint::ActivityStartCreateScope)
            } else {
                Ok(AsyncResumePoint::TransitionCreateScope)
            }
        }
        AsyncResumePoint::ActivityEnd | AsyncResumePoint::Transition(_) => {
            let outgoing = target.outgoing(target_activity_id);
            match outgoing.as_slice() {
                [] => Ok(AsyncResumePoint::ActivityEnd),
                [only] => Ok(AsyncResumePoint::Transition(only.id.clone())),
                _ => {
                    let source_transition = match point {
                        AsyncResumePoint::Transition(id) => Some(id.as_str()),
                        _ => None,
                    };
                    outgoing
                        .iter()
                        .find(|t| Some(t.id.as_str()) == source_transition)
                        .map(|t| AsyncResumePoint::Transition(t.id.clone()))
                        .ok_or_else(|| {
                            format!(
                                "ambiguous resumption point: '{}' has {} outgoing transitions and none matches {}",
                                target_activity_id,
                                outgoing.len(),
                                source_transition.unwrap_or("the source")
                            )
                        })
                }
            }
        }
    }
}
