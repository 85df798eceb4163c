pub mod action;
pub mod call;
pub mod common;
pub mod event;
pub mod flow;

use std::sync::Arc;

use crate::definition::ActivityKind;
use crate::runtime::node::ActivityBehavior;

/// One behavior for every [`ActivityKind`].
pub fn standard_behaviors() -> Vec<Arc<dyn ActivityBehavior>> {
    vec![
        Arc::new(common::StartEventBehavior),
        Arc::new(common::EndEventBehavior),
        Arc::new(common::TerminateEndEventBehavior),
        Arc::new(common::TaskBehavior),
        Arc::new(action::UserTaskBehavior),
        Arc::new(action::ServiceTaskBehavior),
        Arc::new(action::ExternalTaskBehavior),
        Arc::new(flow::SubProcessBehavior),
        Arc::new(call::CallActivityBehavior),
        Arc::new(flow::ParallelGatewayBehavior),
        Arc::new(event::MessageCatchEventBehavior),
        Arc::new(event::BoundaryEventBehavior::new(ActivityKind::BoundaryMessage)),
        Arc::new(event::BoundaryEventBehavior::new(ActivityKind::BoundaryTimer)),
        Arc::new(event::BoundaryEventBehavior::new(ActivityKind::BoundaryError)),
    ]
}
