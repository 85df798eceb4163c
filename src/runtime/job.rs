use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::runtime::operation::AtomicOperation;

/// Where an asynchronous continuation resumes the operation chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AsyncResumePoint {
    ProcessStart,
    ActivityStartCreateScope,
    TransitionCreateScope,
    /// Async after, leaving through the given outgoing transition.
    Transition(String),
    /// Async after an activity without outgoing transitions.
    ActivityEnd,
}

const TRANSITION_PREFIX: &str = "transition-notify-listener-take$";

impl AsyncResumePoint {
    pub fn is_async_before(&self) -> bool {
        matches!(
            self,
            AsyncResumePoint::ProcessStart
                | AsyncResumePoint::ActivityStartCreateScope
                | AsyncResumePoint::TransitionCreateScope
        )
    }

    pub fn is_async_after(&self) -> bool {
        !self.is_async_before()
    }

    /// Operation the job performs when it is executed.
    pub fn operation(&self) -> AtomicOperation {
        match self {
            AsyncResumePoint::ProcessStart => AtomicOperation::ProcessStart,
            AsyncResumePoint::ActivityStartCreateScope => AtomicOperation::ActivityStartCreateScope,
            AsyncResumePoint::TransitionCreateScope => AtomicOperation::TransitionCreateScope,
            AsyncResumePoint::Transition(_) => AtomicOperation::TransitionNotifyListenerTake,
            AsyncResumePoint::ActivityEnd => AtomicOperation::ActivityEnd,
        }
    }
}

impl fmt::Display for AsyncResumePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsyncResumePoint::ProcessStart => f.write_str("process-start"),
            AsyncResumePoint::ActivityStartCreateScope => f.write_str("activity-start-create-scope"),
            AsyncResumePoint::TransitionCreateScope => f.write_str("transition-create-scope"),
            AsyncResumePoint::Transition(id) => write!(f, "{}{}", TRANSITION_PREFIX, id),
            AsyncResumePoint::ActivityEnd => f.write_str("activity-end"),
        }
    }
}

impl FromStr for AsyncResumePoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process-start" => Ok(AsyncResumePoint::ProcessStart),
            "activity-start-create-scope" => Ok(AsyncResumePoint::ActivityStartCreateScope),
            "transition-create-scope" => Ok(AsyncResumePoint::TransitionCreateScope),
            "activity-end" => Ok(AsyncResumePoint::ActivityEnd),
            other => other
                .strip_prefix(TRANSITION_PREFIX)
                .filter(|id| !id.is_empty())
                .map(|id| AsyncResumePoint::Transition(id.to_string()))
                .ok_or_else(|| format!("unknown async resume point '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_handler_configuration() {
        let point: AsyncResumePoint = "transition-notify-listener-take$flow1".parse().unwrap();
        assert_eq!(point, AsyncResumePoint::Transition("flow1".to_string()));
        assert_eq!(point.to_string(), "transition-notify-listener-take$flow1");
        assert!(point.is_async_after());
        assert!("transition-notify-listener-take$".parse::<AsyncResumePoint>().is_err());
        assert_eq!(
            "activity-start-create-scope".parse::<AsyncResumePoint>(),
            Ok(AsyncResumePoint::ActivityStartCreateScope)
        );
    }
}
