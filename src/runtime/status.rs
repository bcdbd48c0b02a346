use crate::{ErrorDetails, Event};

/// High-level orchestration status derived from history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    /// Created, first turn not yet run.
    NotStarted,
    Running,
    Completed { output: String },
    Failed { details: ErrorDetails },
    Terminated { reason: String },
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed { .. }
                | OrchestrationStatus::Failed { .. }
                | OrchestrationStatus::Terminated { .. }
        )
    }
}

/// Derive status from a full history. The first terminal event wins.
pub fn status_from_history(history: &[Event]) -> OrchestrationStatus {
    if history.is_empty() {
        return OrchestrationStatus::NotFound;
    }
    for e in history {
        match e {
            Event::OrchestrationCompleted { output } => {
                return OrchestrationStatus::Completed { output: output.clone() };
            }
            Event::OrchestrationFailed { details } => {
                return OrchestrationStatus::Failed {
                    details: details.clone(),
                };
            }
            Event::OrchestrationTerminated { reason } => {
                return OrchestrationStatus::Terminated { reason: reason.clone() };
            }
            _ => {}
        }
    }
    if history.len() == 1 {
        OrchestrationStatus::NotStarted
    } else {
        OrchestrationStatus::Running
    }
}

/// Name and input recorded by `OrchestrationStarted`, if present.
pub fn started_with(history: &[Event]) -> Option<(&str, &str)> {
    history.iter().find_map(|e| match e {
        Event::OrchestrationStarted { name, input } => Some((name.as_str(), input.as_str())),
        _ => None,
    })
}
