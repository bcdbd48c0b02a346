use std::collections::HashSet;

use tracing::{debug, warn};

use crate::providers::WorkItem;
use crate::Event;

/// History events derived from one batch of orchestrator messages.
#[derive(Debug, Default)]
pub struct FoldedMessages {
    /// New events in arrival order, duplicates removed.
    pub events: Vec<Event>,
    /// Reason of the first cancellation request, if any arrived.
    pub cancel: Option<String>,
}

/// Turn orchestrator messages into history events, dropping completions
/// whose id already has an outcome in `history` or earlier in the batch.
pub fn fold_messages(instance: &str, history: &[Event], messages: Vec<WorkItem>) -> FoldedMessages {
    let mut completed: HashSet<u64> = history.iter().filter_map(Event::completion_id).collect();
    let scheduled: HashSet<u64> = history
        .iter()
        .filter_map(|e| match e {
            Event::ActivityScheduled { id, .. } => Some(*id),
            _ => None,
        })
        .collect();
    let mut cancel_seen = history
        .iter()
        .any(|e| matches!(e, Event::OrchestrationCancelRequested { .. }));
    let mut out = FoldedMessages::default();
    for msg in messages {
        let (id, event) = match msg {
            WorkItem::ActivityCompleted { id, result, .. } => (id, Event::ActivityCompleted { id, result }),
            WorkItem::ActivityFailed { id, error, .. } => (id, Event::ActivityFailed { id, error }),
            WorkItem::CancelInstance { reason, .. } => {
                if !cancel_seen {
                    cancel_seen = true;
                    out.cancel = Some(reason.clone());
                    out.events.push(Event::OrchestrationCancelRequested { reason });
                }
                continue;
            }
            // The start signal only triggers a turn
            WorkItem::StartOrchestration { .. } => continue,
            other => {
                warn!(instance, ?other, "unexpected work item on orchestrator queue; dropping");
                continue;
            }
        };
        if !completed.insert(id) {
            debug!(instance, id, "duplicate activity completion discarded");
            continue;
        }
        if !scheduled.contains(&id) {
            // Possible after a crash between publishing work and recording the schedule
            warn!(instance, id, "completion arrived before its schedule was recorded");
        }
        out.events.push(event);
    }
    out
}
