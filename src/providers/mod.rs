use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{Event, SequencedEvent};

pub mod error;
pub mod fs;
pub mod in_memory;

pub use error::ProviderError;

/// Default time a dequeued item stays invisible before it is redelivered.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
/// Default upper bound on events per instance history.
pub const DEFAULT_HISTORY_CAP: usize = 10_000;

/// Messages moved between the dispatcher and the activity workers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkItem {
    /// A new instance is ready for its first turn.
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
    },
    /// Run one activity invocation.
    ActivityExecute {
        instance: String,
        id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted { instance: String, id: u64, result: String },
    ActivityFailed { instance: String, id: u64, error: String },
    /// Request termination of a running instance.
    CancelInstance { instance: String, reason: String },
}

impl WorkItem {
    /// Instance the message belongs to.
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::CancelInstance { instance, .. } => instance,
        }
    }
}

/// Which queue a work item lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueKind {
    /// Messages that trigger a replay turn for an instance.
    Orchestrator,
    /// Activity executions.
    Worker,
}

/// All visible orchestrator messages for one instance, locked together.
/// While the batch is outstanding no other dispatcher can fetch messages
/// for the same instance.
#[derive(Debug, Clone)]
pub struct OrchestrationBatch {
    pub instance: String,
    pub messages: Vec<WorkItem>,
    pub lock_token: String,
}

/// Durable per-instance history plus the two work queues.
///
/// Implementations must serialize writers per instance, assign sequence
/// numbers 1, 2, 3... in append order and discard duplicate completions so
/// that at-least-once delivery stays idempotent in history.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create an instance: writes `OrchestrationStarted` at sequence 1 and
    /// enqueues `StartOrchestration` in one step. Fails if it already exists.
    async fn create_instance(&self, instance: &str, orchestration: &str, input: &str) -> Result<(), ProviderError>;

    /// Full history with sequence numbers. Unknown instances read as empty.
    async fn read_sequenced(&self, instance: &str) -> Result<Vec<SequencedEvent>, ProviderError>;

    /// Full history, swallowing read errors as an empty history.
    async fn read(&self, instance: &str) -> Vec<Event> {
        self.read_sequenced(instance)
            .await
            .map(|evs| evs.into_iter().map(|e| e.event).collect())
            .unwrap_or_default()
    }

    /// Append events and return the sequence number of the last event in
    /// history afterwards. Duplicate completions and anything after a
    /// terminal event are dropped. Terminal events do not count against the
    /// history cap, so an instance at the cap can still be failed.
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<u64, ProviderError>;

    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError>;

    async fn list_instances(&self) -> Vec<String>;

    /// Produce a human-readable dump of all stored histories.
    async fn dump_all_pretty(&self) -> String {
        let mut out = String::new();
        for inst in self.list_instances().await {
            out.push_str(&format!("instance={inst}\n"));
            for ev in self.read_sequenced(&inst).await.unwrap_or_default() {
                out.push_str(&format!("  #{} {:?}\n", ev.seq, ev.event));
            }
        }
        out
    }

    /// Enqueue a work item. Enqueuing an item identical to one already
    /// waiting is a no-op.
    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError>;

    /// Take the first visible item and hide it until `ack`, `abandon` or the
    /// lock timeout, whichever comes first.
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)>;

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError>;

    /// Make a locked item visible again at the head of its queue.
    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError>;

    /// Fetch every visible orchestrator message of the first instance that is
    /// not already locked.
    async fn fetch_orchestration_batch(&self) -> Option<OrchestrationBatch>;

    /// Commit a turn: append `history_delta`, enqueue `worker_items` and
    /// release the instance lock. Fails with a permanent error when the lock
    /// expired or was already released. When the append itself is rejected
    /// nothing is committed and the lock stays held, so the caller can ack
    /// again with a different delta or abandon.
    async fn ack_orchestration_batch(
        &self,
        lock_token: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError>;

    /// Release the instance lock and make the batch visible again.
    async fn abandon_orchestration_batch(&self, lock_token: &str) -> Result<(), ProviderError>;
}

/// Filter `new_events` down to the ones that may be appended after `existing`.
pub(crate) fn appendable_events(existing: &[Event], new_events: Vec<Event>) -> Vec<Event> {
    let mut completed: HashSet<u64> = existing.iter().filter_map(Event::completion_id).collect();
    let mut terminal = existing.iter().any(Event::is_terminal);
    let mut cancel_requested = existing
        .iter()
        .any(|e| matches!(e, Event::OrchestrationCancelRequested { .. }));
    let mut started = !existing.is_empty();
    let mut out = Vec::with_capacity(new_events.len());
    for ev in new_events {
        if terminal {
            break;
        }
        let keep = match &ev {
            Event::OrchestrationStarted { .. } => !started,
            Event::ActivityCompleted { id, .. } | Event::ActivityFailed { id, .. } => completed.insert(*id),
            Event::OrchestrationCancelRequested { .. } => !cancel_requested,
            _ => true,
        };
        if !keep {
            continue;
        }
        started = true;
        if matches!(ev, Event::OrchestrationCancelRequested { .. }) {
            cancel_requested = true;
        }
        terminal = ev.is_terminal();
        out.push(ev);
    }
    out
}

/// Reject an append that would grow history past `cap`.
pub(crate) fn check_history_cap(cap: usize, have: usize, to_add: &[Event]) -> Result<(), ProviderError> {
    let growth = to_add.iter().filter(|e| !e.is_terminal()).count();
    if have + growth > cap {
        return Err(ProviderError::permanent(
            "append",
            format!("history cap exceeded (cap={cap}, have={have}, append={growth})"),
        ));
    }
    Ok(())
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn new_lock_token(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}
