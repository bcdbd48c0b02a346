use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use super::{
    appendable_events, check_history_cap, new_lock_token, HistoryStore, OrchestrationBatch, ProviderError, QueueKind, WorkItem,
    DEFAULT_HISTORY_CAP, DEFAULT_LOCK_TIMEOUT,
};
use crate::{Event, SequencedEvent};

struct Locked {
    kind: QueueKind,
    // Set for orchestration batches; the instance stays locked while present
    instance: Option<String>,
    items: Vec<WorkItem>,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    histories: HashMap<String, Vec<SequencedEvent>>,
    orchestrator_q: Vec<WorkItem>,
    worker_q: Vec<WorkItem>,
    locked: HashMap<String, Locked>,
}

impl State {
    fn queue(&mut self, kind: QueueKind) -> &mut Vec<WorkItem> {
        match kind {
            QueueKind::Orchestrator => &mut self.orchestrator_q,
            QueueKind::Worker => &mut self.worker_q,
        }
    }

    fn push_unique(&mut self, kind: QueueKind, item: WorkItem) {
        let q = self.queue(kind);
        if !q.contains(&item) {
            q.push(item);
        }
    }

    fn requeue_front(&mut self, locked: Locked) {
        let q = self.queue(locked.kind);
        for (i, item) in locked.items.into_iter().enumerate() {
            q.insert(i, item);
        }
    }

    fn release_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .locked
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(t, _)| t.clone())
            .collect();
        for token in expired {
            if let Some(locked) = self.locked.remove(&token) {
                tracing::debug!(token = %token, "lock expired, redelivering");
                self.requeue_front(locked);
            }
        }
    }

    fn locked_instances(&self) -> HashSet<String> {
        self.locked.values().filter_map(|l| l.instance.clone()).collect()
    }

    fn append(&mut self, instance: &str, new_events: Vec<Event>, cap: usize) -> Result<u64, ProviderError> {
        let hist = self
            .histories
            .get_mut(instance)
            .ok_or_else(|| ProviderError::permanent("append", format!("instance not found: {instance}")))?;
        let existing: Vec<Event> = hist.iter().map(|e| e.event.clone()).collect();
        let to_add = appendable_events(&existing, new_events);
        check_history_cap(cap, hist.len(), &to_add)?;
        for event in to_add {
            let seq = hist.len() as u64 + 1;
            hist.push(SequencedEvent { seq, event });
        }
        Ok(hist.len() as u64)
    }
}

/// Process-local store. Every operation runs under one lock, so batch acks
/// are atomic.
pub struct InMemoryHistoryStore {
    state: Mutex<State>,
    lock_timeout: Duration,
    cap: usize,
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            cap: DEFAULT_HISTORY_CAP,
        }
    }

    /// Override how long dequeued items stay invisible.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_history_cap(mut self, cap: usize) -> Self {
        self.cap = cap;
        self
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_instance(&self, instance: &str, orchestration: &str, input: &str) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        if g.histories.contains_key(instance) {
            return Err(ProviderError::permanent(
                "create_instance",
                format!("instance already exists: {instance}"),
            ));
        }
        g.histories.insert(
            instance.to_string(),
            vec![SequencedEvent {
                seq: 1,
                event: Event::OrchestrationStarted {
                    name: orchestration.to_string(),
                    input: input.to_string(),
                },
            }],
        );
        g.push_unique(
            QueueKind::Orchestrator,
            WorkItem::StartOrchestration {
                instance: instance.to_string(),
                orchestration: orchestration.to_string(),
                input: input.to_string(),
            },
        );
        Ok(())
    }

    async fn read_sequenced(&self, instance: &str) -> Result<Vec<SequencedEvent>, ProviderError> {
        let g = self.state.lock().await;
        Ok(g.histories.get(instance).cloned().unwrap_or_default())
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<u64, ProviderError> {
        let mut g = self.state.lock().await;
        g.append(instance, new_events, self.cap)
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        if g.histories.remove(instance).is_none() {
            return Err(ProviderError::permanent(
                "remove_instance",
                format!("instance not found: {instance}"),
            ));
        }
        g.orchestrator_q.retain(|i| i.instance() != instance);
        g.worker_q.retain(|i| i.instance() != instance);
        Ok(())
    }

    async fn list_instances(&self) -> Vec<String> {
        let g = self.state.lock().await;
        let mut out: Vec<String> = g.histories.keys().cloned().collect();
        out.sort();
        out
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError> {
        self.state.lock().await.push_unique(kind, item);
        Ok(())
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let now = Instant::now();
        let mut g = self.state.lock().await;
        g.release_expired(now);
        let busy = g.locked_instances();
        let q = g.queue(kind);
        // Orchestrator messages of a locked instance wait for the batch to finish
        let pos = q
            .iter()
            .position(|i| kind == QueueKind::Worker || !busy.contains(i.instance()))?;
        let item = q.remove(pos);
        let token = new_lock_token(match kind {
            QueueKind::Orchestrator => "o",
            QueueKind::Worker => "w",
        });
        g.locked.insert(
            token.clone(),
            Locked {
                kind,
                instance: None,
                items: vec![item.clone()],
                expires_at: now + self.lock_timeout,
            },
        );
        Some((item, token))
    }

    async fn ack(&self, _kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        self.state.lock().await.locked.remove(token);
        Ok(())
    }

    async fn abandon(&self, _kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        if let Some(locked) = g.locked.remove(token) {
            g.requeue_front(locked);
        }
        Ok(())
    }

    async fn fetch_orchestration_batch(&self) -> Option<OrchestrationBatch> {
        let now = Instant::now();
        let mut g = self.state.lock().await;
        g.release_expired(now);
        let busy = g.locked_instances();
        let instance = g
            .orchestrator_q
            .iter()
            .map(|i| i.instance())
            .find(|inst| !busy.contains(*inst))?
            .to_string();
        let (messages, rest): (Vec<WorkItem>, Vec<WorkItem>) = std::mem::take(&mut g.orchestrator_q)
            .into_iter()
            .partition(|i| i.instance() == instance);
        g.orchestrator_q = rest;
        let lock_token = new_lock_token("b");
        g.locked.insert(
            lock_token.clone(),
            Locked {
                kind: QueueKind::Orchestrator,
                instance: Some(instance.clone()),
                items: messages.clone(),
                expires_at: now + self.lock_timeout,
            },
        );
        Some(OrchestrationBatch {
            instance,
            messages,
            lock_token,
        })
    }

    async fn ack_orchestration_batch(
        &self,
        lock_token: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        let locked = g.locked.remove(lock_token).ok_or_else(|| {
            ProviderError::permanent("ack_orchestration_batch", format!("unknown lock token: {lock_token}"))
        })?;
        if locked.expires_at <= Instant::now() {
            g.requeue_front(locked);
            return Err(ProviderError::permanent(
                "ack_orchestration_batch",
                format!("lock expired: {lock_token}"),
            ));
        }
        let instance = locked.instance.clone().unwrap_or_default();
        if !history_delta.is_empty() {
            if let Err(e) = g.append(&instance, history_delta, self.cap) {
                g.locked.insert(lock_token.to_string(), locked);
                return Err(e);
            }
        }
        for item in worker_items {
            g.push_unique(QueueKind::Worker, item);
        }
        Ok(())
    }

    async fn abandon_orchestration_batch(&self, lock_token: &str) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        if let Some(locked) = g.locked.remove(lock_token) {
            g.requeue_front(locked);
        }
        Ok(())
    }
}
