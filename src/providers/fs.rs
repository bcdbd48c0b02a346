use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{
    appendable_events, check_history_cap, new_lock_token, now_ms, HistoryStore, OrchestrationBatch, ProviderError, QueueKind, WorkItem,
    DEFAULT_HISTORY_CAP, DEFAULT_LOCK_TIMEOUT,
};
use crate::{Event, SequencedEvent};

/// Contents of a lock sidecar: the hidden items and when they reappear.
#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    instance: Option<String>,
    expires_at_ms: u64,
    items: Vec<WorkItem>,
}

/// Filesystem-backed history store.
///
/// Layout under `root`:
/// - `instances/{instance}.jsonl`: one `SequencedEvent` per line
/// - `orch-queue.jsonl`, `work-queue.jsonl`: pending work items, rewritten
///   atomically via temp file + rename
/// - `.locks/{orch,work}/{token}.lock`: items hidden by a peek-lock
///
/// Locks carry a wall-clock expiry, so a store reopened after a crash
/// redelivers whatever the previous process had in flight. One process per
/// root directory.
pub struct FsHistoryStore {
    root: PathBuf,
    orch_queue_file: PathBuf,
    work_queue_file: PathBuf,
    lock_timeout: Duration,
    cap: usize,
    io_lock: Mutex<()>,
}

impl FsHistoryStore {
    /// Create a store rooted at the given directory path.
    /// If `reset_on_create` is true, delete any existing data under the root first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        // best-effort create; real failures surface on first use
        let _ = std::fs::create_dir_all(path.join("instances"));
        Self {
            orch_queue_file: path.join("orch-queue.jsonl"),
            work_queue_file: path.join("work-queue.jsonl"),
            root: path,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            cap: DEFAULT_HISTORY_CAP,
            io_lock: Mutex::new(()),
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

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn history_path(&self, instance: &str) -> PathBuf {
        self.root.join("instances").join(format!("{instance}.jsonl"))
    }
    fn lock_dir(&self, kind: QueueKind) -> PathBuf {
        match kind {
            QueueKind::Orchestrator => self.root.join(".locks/orch"),
            QueueKind::Worker => self.root.join(".locks/work"),
        }
    }
    fn lock_path(&self, kind: QueueKind, token: &str) -> PathBuf {
        self.lock_dir(kind).join(format!("{token}.lock"))
    }
    fn queue_file(&self, kind: QueueKind) -> &Path {
        match kind {
            QueueKind::Orchestrator => &self.orch_queue_file,
            QueueKind::Worker => &self.work_queue_file,
        }
    }

    fn validate_instance(op: &str, instance: &str) -> Result<(), ProviderError> {
        if instance.is_empty() || instance.starts_with('.') || instance.contains(['/', '\\']) {
            return Err(ProviderError::permanent(op, format!("invalid instance id: '{instance}'")));
        }
        Ok(())
    }

    async fn read_history(&self, instance: &str) -> Result<Vec<SequencedEvent>, ProviderError> {
        let data = match tokio::fs::read_to_string(self.history_path(instance)).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ProviderError::io("read", e)),
        };
        let mut out = Vec::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SequencedEvent>(line) {
                Ok(ev) => out.push(ev),
                // A torn final line from a crash mid-write is ignored
                Err(e) => tracing::warn!(instance, error = %e, "skipping unreadable history line"),
            }
        }
        Ok(out)
    }

    /// Filter and sequence `new_events` against the stored history without
    /// writing anything. Returns the encoded lines and the resulting last seq.
    async fn plan_append(&self, instance: &str, new_events: Vec<Event>) -> Result<(String, u64), ProviderError> {
        let path = self.history_path(instance);
        if !tokio::fs::try_exists(&path).await.map_err(|e| ProviderError::io("append", e))? {
            return Err(ProviderError::permanent("append", format!("instance not found: {instance}")));
        }
        let existing = self.read_history(instance).await?;
        let events: Vec<Event> = existing.iter().map(|e| e.event.clone()).collect();
        let to_add = appendable_events(&events, new_events);
        check_history_cap(self.cap, existing.len(), &to_add)?;
        let mut seq = existing.last().map(|e| e.seq).unwrap_or(0);
        let mut buf = String::new();
        for event in to_add {
            seq += 1;
            let line = serde_json::to_string(&SequencedEvent { seq, event })
                .map_err(|e| ProviderError::permanent("append", e.to_string()))?;
            buf.push_str(&line);
            buf.push('\n');
        }
        Ok((buf, seq))
    }

    async fn write_history(&self, instance: &str, lines: &str) -> Result<(), ProviderError> {
        if lines.is_empty() {
            return Ok(());
        }
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(self.history_path(instance))
            .await
            .map_err(|e| ProviderError::io("append", e))?;
        file.write_all(lines.as_bytes())
            .await
            .map_err(|e| ProviderError::io("append", e))?;
        file.sync_data().await.map_err(|e| ProviderError::io("append", e))
    }

    async fn append_history(&self, instance: &str, new_events: Vec<Event>) -> Result<u64, ProviderError> {
        let (lines, seq) = self.plan_append(instance, new_events).await?;
        self.write_history(instance, &lines).await?;
        Ok(seq)
    }

    fn load_queue(&self, kind: QueueKind) -> Vec<WorkItem> {
        let content = std::fs::read_to_string(self.queue_file(kind)).unwrap_or_default();
        content
            .lines()
            .filter_map(|l| serde_json::from_str::<WorkItem>(l).ok())
            .collect()
    }

    fn store_queue(&self, kind: QueueKind, items: &[WorkItem]) -> Result<(), ProviderError> {
        let qf = self.queue_file(kind);
        let tmp = qf.with_extension("jsonl.tmp");
        {
            let mut tf = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .map_err(|e| ProviderError::io("store_queue", e))?;
            for it in items {
                let line = serde_json::to_string(it).map_err(|e| ProviderError::permanent("store_queue", e.to_string()))?;
                tf.write_all(line.as_bytes()).map_err(|e| ProviderError::io("store_queue", e))?;
                tf.write_all(b"\n").map_err(|e| ProviderError::io("store_queue", e))?;
            }
            tf.sync_data().map_err(|e| ProviderError::io("store_queue", e))?;
        }
        std::fs::rename(&tmp, qf).map_err(|e| ProviderError::io("store_queue", e))
    }

    fn enqueue_unique(&self, kind: QueueKind, new_items: Vec<WorkItem>) -> Result<(), ProviderError> {
        let mut items = self.load_queue(kind);
        let before = items.len();
        for item in new_items {
            if !items.contains(&item) {
                items.push(item);
            }
        }
        if items.len() == before {
            return Ok(());
        }
        self.store_queue(kind, &items)
    }

    fn requeue_front(&self, kind: QueueKind, mut front: Vec<WorkItem>) -> Result<(), ProviderError> {
        let items = self.load_queue(kind);
        front.extend(items);
        self.store_queue(kind, &front)
    }

    fn read_locks(&self, kind: QueueKind) -> Vec<(String, LockRecord)> {
        let mut out = Vec::new();
        let Ok(rd) = std::fs::read_dir(self.lock_dir(kind)) else {
            return out;
        };
        for ent in rd.flatten() {
            let name = ent.file_name();
            let Some(token) = name.to_str().and_then(|n| n.strip_suffix(".lock")) else {
                continue;
            };
            if let Ok(data) = std::fs::read_to_string(ent.path()) {
                if let Ok(rec) = serde_json::from_str::<LockRecord>(&data) {
                    out.push((token.to_string(), rec));
                }
            }
        }
        out
    }

    fn take_lock(&self, kind: QueueKind, token: &str) -> Option<LockRecord> {
        let path = self.lock_path(kind, token);
        let data = std::fs::read_to_string(&path).ok()?;
        let rec = serde_json::from_str::<LockRecord>(&data).ok()?;
        let _ = std::fs::remove_file(&path);
        Some(rec)
    }

    fn write_lock(&self, kind: QueueKind, token: &str, rec: &LockRecord) -> Result<(), ProviderError> {
        std::fs::create_dir_all(self.lock_dir(kind)).map_err(|e| ProviderError::io("lock", e))?;
        let line = serde_json::to_string(rec).map_err(|e| ProviderError::permanent("lock", e.to_string()))?;
        std::fs::write(self.lock_path(kind, token), line).map_err(|e| ProviderError::io("lock", e))
    }

    /// Move expired locks back to the head of their queue; returns the
    /// instances still locked by live batches.
    fn release_expired(&self, kind: QueueKind) -> Vec<String> {
        let now = now_ms();
        let mut live = Vec::new();
        for (token, rec) in self.read_locks(kind) {
            if rec.expires_at_ms > now {
                live.extend(rec.instance);
                continue;
            }
            tracing::debug!(token = %token, "lock expired, redelivering");
            if let Some(rec) = self.take_lock(kind, &token) {
                if let Err(e) = self.requeue_front(kind, rec.items) {
                    tracing::warn!(error = %e, "failed to redeliver expired items");
                }
            }
        }
        live
    }
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    async fn create_instance(&self, instance: &str, orchestration: &str, input: &str) -> Result<(), ProviderError> {
        Self::validate_instance("create_instance", instance)?;
        let _g = self.io_lock.lock().await;
        tokio::fs::create_dir_all(self.root.join("instances"))
            .await
            .map_err(|e| ProviderError::io("create_instance", e))?;
        let path = self.history_path(instance);
        let mut file = match tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(ProviderError::permanent(
                    "create_instance",
                    format!("instance already exists: {instance}"),
                ));
            }
            Err(e) => return Err(ProviderError::io("create_instance", e)),
        };
        let started = SequencedEvent {
            seq: 1,
            event: Event::OrchestrationStarted {
                name: orchestration.to_string(),
                input: input.to_string(),
            },
        };
        let line = serde_json::to_string(&started).map_err(|e| ProviderError::permanent("create_instance", e.to_string()))?;
        file.write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| ProviderError::io("create_instance", e))?;
        file.sync_data()
            .await
            .map_err(|e| ProviderError::io("create_instance", e))?;
        self.enqueue_unique(
            QueueKind::Orchestrator,
            vec![WorkItem::StartOrchestration {
                instance: instance.to_string(),
                orchestration: orchestration.to_string(),
                input: input.to_string(),
            }],
        )
    }

    async fn read_sequenced(&self, instance: &str) -> Result<Vec<SequencedEvent>, ProviderError> {
        let _g = self.io_lock.lock().await;
        self.read_history(instance).await
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<u64, ProviderError> {
        let _g = self.io_lock.lock().await;
        self.append_history(instance, new_events).await
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError> {
        Self::validate_instance("remove_instance", instance)?;
        let _g = self.io_lock.lock().await;
        match tokio::fs::remove_file(self.history_path(instance)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProviderError::permanent(
                    "remove_instance",
                    format!("instance not found: {instance}"),
                ));
            }
            Err(e) => return Err(ProviderError::io("remove_instance", e)),
        }
        for kind in [QueueKind::Orchestrator, QueueKind::Worker] {
            let mut items = self.load_queue(kind);
            let before = items.len();
            items.retain(|i| i.instance() != instance);
            if items.len() != before {
                self.store_queue(kind, &items)?;
            }
        }
        Ok(())
    }

    async fn list_instances(&self) -> Vec<String> {
        let _g = self.io_lock.lock().await;
        let mut out = Vec::new();
        if let Ok(mut rd) = tokio::fs::read_dir(self.root.join("instances")).await {
            while let Ok(Some(ent)) = rd.next_entry().await {
                if let Some(stem) = ent.file_name().to_str().and_then(|n| n.strip_suffix(".jsonl")) {
                    out.push(stem.to_string());
                }
            }
        }
        out.sort();
        out
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError> {
        let _g = self.io_lock.lock().await;
        self.enqueue_unique(kind, vec![item])
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let _g = self.io_lock.lock().await;
        let busy = self.release_expired(kind);
        let mut items = self.load_queue(kind);
        let pos = items
            .iter()
            .position(|i| kind == QueueKind::Worker || !busy.iter().any(|b| b == i.instance()))?;
        let item = items.remove(pos);
        let token = new_lock_token(match kind {
            QueueKind::Orchestrator => "o",
            QueueKind::Worker => "w",
        });
        let rec = LockRecord {
            instance: None,
            expires_at_ms: now_ms() + self.lock_timeout.as_millis() as u64,
            items: vec![item.clone()],
        };
        // Lock first: a crash between the two writes duplicates rather than loses the item
        if let Err(e) = self.write_lock(kind, &token, &rec) {
            tracing::warn!(error = %e, "failed to write lock sidecar");
            return None;
        }
        if let Err(e) = self.store_queue(kind, &items) {
            tracing::warn!(error = %e, "failed to rewrite queue after dequeue");
            let _ = self.take_lock(kind, &token);
            return None;
        }
        Some((item, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        let _g = self.io_lock.lock().await;
        let path = self.lock_path(kind, token);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| ProviderError::io("ack", e))?;
        }
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        let _g = self.io_lock.lock().await;
        match self.take_lock(kind, token) {
            Some(rec) => self.requeue_front(kind, rec.items),
            None => Ok(()),
        }
    }

    async fn fetch_orchestration_batch(&self) -> Option<OrchestrationBatch> {
        let _g = self.io_lock.lock().await;
        let busy = self.release_expired(QueueKind::Orchestrator);
        let items = self.load_queue(QueueKind::Orchestrator);
        let instance = items
            .iter()
            .map(|i| i.instance())
            .find(|inst| !busy.iter().any(|b| b == inst))?
            .to_string();
        let (messages, rest): (Vec<WorkItem>, Vec<WorkItem>) =
            items.into_iter().partition(|i| i.instance() == instance);
        let lock_token = new_lock_token("b");
        let rec = LockRecord {
            instance: Some(instance.clone()),
            expires_at_ms: now_ms() + self.lock_timeout.as_millis() as u64,
            items: messages.clone(),
        };
        if let Err(e) = self.write_lock(QueueKind::Orchestrator, &lock_token, &rec) {
            tracing::warn!(error = %e, "failed to write batch lock");
            return None;
        }
        if let Err(e) = self.store_queue(QueueKind::Orchestrator, &rest) {
            tracing::warn!(error = %e, "failed to rewrite orchestrator queue");
            let _ = self.take_lock(QueueKind::Orchestrator, &lock_token);
            return None;
        }
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
        let _g = self.io_lock.lock().await;
        let kind = QueueKind::Orchestrator;
        let path = self.lock_path(kind, lock_token);
        let data = std::fs::read_to_string(&path).map_err(|_| {
            ProviderError::permanent("ack_orchestration_batch", format!("unknown lock token: {lock_token}"))
        })?;
        let rec: LockRecord =
            serde_json::from_str(&data).map_err(|e| ProviderError::permanent("ack_orchestration_batch", e.to_string()))?;
        if rec.expires_at_ms <= now_ms() {
            let _ = std::fs::remove_file(&path);
            self.requeue_front(kind, rec.items)?;
            return Err(ProviderError::permanent(
                "ack_orchestration_batch",
                format!("lock expired: {lock_token}"),
            ));
        }
        let instance = rec.instance.unwrap_or_default();
        // A rejected delta leaves the lock sidecar in place and nothing enqueued
        let (lines, _) = if history_delta.is_empty() {
            (String::new(), 0)
        } else {
            self.plan_append(&instance, history_delta).await?
        };
        // Worker items go out before the history delta; if we crash in between,
        // the redelivered batch re-derives the same decisions and the enqueue is idempotent.
        self.enqueue_unique(QueueKind::Worker, worker_items)?;
        self.write_history(&instance, &lines).await?;
        std::fs::remove_file(&path).map_err(|e| ProviderError::io("ack_orchestration_batch", e))
    }

    async fn abandon_orchestration_batch(&self, lock_token: &str) -> Result<(), ProviderError> {
        let _g = self.io_lock.lock().await;
        match self.take_lock(QueueKind::Orchestrator, lock_token) {
            Some(rec) => self.requeue_front(QueueKind::Orchestrator, rec.items),
            None => Ok(()),
        }
    }
}
