use crate::client::Client;
use crate::providers::in_memory::InMemoryHistoryStore;
use crate::providers::{HistoryStore, OrchestrationBatch, ProviderError, QueueKind, WorkItem};
use crate::{Action, ErrorDetails, Event, OrchestrationContext};
use async_trait::async_trait;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub mod completions;
pub mod registry;
pub mod replay;
pub mod status;

pub use registry::{ActivityRegistry, ActivityRegistryBuilder, OrchestrationRegistry, OrchestrationRegistryBuilder};
pub use status::OrchestrationStatus;

use replay::{DefaultReplayEngine, ReplayEngine};

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Dispatcher sizing and polling knobs.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Tasks pulling orchestration batches. Each instance is still processed
    /// by one task at a time.
    pub orchestration_concurrency: usize,
    /// Tasks executing activities.
    pub worker_concurrency: usize,
    /// Sleep between polls of an empty queue.
    pub dispatcher_idle_sleep: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            orchestration_concurrency: 2,
            worker_concurrency: 4,
            dispatcher_idle_sleep: Duration::from_millis(10),
        }
    }
}

/// In-process runtime that replays orchestrations and executes activities
/// against a shared `HistoryStore`.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    history_store: Arc<dyn HistoryStore>,
    orchestration_registry: OrchestrationRegistry,
    activity_registry: Arc<ActivityRegistry>,
    replay_engine: Arc<dyn ReplayEngine>,
    options: RuntimeOptions,
}

impl Runtime {
    /// Start a runtime over a fresh in-memory store.
    pub async fn start(
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        let history_store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
        Self::start_with_store(history_store, activity_registry, orchestration_registry).await
    }

    /// Start a new runtime with a custom `HistoryStore` implementation.
    pub async fn start_with_store(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(
            history_store,
            activity_registry,
            orchestration_registry,
            RuntimeOptions::default(),
        )
        .await
    }

    pub async fn start_with_options(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        crate::logging::init_tracing();

        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            history_store,
            orchestration_registry,
            activity_registry,
            replay_engine: Arc::new(DefaultReplayEngine),
            options,
        });

        let mut joins = Vec::new();
        for idx in 0..runtime.options.orchestration_concurrency.max(1) {
            joins.push(runtime.clone().start_orchestration_dispatcher(idx));
        }
        for idx in 0..runtime.options.worker_concurrency.max(1) {
            joins.push(runtime.clone().start_work_dispatcher(idx));
        }
        runtime.joins.lock().await.extend(joins);
        info!(
            orchestrations = ?runtime.orchestration_registry.list_orchestration_names(),
            orchestration_concurrency = runtime.options.orchestration_concurrency,
            worker_concurrency = runtime.options.worker_concurrency,
            "runtime started"
        );
        runtime
    }

    pub fn history_store(&self) -> Arc<dyn HistoryStore> {
        self.history_store.clone()
    }

    /// A client bound to this runtime's store.
    pub fn client(&self) -> Client {
        Client::new(self.history_store.clone())
    }

    fn start_orchestration_dispatcher(self: Arc<Self>, idx: usize) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!(dispatcher = idx, "orchestration dispatcher running");
            loop {
                match self.history_store.fetch_orchestration_batch().await {
                    Some(batch) => self.process_batch(batch).await,
                    None => tokio::time::sleep(self.options.dispatcher_idle_sleep).await,
                }
            }
        })
    }

    fn start_work_dispatcher(self: Arc<Self>, idx: usize) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!(worker = idx, "work dispatcher running");
            loop {
                let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Worker).await else {
                    tokio::time::sleep(self.options.dispatcher_idle_sleep).await;
                    continue;
                };
                match item {
                    WorkItem::ActivityExecute {
                        instance,
                        id,
                        name,
                        input,
                    } => {
                        let outcome = self.execute_activity(&instance, id, &name, input).await;
                        let msg = match outcome {
                            Ok(result) => WorkItem::ActivityCompleted {
                                instance: instance.clone(),
                                id,
                                result,
                            },
                            Err(error) => WorkItem::ActivityFailed {
                                instance: instance.clone(),
                                id,
                                error,
                            },
                        };
                        match self.history_store.enqueue_work(QueueKind::Orchestrator, msg).await {
                            Ok(()) => {
                                if let Err(e) = self.history_store.ack(QueueKind::Worker, &token).await {
                                    warn!(instance = %instance, id, error = %e, "worker ack failed");
                                }
                            }
                            Err(e) => {
                                warn!(instance = %instance, id, error = %e, "failed to report activity outcome; abandoning");
                                let _ = self.history_store.abandon(QueueKind::Worker, &token).await;
                            }
                        }
                    }
                    other => {
                        error!(?other, "unexpected WorkItem in Worker dispatcher; dropping");
                        let _ = self.history_store.ack(QueueKind::Worker, &token).await;
                    }
                }
            }
        })
    }

    /// Run one activity on its own task so a panic surfaces as a failure.
    async fn execute_activity(&self, instance: &str, id: u64, name: &str, input: String) -> Result<String, String> {
        let Some(handler) = self.activity_registry.get(name) else {
            warn!(instance, id, name, "activity not registered");
            return Err(format!("unregistered:{name}"));
        };
        debug!(instance, id, name, "executing activity");
        match tokio::spawn(async move { handler.invoke(input).await }).await {
            Ok(outcome) => {
                if let Err(e) = &outcome {
                    debug!(instance, id, name, error = %e, "activity failed");
                }
                outcome
            }
            Err(join_err) if join_err.is_panic() => {
                let msg = panic_message(join_err.into_panic());
                warn!(instance, id, name, panic = %msg, "activity panicked");
                Err(format!("activity panicked: {msg}"))
            }
            Err(join_err) => Err(format!("activity task failed: {join_err}")),
        }
    }

    /// One orchestration turn: fold the batch into history, replay, and
    /// commit the delta together with new activity work.
    async fn process_batch(&self, batch: OrchestrationBatch) {
        let OrchestrationBatch {
            instance,
            messages,
            lock_token,
        } = batch;
        let history: Vec<Event> = match self.history_store.read_sequenced(&instance).await {
            Ok(h) => h.into_iter().map(|e| e.event).collect(),
            Err(e) => {
                warn!(instance = %instance, error = %e, "history read failed; abandoning batch");
                let _ = self.history_store.abandon_orchestration_batch(&lock_token).await;
                return;
            }
        };
        let (delta, worker_items) = self.decide(&instance, &history, messages);
        let new_events = delta.len();
        match self
            .history_store
            .ack_orchestration_batch(&lock_token, delta, worker_items)
            .await
        {
            Ok(()) => debug!(instance = %instance, new_events, "turn committed"),
            Err(e) if e.is_retryable() => {
                warn!(instance = %instance, error = %e, "turn commit failed; abandoning batch");
                let _ = self.history_store.abandon_orchestration_batch(&lock_token).await;
            }
            // The store refused the history delta itself (cap, missing instance)
            Err(e) if e.operation == "append" => {
                error!(instance = %instance, error = %e, "turn commit rejected; failing instance");
                self.fail_rejected_turn(&instance, &lock_token, e).await;
            }
            Err(e) => error!(instance = %instance, error = %e, "turn commit rejected"),
        }
    }

    /// Replace a delta the store refused with a terminal failure. The batch
    /// messages are consumed and no activity work is released.
    async fn fail_rejected_turn(&self, instance: &str, lock_token: &str, rejected: ProviderError) {
        let failed = Event::OrchestrationFailed {
            details: ErrorDetails::Application {
                message: format!("turn commit rejected: {rejected}"),
            },
        };
        match self
            .history_store
            .ack_orchestration_batch(lock_token, vec![failed], Vec::new())
            .await
        {
            Ok(()) => info!(instance, "orchestration failed after rejected commit"),
            Err(e) => {
                warn!(instance, error = %e, "failure commit failed; abandoning batch");
                let _ = self.history_store.abandon_orchestration_batch(lock_token).await;
            }
        }
    }

    /// Compute the history delta and worker items for one batch.
    fn decide(&self, instance: &str, history: &[Event], messages: Vec<WorkItem>) -> (Vec<Event>, Vec<WorkItem>) {
        if history.is_empty() {
            warn!(instance, dropped = messages.len(), "messages for unknown instance dropped");
            return (Vec::new(), Vec::new());
        }
        if history.iter().any(Event::is_terminal) {
            debug!(instance, dropped = messages.len(), "instance already terminal; messages discarded");
            return (Vec::new(), Vec::new());
        }

        let folded = completions::fold_messages(instance, history, messages);
        let mut delta = folded.events;
        let cancel = folded.cancel.or_else(|| {
            history.iter().find_map(|e| match e {
                Event::OrchestrationCancelRequested { reason } => Some(reason.clone()),
                _ => None,
            })
        });
        if let Some(reason) = cancel {
            info!(instance, reason = %reason, "orchestration terminated");
            delta.push(Event::OrchestrationTerminated { reason });
            return (delta, Vec::new());
        }

        let Some((name, input)) = status::started_with(history) else {
            error!(instance, "history has no OrchestrationStarted");
            return (delta, Vec::new());
        };
        let Some(handler) = self.orchestration_registry.get(name) else {
            error!(instance, orchestration = name, "orchestration not registered");
            delta.push(Event::OrchestrationFailed {
                details: ErrorDetails::Configuration {
                    message: format!("unregistered orchestration: {name}"),
                },
            });
            return (delta, Vec::new());
        };

        let mut working: Vec<Event> = history.to_vec();
        working.extend(delta.iter().cloned());
        let baseline = working.len();
        let turn_index = working.iter().filter(|e| e.completion_id().is_some()).count() as u64;
        let replayed = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.replay_engine
                .replay(instance, working, turn_index, handler, input.to_string())
        }));
        let outcome = match replayed {
            Ok(o) => o,
            Err(panic) => {
                let msg = panic_message(panic);
                error!(instance, panic = %msg, "orchestration panicked");
                delta.push(Event::OrchestrationFailed {
                    details: ErrorDetails::Application {
                        message: format!("orchestration panicked: {msg}"),
                    },
                });
                return (delta, Vec::new());
            }
        };

        if let Some(message) = outcome.nondeterminism {
            error!(instance, error = %message, "replay diverged from history");
            delta.push(Event::OrchestrationFailed {
                details: ErrorDetails::Nondeterminism { message },
            });
            return (delta, Vec::new());
        }

        delta.extend(outcome.history.into_iter().skip(baseline));
        let mut worker_items: Vec<WorkItem> = outcome
            .decisions
            .into_iter()
            .map(|d| match d {
                Action::CallActivity { id, name, input } => WorkItem::ActivityExecute {
                    instance: instance.to_string(),
                    id,
                    name,
                    input,
                },
            })
            .collect();
        debug!(
            instance,
            turn_index,
            scheduled = worker_items.len(),
            logs = outcome.logs.len(),
            "replay turn finished"
        );

        match outcome.output {
            Some(Ok(output)) => {
                info!(instance, orchestration = name, "orchestration completed");
                delta.push(Event::OrchestrationCompleted { output });
                worker_items.clear();
            }
            Some(Err(message)) => {
                info!(instance, orchestration = name, error = %message, "orchestration failed");
                delta.push(Event::OrchestrationFailed {
                    details: ErrorDetails::Application { message },
                });
                worker_items.clear();
            }
            None => {}
        }
        (delta, worker_items)
    }

    /// Abort background tasks. In-flight work stays locked in the store and
    /// is redelivered after its lock expires.
    pub async fn shutdown(self: Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
        info!("runtime stopped");
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
