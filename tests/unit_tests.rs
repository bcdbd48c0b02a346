use durable_fanout::client::{RetryPolicy, RuntimeStatus};
use durable_fanout::providers::fs::FsHistoryStore;
use durable_fanout::providers::in_memory::InMemoryHistoryStore;
use durable_fanout::providers::{HistoryStore, OrchestrationBatch, ProviderError, QueueKind, WorkItem};
use durable_fanout::runtime::completions::fold_messages;
use durable_fanout::runtime::status::status_from_history;
use durable_fanout::runtime::{ActivityRegistry, OrchestrationRegistry, Runtime};
use durable_fanout::{
    run_turn, Action, Client, ClientError, ErrorDetails, Event, OrchestrationContext, OrchestrationStatus,
    SequencedEvent,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::sync::Arc as StdArc;
use std::time::Duration;
mod common;

const WAIT: Duration = Duration::from_secs(5);

// Single-turn emission: exactly one action per scheduled future and a matching schedule event.
#[test]
fn action_emission_single_turn() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        let _ = ctx.schedule_activity("A", "1").into_activity().await;
        unreachable!()
    };

    let turn = run_turn(Vec::<Event>::new(), orchestrator);
    assert!(turn.output.is_none(), "must not complete in first turn");
    assert_eq!(
        turn.actions,
        vec![Action::CallActivity {
            id: 1,
            name: "A".into(),
            input: "1".into()
        }]
    );
    assert!(matches!(turn.history[0], Event::ActivityScheduled { id: 1, .. }));
}

#[test]
fn failed_activity_surfaces_error_string() {
    let history = vec![
        Event::ActivityScheduled {
            id: 1,
            name: "A".into(),
            input: "1".into(),
        },
        Event::ActivityFailed {
            id: 1,
            error: "bad".into(),
        },
    ];
    let turn = run_turn(history, |ctx: OrchestrationContext| async move {
        ctx.schedule_activity("A", "1").into_activity().await
    });
    assert_eq!(turn.output, Some(Err("bad".to_string())));
}

#[test]
fn status_follows_history() {
    let started = Event::OrchestrationStarted {
        name: "O".into(),
        input: "i".into(),
    };
    assert_eq!(status_from_history(&[]), OrchestrationStatus::NotFound);
    assert_eq!(status_from_history(&[started.clone()]), OrchestrationStatus::NotStarted);
    let running = vec![
        started.clone(),
        Event::ActivityScheduled {
            id: 1,
            name: "A".into(),
            input: String::new(),
        },
    ];
    assert_eq!(status_from_history(&running), OrchestrationStatus::Running);
    let terminated = vec![
        started.clone(),
        Event::OrchestrationCancelRequested { reason: "r".into() },
        Event::OrchestrationTerminated { reason: "r".into() },
    ];
    assert!(status_from_history(&terminated).is_terminal());
    let failed = vec![
        started,
        Event::OrchestrationFailed {
            details: ErrorDetails::Configuration { message: "m".into() },
        },
    ];
    assert!(matches!(
        status_from_history(&failed),
        OrchestrationStatus::Failed {
            details: ErrorDetails::Configuration { .. }
        }
    ));
}

#[test]
fn error_details_serialize_with_kind_tag() {
    let d = ErrorDetails::Nondeterminism { message: "x".into() };
    assert_eq!(serde_json::to_string(&d).unwrap(), r#"{"kind":"nondeterminism","message":"x"}"#);
    assert_eq!(d.to_string(), "nondeterminism: x");
}

#[test]
fn fold_drops_duplicate_completions_and_keeps_first_cancel() {
    let history = vec![
        Event::OrchestrationStarted {
            name: "O".into(),
            input: String::new(),
        },
        Event::ActivityScheduled {
            id: 1,
            name: "A".into(),
            input: String::new(),
        },
        Event::ActivityScheduled {
            id: 2,
            name: "A".into(),
            input: String::new(),
        },
        Event::ActivityCompleted {
            id: 1,
            result: "r".into(),
        },
    ];
    let messages = vec![
        WorkItem::ActivityCompleted {
            instance: "i".into(),
            id: 1,
            result: "dup".into(),
        },
        WorkItem::ActivityFailed {
            instance: "i".into(),
            id: 2,
            error: "e".into(),
        },
        WorkItem::ActivityCompleted {
            instance: "i".into(),
            id: 2,
            result: "late".into(),
        },
        WorkItem::CancelInstance {
            instance: "i".into(),
            reason: "first".into(),
        },
        WorkItem::CancelInstance {
            instance: "i".into(),
            reason: "second".into(),
        },
    ];
    let folded = fold_messages("i", &history, messages);
    assert_eq!(
        folded.events,
        vec![
            Event::ActivityFailed {
                id: 2,
                error: "e".into()
            },
            Event::OrchestrationCancelRequested { reason: "first".into() },
        ]
    );
    assert_eq!(folded.cancel.as_deref(), Some("first"));
}

async fn append_assigns_sequence_and_dedupes_with(store: StdArc<dyn HistoryStore>) {
    store.create_instance("inst-seq", "O", "in").await.unwrap();
    let last = store
        .append(
            "inst-seq",
            vec![
                Event::ActivityScheduled {
                    id: 1,
                    name: "A".into(),
                    input: "x".into(),
                },
                Event::ActivityCompleted {
                    id: 1,
                    result: "r".into(),
                },
                Event::ActivityCompleted {
                    id: 1,
                    result: "r".into(),
                },
            ],
        )
        .await
        .unwrap();
    assert_eq!(last, 3);
    // A completion for an already-completed id is dropped, even with a different payload
    let last = store
        .append(
            "inst-seq",
            vec![Event::ActivityFailed {
                id: 1,
                error: "x".into(),
            }],
        )
        .await
        .unwrap();
    assert_eq!(last, 3);
    store
        .append(
            "inst-seq",
            vec![
                Event::OrchestrationCompleted { output: "done".into() },
                Event::ActivityScheduled {
                    id: 2,
                    name: "A".into(),
                    input: "y".into(),
                },
            ],
        )
        .await
        .unwrap();

    let seqs: Vec<u64> = store
        .read_sequenced("inst-seq")
        .await
        .unwrap()
        .iter()
        .map(|e: &SequencedEvent| e.seq)
        .collect();
    assert_eq!(seqs, vec![1, 2, 3, 4], "nothing is appended after a terminal event");

    assert!(store.append("missing", vec![]).await.is_err());
    assert!(store.read("missing").await.is_empty());
}

#[tokio::test]
async fn append_assigns_sequence_and_dedupes_in_memory() {
    append_assigns_sequence_and_dedupes_with(common::mem_store()).await;
}

#[tokio::test]
async fn append_assigns_sequence_and_dedupes_fs() {
    let (store, _td) = common::fs_store();
    append_assigns_sequence_and_dedupes_with(store).await;
}

#[tokio::test]
async fn history_cap_is_enforced() {
    let store = StdArc::new(InMemoryHistoryStore::new().with_history_cap(2)) as StdArc<dyn HistoryStore>;
    store.create_instance("capped", "O", "").await.unwrap();
    let ev = |id| Event::ActivityScheduled {
        id,
        name: "A".into(),
        input: String::new(),
    };
    store.append("capped", vec![ev(1)]).await.unwrap();
    let err = store.append("capped", vec![ev(2)]).await.unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(store.read("capped").await.len(), 2);

    // A terminal event still fits at the cap
    let failed = Event::OrchestrationFailed {
        details: ErrorDetails::Application { message: "full".into() },
    };
    assert_eq!(store.append("capped", vec![failed]).await.unwrap(), 3);
}

/// A fan-out whose completions overflow the history cap ends in a terminal
/// failure instead of retrying the same commit forever.
async fn cap_overflow_fails_instance_with(store: StdArc<dyn HistoryStore>) {
    let activities = ActivityRegistry::builder()
        .register("Echo", |input: String| async move { Ok(input) })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("WideFanOut", |ctx: OrchestrationContext, _input: String| async move {
            let tasks = (0..5).map(|i| ctx.schedule_activity("Echo", i.to_string())).collect();
            let results = ctx.join(tasks).await;
            Ok(results.len().to_string())
        })
        .build();
    let rt = Runtime::start_with_store(store.clone(), Arc::new(activities), orchestrations).await;
    let client = rt.client();
    let id = client.schedule_new_orchestration("WideFanOut", "").await.unwrap();
    let inst = client.wait_for_completion(&id, WAIT).await.unwrap();
    assert_eq!(inst.status, RuntimeStatus::Failed);
    let failure = inst.failure.unwrap();
    assert_eq!(failure.kind(), "application");
    assert!(failure.message().contains("history cap exceeded"), "{failure}");

    let hist = store.read(&id).await;
    assert!(hist.len() <= 9, "cap of 8 plus the terminal event, got {}", hist.len());
    assert!(hist.last().unwrap().is_terminal());
    rt.shutdown().await;
}

#[tokio::test]
async fn cap_overflow_fails_instance_in_memory() {
    let store = StdArc::new(InMemoryHistoryStore::new().with_history_cap(8)) as StdArc<dyn HistoryStore>;
    cap_overflow_fails_instance_with(store).await;
}

#[tokio::test]
async fn cap_overflow_fails_instance_fs() {
    let td = tempfile::tempdir().unwrap();
    let store = StdArc::new(FsHistoryStore::new(td.path(), true).with_history_cap(8)) as StdArc<dyn HistoryStore>;
    cap_overflow_fails_instance_with(store).await;
}

#[tokio::test]
async fn rejected_batch_ack_keeps_lock_for_a_second_commit() {
    let store = StdArc::new(InMemoryHistoryStore::new().with_history_cap(1)) as StdArc<dyn HistoryStore>;
    store.create_instance("full", "O", "").await.unwrap();
    let batch = store.fetch_orchestration_batch().await.unwrap();
    let scheduled = Event::ActivityScheduled {
        id: 1,
        name: "A".into(),
        input: String::new(),
    };
    let work = WorkItem::ActivityExecute {
        instance: "full".into(),
        id: 1,
        name: "A".into(),
        input: String::new(),
    };
    let err = store
        .ack_orchestration_batch(&batch.lock_token, vec![scheduled], vec![work])
        .await
        .unwrap_err();
    assert_eq!(err.operation, "append");
    assert!(store.dequeue_peek_lock(QueueKind::Worker).await.is_none(), "nothing released");
    store
        .enqueue_work(
            QueueKind::Orchestrator,
            WorkItem::CancelInstance {
                instance: "full".into(),
                reason: "later".into(),
            },
        )
        .await
        .unwrap();
    assert!(store.fetch_orchestration_batch().await.is_none(), "instance still locked");

    let failed = Event::OrchestrationFailed {
        details: ErrorDetails::Application { message: "full".into() },
    };
    store
        .ack_orchestration_batch(&batch.lock_token, vec![failed], Vec::new())
        .await
        .unwrap();
    assert_eq!(store.read("full").await.len(), 2);
}

#[tokio::test]
async fn identical_queued_items_collapse() {
    let (store, _td) = common::fs_store();
    let item = WorkItem::ActivityCompleted {
        instance: "i".into(),
        id: 1,
        result: "r".into(),
    };
    store.enqueue_work(QueueKind::Orchestrator, item.clone()).await.unwrap();
    store.enqueue_work(QueueKind::Orchestrator, item.clone()).await.unwrap();
    let (got, _) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
    assert_eq!(got, item);
    assert!(store.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());
}

#[tokio::test]
async fn remove_instance_clears_history_and_queues() {
    let store = common::mem_store();
    store.create_instance("gone", "O", "").await.unwrap();
    store.remove_instance("gone").await.unwrap();
    assert!(store.list_instances().await.is_empty());
    assert!(store.fetch_orchestration_batch().await.is_none());
    assert!(store.remove_instance("gone").await.is_err());
}

#[test]
fn duplicate_registrations_are_reported() {
    let err = ActivityRegistry::builder()
        .register("A", |i: String| async move { Ok(i) })
        .register("A", |i: String| async move { Ok(i) })
        .build_result()
        .err()
        .unwrap();
    assert!(err.contains("duplicate activity registration: A"), "{err}");

    let err = OrchestrationRegistry::builder()
        .register("O", |_ctx: OrchestrationContext, i: String| async move { Ok(i) })
        .register("O", |_ctx: OrchestrationContext, i: String| async move { Ok(i) })
        .build_result()
        .err()
        .unwrap();
    assert!(err.contains("duplicate orchestration registration: O"), "{err}");
}

#[test]
fn orchestration_names_are_listed_sorted() {
    let reg = OrchestrationRegistry::builder()
        .register("Zeta", |_ctx: OrchestrationContext, i: String| async move { Ok(i) })
        .register("Alpha", |_ctx: OrchestrationContext, i: String| async move { Ok(i) })
        .build();
    assert_eq!(reg.list_orchestration_names(), vec!["Alpha".to_string(), "Zeta".to_string()]);
    assert!(reg.get("Alpha").is_some());
    assert!(reg.get("Beta").is_none());
}

#[test]
fn system_activities_are_preregistered() {
    let reg = ActivityRegistry::builder().build();
    assert!(reg.contains("__system_now"));
    assert!(reg.contains("__system_new_guid"));
}

#[tokio::test]
async fn unregistered_activity_fails_instance() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("CallsMissing", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_activity("Missing", "x").into_activity().await
        })
        .build();
    let rt = Runtime::start(Arc::new(ActivityRegistry::builder().build()), orchestrations).await;
    let client = rt.client();
    let id = client.schedule_new_orchestration("CallsMissing", "").await.unwrap();
    let inst = client.wait_for_completion(&id, WAIT).await.unwrap();
    assert_eq!(inst.status, RuntimeStatus::Failed);
    assert_eq!(
        inst.failure,
        Some(ErrorDetails::Application {
            message: "unregistered:Missing".into()
        })
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn unregistered_orchestration_fails_with_configuration_error() {
    let rt = Runtime::start(
        Arc::new(ActivityRegistry::builder().build()),
        OrchestrationRegistry::builder().build(),
    )
    .await;
    let client = rt.client();
    let id = client.schedule_new_orchestration("Nope", "").await.unwrap();
    let inst = client.wait_for_completion(&id, WAIT).await.unwrap();
    assert_eq!(
        inst.failure,
        Some(ErrorDetails::Configuration {
            message: "unregistered orchestration: Nope".into()
        })
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn panics_become_failures() {
    let activities = ActivityRegistry::builder()
        .register("Explode", |_input: String| async move {
            if true {
                panic!("kaboom");
            }
            Ok(String::new())
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("ActivityPanics", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_activity("Explode", "").into_activity().await
        })
        .register("OrchestrationPanics", |_ctx: OrchestrationContext, _input: String| async move {
            if true {
                panic!("bad orchestration");
            }
            Ok(String::new())
        })
        .build();
    let rt = Runtime::start(Arc::new(activities), orchestrations).await;
    let client = rt.client();

    let a = client.schedule_new_orchestration("ActivityPanics", "").await.unwrap();
    let inst = client.wait_for_completion(&a, WAIT).await.unwrap();
    let failure = inst.failure.unwrap();
    assert!(failure.message().starts_with("activity panicked: kaboom"), "{failure}");

    let o = client.schedule_new_orchestration("OrchestrationPanics", "").await.unwrap();
    let inst = client.wait_for_completion(&o, WAIT).await.unwrap();
    let failure = inst.failure.unwrap();
    assert_eq!(failure.kind(), "application");
    assert!(failure.message().contains("bad orchestration"), "{failure}");
    rt.shutdown().await;
}

#[tokio::test]
async fn read_output_decodes_or_reports() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Plain", |_ctx: OrchestrationContext, input: String| async move { Ok(input) })
        .build();
    let rt = Runtime::start(Arc::new(ActivityRegistry::builder().build()), orchestrations).await;
    let client = rt.client();

    let id = client.schedule_new_orchestration("Plain", "not json").await.unwrap();
    let inst = client.wait_for_completion(&id, WAIT).await.unwrap();
    assert_eq!(inst.read_output::<String>().unwrap(), "not json");
    assert!(matches!(inst.read_output::<u64>(), Err(ClientError::Decode(_))));

    let id = client.schedule_new_orchestration("Plain", "42").await.unwrap();
    let inst = client.wait_for_completion(&id, WAIT).await.unwrap();
    assert_eq!(inst.read_output::<u64>().unwrap(), 42);

    // Output is withheld unless requested
    let bare = client.wait_for_instance(&id, false, WAIT).await.unwrap();
    assert!(bare.output.is_none() && bare.input.is_none());
    rt.shutdown().await;
}

/// Fails `create_instance` with a transient error a fixed number of times.
struct FlakyStore {
    inner: InMemoryHistoryStore,
    failures_left: AtomicU32,
}

impl FlakyStore {
    fn new(failures: u32) -> Self {
        Self {
            inner: InMemoryHistoryStore::new(),
            failures_left: AtomicU32::new(failures),
        }
    }
}

#[async_trait::async_trait]
impl HistoryStore for FlakyStore {
    async fn create_instance(&self, instance: &str, orchestration: &str, input: &str) -> Result<(), ProviderError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(ProviderError::retryable("create_instance", "connection reset"));
        }
        self.inner.create_instance(instance, orchestration, input).await
    }
    async fn read_sequenced(&self, instance: &str) -> Result<Vec<SequencedEvent>, ProviderError> {
        self.inner.read_sequenced(instance).await
    }
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<u64, ProviderError> {
        self.inner.append(instance, new_events).await
    }
    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError> {
        self.inner.remove_instance(instance).await
    }
    async fn list_instances(&self) -> Vec<String> {
        self.inner.list_instances().await
    }
    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError> {
        self.inner.enqueue_work(kind, item).await
    }
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        self.inner.dequeue_peek_lock(kind).await
    }
    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        self.inner.ack(kind, token).await
    }
    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        self.inner.abandon(kind, token).await
    }
    async fn fetch_orchestration_batch(&self) -> Option<OrchestrationBatch> {
        self.inner.fetch_orchestration_batch().await
    }
    async fn ack_orchestration_batch(
        &self,
        lock_token: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError> {
        self.inner
            .ack_orchestration_batch(lock_token, history_delta, worker_items)
            .await
    }
    async fn abandon_orchestration_batch(&self, lock_token: &str) -> Result<(), ProviderError> {
        self.inner.abandon_orchestration_batch(lock_token).await
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
    }
}

#[tokio::test]
async fn client_retries_transient_store_errors() {
    let store = StdArc::new(FlakyStore::new(2)) as StdArc<dyn HistoryStore>;
    let client = Client::new(store.clone()).with_retry_policy(fast_retry());
    client
        .schedule_new_orchestration_with_id("inst-retry", "O", "")
        .await
        .unwrap();
    assert_eq!(store.read("inst-retry").await.len(), 1);
}

#[tokio::test]
async fn client_gives_up_after_max_attempts() {
    let store = StdArc::new(FlakyStore::new(10)) as StdArc<dyn HistoryStore>;
    let client = Client::new(store).with_retry_policy(fast_retry());
    match client.schedule_new_orchestration("O", "").await {
        Err(ClientError::Transport { attempts, source }) => {
            assert_eq!(attempts, 3);
            assert!(source.is_retryable());
        }
        other => panic!("expected transport error, got {other:?}"),
    }
}
