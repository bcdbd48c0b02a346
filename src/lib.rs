//! Replay-driven durable orchestration core with fan-out/fan-in support.
//!
//! Orchestrations are plain async functions over an `OrchestrationContext`.
//! Every decision they make is recorded in an append-only history of
//! `Event`s; after a crash or a new completion the function is re-run from
//! the start and its decisions are matched against that history, so side
//! effects are never repeated. This crate provides:
//!
//! - Public data model: `Event`, `SequencedEvent`, `ErrorDetails`, `Action`
//! - Orchestration driver: `run_turn`, `run_turn_with`, and `Executor`
//! - An `OrchestrationContext` that schedules activities by position and
//!   joins them back in scheduling order
//! - History stores and work queues in [`providers`]
//! - A multi-task dispatcher in [`runtime`] and a thin [`client`]
//! - The reference fan-out workloads in [`workloads`]
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

pub mod client;
pub mod config;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod runtime;
pub mod workloads;

pub use client::{Client, ClientError, OrchestrationInstance};
pub use runtime::{OrchestrationHandler, OrchestrationRegistry, OrchestrationStatus, Runtime, RuntimeOptions};

// Internal system activity names
pub(crate) const SYSTEM_NOW_ACTIVITY: &str = "__system_now";
pub(crate) const SYSTEM_NEW_GUID_ACTIVITY: &str = "__system_new_guid";

use crate::_typed_codec::Codec;
use crate::logging::LogLevel;
use serde::{Deserialize, Serialize};

// Typed payloads are JSON; plain strings travel raw so string activities stay readable in history.
pub(crate) mod _typed_codec {
    use serde::{de::DeserializeOwned, Serialize};
    use serde_json::Value;
    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }
    pub struct Json;
    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(first) => {
                    // A raw string payload decodes as a JSON string value
                    serde_json::from_value(Value::String(s.to_string())).map_err(|_| first.to_string())
                }
            }
        }
    }
}

/// Why an orchestration reached the `Failed` state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorDetails {
    /// The orchestration function returned an error.
    Application { message: String },
    /// Replay diverged from recorded history. Never retried.
    Nondeterminism { message: String },
    /// The instance references something the host does not know (e.g. an
    /// unregistered orchestration name).
    Configuration { message: String },
}

impl ErrorDetails {
    pub fn kind(&self) -> &'static str {
        match self {
            ErrorDetails::Application { .. } => "application",
            ErrorDetails::Nondeterminism { .. } => "nondeterminism",
            ErrorDetails::Configuration { .. } => "configuration",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ErrorDetails::Application { message }
            | ErrorDetails::Nondeterminism { message }
            | ErrorDetails::Configuration { message } => message,
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message())
    }
}

/// Append-only orchestration history entries persisted by a provider and
/// consumed during replay. Activity variants share a correlation `id` that
/// pairs a scheduling decision with its completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// Instance created by orchestration name with its input. Always first.
    OrchestrationStarted { name: String, input: String },
    /// Activity was scheduled with a unique ID and input.
    ActivityScheduled { id: u64, name: String, input: String },
    /// Activity completed successfully with a result.
    ActivityCompleted { id: u64, result: String },
    /// Activity failed with an error string.
    ActivityFailed { id: u64, error: String },
    /// Termination was requested; the runtime follows with `OrchestrationTerminated`.
    OrchestrationCancelRequested { reason: String },
    /// Orchestration completed with a final result.
    OrchestrationCompleted { output: String },
    /// Orchestration failed.
    OrchestrationFailed { details: ErrorDetails },
    /// Orchestration was terminated before it could finish.
    OrchestrationTerminated { reason: String },
}

impl Event {
    /// Completed, failed and terminated events end an instance.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestrationCompleted { .. } | Event::OrchestrationFailed { .. } | Event::OrchestrationTerminated { .. }
        )
    }

    /// Correlation id when this event completes an activity.
    pub fn completion_id(&self) -> Option<u64> {
        match self {
            Event::ActivityCompleted { id, .. } | Event::ActivityFailed { id, .. } => Some(*id),
            _ => None,
        }
    }
}

/// An `Event` together with the position a provider assigned to it.
/// Sequence numbers start at 1 and increase by one per appended event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SequencedEvent {
    pub seq: u64,
    pub event: Event,
}

/// Declarative decisions produced by an orchestration turn. The runtime
/// materializes these into worker queue items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Schedule an activity invocation.
    CallActivity { id: u64, name: String, input: String },
}

#[derive(Debug)]
struct CtxInner {
    instance: String,
    history: Vec<Event>,
    actions: Vec<Action>,

    // (id, name, input) of every ActivityScheduled in history, in order
    recorded_schedules: Vec<(u64, String, String)>,
    schedule_cursor: usize,
    next_correlation_id: u64,

    turn_index: u64,
    log_buffer: Vec<(LogLevel, String)>,
    nondeterminism: Option<String>,
}

impl CtxInner {
    fn new(instance: String, history: Vec<Event>) -> Self {
        let recorded_schedules: Vec<(u64, String, String)> = history
            .iter()
            .filter_map(|e| match e {
                Event::ActivityScheduled { id, name, input } => Some((*id, name.clone(), input.clone())),
                _ => None,
            })
            .collect();
        // Ids follow recorded schedules only, so a turn redone after a lost
        // commit hands out the same ids again
        let max_id = recorded_schedules.iter().map(|(id, _, _)| *id).max().unwrap_or(0);
        Self {
            instance,
            history,
            actions: Vec::new(),
            recorded_schedules,
            schedule_cursor: 0,
            next_correlation_id: max_id.saturating_add(1),
            turn_index: 0,
            log_buffer: Vec::new(),
            nondeterminism: None,
        }
    }

    fn is_replaying(&self) -> bool {
        self.schedule_cursor < self.recorded_schedules.len()
    }

    fn record_nondeterminism(&mut self, message: String) {
        // First divergence wins; later ones are consequences of it
        if self.nondeterminism.is_none() {
            self.nondeterminism = Some(message);
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_correlation_id;
        self.next_correlation_id += 1;
        id
    }

    fn completion_for(&self, id: u64) -> Option<Result<String, String>> {
        self.history.iter().find_map(|e| match e {
            Event::ActivityCompleted { id: cid, result } if *cid == id => Some(Ok(result.clone())),
            Event::ActivityFailed { id: cid, error } if *cid == id => Some(Err(error.clone())),
            _ => None,
        })
    }
}

/// User-facing orchestration context for scheduling and replay-safe helpers.
///
/// A context is built fresh for every turn from the instance history; it is
/// the only state an orchestration function may consult.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Construct a new context from an existing history vector.
    pub fn new(history: Vec<Event>) -> Self {
        Self::for_instance("", history)
    }

    /// Construct a context bound to a named instance.
    pub fn for_instance(instance: impl Into<String>, history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance.into(), history))),
        }
    }

    /// Id of the orchestration instance this turn runs for.
    pub fn instance_id(&self) -> String {
        self.inner.lock().unwrap().instance.clone()
    }

    /// The zero-based turn counter assigned by the host for diagnostics.
    pub fn turn_index(&self) -> u64 {
        self.inner.lock().unwrap().turn_index
    }
    pub(crate) fn set_turn_index(&self, idx: u64) {
        self.inner.lock().unwrap().turn_index = idx;
    }

    /// True while the function is re-issuing decisions already recorded in
    /// history. Side effects such as logging should be skipped then.
    pub fn is_replaying(&self) -> bool {
        self.inner.lock().unwrap().is_replaying()
    }

    /// Record and emit a log line unless the turn is replaying.
    pub fn trace(&self, level: LogLevel, message: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.is_replaying() {
            return;
        }
        let message = message.into();
        level.emit(&inner.instance, inner.turn_index, &message);
        inner.log_buffer.push((level, message));
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        self.trace(LogLevel::Info, message);
    }
    pub fn trace_warn(&self, message: impl Into<String>) {
        self.trace(LogLevel::Warn, message);
    }
    pub fn trace_error(&self, message: impl Into<String>) {
        self.trace(LogLevel::Error, message);
    }
    pub fn trace_debug(&self, message: impl Into<String>) {
        self.trace(LogLevel::Debug, message);
    }

    /// Wall-clock time in milliseconds since epoch, recorded through a system
    /// activity so replays observe the same value.
    pub async fn system_now_ms(&self) -> Result<u128, String> {
        let v = self.schedule_activity(crate::SYSTEM_NOW_ACTIVITY, "").into_activity().await?;
        v.parse::<u128>().map_err(|e| format!("system_now returned '{v}': {e}"))
    }

    /// A fresh GUID recorded through a system activity.
    pub async fn system_new_guid(&self) -> Result<String, String> {
        self.schedule_activity(crate::SYSTEM_NEW_GUID_ACTIVITY, "")
            .into_activity()
            .await
    }

    /// Schedule an activity and return a `DurableFuture` correlated to it.
    ///
    /// The k-th call in a turn is matched against the k-th `ActivityScheduled`
    /// event in history. A matching record is adopted without emitting a new
    /// decision; a record with a different name or input is a replay
    /// inconsistency and the returned future never resolves.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        let name: String = name.into();
        let input: String = input.into();
        let mut inner = self.inner.lock().unwrap();
        let position = inner.schedule_cursor;
        inner.schedule_cursor += 1;
        let id = match inner.recorded_schedules.get(position).cloned() {
            Some((id, n, inp)) if n == name && inp == input => Some(id),
            Some((_, n, inp)) => {
                inner.record_nondeterminism(format!(
                    "nondeterministic: schedule order mismatch at position {position}: history has ActivityScheduled('{n}','{inp}') but code scheduled ('{name}','{input}')"
                ));
                None
            }
            None => {
                let id = inner.next_id();
                inner.history.push(Event::ActivityScheduled {
                    id,
                    name: name.clone(),
                    input: input.clone(),
                });
                inner.actions.push(Action::CallActivity {
                    id,
                    name: name.clone(),
                    input,
                });
                Some(id)
            }
        };
        drop(inner);
        DurableFuture::new(id, name, self.clone())
    }

    /// Typed helper that serializes input; pair with `into_activity_typed`.
    ///
    /// Input that fails to encode schedules nothing; the returned future
    /// resolves to that error, like a failed activity.
    pub fn schedule_activity_typed<In: Serialize>(&self, name: impl Into<String>, input: &In) -> DurableFuture {
        let name: String = name.into();
        match crate::_typed_codec::Json::encode(input) {
            Ok(payload) => self.schedule_activity(name, payload),
            Err(e) => {
                let error = format!("failed to encode input for activity '{name}': {e}");
                DurableFuture::rejected(name, self.clone(), error)
            }
        }
    }

    /// Wait for all futures. Resolves only once every member has a recorded
    /// outcome, yielding outcomes in the order the futures were passed in.
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture::new(futures)
    }

    /// Wait for all futures and decode each output. The first failure in
    /// scheduling order becomes the error.
    pub async fn join_typed<T: serde::de::DeserializeOwned>(&self, futures: Vec<DurableFuture>) -> Result<Vec<T>, String> {
        self.join(futures)
            .await
            .into_iter()
            .map(|r| r.and_then(|s| crate::_typed_codec::Json::decode::<T>(&s)))
            .collect()
    }

    pub(crate) fn activity_outcome(&self, id: u64) -> Option<Result<String, String>> {
        self.inner.lock().unwrap().completion_for(id)
    }

    fn finish_turn(&self, completed: bool) -> (Vec<Event>, Vec<Action>, Vec<(LogLevel, String)>, Option<String>) {
        let mut inner = self.inner.lock().unwrap();
        if completed && inner.schedule_cursor < inner.recorded_schedules.len() {
            let remaining = inner.recorded_schedules.len() - inner.schedule_cursor;
            inner.record_nondeterminism(format!(
                "nondeterministic: orchestration finished but history holds {remaining} further scheduled activities"
            ));
        }
        (
            inner.history.clone(),
            std::mem::take(&mut inner.actions),
            std::mem::take(&mut inner.log_buffer),
            inner.nondeterminism.clone(),
        )
    }
}

pub use crate::futures::{DurableFuture, JoinFuture};

impl DurableFuture {
    /// Await the activity outcome as a raw string.
    pub fn into_activity(self) -> impl Future<Output = Result<String, String>> {
        self
    }

    /// Await the activity outcome decoded to a typed value.
    pub async fn into_activity_typed<Out: serde::de::DeserializeOwned>(self) -> Result<Out, String> {
        let s = self.await?;
        crate::_typed_codec::Json::decode::<Out>(&s)
    }
}

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

fn poll_once<F: Future>(fut: Pin<&mut F>) -> Poll<F::Output> {
    let w = noop_waker();
    let mut cx = Context::from_waker(&w);
    fut.poll(&mut cx)
}

/// Outcome of polling an orchestration once against its history.
#[derive(Debug)]
pub struct TurnResult<O> {
    /// History after the turn, including newly scheduled activities.
    pub history: Vec<Event>,
    /// New decisions for the host to carry out.
    pub actions: Vec<Action>,
    /// Log lines emitted past the replay frontier.
    pub logs: Vec<(LogLevel, String)>,
    /// `Some` once the orchestration function returned.
    pub output: Option<O>,
    /// Set when the code diverged from recorded history.
    pub nondeterminism: Option<String>,
}

/// Poll the orchestrator once with the provided history.
pub fn run_turn<O, F>(history: Vec<Event>, orchestrator: impl Fn(OrchestrationContext) -> F) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    run_turn_with("", history, 0, orchestrator)
}

/// Same as `run_turn` but binds the context to an instance and annotates it
/// with a caller-supplied turn index for diagnostics and logging.
pub fn run_turn_with<O, F>(
    instance: &str,
    history: Vec<Event>,
    turn_index: u64,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::for_instance(instance, history);
    ctx.set_turn_index(turn_index);
    let fut = std::pin::pin!(orchestrator(ctx.clone()));
    let output = match poll_once(fut) {
        Poll::Ready(out) => Some(out),
        Poll::Pending => None,
    };
    let (history, actions, logs, nondeterminism) = ctx.finish_turn(output.is_some());
    TurnResult {
        history,
        actions,
        logs,
        output,
        nondeterminism,
    }
}

/// Helper for single-threaded, host-driven execution in tests and samples.
pub struct Executor;

impl Executor {
    /// Drives an orchestrator by alternately replaying one turn and invoking
    /// the provided `execute_actions` to materialize requested actions into
    /// history, until the orchestrator completes.
    ///
    /// Returns an error if a turn reports a replay inconsistency or makes no
    /// progress.
    pub fn drive_to_completion<O, F, X>(
        mut history: Vec<Event>,
        orchestrator: impl Fn(OrchestrationContext) -> F,
        mut execute_actions: X,
    ) -> Result<(Vec<Event>, O), String>
    where
        F: Future<Output = O>,
        X: FnMut(Vec<Action>, &mut Vec<Event>),
    {
        loop {
            let turn = run_turn(history, &orchestrator);
            if let Some(msg) = turn.nondeterminism {
                return Err(msg);
            }
            history = turn.history;
            if let Some(out) = turn.output {
                return Ok((history, out));
            }
            let before = history.len();
            execute_actions(turn.actions, &mut history);
            if history.len() == before {
                return Err("orchestration is waiting but no new history was produced".to_string());
            }
        }
    }
}
