//! Thin control-plane client: starts instances, reads their status and
//! waits for them to finish. It talks to the runtime only through the shared
//! `HistoryStore`.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::_typed_codec::{Codec, Json};
use crate::providers::{HistoryStore, ProviderError, QueueKind, WorkItem};
use crate::runtime::status::{self, OrchestrationStatus};
use crate::ErrorDetails;

/// Errors surfaced by [`Client`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The wait deadline passed. The instance itself is untouched.
    #[error("timed out after {waited:?} waiting for instance {instance}")]
    Timeout { instance: String, waited: Duration },
    #[error("instance not found: {0}")]
    NotFound(String),
    #[error("instance {instance} has no output (status {status})")]
    NotCompleted { instance: String, status: RuntimeStatus },
    /// The store kept failing with transient errors after all retries.
    #[error("transport failure after {attempts} attempts: {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: ProviderError,
    },
    /// The store refused the request.
    #[error("request rejected: {0}")]
    Rejected(#[source] ProviderError),
    #[error("failed to encode input: {0}")]
    Encode(String),
    #[error("failed to decode output: {0}")]
    Decode(String),
}

/// Lifecycle state as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RuntimeStatus {
    NotStarted,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl RuntimeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RuntimeStatus::Completed | RuntimeStatus::Failed | RuntimeStatus::Terminated)
    }
}

impl std::fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RuntimeStatus::NotStarted => "NotStarted",
            RuntimeStatus::Running => "Running",
            RuntimeStatus::Completed => "Completed",
            RuntimeStatus::Failed => "Failed",
            RuntimeStatus::Terminated => "Terminated",
        };
        f.write_str(s)
    }
}

/// Snapshot of one orchestration instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestrationInstance {
    pub instance_id: String,
    pub name: String,
    pub status: RuntimeStatus,
    /// Present only when inputs and outputs were requested.
    pub input: Option<String>,
    /// Present only for `Completed` instances, and only when requested.
    pub output: Option<String>,
    /// Present only for `Failed` instances.
    pub failure: Option<ErrorDetails>,
    /// Present only for `Terminated` instances.
    pub termination_reason: Option<String>,
    /// Number of events in the instance history.
    pub history_len: u64,
}

impl OrchestrationInstance {
    /// Decode the output of a completed instance.
    pub fn read_output<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        match (&self.status, &self.output) {
            (RuntimeStatus::Completed, Some(out)) => Json::decode::<T>(out).map_err(ClientError::Decode),
            _ => Err(ClientError::NotCompleted {
                instance: self.instance_id.clone(),
                status: self.status,
            }),
        }
    }
}

/// How transient store failures are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(200),
        }
    }
}

const WAIT_INITIAL_DELAY_MS: u64 = 5;
const WAIT_MAX_DELAY_MS: u64 = 100;

#[derive(Clone)]
pub struct Client {
    store: Arc<dyn HistoryStore>,
    retry: RetryPolicy,
}

impl Client {
    /// Create a client bound to a `HistoryStore` instance.
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut backoff = self.retry.initial_backoff;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if !e.is_retryable() => return Err(ClientError::Rejected(e)),
                Err(e) if attempt >= self.retry.max_attempts.max(1) => {
                    return Err(ClientError::Transport {
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "transient store error; retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.retry.max_backoff);
                    attempt += 1;
                }
            }
        }
    }

    /// Start a new instance under a fresh UUID and return its id.
    pub async fn schedule_new_orchestration(
        &self,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<String, ClientError> {
        let instance = uuid::Uuid::new_v4().to_string();
        self.schedule_new_orchestration_with_id(&instance, orchestration, input)
            .await?;
        Ok(instance)
    }

    /// Start a new instance with a caller-chosen id.
    pub async fn schedule_new_orchestration_with_id(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        let input = input.into();
        self.with_retry(|| self.store.create_instance(instance, orchestration, &input))
            .await?;
        tracing::info!(instance, orchestration, "orchestration scheduled");
        Ok(())
    }

    /// Start a new instance with typed input (serialized to JSON).
    pub async fn schedule_new_orchestration_typed<In: Serialize>(
        &self,
        orchestration: &str,
        input: &In,
    ) -> Result<String, ClientError> {
        let payload = Json::encode(input).map_err(ClientError::Encode)?;
        self.schedule_new_orchestration(orchestration, payload).await
    }

    /// Current snapshot of an instance, or `None` if it does not exist.
    pub async fn get_instance(
        &self,
        instance: &str,
        include_inputs_outputs: bool,
    ) -> Result<Option<OrchestrationInstance>, ClientError> {
        let history: Vec<crate::Event> = self
            .with_retry(|| self.store.read_sequenced(instance))
            .await?
            .into_iter()
            .map(|e| e.event)
            .collect();
        let Some((name, input)) = status::started_with(&history) else {
            return Ok(None);
        };
        let mut snapshot = OrchestrationInstance {
            instance_id: instance.to_string(),
            name: name.to_string(),
            status: RuntimeStatus::Running,
            input: include_inputs_outputs.then(|| input.to_string()),
            output: None,
            failure: None,
            termination_reason: None,
            history_len: history.len() as u64,
        };
        match status::status_from_history(&history) {
            OrchestrationStatus::NotFound => return Ok(None),
            OrchestrationStatus::NotStarted => snapshot.status = RuntimeStatus::NotStarted,
            OrchestrationStatus::Running => {}
            OrchestrationStatus::Completed { output } => {
                snapshot.status = RuntimeStatus::Completed;
                snapshot.output = include_inputs_outputs.then_some(output);
            }
            OrchestrationStatus::Failed { details } => {
                snapshot.status = RuntimeStatus::Failed;
                snapshot.failure = Some(details);
            }
            OrchestrationStatus::Terminated { reason } => {
                snapshot.status = RuntimeStatus::Terminated;
                snapshot.termination_reason = Some(reason);
            }
        }
        Ok(Some(snapshot))
    }

    /// Wait until the instance is Completed, Failed or Terminated, polling
    /// with exponential backoff. On deadline returns `ClientError::Timeout`.
    pub async fn wait_for_instance(
        &self,
        instance: &str,
        include_inputs_outputs: bool,
        timeout: Duration,
    ) -> Result<OrchestrationInstance, ClientError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut delay_ms = WAIT_INITIAL_DELAY_MS;
        loop {
            match self.get_instance(instance, include_inputs_outputs).await? {
                Some(snapshot) if snapshot.status.is_terminal() => return Ok(snapshot),
                Some(_) => {}
                None => return Err(ClientError::NotFound(instance.to_string())),
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ClientError::Timeout {
                    instance: instance.to_string(),
                    waited: now - started,
                });
            }
            let sleep = Duration::from_millis(delay_ms).min(deadline - now);
            tokio::time::sleep(sleep).await;
            delay_ms = delay_ms.saturating_mul(2).min(WAIT_MAX_DELAY_MS);
        }
    }

    /// `wait_for_instance` with inputs and outputs included.
    pub async fn wait_for_completion(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationInstance, ClientError> {
        self.wait_for_instance(instance, true, timeout).await
    }

    /// Request termination. Takes effect at the next turn of the instance;
    /// already-terminal instances are left as they are.
    pub async fn terminate_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        if self.get_instance(instance, false).await?.is_none() {
            return Err(ClientError::NotFound(instance.to_string()));
        }
        let item = WorkItem::CancelInstance {
            instance: instance.to_string(),
            reason: reason.into(),
        };
        self.with_retry(|| self.store.enqueue_work(QueueKind::Orchestrator, item.clone()))
            .await
    }

    pub async fn list_instances(&self) -> Vec<String> {
        self.store.list_instances().await
    }
}
