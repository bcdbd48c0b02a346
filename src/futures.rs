use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::OrchestrationContext;

/// Future for a single scheduled activity. Resolves only when history holds
/// the matching `ActivityCompleted` or `ActivityFailed` event.
pub struct DurableFuture {
    // None when scheduling diverged from history; such a future never resolves
    id: Option<u64>,
    name: String,
    ctx: OrchestrationContext,
    // Set when the call never reached scheduling; resolves at once
    rejected: Option<String>,
}

impl DurableFuture {
    pub(crate) fn new(id: Option<u64>, name: String, ctx: OrchestrationContext) -> Self {
        Self {
            id,
            name,
            ctx,
            rejected: None,
        }
    }

    /// A future that resolves to `Err(error)` without scheduling anything.
    pub(crate) fn rejected(name: String, ctx: OrchestrationContext, error: String) -> Self {
        Self {
            id: None,
            name,
            ctx,
            rejected: Some(error),
        }
    }

    /// Correlation id shared with the `ActivityScheduled` event.
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn activity_name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for DurableFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableFuture")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl Future for DurableFuture {
    type Output = Result<String, String>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(error) = &self.rejected {
            return Poll::Ready(Err(error.clone()));
        }
        let Some(id) = self.id else {
            return Poll::Pending;
        };
        match self.ctx.activity_outcome(id) {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

/// Wait-for-all over a fan-out group.
///
/// Outcomes are kept per slot so the result order is the scheduling order
/// regardless of which completions were appended first.
pub struct JoinFuture {
    children: Vec<DurableFuture>,
    outcomes: Vec<Option<Result<String, String>>>,
}

impl JoinFuture {
    pub(crate) fn new(children: Vec<DurableFuture>) -> Self {
        let outcomes = children.iter().map(|_| None).collect();
        Self { children, outcomes }
    }

    /// Number of members that already have an outcome.
    pub fn resolved(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_some()).count()
    }
}

impl Future for JoinFuture {
    type Output = Vec<Result<String, String>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for (child, slot) in this.children.iter_mut().zip(this.outcomes.iter_mut()) {
            if slot.is_some() {
                continue;
            }
            if let Poll::Ready(outcome) = Pin::new(child).poll(cx) {
                *slot = Some(outcome);
            }
        }
        if this.outcomes.iter().all(Option::is_some) {
            let done = this.outcomes.iter_mut().filter_map(Option::take).collect();
            Poll::Ready(done)
        } else {
            Poll::Pending
        }
    }
}
