use std::sync::Arc;

use crate::logging::LogLevel;
use crate::runtime::OrchestrationHandler;
use crate::{Action, Event, OrchestrationContext};

/// What one replay turn produced.
#[derive(Debug)]
pub struct ReplayOutcome {
    /// History after the turn, including newly scheduled activities.
    pub history: Vec<Event>,
    pub decisions: Vec<Action>,
    pub logs: Vec<(LogLevel, String)>,
    pub output: Option<Result<String, String>>,
    pub nondeterminism: Option<String>,
}

pub trait ReplayEngine: Send + Sync {
    /// Replay `history` through `handler` once, from the beginning.
    fn replay(
        &self,
        instance: &str,
        history: Vec<Event>,
        turn_index: u64,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> ReplayOutcome;
}

/// Runs the orchestration on the current thread with a no-op waker.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultReplayEngine;

impl ReplayEngine for DefaultReplayEngine {
    fn replay(
        &self,
        instance: &str,
        history: Vec<Event>,
        turn_index: u64,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> ReplayOutcome {
        let turn = crate::run_turn_with(instance, history, turn_index, |ctx: OrchestrationContext| {
            let handler = Arc::clone(&handler);
            let input = input.clone();
            async move { handler.invoke(ctx, input).await }
        });
        ReplayOutcome {
            history: turn.history,
            decisions: turn.actions,
            logs: turn.logs,
            output: turn.output,
            nondeterminism: turn.nondeterminism,
        }
    }
}
