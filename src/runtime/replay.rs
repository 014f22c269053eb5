use std::sync::Arc;

use crate::runtime::OrchestrationHandler;
use crate::{Action, ClaimedIdsSnapshot, Event};

/// Decisions are the same as public Actions; the replay core emits them directly.
pub type Decision = Action;

/// Everything one replayed turn produced.
pub struct ReplayTurn {
    pub history: Vec<Event>,
    pub decisions: Vec<Decision>,
    pub output: Option<Result<String, String>>,
    pub claims: ClaimedIdsSnapshot,
}

pub trait ReplayEngine: Send + Sync {
    /// Replays one turn of `handler` for `instance` against `history`.
    fn replay(
        &self,
        instance: &str,
        history: Vec<Event>,
        turn_index: u64,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> ReplayTurn;
}

#[derive(Default)]
pub struct DefaultReplayEngine;

impl ReplayEngine for DefaultReplayEngine {
    fn replay(
        &self,
        instance: &str,
        history: Vec<Event>,
        turn_index: u64,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> ReplayTurn {
        let orchestrator = |ctx: crate::OrchestrationContext| {
            let h = handler.clone();
            let inp = input.clone();
            async move { h.invoke(ctx, inp).await }
        };
        let (history, decisions, _logs, output, claims) =
            crate::run_turn_with_claims(instance, history, turn_index, orchestrator);
        ReplayTurn {
            history,
            decisions,
            output,
            claims,
        }
    }
}
