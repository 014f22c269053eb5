//! Durable fan-out/fan-in of container app job executions.
//!
//! The crate is built around a replay-driven orchestration core: every
//! decision an orchestration makes is recorded as an append-only `Event`,
//! and the orchestration body is re-polled from the beginning against that
//! history to resume after a crash or a new completion. It provides:
//!
//! - Public data model: `Event`, `Action`
//! - Orchestration driver: `run_turn`, `run_turn_with`, and `Executor`
//! - An `OrchestrationContext` that schedules activities, timers and
//!   sub-orchestrations by correlation id and reports whether it is replaying
//! - `DurableFuture` and `JoinFuture` for fan-out/fan-in composition
//! - An in-process `runtime` over a pluggable `providers::HistoryStore`
//! - The transcription workflow: `jobs` (start + poll a container app job),
//!   `sessions` (video metadata lookup) and `transcripts` (the fan-out)
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod futures;
pub mod jobs;
pub mod logging;
pub mod providers;
pub mod runtime;
pub mod sessions;
pub mod transcripts;
pub mod worker;

pub use crate::futures::{DurableFuture, DurableOutput, JoinFuture};
pub use crate::logging::{LogLevel, ReplaySafeLogger};
pub use runtime::{OrchestrationHandler, OrchestrationRegistry, OrchestrationRegistryBuilder, OrchestrationStatus};

use crate::_typed_codec::Codec;
use crate::futures::Kind;
use serde::{Deserialize, Serialize};

/// Wall clock in milliseconds since the Unix epoch; 0 if the clock is before it.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// Payloads cross the history boundary as strings; typed helpers go through this codec.
pub(crate) mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;

    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }

    pub struct Json;

    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            // Bare JSON strings are stored raw
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }

        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => serde_json::from_value(Value::String(s.to_string())).map_err(|e| e.to_string()),
            }
        }
    }
}

/// Append-only orchestration history entries persisted by a provider and
/// consumed during replay. Variants use stable correlation IDs to pair
/// scheduling operations with their completions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// Orchestration instance was created and started by name with input.
    /// Parent linkage is present when this is a child orchestration.
    OrchestrationStarted {
        name: String,
        input: String,
        parent_instance: Option<String>,
        parent_id: Option<u64>,
    },
    /// Orchestration completed with a final result.
    OrchestrationCompleted { output: String },
    /// Orchestration failed with a final error.
    OrchestrationFailed { error: String },

    /// Activity was scheduled with a unique ID and input.
    ActivityScheduled { id: u64, name: String, input: String },
    /// Activity completed successfully with a result.
    ActivityCompleted { id: u64, result: String },
    /// Activity failed with an error string.
    ActivityFailed { id: u64, error: String },

    /// Timer was created and will fire at wall-clock `fire_at_ms`.
    TimerCreated { id: u64, fire_at_ms: u64 },
    /// Timer fired.
    TimerFired { id: u64, fire_at_ms: u64 },

    /// Sub-orchestration was scheduled with a deterministic child instance id.
    SubOrchestrationScheduled {
        id: u64,
        name: String,
        instance: String,
        input: String,
    },
    /// Sub-orchestration completed and returned a result to the parent.
    SubOrchestrationCompleted { id: u64, result: String },
    /// Sub-orchestration failed and returned an error to the parent.
    SubOrchestrationFailed { id: u64, error: String },
}

impl Event {
    /// Correlation id carried by schedule and completion events.
    pub fn correlation_id(&self) -> Option<u64> {
        match self {
            Event::ActivityScheduled { id, .. }
            | Event::ActivityCompleted { id, .. }
            | Event::ActivityFailed { id, .. }
            | Event::TimerCreated { id, .. }
            | Event::TimerFired { id, .. }
            | Event::SubOrchestrationScheduled { id, .. }
            | Event::SubOrchestrationCompleted { id, .. }
            | Event::SubOrchestrationFailed { id, .. } => Some(*id),
            Event::OrchestrationStarted { .. }
            | Event::OrchestrationCompleted { .. }
            | Event::OrchestrationFailed { .. } => None,
        }
    }

    /// Id of the operation this event completes, if it is a completion.
    pub fn completion_id(&self) -> Option<u64> {
        match self {
            Event::ActivityCompleted { id, .. }
            | Event::ActivityFailed { id, .. }
            | Event::TimerFired { id, .. }
            | Event::SubOrchestrationCompleted { id, .. }
            | Event::SubOrchestrationFailed { id, .. } => Some(*id),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestrationCompleted { .. } | Event::OrchestrationFailed { .. }
        )
    }
}

/// Declarative decisions produced by an orchestration turn. The runtime is
/// responsible for dispatching them; the matching schedule `Event`s are
/// already in the turn's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Schedule an activity invocation.
    CallActivity { id: u64, name: String, input: String },
    /// Create a timer that will fire after the requested delay.
    CreateTimer { id: u64, delay_ms: u64 },
    /// Start a sub-orchestration by name under a child instance id.
    StartSubOrchestration {
        id: u64,
        name: String,
        instance: String,
        input: String,
    },
}

#[derive(Debug)]
pub(crate) struct CtxInner {
    pub(crate) instance: String,
    pub(crate) history: Vec<Event>,
    actions: Vec<Action>,
    next_correlation_id: u64,

    turn_index: u64,
    // Distinct completions present when the turn started; consuming fewer
    // than this means the body is still behind the recorded frontier.
    replay_frontier: usize,
    consumed_completions: HashSet<u64>,
    log_buffer: Vec<(LogLevel, String)>,

    claimed_activity_ids: HashSet<u64>,
    claimed_timer_ids: HashSet<u64>,
    claimed_sub_orchestration_ids: HashSet<u64>,
}

impl CtxInner {
    fn new(instance: String, history: Vec<Event>) -> Self {
        let max_id = history.iter().filter_map(Event::correlation_id).max().unwrap_or(0);
        let replay_frontier = history
            .iter()
            .filter_map(Event::completion_id)
            .collect::<HashSet<_>>()
            .len();
        Self {
            instance,
            history,
            actions: Vec::new(),
            next_correlation_id: max_id.saturating_add(1),
            turn_index: 0,
            replay_frontier,
            consumed_completions: HashSet::new(),
            log_buffer: Vec::new(),
            claimed_activity_ids: HashSet::new(),
            claimed_timer_ids: HashSet::new(),
            claimed_sub_orchestration_ids: HashSet::new(),
        }
    }

    pub(crate) fn record_action(&mut self, a: Action) {
        self.actions.push(a);
    }

    pub(crate) fn mark_consumed(&mut self, id: u64) {
        self.consumed_completions.insert(id);
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_correlation_id;
        self.next_correlation_id += 1;
        id
    }
}

/// User-facing orchestration context for scheduling and replay-safe helpers.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Construct a context for `instance` from an existing history vector.
    pub fn new(instance: impl Into<String>, history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance.into(), history))),
        }
    }

    // A panicking orchestration body must not wedge the runtime, so poisoning is ignored.
    pub(crate) fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Id of the instance being executed.
    pub fn instance_id(&self) -> String {
        self.lock().instance.clone()
    }

    /// The zero-based turn counter assigned by the host for diagnostics.
    pub fn turn_index(&self) -> u64 {
        self.lock().turn_index
    }

    pub(crate) fn set_turn_index(&self, idx: u64) {
        self.lock().turn_index = idx;
    }

    /// True while the body is re-executing steps whose results are already
    /// recorded in history; false once it runs past the last recorded completion.
    pub fn is_replaying(&self) -> bool {
        let inner = self.lock();
        inner.consumed_completions.len() < inner.replay_frontier
    }

    /// Drain the buffered log messages accumulated during the turn.
    pub fn take_log_buffer(&self) -> Vec<(LogLevel, String)> {
        std::mem::take(&mut self.lock().log_buffer)
    }

    /// Buffer a structured log message for the current turn.
    pub fn push_log(&self, level: LogLevel, msg: String) {
        self.lock().log_buffer.push((level, msg));
    }

    fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.lock().actions)
    }

    /// Schedule an activity and return a `DurableFuture` correlated to it.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        let name: String = name.into();
        let input: String = input.into();
        let mut inner = self.lock();
        // Adopt the first matching scheduled activity not yet claimed this turn
        let adopted_id = inner
            .history
            .iter()
            .find_map(|e| match e {
                Event::ActivityScheduled {
                    id,
                    name: n,
                    input: inp,
                } if n == &name && inp == &input && !inner.claimed_activity_ids.contains(id) => Some(*id),
                _ => None,
            })
            .unwrap_or_else(|| inner.next_id());
        inner.claimed_activity_ids.insert(adopted_id);
        drop(inner);
        DurableFuture(Kind::Activity {
            id: adopted_id,
            name,
            input,
            scheduled: false,
            ctx: self.clone(),
        })
    }

    /// Typed helper that serializes the input; pair with `into_activity_typed`.
    pub fn schedule_activity_typed<In: Serialize>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> Result<DurableFuture, String> {
        let payload = crate::_typed_codec::Json::encode(input)?;
        Ok(self.schedule_activity(name, payload))
    }

    /// Schedule a timer and return a `DurableFuture` correlated to it.
    pub fn schedule_timer(&self, delay_ms: u64) -> DurableFuture {
        let mut inner = self.lock();
        let adopted_id = inner
            .history
            .iter()
            .find_map(|e| match e {
                Event::TimerCreated { id, .. } if !inner.claimed_timer_ids.contains(id) => Some(*id),
                _ => None,
            })
            .unwrap_or_else(|| inner.next_id());
        inner.claimed_timer_ids.insert(adopted_id);
        drop(inner);
        DurableFuture(Kind::Timer {
            id: adopted_id,
            delay_ms,
            scheduled: false,
            ctx: self.clone(),
        })
    }

    /// Schedule a sub-orchestration by name. The child instance id is
    /// `{parent}::sub::{correlation_id}`, stable across replays.
    pub fn schedule_sub_orchestration(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        let name: String = name.into();
        let input: String = input.into();
        let mut inner = self.lock();
        let adopted = inner.history.iter().find_map(|e| match e {
            Event::SubOrchestrationScheduled {
                id,
                name: n,
                input: inp,
                instance,
            } if n == &name && inp == &input && !inner.claimed_sub_orchestration_ids.contains(id) => {
                Some((*id, instance.clone()))
            }
            _ => None,
        });
        let (id, instance) = match adopted {
            Some(found) => found,
            None => {
                let id = inner.next_id();
                (id, format!("{}::sub::{id}", inner.instance))
            }
        };
        inner.claimed_sub_orchestration_ids.insert(id);
        drop(inner);
        DurableFuture(Kind::SubOrch {
            id,
            name,
            instance,
            input,
            scheduled: false,
            ctx: self.clone(),
        })
    }

    pub fn schedule_sub_orchestration_typed<In: Serialize>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> Result<DurableFuture, String> {
        let payload = crate::_typed_codec::Json::encode(input)?;
        Ok(self.schedule_sub_orchestration(name, payload))
    }

    /// Deterministic join over N futures. Every branch is polled on every
    /// poll, so all of them are scheduled in the same turn; outputs come
    /// back in the order the futures were given.
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture::new(futures)
    }

    pub(crate) fn claimed_ids_snapshot(&self) -> ClaimedIdsSnapshot {
        let inner = self.lock();
        ClaimedIdsSnapshot {
            activities: inner.claimed_activity_ids.clone(),
            timers: inner.claimed_timer_ids.clone(),
            sub_orchestrations: inner.claimed_sub_orchestration_ids.clone(),
        }
    }
}

fn poll_once<F: Future>(fut: F) -> Option<F::Output> {
    let fut = std::pin::pin!(fut);
    let mut cx = Context::from_waker(Waker::noop());
    match fut.poll(&mut cx) {
        Poll::Ready(out) => Some(out),
        Poll::Pending => None,
    }
}

/// Tuple returned by `run_turn` and `run_turn_with` containing the updated
/// history, actions to execute, per-turn logs, and an optional output.
pub type TurnResult<O> = (Vec<Event>, Vec<Action>, Vec<(LogLevel, String)>, Option<O>);

/// Poll the orchestrator once against `history`, producing the updated
/// history, requested `Action`s, buffered logs, and the output if it finished.
pub fn run_turn<O, F>(
    instance: &str,
    history: Vec<Event>,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    run_turn_with(instance, history, 0, orchestrator)
}

/// Same as `run_turn` but annotates the context with a caller-supplied
/// turn index for diagnostics and logging.
pub fn run_turn_with<O, F>(
    instance: &str,
    history: Vec<Event>,
    turn_index: u64,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    let (history, actions, logs, out, _claims) = run_turn_with_claims(instance, history, turn_index, orchestrator);
    (history, actions, logs, out)
}

/// Snapshot of IDs claimed by the orchestrator during a single poll turn.
#[derive(Debug, Clone, Default)]
pub struct ClaimedIdsSnapshot {
    pub activities: HashSet<u64>,
    pub timers: HashSet<u64>,
    pub sub_orchestrations: HashSet<u64>,
}

/// Same as `run_turn_with` but also returns which correlation IDs were claimed during the poll.
pub fn run_turn_with_claims<O, F>(
    instance: &str,
    history: Vec<Event>,
    turn_index: u64,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> (
    Vec<Event>,
    Vec<Action>,
    Vec<(LogLevel, String)>,
    Option<O>,
    ClaimedIdsSnapshot,
)
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::new(instance, history);
    ctx.set_turn_index(turn_index);
    let out = poll_once(orchestrator(ctx.clone()));
    let actions = ctx.take_actions();
    let logs = ctx.take_log_buffer();
    let claims = ctx.claimed_ids_snapshot();
    let hist_after = ctx.lock().history.clone();
    (hist_after, actions, logs, out, claims)
}

/// Helper for single-threaded, host-driven execution in tests and samples.
pub struct Executor;

impl Executor {
    /// Drives an orchestrator by alternately replaying one turn and invoking
    /// the provided `execute_actions` to materialize requested actions into
    /// history, until the orchestrator completes.
    pub fn drive_to_completion<O, F, X>(
        instance: &str,
        mut history: Vec<Event>,
        orchestrator: impl Fn(OrchestrationContext) -> F,
        mut execute_actions: X,
    ) -> (Vec<Event>, O)
    where
        F: Future<Output = O>,
        X: FnMut(Vec<Action>, &mut Vec<Event>),
    {
        let mut turn_index = 0;
        loop {
            let (hist_after_replay, actions, _logs, output) =
                run_turn_with(instance, history, turn_index, &orchestrator);
            history = hist_after_replay;
            if let Some(out) = output {
                return (history, out);
            }
            execute_actions(actions, &mut history);
            turn_index += 1;
        }
    }
}
