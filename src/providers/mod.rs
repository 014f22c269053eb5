use crate::Event;
use serde::{Deserialize, Serialize};

pub mod in_memory;

/// Queue a `WorkItem` travels on. Each queue is drained by one runtime dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueKind {
    Orchestrator,
    Worker,
    Timer,
}

/// Messages exchanged between the runtime dispatchers through provider queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItem {
    /// Start (or re-attach to) an orchestration instance. Child instances carry
    /// the parent link so their result is routed back.
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
        parent_instance: Option<String>,
        parent_id: Option<u64>,
    },
    /// Worker queue: run an activity.
    ActivityExecute {
        instance: String,
        id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        instance: String,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        id: u64,
        error: String,
    },
    /// Timer queue: arm a timer for `fire_at_ms` (wall clock, ms since epoch).
    TimerSchedule {
        instance: String,
        id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        instance: String,
        id: u64,
        fire_at_ms: u64,
    },
    SubOrchCompleted {
        parent_instance: String,
        parent_id: u64,
        result: String,
    },
    SubOrchFailed {
        parent_instance: String,
        parent_id: u64,
        error: String,
    },
}

/// Storage abstraction for orchestration histories and work queues.
///
/// Queues use peek-lock semantics: `dequeue_peek_lock` hides an item behind a
/// token until it is `ack`ed (removed) or `abandon`ed (made visible again).
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Full history of an instance; empty when the instance is unknown.
    async fn read(&self, instance: &str) -> Vec<Event>;
    /// Append events. Duplicate completions and terminal events are dropped.
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String>;
    async fn create_instance(&self, instance: &str) -> Result<(), String>;
    async fn remove_instance(&self, instance: &str) -> Result<(), String>;
    async fn list_instances(&self) -> Vec<String>;
    /// Drop all histories and queued work.
    async fn reset(&self);
    /// Human-readable dump of every stored history.
    async fn dump_all_pretty(&self) -> String;

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String>;
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)>;
    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String>;
    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String>;
}

/// Dedupe key for completion and terminal events; `None` for events that are
/// always appended.
pub(crate) fn completion_key(ev: &Event) -> Option<(u64, &'static str)> {
    match ev {
        Event::ActivityCompleted { id, .. } | Event::ActivityFailed { id, .. } => Some((*id, "activity")),
        Event::TimerFired { id, .. } => Some((*id, "timer")),
        Event::SubOrchestrationCompleted { id, .. } | Event::SubOrchestrationFailed { id, .. } => {
            Some((*id, "sub_orchestration"))
        }
        // Synthetic id 0 slot: an instance terminates once
        Event::OrchestrationCompleted { .. } | Event::OrchestrationFailed { .. } => Some((0, "terminal")),
        _ => None,
    }
}
