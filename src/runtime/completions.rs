use std::sync::Arc;

use tracing::{debug, warn};

use crate::Event;
use crate::providers::{HistoryStore, QueueKind, WorkItem};
use crate::runtime::router::OrchestratorMsg;

/// Append a delivered completion to `history`.
///
/// Returns the ack token and whether history changed. Duplicates and
/// completions that do not match a schedule event of the same kind are
/// dropped (and can be acked right away).
pub(crate) fn append_completion(history: &mut Vec<Event>, msg: OrchestratorMsg) -> (Option<String>, bool) {
    let instance = msg.instance().to_string();
    let (token, event) = match msg {
        OrchestratorMsg::ActivityCompleted {
            id, result, ack_token, ..
        } => (ack_token, Event::ActivityCompleted { id, result }),
        OrchestratorMsg::ActivityFailed { id, error, ack_token, .. } => (ack_token, Event::ActivityFailed { id, error }),
        OrchestratorMsg::TimerFired {
            id,
            fire_at_ms,
            ack_token,
            ..
        } => (ack_token, Event::TimerFired { id, fire_at_ms }),
        OrchestratorMsg::SubOrchCompleted {
            id, result, ack_token, ..
        } => (ack_token, Event::SubOrchestrationCompleted { id, result }),
        OrchestratorMsg::SubOrchFailed { id, error, ack_token, .. } => {
            (ack_token, Event::SubOrchestrationFailed { id, error })
        }
    };
    let Some(id) = event.completion_id() else {
        return (token, false);
    };

    let scheduled = history.iter().any(|e| match (e, &event) {
        (
            Event::ActivityScheduled { id: sid, .. },
            Event::ActivityCompleted { .. } | Event::ActivityFailed { .. },
        )
        | (Event::TimerCreated { id: sid, .. }, Event::TimerFired { .. })
        | (
            Event::SubOrchestrationScheduled { id: sid, .. },
            Event::SubOrchestrationCompleted { .. } | Event::SubOrchestrationFailed { .. },
        ) => *sid == id,
        _ => false,
    });
    if !scheduled {
        warn!(instance = %instance, id, ?event, "dropping completion with no matching schedule event");
        return (token, false);
    }
    if history.iter().any(|e| e.completion_id() == Some(id)) {
        debug!(instance = %instance, id, "dropping duplicate completion");
        return (token, false);
    }
    history.push(event);
    (token, true)
}

/// Re-enqueue work for schedule events that have no completion yet. Used when
/// resuming instances found in the store at startup.
pub(crate) async fn rehydrate_pending(instance: &str, history: &[Event], store: &Arc<dyn HistoryStore>) {
    let completed = |id: u64| history.iter().any(|e| e.completion_id() == Some(id));
    for e in history {
        let (kind, item) = match e {
            Event::ActivityScheduled { id, name, input } if !completed(*id) => (
                QueueKind::Worker,
                WorkItem::ActivityExecute {
                    instance: instance.to_string(),
                    id: *id,
                    name: name.clone(),
                    input: input.clone(),
                },
            ),
            Event::TimerCreated { id, fire_at_ms } if !completed(*id) => (
                QueueKind::Timer,
                WorkItem::TimerSchedule {
                    instance: instance.to_string(),
                    id: *id,
                    fire_at_ms: *fire_at_ms,
                },
            ),
            Event::SubOrchestrationScheduled {
                id,
                name,
                instance: child,
                input,
            } if !completed(*id) => {
                // A child with its own history is resumed on its own
                if !store.read(child).await.is_empty() {
                    continue;
                }
                (
                    QueueKind::Orchestrator,
                    WorkItem::StartOrchestration {
                        instance: child.clone(),
                        orchestration: name.clone(),
                        input: input.clone(),
                        parent_instance: Some(instance.to_string()),
                        parent_id: Some(*id),
                    },
                )
            }
            _ => continue,
        };
        debug!(instance, ?item, "re-enqueueing pending work");
        if let Err(err) = store.enqueue_work(kind, item).await {
            warn!(instance, error = %err, "failed to re-enqueue pending work");
        }
    }
}
