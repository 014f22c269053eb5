use std::sync::Arc;

use tracing::{debug, warn};

use super::Runtime;
use crate::{Event, now_ms};
use crate::providers::{QueueKind, WorkItem};

pub(crate) async fn dispatch_call_activity(rt: &Arc<Runtime>, instance: &str, id: u64, name: String, input: String) {
    debug!(instance, id, name = %name, "dispatching activity");
    let item = WorkItem::ActivityExecute {
        instance: instance.to_string(),
        id,
        name,
        input,
    };
    if let Err(err) = rt.history_store.enqueue_work(QueueKind::Worker, item).await {
        warn!(instance, id, error = %err, "failed to enqueue ActivityExecute");
    }
}

pub(crate) async fn dispatch_create_timer(rt: &Arc<Runtime>, instance: &str, history: &[Event], id: u64, delay_ms: u64) {
    // The due time was fixed when the timer was recorded; reuse it
    let fire_at_ms = history
        .iter()
        .find_map(|e| match e {
            Event::TimerCreated { id: cid, fire_at_ms } if *cid == id => Some(*fire_at_ms),
            _ => None,
        })
        .unwrap_or_else(|| now_ms().saturating_add(delay_ms));
    debug!(instance, id, fire_at_ms, "dispatching timer");
    let item = WorkItem::TimerSchedule {
        instance: instance.to_string(),
        id,
        fire_at_ms,
    };
    if let Err(err) = rt.history_store.enqueue_work(QueueKind::Timer, item).await {
        warn!(instance, id, error = %err, "failed to enqueue TimerSchedule");
    }
}

pub(crate) async fn dispatch_start_sub_orchestration(
    rt: &Arc<Runtime>,
    parent_instance: &str,
    id: u64,
    name: String,
    child_instance: String,
    input: String,
) {
    debug!(parent_instance, id, name = %name, child_instance = %child_instance, "dispatching sub-orchestration");
    let item = WorkItem::StartOrchestration {
        instance: child_instance,
        orchestration: name,
        input,
        parent_instance: Some(parent_instance.to_string()),
        parent_id: Some(id),
    };
    if let Err(err) = rt.history_store.enqueue_work(QueueKind::Orchestrator, item).await {
        warn!(parent_instance, id, error = %err, "failed to enqueue sub-orchestration start");
    }
}
