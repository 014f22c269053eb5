use crate::{ClaimedIdsSnapshot, Event};

/// Every schedule event already in history must be re-claimed by the code
/// when it replays. An unclaimed one means the orchestration no longer makes
/// the decisions it made before (code changed under a running instance).
pub(crate) fn detect_unclaimed_schedules(prior: &[Event], claims: &ClaimedIdsSnapshot) -> Option<String> {
    for e in prior {
        let unclaimed = match e {
            Event::ActivityScheduled { id, name, .. } if !claims.activities.contains(id) => {
                Some(format!("activity '{name}' (id {id})"))
            }
            Event::TimerCreated { id, .. } if !claims.timers.contains(id) => Some(format!("timer (id {id})")),
            Event::SubOrchestrationScheduled { id, name, .. } if !claims.sub_orchestrations.contains(id) => {
                Some(format!("sub-orchestration '{name}' (id {id})"))
            }
            _ => None,
        };
        if let Some(what) = unclaimed {
            return Some(format!(
                "nondeterministic: {what} is recorded in history but was not scheduled on replay"
            ));
        }
    }
    None
}
