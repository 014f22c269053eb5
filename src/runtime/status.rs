use std::time::{Duration, Instant};

use super::{OrchestrationStatus, Runtime, WaitError};
use crate::Event;
use crate::_typed_codec::{Codec, Json};

/// Status as recorded in a history.
pub fn status_from_history(history: &[Event]) -> OrchestrationStatus {
    if history.is_empty() {
        return OrchestrationStatus::NotFound;
    }
    for e in history.iter().rev() {
        match e {
            Event::OrchestrationCompleted { output } => {
                return OrchestrationStatus::Completed { output: output.clone() };
            }
            Event::OrchestrationFailed { error } => return OrchestrationStatus::Failed { error: error.clone() },
            _ => {}
        }
    }
    OrchestrationStatus::Running
}

impl Runtime {
    /// Current status of an instance derived from its stored history.
    pub async fn get_orchestration_status(&self, instance: &str) -> OrchestrationStatus {
        status_from_history(&self.history_store.read(instance).await)
    }

    /// Wait until the orchestration reaches a terminal state (Completed/Failed) or the timeout elapses.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = Instant::now() + timeout;
        let mut delay_ms: u64 = 5;
        loop {
            match self.get_orchestration_status(instance).await {
                status @ (OrchestrationStatus::Completed { .. } | OrchestrationStatus::Failed { .. }) => {
                    return Ok(status);
                }
                _ if Instant::now() >= deadline => return Err(WaitError::Timeout),
                _ => {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = delay_ms.saturating_mul(2).min(100);
                }
            }
        }
    }

    /// Typed variant: returns Ok(Ok<T>) on Completed with decoded output, Ok(Err(String)) on Failed.
    pub async fn wait_for_orchestration_typed<Out: serde::de::DeserializeOwned>(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<Result<Out, String>, WaitError> {
        match self.wait_for_orchestration(instance, timeout).await? {
            OrchestrationStatus::Completed { output } => Json::decode::<Out>(&output)
                .map(Ok)
                .map_err(|e| WaitError::Other(format!("decode failed: {e}"))),
            OrchestrationStatus::Failed { error } => Ok(Err(error)),
            other => Err(WaitError::Other(format!("unexpected status {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_tracks_terminal_events() {
        assert_eq!(status_from_history(&[]), OrchestrationStatus::NotFound);
        let mut history = vec![Event::OrchestrationStarted {
            name: "N".into(),
            input: "".into(),
            parent_instance: None,
            parent_id: None,
        }];
        assert_eq!(status_from_history(&history), OrchestrationStatus::Running);
        history.push(Event::OrchestrationFailed { error: "boom".into() });
        assert_eq!(
            status_from_history(&history),
            OrchestrationStatus::Failed { error: "boom".into() }
        );
    }
}
