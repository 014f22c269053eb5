use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;

use crate::_typed_codec::{Codec, Json};
use crate::{Action, Event, OrchestrationContext, now_ms};

/// Output of a `DurableFuture` when awaited via unified composition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    SubOrchestration(Result<String, String>),
}

impl DurableOutput {
    /// Decode a successful sub-orchestration result; failures pass through.
    pub fn into_sub_orchestration_typed<T: DeserializeOwned>(self) -> Result<T, String> {
        match self {
            DurableOutput::SubOrchestration(Ok(raw)) => Json::decode(&raw),
            DurableOutput::SubOrchestration(Err(e)) => Err(e),
            other => Err(format!("expected a sub-orchestration output, got {other:?}")),
        }
    }
}

pub(crate) enum Kind {
    Activity {
        id: u64,
        name: String,
        input: String,
        scheduled: bool,
        ctx: OrchestrationContext,
    },
    Timer {
        id: u64,
        delay_ms: u64,
        scheduled: bool,
        ctx: OrchestrationContext,
    },
    SubOrch {
        id: u64,
        name: String,
        instance: String,
        input: String,
        scheduled: bool,
        ctx: OrchestrationContext,
    },
}

/// A unified future for activities, timers and sub-orchestrations that
/// carries a correlation ID. Resolves from history; when the completion is
/// not there yet it records the schedule event and its `Action` once and
/// stays pending.
pub struct DurableFuture(pub(crate) Kind);

impl DurableFuture {
    /// Correlation id assigned (or adopted from history) at scheduling time.
    pub fn correlation_id(&self) -> u64 {
        match &self.0 {
            Kind::Activity { id, .. } | Kind::Timer { id, .. } | Kind::SubOrch { id, .. } => *id,
        }
    }

    /// Await an activity result as a raw String.
    pub fn into_activity(self) -> impl Future<Output = Result<String, String>> {
        async move {
            match self.await {
                DurableOutput::Activity(v) => v,
                other => Err(format!("into_activity used on non-activity future: {other:?}")),
            }
        }
    }

    /// Await an activity result decoded to a typed value.
    pub fn into_activity_typed<Out: DeserializeOwned>(self) -> impl Future<Output = Result<Out, String>> {
        async move {
            let raw = self.into_activity().await?;
            Json::decode::<Out>(&raw)
        }
    }

    /// Resolves when the correlated timer fires.
    pub fn into_timer(self) -> impl Future<Output = ()> {
        async move {
            if let other @ (DurableOutput::Activity(_) | DurableOutput::SubOrchestration(_)) = self.await {
                tracing::warn!(?other, "into_timer used on non-timer future");
            }
        }
    }

    /// Await a sub-orchestration result as a raw String.
    pub fn into_sub_orchestration(self) -> impl Future<Output = Result<String, String>> {
        async move {
            match self.await {
                DurableOutput::SubOrchestration(v) => v,
                other => Err(format!("into_sub_orchestration used on non-sub-orch future: {other:?}")),
            }
        }
    }

    /// Await a sub-orchestration result decoded to a typed value.
    pub fn into_sub_orchestration_typed<Out: DeserializeOwned>(self) -> impl Future<Output = Result<Out, String>> {
        async move {
            let raw = self.into_sub_orchestration().await?;
            Json::decode::<Out>(&raw)
        }
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().0 {
            Kind::Activity {
                id,
                name,
                input,
                scheduled,
                ctx,
            } => {
                let mut inner = ctx.lock();
                let done = inner.history.iter().find_map(|e| match e {
                    Event::ActivityCompleted { id: cid, result } if cid == id => Some(Ok(result.clone())),
                    Event::ActivityFailed { id: cid, error } if cid == id => Some(Err(error.clone())),
                    _ => None,
                });
                if let Some(result) = done {
                    inner.mark_consumed(*id);
                    return Poll::Ready(DurableOutput::Activity(result));
                }
                let already_scheduled = inner
                    .history
                    .iter()
                    .any(|e| matches!(e, Event::ActivityScheduled { id: cid, .. } if cid == id));
                if !already_scheduled && !*scheduled {
                    *scheduled = true;
                    inner.history.push(Event::ActivityScheduled {
                        id: *id,
                        name: name.clone(),
                        input: input.clone(),
                    });
                    inner.record_action(Action::CallActivity {
                        id: *id,
                        name: name.clone(),
                        input: input.clone(),
                    });
                }
                Poll::Pending
            }
            Kind::Timer {
                id,
                delay_ms,
                scheduled,
                ctx,
            } => {
                let mut inner = ctx.lock();
                if inner
                    .history
                    .iter()
                    .any(|e| matches!(e, Event::TimerFired { id: cid, .. } if cid == id))
                {
                    inner.mark_consumed(*id);
                    return Poll::Ready(DurableOutput::Timer);
                }
                let already_created = inner
                    .history
                    .iter()
                    .any(|e| matches!(e, Event::TimerCreated { id: cid, .. } if cid == id));
                if !already_created && !*scheduled {
                    *scheduled = true;
                    let fire_at_ms = now_ms().saturating_add(*delay_ms);
                    inner.history.push(Event::TimerCreated { id: *id, fire_at_ms });
                    inner.record_action(Action::CreateTimer {
                        id: *id,
                        delay_ms: *delay_ms,
                    });
                }
                Poll::Pending
            }
            Kind::SubOrch {
                id,
                name,
                instance,
                input,
                scheduled,
                ctx,
            } => {
                let mut inner = ctx.lock();
                let done = inner.history.iter().find_map(|e| match e {
                    Event::SubOrchestrationCompleted { id: cid, result } if cid == id => Some(Ok(result.clone())),
                    Event::SubOrchestrationFailed { id: cid, error } if cid == id => Some(Err(error.clone())),
                    _ => None,
                });
                if let Some(result) = done {
                    inner.mark_consumed(*id);
                    return Poll::Ready(DurableOutput::SubOrchestration(result));
                }
                let already_scheduled = inner
                    .history
                    .iter()
                    .any(|e| matches!(e, Event::SubOrchestrationScheduled { id: cid, .. } if cid == id));
                if !already_scheduled && !*scheduled {
                    *scheduled = true;
                    inner.history.push(Event::SubOrchestrationScheduled {
                        id: *id,
                        name: name.clone(),
                        instance: instance.clone(),
                        input: input.clone(),
                    });
                    inner.record_action(Action::StartSubOrchestration {
                        id: *id,
                        name: name.clone(),
                        instance: instance.clone(),
                        input: input.clone(),
                    });
                }
                Poll::Pending
            }
        }
    }
}

/// Resolves once every branch has resolved, with outputs in launch order.
pub struct JoinFuture {
    branches: Vec<DurableFuture>,
    outputs: Vec<Option<DurableOutput>>,
}

impl JoinFuture {
    pub(crate) fn new(branches: Vec<DurableFuture>) -> Self {
        let outputs = branches.iter().map(|_| None).collect();
        Self { branches, outputs }
    }
}

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for (branch, slot) in this.branches.iter_mut().zip(this.outputs.iter_mut()) {
            if slot.is_none()
                && let Poll::Ready(out) = Pin::new(branch).poll(cx)
            {
                *slot = Some(out);
            }
        }
        if this.outputs.iter().all(Option::is_some) {
            Poll::Ready(this.outputs.iter_mut().filter_map(Option::take).collect())
        } else {
            Poll::Pending
        }
    }
}
