use crate::_typed_codec::{Codec, Json};
use crate::providers::in_memory::InMemoryHistoryStore;
use crate::providers::{HistoryStore, QueueKind, WorkItem};
use crate::{Event, OrchestrationContext};
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

mod completions;
mod detect;
mod dispatch;
pub mod registry;
pub mod replay;
pub mod router;
pub mod status;
mod timers;

pub use registry::{ActivityRegistry, ActivityRegistryBuilder, OrchestrationRegistry, OrchestrationRegistryBuilder};
pub use router::{InstanceRouter, OrchestratorMsg};
pub use status::status_from_history;

use registry::ActivityHandler;
use replay::{DefaultReplayEngine, ReplayEngine, ReplayTurn};
use timers::{TimerRequest, TimerService};

/// High-level orchestration status derived from history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    Running,
    Completed { output: String },
    Failed { error: String },
}

/// Error type returned by orchestration wait helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Other(String),
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// How the worker dispatcher retries a failing activity before reporting
/// `ActivityFailed` to the orchestration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one; at least 1.
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    pub activity_retry: RetryPolicy,
}

/// Introspection: descriptor of an orchestration derived from history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestrationDescriptor {
    pub name: String,
    pub parent_instance: Option<String>,
    pub parent_id: Option<u64>,
}

type InstanceResult = (Vec<Event>, Result<String, String>);

fn started_name(history: &[Event]) -> Option<String> {
    history.iter().find_map(|e| match e {
        Event::OrchestrationStarted { name, .. } => Some(name.clone()),
        _ => None,
    })
}

fn terminal_result(history: &[Event]) -> Option<Result<String, String>> {
    history.iter().rev().find_map(|e| match e {
        Event::OrchestrationCompleted { output } => Some(Ok(output.clone())),
        Event::OrchestrationFailed { error } => Some(Err(error.clone())),
        _ => None,
    })
}

/// In-process runtime that executes activities and timers and persists
/// history via a `HistoryStore`.
pub struct Runtime {
    router: Arc<InstanceRouter>,
    joins: Mutex<Vec<JoinHandle<()>>>,
    instance_joins: Mutex<Vec<JoinHandle<()>>>,
    history_store: Arc<dyn HistoryStore>,
    active_instances: Mutex<HashSet<String>>,
    result_waiters: Mutex<HashMap<String, Vec<oneshot::Sender<InstanceResult>>>>,
    orchestration_registry: OrchestrationRegistry,
    options: RuntimeOptions,
}

impl Runtime {
    const COMPLETION_BATCH_LIMIT: usize = 128;
    const POLLER_GATE_DELAY_MS: u64 = 5;
    const POLLER_IDLE_SLEEP_MS: u64 = 10;
    const ORCH_IDLE_DEHYDRATE_MS: u64 = 1000;

    /// Start a new runtime using the in-memory history store.
    pub async fn start(
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        let history_store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
        Self::start_with_store(history_store, activity_registry, orchestration_registry).await
    }

    /// Start a new runtime with a custom `HistoryStore` implementation.
    pub async fn start_with_store(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(
            history_store,
            activity_registry,
            orchestration_registry,
            RuntimeOptions::default(),
        )
        .await
    }

    /// Start a runtime with explicit options. Instances already in the store
    /// without a terminal event are resumed.
    pub async fn start_with_options(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        let runtime = Arc::new(Self {
            router: Arc::new(InstanceRouter::default()),
            joins: Mutex::new(Vec::new()),
            instance_joins: Mutex::new(Vec::new()),
            history_store,
            active_instances: Mutex::new(HashSet::new()),
            result_waiters: Mutex::new(HashMap::new()),
            orchestration_registry,
            options,
        });

        let mut joins = vec![
            runtime.clone().start_orchestration_dispatcher(),
            runtime.clone().start_work_dispatcher(activity_registry),
        ];
        joins.extend(runtime.clone().start_timer_dispatcher());
        runtime.joins.lock().await.extend(joins);

        runtime.resume_incomplete_instances().await;
        runtime
    }

    /// Abort background tasks and hydrated instances. Histories stay in the store.
    pub async fn shutdown(self: Arc<Self>) {
        for j in self.joins.lock().await.drain(..) {
            j.abort();
        }
        for j in self.instance_joins.lock().await.drain(..) {
            j.abort();
        }
        info!("runtime shut down");
    }

    /// Start an orchestration using raw String input/output.
    pub async fn start_orchestration(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: impl Into<String>,
    ) -> Result<JoinHandle<InstanceResult>, String> {
        let rx = self
            .start_internal(instance, orchestration_name, input.into(), None, true)
            .await?
            .ok_or_else(|| format!("no result channel for {instance}"))?;
        Ok(tokio::spawn(async move {
            rx.await
                .unwrap_or_else(|_| (Vec::new(), Err("runtime dropped the result channel".to_string())))
        }))
    }

    /// Start a typed orchestration; input/output are serialized internally.
    pub async fn start_orchestration_typed<In, Out>(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: In,
    ) -> Result<JoinHandle<(Vec<Event>, Result<Out, String>)>, String>
    where
        In: Serialize,
        Out: DeserializeOwned + Send + 'static,
    {
        let payload = Json::encode(&input).map_err(|e| format!("encode: {e}"))?;
        let handle = self.start_orchestration(instance, orchestration_name, payload).await?;
        Ok(tokio::spawn(async move {
            match handle.await {
                Ok((hist, res)) => (hist, res.and_then(|s| Json::decode::<Out>(&s))),
                Err(e) => (Vec::new(), Err(format!("result task failed: {e}"))),
            }
        }))
    }

    /// Return the descriptor `{ name, parent_instance?, parent_id? }` for an instance.
    pub async fn get_orchestration_descriptor(&self, instance: &str) -> Option<OrchestrationDescriptor> {
        let hist = self.history_store.read(instance).await;
        hist.iter().find_map(|e| match e {
            Event::OrchestrationStarted {
                name,
                parent_instance,
                parent_id,
                ..
            } => Some(OrchestrationDescriptor {
                name: name.clone(),
                parent_instance: parent_instance.clone(),
                parent_id: *parent_id,
            }),
            _ => None,
        })
    }

    async fn start_internal(
        self: &Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: String,
        parent: Option<(String, u64)>,
        want_result: bool,
    ) -> Result<Option<oneshot::Receiver<InstanceResult>>, String> {
        // Ensure instance exists (best-effort)
        let _ = self.history_store.create_instance(instance).await;
        let hist = self.history_store.read(instance).await;
        if hist.is_empty() {
            let (parent_instance, parent_id) = match &parent {
                Some((p, id)) => (Some(p.clone()), Some(*id)),
                None => (None, None),
            };
            self.history_store
                .append(
                    instance,
                    vec![Event::OrchestrationStarted {
                        name: orchestration_name.to_string(),
                        input,
                        parent_instance,
                        parent_id,
                    }],
                )
                .await
                .map_err(|e| format!("failed to append OrchestrationStarted: {e}"))?;
            info!(instance, orchestration = orchestration_name, "orchestration started");
        } else if let Some(result) = terminal_result(&hist) {
            debug!(instance, "start requested for a finished instance");
            // The parent may have missed the result
            if let Some((pinst, pid)) = parent {
                self.notify_parent(&pinst, pid, &result).await;
            }
            if !want_result {
                return Ok(None);
            }
            let (tx, rx) = oneshot::channel();
            let _ = tx.send((hist, result));
            return Ok(Some(rx));
        } else {
            warn!(instance, "instance already has history; duplicate start accepted");
        }

        let rx = if want_result {
            let (tx, rx) = oneshot::channel();
            self.result_waiters
                .lock()
                .await
                .entry(instance.to_string())
                .or_default()
                .push(tx);
            Some(rx)
        } else {
            None
        };
        let name = started_name(&hist).unwrap_or_else(|| orchestration_name.to_string());
        self.ensure_instance_active(instance, &name).await;
        Ok(rx)
    }

    async fn resume_incomplete_instances(self: &Arc<Self>) {
        for instance in self.history_store.list_instances().await {
            let history = self.history_store.read(&instance).await;
            if history.iter().any(Event::is_terminal) {
                continue;
            }
            let Some(name) = started_name(&history) else {
                continue;
            };
            info!(instance = %instance, orchestration = %name, "resuming incomplete instance");
            completions::rehydrate_pending(&instance, &history, &self.history_store).await;
            self.ensure_instance_active(&instance, &name).await;
        }
    }

    async fn ensure_instance_active(self: &Arc<Self>, instance: &str, orchestration_name: &str) -> bool {
        if !self.active_instances.lock().await.insert(instance.to_string()) {
            return false;
        }
        let rt = self.clone();
        let inst = instance.to_string();
        let name = orchestration_name.to_string();
        let handle = tokio::spawn(async move {
            rt.run_instance(&inst, &name).await;
            rt.active_instances.lock().await.remove(&inst);
        });
        let mut joins = self.instance_joins.lock().await;
        joins.retain(|h| !h.is_finished());
        joins.push(handle);
        true
    }

    async fn has_waiters(&self, instance: &str) -> bool {
        self.result_waiters.lock().await.contains_key(instance)
    }

    async fn notify_waiters(&self, instance: &str, history: &[Event], result: &Result<String, String>) {
        if let Some(waiters) = self.result_waiters.lock().await.remove(instance) {
            for w in waiters {
                let _ = w.send((history.to_vec(), result.clone()));
            }
        }
    }

    async fn notify_parent(&self, parent_instance: &str, parent_id: u64, result: &Result<String, String>) {
        let item = match result {
            Ok(s) => WorkItem::SubOrchCompleted {
                parent_instance: parent_instance.to_string(),
                parent_id,
                result: s.clone(),
            },
            Err(e) => WorkItem::SubOrchFailed {
                parent_instance: parent_instance.to_string(),
                parent_id,
                error: e.clone(),
            },
        };
        if let Err(err) = self.history_store.enqueue_work(QueueKind::Orchestrator, item).await {
            warn!(parent_instance, parent_id, error = %err, "failed to route sub-orchestration result to parent");
        }
    }

    /// Drive one hydrated instance: replay, persist, dispatch, wait for
    /// completions, repeat. Returns when the instance terminates or dehydrates.
    async fn run_instance(self: &Arc<Self>, instance: &str, orchestration_name: &str) {
        let mut history = self.history_store.read(instance).await;
        let Some((input, parent)) = history.iter().find_map(|e| match e {
            Event::OrchestrationStarted {
                input,
                parent_instance,
                parent_id,
                ..
            } => Some((input.clone(), parent_instance.clone().zip(*parent_id))),
            _ => None,
        }) else {
            error!(instance, "no OrchestrationStarted in history; cannot run instance");
            return;
        };

        let Some(handler) = self.orchestration_registry.get(orchestration_name) else {
            let err = format!("unregistered:{orchestration_name}");
            self.finish(instance, &mut history, Err(err), parent).await;
            return;
        };

        let mut inbox = self.router.register(instance).await;
        let engine = DefaultReplayEngine;
        let mut turn_index: u64 = 0;
        loop {
            let baseline_len = history.len();
            let ReplayTurn {
                history: hist_after,
                decisions,
                output,
                claims,
            } = engine.replay(instance, history, turn_index, handler.clone(), input.clone());
            history = hist_after;

            if let Some(err) = detect::detect_unclaimed_schedules(&history[..baseline_len], &claims) {
                error!(instance, turn_index, error = %err, "orchestration diverged from its history");
                history.truncate(baseline_len);
                self.close_inbox(instance, &mut inbox, true).await;
                self.finish(instance, &mut history, Err(err), parent).await;
                return;
            }

            if history.len() > baseline_len
                && let Err(e) = self
                    .history_store
                    .append(instance, history[baseline_len..].to_vec())
                    .await
            {
                history.truncate(baseline_len);
                self.fail_unpersisted(instance, &mut inbox, &mut history, e, parent).await;
                return;
            }

            if let Some(out) = output {
                self.close_inbox(instance, &mut inbox, true).await;
                self.finish(instance, &mut history, out, parent).await;
                return;
            }

            self.apply_decisions(instance, &history, decisions).await;

            // Receive at least one completion, or dehydrate on idle timeout
            let first = loop {
                match tokio::time::timeout(Duration::from_millis(Self::ORCH_IDLE_DEHYDRATE_MS), inbox.recv()).await {
                    Ok(Some(msg)) => break msg,
                    Ok(None) => {
                        self.router.unregister(instance).await;
                        return;
                    }
                    Err(_timeout) => {
                        if self.has_waiters(instance).await {
                            continue;
                        }
                        debug!(instance, turn_index, "dehydrating idle instance");
                        self.close_inbox(instance, &mut inbox, false).await;
                        return;
                    }
                }
            };

            let persisted_len = history.len();
            let mut batch = vec![first];
            while batch.len() < Self::COMPLETION_BATCH_LIMIT {
                match inbox.try_recv() {
                    Ok(msg) => batch.push(msg),
                    Err(_) => break,
                }
            }
            let mut ack_tokens = Vec::with_capacity(batch.len());
            for msg in batch {
                let (token, _changed) = completions::append_completion(&mut history, msg);
                ack_tokens.extend(token);
            }
            if history.len() > persisted_len
                && let Err(e) = self
                    .history_store
                    .append(instance, history[persisted_len..].to_vec())
                    .await
            {
                history.truncate(persisted_len);
                for t in ack_tokens {
                    let _ = self.history_store.ack(QueueKind::Orchestrator, &t).await;
                }
                self.fail_unpersisted(instance, &mut inbox, &mut history, e, parent).await;
                return;
            }
            // Ack peek-locked items now that the history is persisted
            for t in ack_tokens {
                let _ = self.history_store.ack(QueueKind::Orchestrator, &t).await;
            }
            turn_index = turn_index.saturating_add(1);
        }
    }

    async fn apply_decisions(self: &Arc<Self>, instance: &str, history: &[Event], decisions: Vec<replay::Decision>) {
        for d in decisions {
            match d {
                replay::Decision::CallActivity { id, name, input } => {
                    dispatch::dispatch_call_activity(self, instance, id, name, input).await;
                }
                replay::Decision::CreateTimer { id, delay_ms } => {
                    dispatch::dispatch_create_timer(self, instance, history, id, delay_ms).await;
                }
                replay::Decision::StartSubOrchestration {
                    id,
                    name,
                    instance: child,
                    input,
                } => {
                    dispatch::dispatch_start_sub_orchestration(self, instance, id, name, child, input).await;
                }
            }
        }
    }

    async fn finish(
        &self,
        instance: &str,
        history: &mut Vec<Event>,
        out: Result<String, String>,
        parent: Option<(String, u64)>,
    ) {
        let term = match &out {
            Ok(s) => Event::OrchestrationCompleted { output: s.clone() },
            Err(e) => Event::OrchestrationFailed { error: e.clone() },
        };
        if let Err(e) = self.history_store.append(instance, vec![term.clone()]).await {
            error!(instance, error = %e, "failed to append terminal event");
        }
        history.push(term);
        match &out {
            Ok(_) => info!(instance, "orchestration completed"),
            Err(e) => warn!(instance, error = %e, "orchestration failed"),
        }
        self.notify_waiters(instance, history, &out).await;
        if let Some((pinst, pid)) = parent {
            self.notify_parent(&pinst, pid, &out).await;
        }
    }

    // The store refused our writes: the instance cannot make progress, so it
    // fails and its waiters and parent see the store error.
    async fn fail_unpersisted(
        &self,
        instance: &str,
        inbox: &mut mpsc::UnboundedReceiver<OrchestratorMsg>,
        history: &mut Vec<Event>,
        store_error: String,
        parent: Option<(String, u64)>,
    ) {
        let err = format!("history append failed: {store_error}");
        error!(instance, error = %err, "instance stopped");
        self.close_inbox(instance, inbox, true).await;
        self.finish(instance, history, Err(err), parent).await;
    }

    /// Detach the instance from the router and settle whatever is still queued
    /// in its inbox: ack when the instance is finished, abandon for redelivery otherwise.
    async fn close_inbox(&self, instance: &str, inbox: &mut mpsc::UnboundedReceiver<OrchestratorMsg>, finished: bool) {
        self.router.unregister(instance).await;
        inbox.close();
        while let Ok(msg) = inbox.try_recv() {
            if let Some(token) = msg.ack_token() {
                let _ = if finished {
                    self.history_store.ack(QueueKind::Orchestrator, token).await
                } else {
                    self.history_store.abandon(QueueKind::Orchestrator, token).await
                };
            }
        }
    }

    /// Forward a completion to its hydrated instance, or rehydrate the
    /// instance and abandon the item so it is redelivered.
    async fn deliver_or_rehydrate(self: &Arc<Self>, token: String, msg: OrchestratorMsg) {
        let instance = msg.instance().to_string();
        if self.router.forward(msg).await.is_ok() {
            return;
        }
        let history = self.history_store.read(&instance).await;
        if history.iter().any(Event::is_terminal) {
            debug!(instance = %instance, "dropping completion for finished instance");
            let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
            return;
        }
        match started_name(&history) {
            Some(name) => {
                self.ensure_instance_active(&instance, &name).await;
                let _ = self.history_store.abandon(QueueKind::Orchestrator, &token).await;
                tokio::time::sleep(Duration::from_millis(Self::POLLER_GATE_DELAY_MS)).await;
            }
            None => {
                error!(instance = %instance, "completion for unknown instance; dropping");
                let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
            }
        }
    }

    fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Orchestrator).await else {
                    tokio::time::sleep(Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS)).await;
                    continue;
                };
                let ack_token = Some(token.clone());
                match item {
                    WorkItem::StartOrchestration {
                        instance,
                        orchestration,
                        input,
                        parent_instance,
                        parent_id,
                    } => {
                        debug!(instance = %instance, orchestration = %orchestration, "StartOrchestration");
                        let parent = parent_instance.zip(parent_id);
                        if let Err(err) = self.start_internal(&instance, &orchestration, input, parent, false).await {
                            error!(instance = %instance, error = %err, "failed to start orchestration");
                        }
                        let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                    }
                    WorkItem::ActivityCompleted { instance, id, result } => {
                        let msg = OrchestratorMsg::ActivityCompleted {
                            instance,
                            id,
                            result,
                            ack_token,
                        };
                        self.deliver_or_rehydrate(token, msg).await;
                    }
                    WorkItem::ActivityFailed { instance, id, error } => {
                        let msg = OrchestratorMsg::ActivityFailed {
                            instance,
                            id,
                            error,
                            ack_token,
                        };
                        self.deliver_or_rehydrate(token, msg).await;
                    }
                    WorkItem::TimerFired {
                        instance,
                        id,
                        fire_at_ms,
                    } => {
                        let msg = OrchestratorMsg::TimerFired {
                            instance,
                            id,
                            fire_at_ms,
                            ack_token,
                        };
                        self.deliver_or_rehydrate(token, msg).await;
                    }
                    WorkItem::SubOrchCompleted {
                        parent_instance,
                        parent_id,
                        result,
                    } => {
                        let msg = OrchestratorMsg::SubOrchCompleted {
                            instance: parent_instance,
                            id: parent_id,
                            result,
                            ack_token,
                        };
                        self.deliver_or_rehydrate(token, msg).await;
                    }
                    WorkItem::SubOrchFailed {
                        parent_instance,
                        parent_id,
                        error,
                    } => {
                        let msg = OrchestratorMsg::SubOrchFailed {
                            instance: parent_instance,
                            id: parent_id,
                            error,
                            ack_token,
                        };
                        self.deliver_or_rehydrate(token, msg).await;
                    }
                    other => {
                        error!(?other, "unexpected WorkItem in Orchestrator dispatcher; dropping");
                        let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                    }
                }
            }
        })
    }

    fn start_work_dispatcher(self: Arc<Self>, activities: Arc<ActivityRegistry>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Worker).await else {
                    tokio::time::sleep(Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS)).await;
                    continue;
                };
                match item {
                    WorkItem::ActivityExecute { instance, id, name, input } => {
                        let rt = self.clone();
                        let activities = activities.clone();
                        tokio::spawn(async move {
                            let completion = match activities.get(&name) {
                                Some(handler) => match rt.execute_activity(handler, &instance, id, &name, input).await {
                                    Ok(result) => WorkItem::ActivityCompleted {
                                        instance: instance.clone(),
                                        id,
                                        result,
                                    },
                                    Err(error) => WorkItem::ActivityFailed {
                                        instance: instance.clone(),
                                        id,
                                        error,
                                    },
                                },
                                None => {
                                    warn!(instance = %instance, activity = %name, "activity is not registered");
                                    WorkItem::ActivityFailed {
                                        instance: instance.clone(),
                                        id,
                                        error: format!("unregistered activity:{name}"),
                                    }
                                }
                            };
                            if let Err(err) = rt.history_store.enqueue_work(QueueKind::Orchestrator, completion).await {
                                warn!(instance = %instance, id, error = %err, "failed to enqueue activity result");
                                let _ = rt.history_store.abandon(QueueKind::Worker, &token).await;
                                return;
                            }
                            let _ = rt.history_store.ack(QueueKind::Worker, &token).await;
                        });
                    }
                    other => {
                        error!(?other, "unexpected WorkItem in Worker dispatcher; dropping");
                        let _ = self.history_store.ack(QueueKind::Worker, &token).await;
                    }
                }
            }
        })
    }

    async fn execute_activity(
        &self,
        handler: Arc<dyn ActivityHandler>,
        instance: &str,
        id: u64,
        name: &str,
        input: String,
    ) -> Result<String, String> {
        let policy = &self.options.activity_retry;
        let mut attempt: u32 = 1;
        loop {
            match handler.invoke(input.clone()).await {
                Ok(result) => return Ok(result),
                Err(error) if attempt < policy.max_attempts => {
                    let delay = policy.delay_for(attempt);
                    warn!(instance, id, activity = name, attempt, error = %error, ?delay, "activity failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    debug!(instance, id, activity = name, attempt, error = %error, "activity failed");
                    return Err(error);
                }
            }
        }
    }

    fn start_timer_dispatcher(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let (service, timer_tx) = TimerService::start(self.history_store.clone(), Self::POLLER_IDLE_SLEEP_MS);
        let intake = tokio::spawn(async move {
            loop {
                let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Timer).await else {
                    tokio::time::sleep(Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS)).await;
                    continue;
                };
                match item {
                    WorkItem::TimerSchedule {
                        instance,
                        id,
                        fire_at_ms,
                    } => {
                        if timer_tx
                            .send(TimerRequest {
                                instance,
                                id,
                                fire_at_ms,
                            })
                            .is_err()
                        {
                            error!("timer service stopped; leaving timer queued");
                            let _ = self.history_store.abandon(QueueKind::Timer, &token).await;
                            return;
                        }
                        let _ = self.history_store.ack(QueueKind::Timer, &token).await;
                    }
                    other => {
                        error!(?other, "unexpected WorkItem in Timer dispatcher; dropping");
                        let _ = self.history_store.ack(QueueKind::Timer, &token).await;
                    }
                }
            }
        });
        vec![service, intake]
    }
}
