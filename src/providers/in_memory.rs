use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use super::{HistoryStore, QueueKind, WorkItem, completion_key};
use crate::Event;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

struct LockedItem {
    kind: QueueKind,
    item: WorkItem,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    histories: HashMap<String, Vec<Event>>,
    queues: HashMap<QueueKind, VecDeque<WorkItem>>,
    locked: HashMap<String, LockedItem>,
    next_token: u64,
}

impl State {
    fn queue(&mut self, kind: QueueKind) -> &mut VecDeque<WorkItem> {
        self.queues.entry(kind).or_default()
    }

    // Locks that outlive their timeout become visible again at the head of the queue.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .locked
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(t, _)| t.clone())
            .collect();
        for token in expired {
            if let Some(l) = self.locked.remove(&token) {
                tracing::warn!(token = %token, kind = ?l.kind, "peek-lock expired; redelivering");
                self.queue(l.kind).push_front(l.item);
            }
        }
    }
}

/// Process-local `HistoryStore`. Histories and queues live in memory and are
/// lost when the store is dropped; sharing one store between runtimes lets a
/// second runtime resume the first one's instances.
///
/// Histories are unbounded unless a cap is set with `new_with_cap`. A capped
/// history still accepts its terminal event.
pub struct InMemoryHistoryStore {
    state: Mutex<State>,
    cap: Option<usize>,
    lock_timeout: Duration,
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            cap: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl InMemoryHistoryStore {
    /// Create a store with a custom per-instance history cap.
    pub fn new_with_cap(cap: usize) -> Self {
        Self {
            cap: Some(cap),
            ..Self::default()
        }
    }

    /// Override how long a peek-locked item stays invisible before redelivery.
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Number of items visible on a queue (locked items excluded).
    pub async fn queue_len(&self, kind: QueueKind) -> usize {
        self.state.lock().await.queues.get(&kind).map_or(0, VecDeque::len)
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        self.state
            .lock()
            .await
            .histories
            .get(instance)
            .cloned()
            .unwrap_or_default()
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String> {
        let mut state = self.state.lock().await;
        let history = state
            .histories
            .get_mut(instance)
            .ok_or_else(|| format!("instance not found: {instance}"))?;
        let growth = new_events.iter().filter(|e| !e.is_terminal()).count();
        if let Some(cap) = self.cap
            && growth > 0
            && history.len() + growth > cap
        {
            return Err(format!(
                "history cap exceeded (cap={cap}, have={}, append={growth})",
                history.len()
            ));
        }
        let mut seen: HashSet<(u64, &'static str)> = history.iter().filter_map(completion_key).collect();
        for ev in new_events {
            if let Some(key) = completion_key(&ev)
                && !seen.insert(key)
            {
                tracing::debug!(instance, ?ev, "dropping duplicate completion");
                continue;
            }
            history.push(ev);
        }
        Ok(())
    }

    async fn create_instance(&self, instance: &str) -> Result<(), String> {
        let mut state = self.state.lock().await;
        if state.histories.contains_key(instance) {
            return Err(format!("instance already exists: {instance}"));
        }
        state.histories.insert(instance.to_string(), Vec::new());
        Ok(())
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), String> {
        self.state
            .lock()
            .await
            .histories
            .remove(instance)
            .map(|_| ())
            .ok_or_else(|| format!("instance not found: {instance}"))
    }

    async fn list_instances(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().await.histories.keys().cloned().collect();
        names.sort();
        names
    }

    async fn reset(&self) {
        *self.state.lock().await = State::default();
    }

    async fn dump_all_pretty(&self) -> String {
        let state = self.state.lock().await;
        let mut names: Vec<&String> = state.histories.keys().collect();
        names.sort();
        let mut out = String::new();
        for name in names {
            out.push_str(&format!("instance={name}\n"));
            for ev in &state.histories[name] {
                out.push_str(&format!("  {ev:?}\n"));
            }
        }
        out
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String> {
        let mut state = self.state.lock().await;
        let queue = state.queue(kind);
        // Idempotent enqueue
        if !queue.contains(&item) {
            queue.push_back(item);
        }
        Ok(())
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.reclaim_expired(now);
        let item = state.queue(kind).pop_front()?;
        state.next_token += 1;
        let token = format!("{kind:?}-{}", state.next_token);
        state.locked.insert(
            token.clone(),
            LockedItem {
                kind,
                item: item.clone(),
                expires_at: now + self.lock_timeout,
            },
        );
        Some((item, token))
    }

    async fn ack(&self, _kind: QueueKind, token: &str) -> Result<(), String> {
        self.state.lock().await.locked.remove(token);
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let mut state = self.state.lock().await;
        if let Some(l) = state.locked.remove(token) {
            state.queue(kind).push_front(l.item);
        }
        Ok(())
    }
}
