use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::now_ms;
use crate::providers::{HistoryStore, QueueKind, WorkItem};

/// Timer armed for an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TimerRequest {
    pub instance: String,
    pub id: u64,
    pub fire_at_ms: u64,
}

/// In-process timer wheel: keeps armed timers ordered by due time and
/// enqueues `TimerFired` on the orchestrator queue when they come due.
pub(crate) struct TimerService {
    store: Arc<dyn HistoryStore>,
    rx: mpsc::UnboundedReceiver<TimerRequest>,
    // (fire_at_ms, seq) keeps same-millisecond timers distinct
    pending: BTreeMap<(u64, u64), TimerRequest>,
    seq: u64,
    idle: Duration,
}

impl TimerService {
    pub(crate) fn start(store: Arc<dyn HistoryStore>, idle_ms: u64) -> (JoinHandle<()>, mpsc::UnboundedSender<TimerRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let svc = TimerService {
            store,
            rx,
            pending: BTreeMap::new(),
            seq: 0,
            idle: Duration::from_millis(idle_ms.max(1) * 100),
        };
        (tokio::spawn(svc.run()), tx)
    }

    async fn run(mut self) {
        loop {
            self.fire_due().await;
            let wait = match self.pending.keys().next() {
                Some((fire_at, _)) => Duration::from_millis(fire_at.saturating_sub(now_ms())),
                None => self.idle,
            };
            tokio::select! {
                req = self.rx.recv() => match req {
                    Some(req) => self.arm(req),
                    None => return,
                },
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn arm(&mut self, req: TimerRequest) {
        self.seq += 1;
        self.pending.insert((req.fire_at_ms, self.seq), req);
    }

    async fn fire_due(&mut self) {
        let now = now_ms();
        while let Some(entry) = self.pending.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let req = entry.remove();
            let item = WorkItem::TimerFired {
                instance: req.instance.clone(),
                id: req.id,
                fire_at_ms: req.fire_at_ms,
            };
            if let Err(err) = self.store.enqueue_work(QueueKind::Orchestrator, item).await {
                warn!(instance = %req.instance, id = req.id, error = %err, "failed to enqueue TimerFired; re-arming");
                self.arm(req);
                break;
            }
        }
    }
}
