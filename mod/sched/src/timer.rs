use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use opsflow_core::{ServiceError, now_ms};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::model::TaskEvent;

/// A deferred WORKER-mode dispatch: produce `event` onto `topic` at
/// `fire_at` (epoch ms).
#[derive(Debug, Clone)]
pub struct TimerEntry {
    pub fire_at: i64,
    pub topic: String,
    pub event: TaskEvent,
}

/// Callback invoked when an entry comes due. Must be non-blocking
/// (fire-and-forget); implementations spawn their own work.
pub type FireFn = Arc<dyn Fn(TimerEntry) + Send + Sync>;

/// A priority queue of deadlines owned by one coordinator task.
///
/// All deferred dispatches funnel through this single task, which makes
/// cancellation and shutdown deterministic: cancelling the queue's token
/// unwinds the coordinator and drops every pending entry.
pub struct TimerQueue {
    tx: mpsc::UnboundedSender<TimerEntry>,
    cancel: CancellationToken,
}

struct HeapEntry {
    fire_at: i64,
    seq: u64,
    entry: TimerEntry,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.fire_at, self.seq).cmp(&(other.fire_at, other.seq))
    }
}

impl TimerQueue {
    /// Start the coordinator task.
    pub fn start(fire: FireFn) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<TimerEntry>();
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();

        tokio::spawn(async move {
            let mut heap: BinaryHeap<Reverse<HeapEntry>> = BinaryHeap::new();
            let mut seq: u64 = 0;
            info!("timer queue started");
            loop {
                let next_due = heap.peek().map(|Reverse(e)| e.fire_at);
                let sleep_for = next_due
                    .map(|at| Duration::from_millis((at - now_ms()).max(0) as u64))
                    .unwrap_or(Duration::from_secs(3600));

                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    entry = rx.recv() => match entry {
                        Some(entry) => {
                            seq += 1;
                            heap.push(Reverse(HeapEntry {
                                fire_at: entry.fire_at,
                                seq,
                                entry,
                            }));
                        }
                        None => break,
                    },
                    _ = tokio::time::sleep(sleep_for), if next_due.is_some() => {
                        let now = now_ms();
                        while let Some(Reverse(head)) = heap.peek() {
                            if head.fire_at > now {
                                break;
                            }
                            let Reverse(head) = heap.pop().unwrap();
                            debug!("timer fired for task {}", head.entry.event.task_id);
                            fire(head.entry);
                        }
                    }
                }
            }
            info!("timer queue stopped ({} entries dropped)", heap.len());
        });

        Self { tx, cancel }
    }

    /// Enqueue a deferred dispatch.
    pub fn schedule(&self, entry: TimerEntry) -> Result<(), ServiceError> {
        self.tx
            .send(entry)
            .map_err(|_| ServiceError::Unavailable("timer queue stopped".into()))
    }

    /// Stop the coordinator; pending entries are dropped.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
