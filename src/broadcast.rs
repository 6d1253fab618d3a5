use crate::model::Trade;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Destination for client-facing updates: the WebSocket layer's
/// "broadcast to all connected clients" entry point. Implementations must
/// tolerate concurrent calls from multiple worker threads.
pub trait BroadcastSink: Send + Sync {
    fn deliver(&self, payload: &str) -> Result<(), String>;
}

/// Depth-limited view of one side-pair of a book, price best-first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookUpdate {
    pub symbol: String,
    pub bids: Vec<(i64, i64)>,
    pub asks: Vec<(i64, i64)>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: time::OffsetDateTime,
}

/// Client-facing message shapes: `{"type":"trade","data":{...}}` and
/// `{"type":"orderbook","data":{...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum BroadcastMessage {
    Trade(Trade),
    Orderbook(BookUpdate),
}

struct QueueShared {
    queue: Mutex<VecDeque<String>>,
    cond: Condvar,
    running: AtomicBool,
}

/// FIFO of serialized messages drained by a pool of worker threads, so that
/// a slow client sink never back-pressures the matching path.
///
/// With more than one worker, two messages popped in order may reach the
/// sink in either order; book updates carry their symbol and latest-wins
/// semantics, and trades are self-describing.
pub struct BroadcastQueue {
    shared: Arc<QueueShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BroadcastQueue {
    pub fn start(worker_count: usize, sink: Arc<dyn BroadcastSink>) -> Self {
        let worker_count = worker_count.max(1);
        let shared = Arc::new(QueueShared {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            running: AtomicBool::new(true),
        });

        debug!("starting {worker_count} broadcast workers");
        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let shared = Arc::clone(&shared);
            let sink = Arc::clone(&sink);
            let handle = thread::Builder::new()
                .name(format!("broadcast-{i}"))
                .spawn(move || worker_loop(shared, sink));
            match handle {
                Ok(handle) => workers.push(handle),
                Err(err) => error!("failed to spawn broadcast worker: {err}"),
            }
        }

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    pub fn push_trade(&self, trade: &Trade) {
        self.push_message(&BroadcastMessage::Trade(trade.clone()));
    }

    pub fn push_book_update(&self, update: BookUpdate) {
        self.push_message(&BroadcastMessage::Orderbook(update));
    }

    fn push_message(&self, message: &BroadcastMessage) {
        if !self.shared.running.load(Ordering::SeqCst) {
            return;
        }
        // Serialize before taking the lock; the push itself is O(1).
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(err) => {
                error!("failed to serialize broadcast message: {err}");
                return;
            }
        };
        lock(&self.shared.queue).push_back(payload);
        self.shared.cond.notify_one();
    }

    pub fn queued(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    /// Wakes every worker and joins them once the queue is drained.
    /// Idempotent; producers observe pushes as no-ops afterwards.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.cond.notify_all();
        let workers = std::mem::take(&mut *lock(&self.workers));
        for handle in workers {
            if handle.join().is_err() {
                error!("broadcast worker panicked");
            }
        }
    }
}

impl Drop for BroadcastQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: Arc<QueueShared>, sink: Arc<dyn BroadcastSink>) {
    loop {
        // Pop exactly one message so idle workers can run other deliveries
        // in parallel; the sink call happens with the lock released.
        let payload = {
            let mut queue = lock(&shared.queue);
            loop {
                if let Some(payload) = queue.pop_front() {
                    break Some(payload);
                }
                if !shared.running.load(Ordering::SeqCst) {
                    break None;
                }
                queue = shared
                    .cond
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        let Some(payload) = payload else { return };
        if let Err(err) = sink.deliver(&payload) {
            error!("broadcast sink error: {err}");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
