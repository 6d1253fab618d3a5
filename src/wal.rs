use crate::model::{now_nanos, Order, Side, StopKind, StopOrder, Trade};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{error, warn};

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Typed envelope stored one-per-line in the log file:
/// `{"type": <kind>, "timestamp": <ns>, "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    pub timestamp: i64,
    #[serde(flatten)]
    pub payload: WalPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WalPayload {
    Order(Order),
    StopOrder(StopOrderRecord),
    Trade(Trade),
    Cancel(CancelRecord),
}

impl WalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            WalPayload::Order(_) => "order",
            WalPayload::StopOrder(_) => "stop_order",
            WalPayload::Trade(_) => "trade",
            WalPayload::Cancel(_) => "cancel",
        }
    }
}

/// Stop-order payload as it appears on disk. Carries a literal
/// `order_type: "stop"` discriminator next to the concrete `stop_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopOrderRecord {
    pub order_id: String,
    pub symbol: String,
    pub order_type: String,
    pub stop_type: StopKind,
    pub side: Side,
    pub quantity: i64,
    pub trigger_price: i64,
    pub limit_price: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl From<&StopOrder> for StopOrderRecord {
    fn from(stop: &StopOrder) -> Self {
        Self {
            order_id: stop.order_id.clone(),
            symbol: stop.symbol.clone(),
            order_type: "stop".to_string(),
            stop_type: stop.stop_type,
            side: stop.side,
            quantity: stop.quantity,
            trigger_price: stop.trigger_price,
            limit_price: stop.limit_price,
            timestamp: stop.created_at,
        }
    }
}

impl StopOrderRecord {
    /// Rebuilds a live stop order from its on-disk form. Trailing state is
    /// not persisted; tracking restarts from the stored trigger price.
    pub fn into_stop_order(self) -> StopOrder {
        StopOrder {
            order_id: self.order_id,
            symbol: self.symbol,
            stop_type: self.stop_type,
            side: self.side,
            quantity: self.quantity,
            trigger_price: self.trigger_price,
            limit_price: self.limit_price,
            trail_amount: 0,
            best_price: self.trigger_price,
            created_at: self.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRecord {
    pub order_id: String,
    pub reason: String,
}

/// Result of reading a log file front to back. Malformed lines are skipped,
/// not fatal.
#[derive(Debug, Default)]
pub struct ReplaySummary {
    pub records: Vec<WalRecord>,
    pub malformed: usize,
}

enum WalEntry {
    Line(String),
    Rotate(PathBuf),
    Flush(SyncSender<()>),
}

struct WalShared {
    queue: Mutex<VecDeque<WalEntry>>,
    cond: Condvar,
    running: AtomicBool,
}

/// Append-only event log with a dedicated writer thread.
///
/// Producers serialize records outside the queue lock and hand the finished
/// line to the writer; nothing on the submit path touches the file handle.
/// The writer drains the queue in batches and flushes once per batch.
pub struct Wal {
    path: Mutex<PathBuf>,
    shared: Arc<WalShared>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Wal {
    /// Opens the log for appending, creating parent directories as needed,
    /// and starts the writer thread. Open failure is fatal to the caller:
    /// the engine cannot accept writes without a log.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let shared = Arc::new(WalShared {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            running: AtomicBool::new(true),
        });
        let writer_shared = Arc::clone(&shared);
        let writer_path = path.clone();
        let writer = thread::Builder::new()
            .name("wal-writer".to_string())
            .spawn(move || writer_loop(file, writer_path, writer_shared))?;

        Ok(Self {
            path: Mutex::new(path),
            shared,
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn append_order(&self, order: &Order) {
        self.append(WalPayload::Order(order.clone()));
    }

    pub fn append_stop_order(&self, stop: &StopOrder) {
        self.append(WalPayload::StopOrder(StopOrderRecord::from(stop)));
    }

    pub fn append_trade(&self, trade: &Trade) {
        self.append(WalPayload::Trade(trade.clone()));
    }

    pub fn append_cancel(&self, order_id: &str, reason: &str) {
        self.append(WalPayload::Cancel(CancelRecord {
            order_id: order_id.to_string(),
            reason: reason.to_string(),
        }));
    }

    fn append(&self, payload: WalPayload) {
        if !self.shared.running.load(Ordering::SeqCst) {
            return;
        }
        let record = WalRecord {
            timestamp: now_nanos(),
            payload,
        };
        // Serialization is the expensive step; keep it outside the lock.
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(err) => {
                error!("failed to serialize wal record: {err}");
                return;
            }
        };
        lock(&self.shared.queue).push_back(WalEntry::Line(line));
        self.shared.cond.notify_one();
    }

    /// Best-effort synchronous flush: waits (bounded) until the writer has
    /// flushed everything enqueued before this call.
    pub fn flush(&self) {
        if !self.shared.running.load(Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = mpsc::sync_channel(1);
        lock(&self.shared.queue).push_back(WalEntry::Flush(tx));
        self.shared.cond.notify_one();
        let _ = rx.recv_timeout(Duration::from_secs(2));
    }

    /// Renames the current file with a unix-seconds suffix and continues
    /// writing at `new_path`. Ordered with respect to concurrent appends
    /// because the request travels through the writer queue.
    pub fn rotate<P: AsRef<Path>>(&self, new_path: P) {
        let new_path = new_path.as_ref().to_path_buf();
        if !self.shared.running.load(Ordering::SeqCst) {
            return;
        }
        *lock(&self.path) = new_path.clone();
        lock(&self.shared.queue).push_back(WalEntry::Rotate(new_path));
        self.shared.cond.notify_one();
    }

    /// Reads the current log file head to tail. A missing file yields an
    /// empty summary; malformed lines are counted and skipped.
    pub fn replay(&self) -> Result<ReplaySummary, WalError> {
        let path = lock(&self.path).clone();
        replay_file(&path)
    }

    pub fn path(&self) -> PathBuf {
        lock(&self.path).clone()
    }

    /// Stops the writer, draining everything enqueued first. Idempotent.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.cond.notify_all();
        let handle = lock(&self.writer).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("wal writer thread panicked");
            }
        }
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Parses a log file without going through a live `Wal`. Used by replay and
/// by the `wal-tool` binary.
pub fn replay_file(path: &Path) -> Result<ReplaySummary, WalError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ReplaySummary::default())
        }
        Err(err) => return Err(WalError::Io(err)),
    };

    let mut summary = ReplaySummary::default();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<WalRecord>(&line) {
            Ok(record) => summary.records.push(record),
            Err(err) => {
                summary.malformed += 1;
                warn!("skipping malformed wal line {}: {err}", line_no + 1);
            }
        }
    }
    Ok(summary)
}

fn writer_loop(mut file: File, mut path: PathBuf, shared: Arc<WalShared>) {
    let mut local: VecDeque<WalEntry> = VecDeque::new();
    loop {
        {
            let mut queue = lock(&shared.queue);
            while queue.is_empty() && shared.running.load(Ordering::SeqCst) {
                queue = shared
                    .cond
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            // Swap bounds lock-hold time to the exchange itself; the batch
            // is written with the lock released.
            std::mem::swap(&mut *queue, &mut local);
        }

        if local.is_empty() {
            if !shared.running.load(Ordering::SeqCst) {
                break;
            }
            continue;
        }

        let mut dirty = false;
        for entry in local.drain(..) {
            match entry {
                WalEntry::Line(line) => {
                    if let Err(err) = writeln!(file, "{line}") {
                        error!("wal write failed: {err}");
                    } else {
                        dirty = true;
                    }
                }
                WalEntry::Rotate(new_path) => {
                    if dirty {
                        if let Err(err) = file.flush() {
                            error!("wal flush before rotate failed: {err}");
                        }
                        dirty = false;
                    }
                    match rotate_file(&path, &new_path) {
                        Ok(new_file) => {
                            file = new_file;
                            path = new_path;
                        }
                        Err(err) => error!("wal rotate failed: {err}"),
                    }
                }
                WalEntry::Flush(ack) => {
                    if let Err(err) = file.flush().and_then(|()| file.sync_data()) {
                        error!("wal flush failed: {err}");
                    }
                    dirty = false;
                    let _ = ack.send(());
                }
            }
        }
        if dirty {
            if let Err(err) = file.flush() {
                error!("wal flush failed: {err}");
            }
        }
    }

    let _ = file.flush();
    let _ = file.sync_data();
}

fn rotate_file(current: &Path, new_path: &Path) -> Result<File, std::io::Error> {
    let suffix = now_nanos() / 1_000_000_000;
    let mut rotated = current.as_os_str().to_owned();
    rotated.push(format!(".{suffix}"));
    fs::rename(current, PathBuf::from(rotated))?;
    if let Some(parent) = new_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(new_path)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
