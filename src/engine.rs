use crate::broadcast::{BookUpdate, BroadcastQueue, BroadcastSink};
use crate::model::{
    now_utc, FeeConfig, NewOrderRequest, NewStopRequest, Order, OrderKind, OrderStatus,
    RejectReason, StopOrder, Trade,
};
use crate::orderbook::{IntegrityError, OrderBook};
use crate::stops::StopOrderManager;
use crate::wal::{Wal, WalError, WalPayload};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use tracing::{error, info, warn};

/// Depth of the book snapshots attached to broadcasts.
const BOOK_BROADCAST_DEPTH: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("wal: {0}")]
    Wal(#[from] WalError),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub wal_path: PathBuf,
    pub broadcast_workers: usize,
    pub default_fees: FeeConfig,
    pub fee_overrides: HashMap<String, FeeConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            wal_path: PathBuf::from("./data/wal.jsonl"),
            broadcast_workers: default_worker_count(),
            default_fees: FeeConfig::default(),
            fee_overrides: HashMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(path) = env::var("WAL_PATH") {
            cfg.wal_path = PathBuf::from(path);
        }
        if let Some(workers) = getenv_parsed::<usize>("BROADCAST_WORKERS") {
            cfg.broadcast_workers = workers.max(1);
        }
        if let Some(bps) = getenv_parsed::<i64>("MAKER_FEE_BPS") {
            cfg.default_fees.maker_fee_bps = bps;
        }
        if let Some(bps) = getenv_parsed::<i64>("TAKER_FEE_BPS") {
            cfg.default_fees.taker_fee_bps = bps;
        }
        cfg
    }
}

fn default_worker_count() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

fn getenv_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

/// Caller-visible outcome of a submit.
#[derive(Debug, Clone, Serialize)]
pub struct OrderReceipt {
    pub order: Order,
    pub status: OrderStatus,
    pub trades: Vec<Trade>,
    pub filled_quantity: i64,
    pub remaining_quantity: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopReceipt {
    pub stop_order: StopOrder,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelReceipt {
    pub order_id: String,
    pub symbol: String,
    pub removed_resting: bool,
    pub removed_stop: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: time::OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolStats {
    pub symbol: String,
    pub best_bid: Option<i64>,
    pub best_ask: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub total_orders: u64,
    pub total_trades: u64,
    pub symbols: Vec<SymbolStats>,
}

/// The sequence point for every state mutation: WAL-append, then match,
/// then broadcast.
///
/// Lock order, outermost first: symbol maps / id index -> per-book lock ->
/// per-stop-manager lock. WAL and broadcast pushes happen with none of
/// those held; their internal queue locks are leaves.
pub struct Engine {
    cfg: EngineConfig,
    wal: Wal,
    broadcast: BroadcastQueue,
    books: Mutex<HashMap<String, Arc<Mutex<OrderBook>>>>,
    stops: Mutex<HashMap<String, Arc<Mutex<StopOrderManager>>>>,
    order_symbols: Mutex<HashMap<String, String>>,
    order_seq: AtomicU64,
    stop_seq: AtomicU64,
    trade_seq: Arc<AtomicU64>,
    total_orders: AtomicU64,
    total_trades: AtomicU64,
}

impl Engine {
    /// Opens the WAL (fatal on failure), starts the broadcast workers, and
    /// replays any existing log before accepting traffic.
    pub fn new(cfg: EngineConfig, sink: Arc<dyn BroadcastSink>) -> Result<Self, EngineError> {
        let wal = Wal::open(&cfg.wal_path)?;
        let broadcast = BroadcastQueue::start(cfg.broadcast_workers, sink);

        let engine = Self {
            cfg,
            wal,
            broadcast,
            books: Mutex::new(HashMap::new()),
            stops: Mutex::new(HashMap::new()),
            order_symbols: Mutex::new(HashMap::new()),
            order_seq: AtomicU64::new(1),
            stop_seq: AtomicU64::new(1),
            trade_seq: Arc::new(AtomicU64::new(1)),
            total_orders: AtomicU64::new(0),
            total_trades: AtomicU64::new(0),
        };
        engine.recover_from_wal()?;
        Ok(engine)
    }

    /// Accepts, logs, and matches an order; triggered stops are converted
    /// and matched in the same call via a work queue, so an arbitrarily
    /// long cascade cannot overflow the stack.
    pub fn submit(&self, req: NewOrderRequest) -> Result<OrderReceipt, RejectReason> {
        req.validate()?;

        let order = Order {
            order_id: format!("ORD-{}", self.order_seq.fetch_add(1, Ordering::SeqCst)),
            symbol: req.symbol.clone(),
            order_type: req.order_type,
            side: req.side,
            quantity: req.quantity,
            price: if req.order_type == OrderKind::Market {
                0
            } else {
                req.price
            },
            timestamp: now_utc(),
        };
        self.total_orders.fetch_add(1, Ordering::SeqCst);

        let book = self.ensure_book(&order.symbol);
        let stops = self.ensure_stop_manager(&order.symbol);
        lock(&self.order_symbols).insert(order.order_id.clone(), order.symbol.clone());

        let own_trades = self.run_matching(&order, &book, &stops);

        let filled_quantity: i64 = own_trades.iter().map(|t| t.quantity).sum();
        let remaining_quantity = (order.quantity - filled_quantity).max(0);
        let status = status_for(order.order_type, filled_quantity, remaining_quantity);

        Ok(OrderReceipt {
            order,
            status,
            trades: own_trades,
            filled_quantity,
            remaining_quantity,
        })
    }

    /// Accepts and logs a conditional order; it stays with the stop manager
    /// until triggered or cancelled.
    pub fn submit_stop(&self, req: NewStopRequest) -> Result<StopReceipt, RejectReason> {
        req.validate()?;

        let stop = StopOrder {
            order_id: format!("STO-{}", self.stop_seq.fetch_add(1, Ordering::SeqCst)),
            symbol: req.symbol.clone(),
            stop_type: req.stop_type,
            side: req.side,
            quantity: req.quantity,
            trigger_price: req.trigger_price,
            limit_price: req.limit_price,
            trail_amount: req.trail_amount,
            best_price: req.trigger_price,
            created_at: now_utc(),
        };
        self.total_orders.fetch_add(1, Ordering::SeqCst);

        self.wal.append_stop_order(&stop);
        let manager = self.ensure_stop_manager(&stop.symbol);
        lock(&self.order_symbols).insert(stop.order_id.clone(), stop.symbol.clone());
        lock(&manager).add(stop.clone());

        Ok(StopReceipt { stop_order: stop })
    }

    /// Cancels a resting or conditional order. A book update is broadcast
    /// only when a live resting order was removed; cancelling a stop does
    /// not change the visible book.
    pub fn cancel(&self, order_id: &str) -> Result<CancelReceipt, RejectReason> {
        let symbol = lock(&self.order_symbols)
            .get(order_id)
            .cloned()
            .ok_or_else(|| RejectReason::UnknownOrder(order_id.to_string()))?;

        let book = lock(&self.books).get(&symbol).cloned();
        let stops = lock(&self.stops).get(&symbol).cloned();

        let removed_resting = match &book {
            Some(book) => match lock(book).cancel_order(order_id) {
                Ok(removed) => removed,
                Err(err) => self.abort_on_integrity(err),
            },
            None => false,
        };
        let removed_stop = stops
            .as_ref()
            .map(|m| lock(m).cancel_stop_order(order_id))
            .unwrap_or(false);

        if !removed_resting && !removed_stop {
            return Err(RejectReason::UnknownOrder(order_id.to_string()));
        }

        self.wal.append_cancel(order_id, "user_request");
        lock(&self.order_symbols).remove(order_id);

        if removed_resting {
            if let Some(book) = &book {
                self.broadcast.push_book_update(snapshot_of(&lock(book)));
            }
        }

        Ok(CancelReceipt {
            order_id: order_id.to_string(),
            symbol,
            removed_resting,
            removed_stop,
            timestamp: now_utc(),
        })
    }

    /// Drives the append -> match -> broadcast -> trigger pipeline for an
    /// order and every stop it cascades into. Returns the trades of the
    /// originally submitted order only.
    fn run_matching(
        &self,
        origin: &Order,
        book: &Arc<Mutex<OrderBook>>,
        stops: &Arc<Mutex<StopOrderManager>>,
    ) -> Vec<Trade> {
        let mut own_trades = Vec::new();
        let mut pending = VecDeque::new();
        pending.push_back(origin.clone());

        while let Some(order) = pending.pop_front() {
            self.wal.append_order(&order);

            let trades = lock(book).add_order(&order);
            if order.order_id == origin.order_id {
                own_trades = trades.clone();
            }
            if trades.is_empty() {
                continue;
            }

            for trade in &trades {
                self.wal.append_trade(trade);
                self.broadcast.push_trade(trade);
            }
            self.total_trades
                .fetch_add(trades.len() as u64, Ordering::SeqCst);

            self.broadcast.push_book_update(snapshot_of(&lock(book)));

            let last_price = trades[trades.len() - 1].price;
            let triggered = {
                let mut manager = lock(stops);
                manager.update_trailing_stops(last_price);
                manager.check_triggers(last_price)
            };
            if !triggered.is_empty() {
                info!(
                    "{} stop order(s) triggered on {} at price {last_price}",
                    triggered.len(),
                    order.symbol
                );
            }
            pending.extend(triggered);
        }

        own_trades
    }

    /// Rebuilds books, stop managers, the id index, and all counters from
    /// the log. Trades are the authoritative ledger: staged quantities are
    /// decremented per trade rather than re-matched, and survivors are
    /// placed on their books without matching.
    fn recover_from_wal(&self) -> Result<(), EngineError> {
        let summary = self.wal.replay()?;
        if summary.malformed > 0 {
            warn!("wal replay skipped {} malformed line(s)", summary.malformed);
        }
        if summary.records.is_empty() {
            return Ok(());
        }

        let mut live_orders: HashMap<String, Order> = HashMap::new();
        let mut live_stops: HashMap<String, StopOrder> = HashMap::new();
        // Arrival order of first appearance; replaying in it preserves
        // price-time priority within every level.
        let mut order_arrival: Vec<String> = Vec::new();
        let mut stop_arrival: Vec<String> = Vec::new();

        let mut max_order = 0u64;
        let mut max_stop = 0u64;
        let mut max_trade = 0u64;
        let mut total_orders = 0u64;
        let mut total_trades = 0u64;

        for record in summary.records {
            match record.payload {
                WalPayload::Order(order) => {
                    if let Some(n) = id_suffix(&order.order_id, "ORD-") {
                        max_order = max_order.max(n);
                        total_orders += 1;
                    }
                    // An order record under a STO- id is a stop that
                    // triggered; the conditional entry is spent and the
                    // order was already counted when the stop was accepted.
                    live_stops.remove(&order.order_id);
                    if !live_orders.contains_key(&order.order_id) {
                        order_arrival.push(order.order_id.clone());
                    }
                    live_orders.insert(order.order_id.clone(), order);
                }
                WalPayload::StopOrder(record) => {
                    let stop = record.into_stop_order();
                    if let Some(n) = id_suffix(&stop.order_id, "STO-") {
                        max_stop = max_stop.max(n);
                    }
                    total_orders += 1;
                    if !live_stops.contains_key(&stop.order_id) {
                        stop_arrival.push(stop.order_id.clone());
                    }
                    live_stops.insert(stop.order_id.clone(), stop);
                }
                WalPayload::Trade(trade) => {
                    if let Some(n) = id_suffix(&trade.trade_id, "T-") {
                        max_trade = max_trade.max(n);
                    }
                    total_trades += 1;
                    for id in [&trade.maker_order_id, &trade.taker_order_id] {
                        if let Some(order) = live_orders.get_mut(id) {
                            order.quantity -= trade.quantity;
                            if order.quantity <= 0 {
                                live_orders.remove(id);
                            }
                        }
                    }
                }
                WalPayload::Cancel(cancel) => {
                    live_orders.remove(&cancel.order_id);
                    live_stops.remove(&cancel.order_id);
                }
            }
        }

        let mut restored_orders = 0usize;
        for id in order_arrival {
            let Some(order) = live_orders.remove(&id) else {
                continue;
            };
            // Only limit orders ever rest; market/IOC/FOK remainders were
            // discarded at accept time and left no cancel record behind.
            if order.order_type != OrderKind::Limit || order.quantity <= 0 {
                continue;
            }
            let book = self.ensure_book(&order.symbol);
            lock(&self.order_symbols).insert(order.order_id.clone(), order.symbol.clone());
            lock(&book).insert_resting(order);
            restored_orders += 1;
        }

        let mut restored_stops = 0usize;
        for id in stop_arrival {
            let Some(stop) = live_stops.remove(&id) else {
                continue;
            };
            let manager = self.ensure_stop_manager(&stop.symbol);
            lock(&self.order_symbols).insert(stop.order_id.clone(), stop.symbol.clone());
            lock(&manager).insert_from_replay(stop);
            restored_stops += 1;
        }

        self.order_seq.store(max_order + 1, Ordering::SeqCst);
        self.stop_seq.store(max_stop + 1, Ordering::SeqCst);
        self.trade_seq.store(max_trade + 1, Ordering::SeqCst);
        self.total_orders.store(total_orders, Ordering::SeqCst);
        self.total_trades.store(total_trades, Ordering::SeqCst);

        info!(
            "wal replay restored {restored_orders} resting order(s) and {restored_stops} stop(s)"
        );
        Ok(())
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = lock(&self.books).keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Point-in-time copy of the top `depth` levels of a symbol's book.
    pub fn book_snapshot(&self, symbol: &str, depth: usize) -> Option<BookUpdate> {
        let book = lock(&self.books).get(symbol).cloned()?;
        let book = lock(&book);
        Some(BookUpdate {
            symbol: symbol.to_string(),
            bids: book.top_bids(depth),
            asks: book.top_asks(depth),
            timestamp: now_utc(),
        })
    }

    /// Most recent trades for a symbol, newest first, read back from the
    /// WAL (the historical record; trades are not retained in memory).
    pub fn recent_trades(&self, symbol: &str, limit: usize) -> Result<Vec<Trade>, EngineError> {
        let summary = self.wal.replay()?;
        let mut trades: Vec<Trade> = summary
            .records
            .into_iter()
            .rev()
            .filter_map(|record| match record.payload {
                WalPayload::Trade(trade) if trade.symbol == symbol => Some(trade),
                _ => None,
            })
            .take(limit)
            .collect();
        trades.shrink_to_fit();
        Ok(trades)
    }

    pub fn active_stops(&self, symbol: &str) -> Vec<StopOrder> {
        match lock(&self.stops).get(symbol).cloned() {
            Some(manager) => lock(&manager).active_stops(),
            None => Vec::new(),
        }
    }

    pub fn stats(&self) -> EngineStats {
        let books: Vec<(String, Arc<Mutex<OrderBook>>)> = lock(&self.books)
            .iter()
            .map(|(symbol, book)| (symbol.clone(), Arc::clone(book)))
            .collect();

        let mut symbols: Vec<SymbolStats> = books
            .into_iter()
            .map(|(symbol, book)| {
                let book = lock(&book);
                SymbolStats {
                    symbol,
                    best_bid: book.best_bid(),
                    best_ask: book.best_ask(),
                }
            })
            .collect();
        symbols.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        EngineStats {
            total_orders: self.total_orders.load(Ordering::SeqCst),
            total_trades: self.total_trades.load(Ordering::SeqCst),
            symbols,
        }
    }

    pub fn total_orders(&self) -> u64 {
        self.total_orders.load(Ordering::SeqCst)
    }

    pub fn total_trades(&self) -> u64 {
        self.total_trades.load(Ordering::SeqCst)
    }

    pub fn flush_wal(&self) {
        self.wal.flush();
    }

    /// Drains and stops the broadcast workers and the WAL writer.
    /// Idempotent; queries remain usable afterwards.
    pub fn stop(&self) {
        self.broadcast.stop();
        self.wal.stop();
    }

    fn ensure_book(&self, symbol: &str) -> Arc<Mutex<OrderBook>> {
        let mut books = lock(&self.books);
        Arc::clone(books.entry(symbol.to_string()).or_insert_with(|| {
            let fees = self
                .cfg
                .fee_overrides
                .get(symbol)
                .copied()
                .unwrap_or(self.cfg.default_fees);
            Arc::new(Mutex::new(OrderBook::new(
                symbol,
                fees,
                Arc::clone(&self.trade_seq),
            )))
        }))
    }

    fn ensure_stop_manager(&self, symbol: &str) -> Arc<Mutex<StopOrderManager>> {
        let mut stops = lock(&self.stops);
        Arc::clone(
            stops
                .entry(symbol.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(StopOrderManager::new()))),
        )
    }

    /// A corrupt book index means matching can no longer be trusted.
    fn abort_on_integrity(&self, err: IntegrityError) -> ! {
        error!("order book integrity violation: {err}");
        self.wal.flush();
        std::process::abort();
    }
}

fn snapshot_of(book: &OrderBook) -> BookUpdate {
    BookUpdate {
        symbol: book.symbol().to_string(),
        bids: book.top_bids(BOOK_BROADCAST_DEPTH),
        asks: book.top_asks(BOOK_BROADCAST_DEPTH),
        timestamp: now_utc(),
    }
}

fn status_for(kind: OrderKind, filled: i64, remaining: i64) -> OrderStatus {
    match kind {
        OrderKind::Fok => {
            if remaining == 0 {
                OrderStatus::Filled
            } else {
                OrderStatus::Cancelled
            }
        }
        OrderKind::Market | OrderKind::Ioc => {
            if filled == 0 {
                OrderStatus::Cancelled
            } else if remaining > 0 {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::Filled
            }
        }
        OrderKind::Limit => {
            if remaining == 0 {
                OrderStatus::Filled
            } else if filled > 0 {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::Open
            }
        }
    }
}

fn id_suffix(id: &str, prefix: &str) -> Option<u64> {
    id.strip_prefix(prefix)?.parse().ok()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
