use crate::model::{now_utc, FeeConfig, Order, OrderKind, Side, Trade, QTY_SCALE};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The id index referenced a level or entry that is no longer present.
/// Book integrity can no longer be guaranteed; the engine treats this as fatal.
#[derive(Debug, Clone, thiserror::Error)]
#[error("order index for {order_id} points at missing {side:?} entry at price {price}")]
pub struct IntegrityError {
    pub order_id: String,
    pub price: i64,
    pub side: Side,
}

/// One side's resting liquidity: price level -> FIFO queue of orders.
/// Bids iterate descending, asks ascending.
type LevelMap = BTreeMap<i64, VecDeque<Order>>;

/// Price-time-priority order book for a single symbol.
///
/// Not internally synchronized; the engine wraps each book in a `Mutex` and
/// holds it for the full duration of every operation.
#[derive(Debug)]
pub struct OrderBook {
    symbol: String,
    bids: LevelMap,
    asks: LevelMap,
    order_index: HashMap<String, (i64, Side)>,
    fee_config: FeeConfig,
    trade_seq: Arc<AtomicU64>,
}

impl OrderBook {
    pub fn new(symbol: &str, fee_config: FeeConfig, trade_seq: Arc<AtomicU64>) -> Self {
        Self {
            symbol: symbol.to_string(),
            bids: LevelMap::new(),
            asks: LevelMap::new(),
            order_index: HashMap::new(),
            fee_config,
            trade_seq,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn set_fee_config(&mut self, fee_config: FeeConfig) {
        self.fee_config = fee_config;
    }

    /// Matches an incoming order against resting liquidity and returns the
    /// resulting trades, oldest first. Limit remainders rest on the book;
    /// market/IOC remainders are discarded; FOK is pre-checked and either
    /// fills entirely or leaves the book untouched.
    pub fn add_order(&mut self, order: &Order) -> Vec<Trade> {
        let mut trades = Vec::new();

        if order.order_type == OrderKind::Fok && !self.fok_fillable(order) {
            return trades;
        }

        let symbol = self.symbol.clone();
        let fees = self.fee_config;
        let trade_seq = Arc::clone(&self.trade_seq);
        let mut remaining = order.quantity;

        while remaining > 0 {
            let level_price = match order.side {
                Side::Buy => self.asks.keys().next().copied(),
                Side::Sell => self.bids.keys().next_back().copied(),
            };
            let Some(price) = level_price else { break };
            if !crosses(order, price) {
                break;
            }

            let levels = match order.side {
                Side::Buy => &mut self.asks,
                Side::Sell => &mut self.bids,
            };
            let Some(queue) = levels.get_mut(&price) else {
                break;
            };

            while remaining > 0 {
                let Some(maker) = queue.front_mut() else { break };
                let fill = remaining.min(maker.quantity);

                let mut trade = Trade {
                    trade_id: next_trade_id(&trade_seq),
                    symbol: symbol.clone(),
                    price,
                    quantity: fill,
                    aggressor_side: order.side,
                    maker_order_id: maker.order_id.clone(),
                    taker_order_id: order.order_id.clone(),
                    maker_fee: 0,
                    taker_fee: 0,
                    timestamp: now_utc(),
                };
                apply_fees(fees, &mut trade);
                trades.push(trade);

                remaining -= fill;
                maker.quantity -= fill;
                if maker.quantity == 0 {
                    if let Some(filled) = queue.pop_front() {
                        self.order_index.remove(&filled.order_id);
                    }
                }
            }

            let empty = queue.is_empty();
            if empty {
                levels.remove(&price);
            }
        }

        if remaining > 0 && order.order_type == OrderKind::Limit {
            let mut resting = order.clone();
            resting.quantity = remaining;
            self.insert_resting(resting);
        }

        trades
    }

    /// Places an order directly on the book without matching. Used by WAL
    /// replay, where the trade records already account for every fill.
    pub fn insert_resting(&mut self, order: Order) {
        self.order_index
            .insert(order.order_id.clone(), (order.price, order.side));
        let levels = match order.side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        levels.entry(order.price).or_default().push_back(order);
    }

    /// Removes a resting order. `Ok(false)` when the id is not on the book.
    pub fn cancel_order(&mut self, order_id: &str) -> Result<bool, IntegrityError> {
        let Some(&(price, side)) = self.order_index.get(order_id) else {
            return Ok(false);
        };
        let corrupt = || IntegrityError {
            order_id: order_id.to_string(),
            price,
            side,
        };

        let levels = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        let queue = levels.get_mut(&price).ok_or_else(corrupt)?;
        let pos = queue
            .iter()
            .position(|o| o.order_id == order_id)
            .ok_or_else(corrupt)?;
        queue.remove(pos);
        self.order_index.remove(order_id);
        if queue.is_empty() {
            levels.remove(&price);
        }
        Ok(true)
    }

    pub fn best_bid(&self) -> Option<i64> {
        self.bids.keys().next_back().copied()
    }

    pub fn best_ask(&self) -> Option<i64> {
        self.asks.keys().next().copied()
    }

    /// Top `n` bid levels, best first, as (price, aggregate quantity).
    pub fn top_bids(&self, n: usize) -> Vec<(i64, i64)> {
        self.bids
            .iter()
            .rev()
            .take(n)
            .map(|(&price, queue)| (price, queue.iter().map(|o| o.quantity).sum()))
            .collect()
    }

    /// Top `n` ask levels, best first, as (price, aggregate quantity).
    pub fn top_asks(&self, n: usize) -> Vec<(i64, i64)> {
        self.asks
            .iter()
            .take(n)
            .map(|(&price, queue)| (price, queue.iter().map(|o| o.quantity).sum()))
            .collect()
    }

    pub fn resting_orders(&self) -> usize {
        self.order_index.len()
    }

    /// Sums available quantity in matching order under the order's price
    /// constraint, stopping as soon as the order is covered.
    fn fok_fillable(&self, order: &Order) -> bool {
        let mut fillable: i64 = 0;
        match order.side {
            Side::Buy => {
                for (&price, queue) in &self.asks {
                    if price > order.price {
                        break;
                    }
                    for resting in queue {
                        fillable += resting.quantity;
                        if fillable >= order.quantity {
                            return true;
                        }
                    }
                }
            }
            Side::Sell => {
                for (&price, queue) in self.bids.iter().rev() {
                    if price < order.price {
                        break;
                    }
                    for resting in queue {
                        fillable += resting.quantity;
                        if fillable >= order.quantity {
                            return true;
                        }
                    }
                }
            }
        }
        fillable >= order.quantity
    }
}

fn crosses(order: &Order, resting_price: i64) -> bool {
    match order.order_type {
        OrderKind::Market => true,
        _ => match order.side {
            Side::Buy => order.price >= resting_price,
            Side::Sell => order.price <= resting_price,
        },
    }
}

fn next_trade_id(seq: &AtomicU64) -> String {
    format!("T-{}", seq.fetch_add(1, Ordering::SeqCst))
}

fn apply_fees(fees: FeeConfig, trade: &mut Trade) {
    let notional = trade.price * trade.quantity / QTY_SCALE;
    trade.maker_fee = notional * fees.maker_fee_bps / 10_000;
    trade.taker_fee = notional * fees.taker_fee_bps / 10_000;
}
