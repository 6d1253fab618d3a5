use crate::model::{now_utc, Order, OrderKind, Side, StopKind, StopOrder};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Conditional orders for one symbol, keyed by trigger price.
///
/// Buy stops trigger when the observed price rises to or above the trigger;
/// sell stops when it falls to or below. Within a trigger price, arrival
/// order is preserved.
#[derive(Debug, Default)]
pub struct StopOrderManager {
    buy_stops: BTreeMap<i64, VecDeque<StopOrder>>,
    sell_stops: BTreeMap<i64, VecDeque<StopOrder>>,
    order_index: HashMap<String, i64>,
}

impl StopOrderManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts a new stop order. Trailing stops start tracking from their
    /// own trigger price.
    pub fn add(&mut self, mut stop: StopOrder) {
        if stop.stop_type == StopKind::TrailingStop {
            stop.best_price = stop.trigger_price;
        }
        self.insert(stop);
    }

    /// Replay-path insertion: the stored trigger and best price are taken
    /// as-is.
    pub fn insert_from_replay(&mut self, stop: StopOrder) {
        self.insert(stop);
    }

    fn insert(&mut self, stop: StopOrder) {
        self.order_index
            .insert(stop.order_id.clone(), stop.trigger_price);
        let stops = match stop.side {
            Side::Buy => &mut self.buy_stops,
            Side::Sell => &mut self.sell_stops,
        };
        stops.entry(stop.trigger_price).or_default().push_back(stop);
    }

    pub fn cancel_stop_order(&mut self, order_id: &str) -> bool {
        let Some(&trigger_price) = self.order_index.get(order_id) else {
            return false;
        };
        for stops in [&mut self.buy_stops, &mut self.sell_stops] {
            if let Some(queue) = stops.get_mut(&trigger_price) {
                if let Some(pos) = queue.iter().position(|s| s.order_id == order_id) {
                    queue.remove(pos);
                    if queue.is_empty() {
                        stops.remove(&trigger_price);
                    }
                    self.order_index.remove(order_id);
                    return true;
                }
            }
        }
        false
    }

    /// Converts every stop whose trigger is crossed by `last_trade_price`
    /// into a live order, nearest trigger first. The caller feeds the
    /// returned orders back into the matching pipeline.
    pub fn check_triggers(&mut self, last_trade_price: i64) -> Vec<Order> {
        let mut triggered = Vec::new();

        while let Some((&trigger, _)) = self.buy_stops.first_key_value() {
            if trigger > last_trade_price {
                break;
            }
            let Some((_, queue)) = self.buy_stops.pop_first() else {
                break;
            };
            for stop in queue {
                self.order_index.remove(&stop.order_id);
                triggered.push(to_live_order(stop));
            }
        }

        while let Some((&trigger, _)) = self.sell_stops.last_key_value() {
            if trigger < last_trade_price {
                break;
            }
            let Some((_, queue)) = self.sell_stops.pop_last() else {
                break;
            };
            for stop in queue {
                self.order_index.remove(&stop.order_id);
                triggered.push(to_live_order(stop));
            }
        }

        triggered
    }

    /// Tightens trailing-stop triggers toward the current price; never
    /// loosens. Entries whose trigger changes are reinserted because the
    /// map key changes with them.
    pub fn update_trailing_stops(&mut self, current_price: i64) {
        let mut moved = Vec::new();

        extract_trailing(&mut self.buy_stops, &mut moved, |stop| {
            current_price < stop.best_price
        });
        for stop in &mut moved {
            stop.best_price = current_price;
            stop.trigger_price = current_price + stop.trail_amount;
        }
        for stop in moved.drain(..) {
            self.insert(stop);
        }

        extract_trailing(&mut self.sell_stops, &mut moved, |stop| {
            current_price > stop.best_price
        });
        for stop in &mut moved {
            stop.best_price = current_price;
            stop.trigger_price = current_price - stop.trail_amount;
        }
        for stop in moved {
            self.insert(stop);
        }
    }

    /// All held stops: buys ascending by trigger, then sells descending.
    pub fn active_stops(&self) -> Vec<StopOrder> {
        let mut stops = Vec::with_capacity(self.order_index.len());
        for queue in self.buy_stops.values() {
            stops.extend(queue.iter().cloned());
        }
        for queue in self.sell_stops.values().rev() {
            stops.extend(queue.iter().cloned());
        }
        stops
    }

    pub fn len(&self) -> usize {
        self.order_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order_index.is_empty()
    }
}

fn to_live_order(stop: StopOrder) -> Order {
    let (order_type, price) = match stop.stop_type {
        StopKind::StopLimit => (OrderKind::Limit, stop.limit_price),
        _ => (OrderKind::Market, 0),
    };
    Order {
        order_id: stop.order_id,
        symbol: stop.symbol,
        order_type,
        side: stop.side,
        quantity: stop.quantity,
        price,
        timestamp: now_utc(),
    }
}

fn extract_trailing(
    stops: &mut BTreeMap<i64, VecDeque<StopOrder>>,
    out: &mut Vec<StopOrder>,
    needs_update: impl Fn(&StopOrder) -> bool,
) {
    let keys: Vec<i64> = stops.keys().copied().collect();
    for key in keys {
        let Some(queue) = stops.get_mut(&key) else {
            continue;
        };
        let mut i = 0;
        while i < queue.len() {
            if queue[i].stop_type == StopKind::TrailingStop && needs_update(&queue[i]) {
                if let Some(stop) = queue.remove(i) {
                    out.push(stop);
                }
            } else {
                i += 1;
            }
        }
        if queue.is_empty() {
            stops.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stop(id: &str, kind: StopKind, side: Side, trigger: i64) -> StopOrder {
        StopOrder {
            order_id: id.to_string(),
            symbol: "BTC-USDT".to_string(),
            stop_type: kind,
            side,
            quantity: 100_000,
            trigger_price: trigger,
            limit_price: 0,
            trail_amount: 0,
            best_price: 0,
            created_at: now_utc(),
        }
    }

    #[test]
    fn buy_stop_triggers_at_or_above_trigger() {
        let mut mgr = StopOrderManager::new();
        mgr.add(stop("S1", StopKind::StopLoss, Side::Buy, 1_050_000));

        assert!(mgr.check_triggers(1_049_999).is_empty());
        let fired = mgr.check_triggers(1_050_000);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].order_id, "S1");
        assert_eq!(fired[0].order_type, OrderKind::Market);
        assert_eq!(fired[0].price, 0);
        assert!(mgr.is_empty());
    }

    #[test]
    fn sell_stop_triggers_at_or_below_trigger() {
        let mut mgr = StopOrderManager::new();
        mgr.add(stop("S1", StopKind::StopLoss, Side::Sell, 950_000));

        assert!(mgr.check_triggers(950_001).is_empty());
        let fired = mgr.check_triggers(950_000);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].side, Side::Sell);
    }

    #[test]
    fn triggers_fire_nearest_first() {
        let mut mgr = StopOrderManager::new();
        mgr.add(stop("far", StopKind::StopLoss, Side::Buy, 1_100_000));
        mgr.add(stop("near", StopKind::StopLoss, Side::Buy, 1_050_000));

        let fired = mgr.check_triggers(1_200_000);
        assert_eq!(fired.len(), 2);
        assert_eq!(fired[0].order_id, "near");
        assert_eq!(fired[1].order_id, "far");
    }

    #[test]
    fn untriggered_stops_are_left_in_place() {
        let mut mgr = StopOrderManager::new();
        mgr.add(stop("near", StopKind::StopLoss, Side::Buy, 1_050_000));
        mgr.add(stop("far", StopKind::StopLoss, Side::Buy, 1_100_000));

        let fired = mgr.check_triggers(1_050_000);
        assert_eq!(fired.len(), 1);
        assert_eq!(mgr.len(), 1);
        assert_eq!(mgr.active_stops()[0].order_id, "far");
    }

    #[test]
    fn stop_limit_converts_to_limit_at_its_limit_price() {
        let mut mgr = StopOrderManager::new();
        let mut s = stop("S1", StopKind::StopLimit, Side::Buy, 1_050_000);
        s.limit_price = 1_060_000;
        mgr.add(s);

        let fired = mgr.check_triggers(1_055_000);
        assert_eq!(fired[0].order_type, OrderKind::Limit);
        assert_eq!(fired[0].price, 1_060_000);
    }

    #[test]
    fn cancel_removes_from_index_and_map() {
        let mut mgr = StopOrderManager::new();
        mgr.add(stop("S1", StopKind::StopLoss, Side::Sell, 950_000));

        assert!(mgr.cancel_stop_order("S1"));
        assert!(!mgr.cancel_stop_order("S1"));
        assert!(mgr.check_triggers(1).is_empty());
    }

    #[test]
    fn trailing_sell_stop_ratchets_up_only() {
        let mut mgr = StopOrderManager::new();
        let mut s = stop("S1", StopKind::TrailingStop, Side::Sell, 990_000);
        s.trail_amount = 10_000;
        mgr.add(s);

        // Price rises: trigger follows at trail distance.
        mgr.update_trailing_stops(1_050_000);
        let stops = mgr.active_stops();
        assert_eq!(stops[0].trigger_price, 1_040_000);
        assert_eq!(stops[0].best_price, 1_050_000);

        // Price falls back: no loosening.
        mgr.update_trailing_stops(1_000_000);
        assert_eq!(mgr.active_stops()[0].trigger_price, 1_040_000);

        // The tightened trigger now fires on the way down.
        let fired = mgr.check_triggers(1_040_000);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].order_type, OrderKind::Market);
    }

    #[test]
    fn trailing_buy_stop_ratchets_down_only() {
        let mut mgr = StopOrderManager::new();
        let mut s = stop("S1", StopKind::TrailingStop, Side::Buy, 1_010_000);
        s.trail_amount = 10_000;
        mgr.add(s);

        mgr.update_trailing_stops(950_000);
        let stops = mgr.active_stops();
        assert_eq!(stops[0].trigger_price, 960_000);
        assert_eq!(stops[0].best_price, 950_000);

        mgr.update_trailing_stops(980_000);
        assert_eq!(mgr.active_stops()[0].trigger_price, 960_000);
    }

    #[test]
    fn trailing_update_keeps_cancellation_working() {
        let mut mgr = StopOrderManager::new();
        let mut s = stop("S1", StopKind::TrailingStop, Side::Sell, 990_000);
        s.trail_amount = 10_000;
        mgr.add(s);

        mgr.update_trailing_stops(1_050_000);
        assert!(mgr.cancel_stop_order("S1"));
        assert!(mgr.is_empty());
    }
}
