use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Prices are fixed-point with two decimal places.
pub const PRICE_SCALE: i64 = 100;
/// Quantities are fixed-point with six decimal places.
pub const QTY_SCALE: i64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Market,
    Limit,
    Ioc,
    Fok,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Market => "market",
            OrderKind::Limit => "limit",
            OrderKind::Ioc => "ioc",
            OrderKind::Fok => "fok",
        }
    }
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StopKind {
    StopLoss,
    StopLimit,
    TakeProfit,
    TrailingStop,
}

impl StopKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopKind::StopLoss => "stop_loss",
            StopKind::StopLimit => "stop_limit",
            StopKind::TakeProfit => "take_profit",
            StopKind::TrailingStop => "trailing_stop",
        }
    }
}

/// An accepted order. `price` is zero exactly when `order_type` is market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub symbol: String,
    pub order_type: OrderKind,
    pub side: Side,
    pub quantity: i64,
    pub price: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub symbol: String,
    pub price: i64,
    pub quantity: i64,
    pub aggressor_side: Side,
    pub maker_order_id: String,
    pub taker_order_id: String,
    pub maker_fee: i64,
    pub taker_fee: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Conditional order held by the stop manager until its trigger is crossed.
///
/// `best_price` is only meaningful for trailing stops: the most favourable
/// market price observed since the stop was accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopOrder {
    pub order_id: String,
    pub symbol: String,
    pub stop_type: StopKind,
    pub side: Side,
    pub quantity: i64,
    pub trigger_price: i64,
    pub limit_price: i64,
    pub trail_amount: i64,
    pub best_price: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    Filled,
    PartiallyFilled,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Filled => "filled",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

/// Maker/taker fee schedule in basis points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeConfig {
    pub maker_fee_bps: i64,
    pub taker_fee_bps: i64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            maker_fee_bps: 10,
            taker_fee_bps: 20,
        }
    }
}

/// An order request as handed over by the HTTP collaborator after shape
/// validation. Field-level validation happens in [`NewOrderRequest::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrderRequest {
    pub symbol: String,
    pub order_type: OrderKind,
    pub side: Side,
    pub quantity: i64,
    #[serde(default)]
    pub price: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewStopRequest {
    pub symbol: String,
    pub stop_type: StopKind,
    pub side: Side,
    pub quantity: i64,
    pub trigger_price: i64,
    #[serde(default)]
    pub limit_price: i64,
    #[serde(default)]
    pub trail_amount: i64,
}

/// Request-local rejections. These never reach the WAL or a book.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("symbol must not be empty")]
    EmptySymbol,
    #[error("quantity must be positive")]
    NonPositiveQuantity,
    #[error("{0} order requires a price")]
    MissingPrice(OrderKind),
    #[error("price must be positive")]
    NonPositivePrice,
    #[error("trigger price must be positive")]
    NonPositiveTriggerPrice,
    #[error("stop_limit requires limit_price")]
    MissingLimitPrice,
    #[error("trailing_stop requires trail_amount")]
    MissingTrailAmount,
    #[error("unknown order: {0}")]
    UnknownOrder(String),
}

impl NewOrderRequest {
    pub fn validate(&self) -> Result<(), RejectReason> {
        if self.symbol.trim().is_empty() {
            return Err(RejectReason::EmptySymbol);
        }
        if self.quantity <= 0 {
            return Err(RejectReason::NonPositiveQuantity);
        }
        match self.order_type {
            OrderKind::Market => Ok(()),
            kind => {
                if self.price == 0 {
                    Err(RejectReason::MissingPrice(kind))
                } else if self.price < 0 {
                    Err(RejectReason::NonPositivePrice)
                } else {
                    Ok(())
                }
            }
        }
    }
}

impl NewStopRequest {
    pub fn validate(&self) -> Result<(), RejectReason> {
        if self.symbol.trim().is_empty() {
            return Err(RejectReason::EmptySymbol);
        }
        if self.quantity <= 0 {
            return Err(RejectReason::NonPositiveQuantity);
        }
        if self.trigger_price <= 0 {
            return Err(RejectReason::NonPositiveTriggerPrice);
        }
        match self.stop_type {
            StopKind::StopLimit if self.limit_price <= 0 => Err(RejectReason::MissingLimitPrice),
            StopKind::TrailingStop if self.trail_amount <= 0 => {
                Err(RejectReason::MissingTrailAmount)
            }
            _ => Ok(()),
        }
    }
}

pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Nanoseconds since the Unix epoch, for WAL record envelopes.
pub fn now_nanos() -> i64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    i64::try_from(nanos).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_kind_round_trips_through_wire_names() {
        for (kind, name) in [
            (OrderKind::Market, "\"market\""),
            (OrderKind::Limit, "\"limit\""),
            (OrderKind::Ioc, "\"ioc\""),
            (OrderKind::Fok, "\"fok\""),
        ] {
            assert_eq!(serde_json::to_string(&kind).unwrap(), name);
            let parsed: OrderKind = serde_json::from_str(name).unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn limit_request_requires_price() {
        let req = NewOrderRequest {
            symbol: "BTC-USDT".to_string(),
            order_type: OrderKind::Limit,
            side: Side::Buy,
            quantity: 1_000_000,
            price: 0,
        };
        assert_eq!(
            req.validate(),
            Err(RejectReason::MissingPrice(OrderKind::Limit))
        );
    }

    #[test]
    fn market_request_ignores_price() {
        let req = NewOrderRequest {
            symbol: "BTC-USDT".to_string(),
            order_type: OrderKind::Market,
            side: Side::Sell,
            quantity: 1,
            price: 0,
        };
        assert_eq!(req.validate(), Ok(()));
    }

    #[test]
    fn stop_limit_requires_limit_price() {
        let req = NewStopRequest {
            symbol: "BTC-USDT".to_string(),
            stop_type: StopKind::StopLimit,
            side: Side::Sell,
            quantity: 1_000_000,
            trigger_price: 950_000,
            limit_price: 0,
            trail_amount: 0,
        };
        assert_eq!(req.validate(), Err(RejectReason::MissingLimitPrice));
    }

    #[test]
    fn non_positive_quantity_is_rejected() {
        let req = NewOrderRequest {
            symbol: "BTC-USDT".to_string(),
            order_type: OrderKind::Market,
            side: Side::Buy,
            quantity: 0,
            price: 0,
        };
        assert_eq!(req.validate(), Err(RejectReason::NonPositiveQuantity));
    }
}
