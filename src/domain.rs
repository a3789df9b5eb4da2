// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side { Buy, Sell }

impl Side {
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "buy", Side::Sell => "sell" } }
    fn code(&self) -> char { match self { Side::Buy => 'B', Side::Sell => 'S' } }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus { Placed, Filled, Canceled }

impl OrderStatus {
    pub fn is_terminal(&self) -> bool { !matches!(self, OrderStatus::Placed) }
    pub fn as_str(&self) -> &'static str {
        match self { OrderStatus::Placed => "placed", OrderStatus::Filled => "filled", OrderStatus::Canceled => "canceled" }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionStatus { Empty, PendingBuy, Filled, PendingSell }

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Empty => "empty",
            PositionStatus::PendingBuy => "pending_buy",
            PositionStatus::Filled => "filled",
            PositionStatus::PendingSell => "pending_sell",
        }
    }
}

/// Locally generated order id: `{B|S}_{price}_{unix_ms}_{nonce}`.
///
/// The decimal point of the price is written as `p` so the id stays inside the
/// `[A-Za-z0-9_-]` alphabet most venues accept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientOrderId(pub String);

impl ClientOrderId {
    pub fn generate(side: Side, price: Decimal, ts: DateTime<Utc>) -> Self {
        let nonce: u16 = rand::thread_rng().gen();
        let px = price.normalize().to_string().replace('.', "p");
        Self(format!("{}_{}_{}_{:04x}", side.code(), px, ts.timestamp_millis(), nonce))
    }

    /// Decode side, price and creation time. `None` for ids we did not mint.
    pub fn parse(raw: &str) -> Option<(Side, Decimal, i64)> {
        let mut parts = raw.split('_');
        let side = match parts.next()? { "B" => Side::Buy, "S" => Side::Sell, _ => return None };
        let price: Decimal = parts.next()?.replace('p', ".").parse().ok()?;
        let ts_ms: i64 = parts.next()?.parse().ok()?;
        parts.next()?;
        if parts.next().is_some() { return None; }
        Some((side, price, ts_ms))
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub client_order_id: ClientOrderId,
}

impl OrderRequest {
    pub fn new(symbol: &str, side: Side, price: Decimal, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            price,
            quantity,
            client_order_id: ClientOrderId::generate(side, price, Utc::now()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

/// Canonical order event. Every exchange adapter maps its native payloads onto
/// this shape before anything reaches the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub symbol: String,
    pub order_id: String,
    pub client_order_id: String,
    pub side: Side,
    pub status: OrderStatus,
    pub price: Decimal,
    pub avg_fill_price: Decimal,
    /// Cumulative filled base quantity.
    pub filled_qty: Decimal,
    /// Fee charged for this order, in quote units.
    pub fee: Decimal,
    pub ts: DateTime<Utc>,
}

impl OrderUpdate {
    pub fn dedup_key(&self) -> String { format!("{}:{}", self.client_order_id, self.status.as_str()) }
}

/// One grid price level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    pub level: i64,
    pub price: Decimal,
    pub status: PositionStatus,
    pub position_qty: Decimal,
    pub entry_price: Decimal,
    pub buy_order_id: Option<String>,
    pub buy_fee: Decimal,
    pub active_order: Option<Order>,
    pub cancel_requested: bool,
}

impl Slot {
    pub fn empty(level: i64, price: Decimal) -> Self {
        Self {
            level,
            price,
            status: PositionStatus::Empty,
            position_qty: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            buy_order_id: None,
            buy_fee: Decimal::ZERO,
            active_order: None,
            cancel_requested: false,
        }
    }

    pub fn is_idle(&self) -> bool { self.status == PositionStatus::Empty && self.active_order.is_none() }

    pub fn reset(&mut self) {
        *self = Slot::empty(self.level, self.price);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub buy_order_id: String,
    pub sell_order_id: String,
    pub symbol: String,
    pub buy_price: Decimal,
    pub sell_price: Decimal,
    pub quantity: Decimal,
    pub pnl: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub symbol: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub local_position_qty: Decimal,
    pub exchange_position_qty: Decimal,
    pub position_diff: Decimal,
    pub active_buy_orders: usize,
    pub active_sell_orders: usize,
    pub exchange_open_orders: usize,
    pub estimated_profit: Decimal,
    pub drift: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub qty: Decimal,
    pub entry_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    pub price: Decimal,
    pub volume: Decimal,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}
