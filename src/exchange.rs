// ===============================
// src/exchange.rs
// ===============================
//
// Boundary to a trading venue. Wire formats, signing and stream framing live
// in the adapters; the core only sees these types.
//
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::{Order, OrderRequest, OrderUpdate, Position, PriceTick};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("insufficient margin: {0}")]
    InsufficientMargin(String),
    #[error("reduce-only violation: {0}")]
    ReduceOnly(String),
    #[error("invalid order: {0}")]
    InvalidOrder(String),
    #[error("order not found: {0}")]
    OrderNotFound(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

impl ExchangeError {
    /// Worth retrying with backoff. Everything else is the venue saying no.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Network(_) | ExchangeError::Timeout | ExchangeError::RateLimited { .. })
    }

    pub fn is_margin_insufficient(&self) -> bool { matches!(self, ExchangeError::InsufficientMargin(_)) }

    pub fn label(&self) -> &'static str {
        match self {
            ExchangeError::Network(_) => "network",
            ExchangeError::Timeout => "timeout",
            ExchangeError::RateLimited { .. } => "rate_limited",
            ExchangeError::InsufficientMargin(_) => "margin",
            ExchangeError::ReduceOnly(_) => "reduce_only",
            ExchangeError::InvalidOrder(_) => "invalid",
            ExchangeError::OrderNotFound(_) => "not_found",
            ExchangeError::Rejected(_) => "rejected",
        }
    }
}

/// Venue-native order event. Adapters implement this for whatever their user
/// stream delivers; `None` means the event carries nothing the engine needs.
pub trait ToOrderUpdate {
    fn to_order_update(&self) -> Option<OrderUpdate>;
}

#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    async fn place_order(&self, req: &OrderRequest) -> Result<Order, ExchangeError>;
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError>;
    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ExchangeError>;

    async fn get_positions(&self, symbol: &str) -> Result<Vec<Position>, ExchangeError>;
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<Order>, ExchangeError>;
    async fn get_order(&self, symbol: &str, order_id: &str) -> Result<Order, ExchangeError>;
    async fn get_balance(&self, asset: &str) -> Result<Decimal, ExchangeError>;

    /// Order events for `symbol`, in venue order.
    async fn subscribe_order_updates(&self, symbol: &str) -> Result<mpsc::Receiver<OrderUpdate>, ExchangeError>;
    async fn subscribe_prices(&self, symbol: &str) -> Result<mpsc::Receiver<PriceTick>, ExchangeError>;
}
