// ===============================
// src/executor.rs
// ===============================
//
// Stateless execution layer between the slot engine and the venue:
//   1) per-price-bucket / per-order TryLock (contention => skip, not an error)
//   2) request pacing (max QPS)
//   3) per-call timeout + bounded exponential backoff on transient errors
//   4) venue rejections surface immediately, never retried
//
use futures_util::future::join_all;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::{future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::config::ExecutorConfig;
use crate::domain::{Order, OrderRequest};
use crate::exchange::{Exchange, ExchangeError};
use crate::lock::{DistributedLock, LockError};
use crate::metrics::{EXEC_RETRIES, LOCK_CONTENDED, ORDERS_PLACED, ORDER_CANCELS, ORDER_ERRORS};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("exchange rejected: {0}")]
    Rejected(ExchangeError),
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ExchangeError },
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl ExecError {
    pub fn is_margin_insufficient(&self) -> bool {
        matches!(self, ExecError::Rejected(e) if e.is_margin_insufficient())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ExecError::Rejected(ExchangeError::OrderNotFound(_)))
    }

    fn label(&self) -> &'static str {
        match self {
            ExecError::Rejected(e) => e.label(),
            ExecError::RetriesExhausted { .. } => "exhausted",
            ExecError::Lock(_) => "lock",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaceOutcome {
    Placed(Order),
    /// Another instance holds this price bucket
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    /// Another instance is already canceling it
    Skipped,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Same order as the requests
    pub results: Vec<Result<PlaceOutcome, ExecError>>,
    pub margin_insufficient: bool,
}

impl BatchOutcome {
    pub fn placed(&self) -> usize { self.results.iter().filter(|r| matches!(r, Ok(PlaceOutcome::Placed(_)))).count() }
    pub fn skipped(&self) -> usize { self.results.iter().filter(|r| matches!(r, Ok(PlaceOutcome::Skipped))).count() }
    pub fn failed(&self) -> usize { self.results.iter().filter(|r| r.is_err()).count() }
}

pub fn bucket_price(price: Decimal, bucket: Decimal) -> Decimal {
    if bucket <= Decimal::ZERO {
        return price;
    }
    ((price / bucket).floor() * bucket).normalize()
}

pub fn place_lock_key(req: &OrderRequest, bucket: Decimal) -> String {
    format!("place:{}:{}:{}", req.symbol, req.side, bucket_price(req.price, bucket))
}

pub fn cancel_lock_key(symbol: &str, order_id: &str) -> String { format!("cancel:{symbol}:{order_id}") }

pub struct OrderExecutor {
    exchange: Arc<dyn Exchange>,
    lock: Arc<dyn DistributedLock>,
    cfg: ExecutorConfig,
    /// placement keys floor prices to this; zero keys on the exact price
    lock_bucket: Decimal,
    /// earliest instant the next request may leave
    next_slot: Mutex<Instant>,
}

impl OrderExecutor {
    pub fn new(exchange: Arc<dyn Exchange>, lock: Arc<dyn DistributedLock>, cfg: ExecutorConfig) -> Self {
        Self { exchange, lock, cfg, lock_bucket: Decimal::ZERO, next_slot: Mutex::new(Instant::now()) }
    }

    pub fn with_lock_bucket(mut self, bucket: Decimal) -> Self {
        self.lock_bucket = bucket;
        self
    }

    pub fn exchange(&self) -> &Arc<dyn Exchange> { &self.exchange }

    pub async fn place_order(&self, req: &OrderRequest) -> Result<PlaceOutcome, ExecError> {
        let key = place_lock_key(req, self.lock_bucket);
        if !self.lock.try_lock(&key, self.cfg.lock_ttl).await? {
            LOCK_CONTENDED.with_label_values(&[&req.symbol, "place"]).inc();
            debug!(symbol = %req.symbol, %key, "price bucket owned elsewhere, skip placement");
            return Ok(PlaceOutcome::Skipped);
        }

        let res = self.call_with_retry("place", &req.symbol, || self.exchange.place_order(req)).await;
        if let Err(e) = self.lock.unlock(&key).await {
            warn!(?e, %key, "lock release failed, will expire by ttl");
        }

        match res {
            Ok(order) => {
                ORDERS_PLACED.with_label_values(&[&req.symbol, req.side.as_str()]).inc();
                debug!(symbol = %req.symbol, side = %req.side, price = %req.price, qty = %req.quantity, id = %order.order_id, "order placed");
                Ok(PlaceOutcome::Placed(order))
            }
            Err(e) => {
                ORDER_ERRORS.with_label_values(&[&req.symbol, "place", e.label()]).inc();
                Err(e)
            }
        }
    }

    pub async fn batch_place_orders(&self, reqs: &[OrderRequest]) -> BatchOutcome {
        let results = join_all(reqs.iter().map(|r| self.place_order(r))).await;
        let margin_insufficient = results.iter().any(|r| matches!(r, Err(e) if e.is_margin_insufficient()));
        BatchOutcome { results, margin_insufficient }
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<CancelOutcome, ExecError> {
        let key = cancel_lock_key(symbol, order_id);
        if !self.lock.try_lock(&key, self.cfg.lock_ttl).await? {
            LOCK_CONTENDED.with_label_values(&[symbol, "cancel"]).inc();
            debug!(symbol, order_id, "cancel already in flight elsewhere, skip");
            return Ok(CancelOutcome::Skipped);
        }

        let res = self.call_with_retry("cancel", symbol, || self.exchange.cancel_order(symbol, order_id)).await;
        if let Err(e) = self.lock.unlock(&key).await {
            warn!(?e, %key, "lock release failed, will expire by ttl");
        }

        match res {
            Ok(()) => {
                ORDER_CANCELS.with_label_values(&[symbol]).inc();
                Ok(CancelOutcome::Canceled)
            }
            Err(e) => {
                ORDER_ERRORS.with_label_values(&[symbol, "cancel", e.label()]).inc();
                Err(e)
            }
        }
    }

    /// Read-side calls for the reconciler and startup checks; same timeout and
    /// retry policy, no locking.
    pub async fn read<T, F, Fut>(&self, op: &'static str, symbol: &str, f: F) -> Result<T, ExecError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        self.call_with_retry(op, symbol, f).await
    }

    async fn pace(&self) {
        if self.cfg.max_qps == 0 {
            return;
        }
        let spacing = Duration::from_secs(1) / self.cfg.max_qps;
        let slot = {
            let mut next = self.next_slot.lock();
            let now = Instant::now();
            let slot = (*next).max(now);
            *next = slot + spacing;
            slot
        };
        sleep_until(slot).await;
    }

    async fn call_with_retry<T, F, Fut>(&self, op: &'static str, symbol: &str, mut f: F) -> Result<T, ExecError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let mut backoff = Backoff::new(self.cfg.base_backoff, self.cfg.max_backoff, 0.1);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.pace().await;
            let res = match timeout(self.cfg.call_timeout, f()).await {
                Ok(r) => r,
                Err(_) => Err(ExchangeError::Timeout),
            };
            match res {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.cfg.max_attempts => {
                    let mut wait = backoff.next_delay();
                    if let ExchangeError::RateLimited { retry_after: Some(after) } = &e {
                        wait = wait.max(*after);
                    }
                    EXEC_RETRIES.with_label_values(&[symbol, op]).inc();
                    warn!(symbol, op, attempt, wait_ms = wait.as_millis() as u64, error = %e, "transient exchange error, retrying");
                    sleep(wait).await;
                }
                Err(e) if e.is_transient() => {
                    warn!(symbol, op, attempt, error = %e, "retries exhausted");
                    return Err(ExecError::RetriesExhausted { attempts: attempt, last: e });
                }
                Err(e) => return Err(ExecError::Rejected(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;
    use crate::gateway::PaperExchange;
    use crate::lock::{MemoryLock, NoopLock};
    use rust_decimal_macros::dec;

    fn cfg() -> ExecutorConfig {
        ExecutorConfig {
            lock_ttl: Duration::from_secs(5),
            max_attempts: 3,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            call_timeout: Duration::from_secs(1),
            max_qps: 0,
        }
    }

    fn paper() -> Arc<PaperExchange> {
        Arc::new(PaperExchange::new("USDT", dec!(0.001)).with_balance("USDT", dec!(10000)))
    }

    #[test]
    fn bucket_floors_to_multiple() {
        assert_eq!(bucket_price(dec!(997.3), dec!(10)), dec!(990));
        assert_eq!(bucket_price(dec!(1000), dec!(10)), dec!(1000));
        assert_eq!(bucket_price(dec!(0.12345), dec!(0.01)), dec!(0.12));
        let req = OrderRequest::new("BTCUSDT", Side::Buy, dec!(995), dec!(1));
        assert_eq!(place_lock_key(&req, dec!(10)), "place:BTCUSDT:buy:990");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let ex = paper();
        ex.fail_next_place(ExchangeError::Network("reset".into()));
        ex.fail_next_place(ExchangeError::RateLimited { retry_after: None });
        let exec = OrderExecutor::new(ex.clone(), Arc::new(NoopLock), cfg());

        let out = exec.place_order(&OrderRequest::new("BTCUSDT", Side::Buy, dec!(990), dec!(0.1))).await.unwrap();
        assert!(matches!(out, PlaceOutcome::Placed(_)));
        assert_eq!(ex.place_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let ex = paper();
        for _ in 0..5 {
            ex.fail_next_place(ExchangeError::Timeout);
        }
        let exec = OrderExecutor::new(ex.clone(), Arc::new(NoopLock), cfg());
        let err = exec.place_order(&OrderRequest::new("BTCUSDT", Side::Buy, dec!(990), dec!(0.1))).await.unwrap_err();
        assert!(matches!(err, ExecError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(ex.place_calls(), 3);
    }

    #[tokio::test]
    async fn rejections_are_not_retried() {
        let ex = paper();
        ex.fail_next_place(ExchangeError::ReduceOnly("no".into()));
        let exec = OrderExecutor::new(ex.clone(), Arc::new(NoopLock), cfg());
        let err = exec.place_order(&OrderRequest::new("BTCUSDT", Side::Sell, dec!(990), dec!(0.1))).await.unwrap_err();
        assert!(matches!(err, ExecError::Rejected(ExchangeError::ReduceOnly(_))));
        assert_eq!(ex.place_calls(), 1);
    }

    #[tokio::test]
    async fn contended_bucket_skips_without_error() {
        let ex = paper();
        let mine = MemoryLock::new();
        let sibling = mine.sibling();
        let req = OrderRequest::new("BTCUSDT", Side::Buy, dec!(993), dec!(0.1));
        assert!(sibling.try_lock(&place_lock_key(&req, dec!(10)), Duration::from_secs(5)).await.unwrap());

        let exec = OrderExecutor::new(ex.clone(), Arc::new(mine.clone()), cfg()).with_lock_bucket(dec!(10));
        assert_eq!(exec.place_order(&req).await.unwrap(), PlaceOutcome::Skipped);
        assert_eq!(ex.place_calls(), 0);

        // released after a successful placement
        let other = OrderRequest::new("BTCUSDT", Side::Buy, dec!(980), dec!(0.1));
        assert!(matches!(exec.place_order(&other).await.unwrap(), PlaceOutcome::Placed(_)));
        assert!(!mine.is_locked(&place_lock_key(&other, dec!(10))));
    }

    #[tokio::test]
    async fn cancel_contention_skips() {
        let ex = paper();
        let mine = MemoryLock::new();
        let exec = OrderExecutor::new(ex.clone(), Arc::new(mine.clone()), cfg());
        let PlaceOutcome::Placed(o) = exec.place_order(&OrderRequest::new("BTCUSDT", Side::Buy, dec!(990), dec!(0.1))).await.unwrap() else {
            panic!("expected placement");
        };

        let sibling = mine.sibling();
        assert!(sibling.try_lock(&cancel_lock_key("BTCUSDT", &o.order_id), Duration::from_secs(5)).await.unwrap());
        assert_eq!(exec.cancel_order("BTCUSDT", &o.order_id).await.unwrap(), CancelOutcome::Skipped);
        assert_eq!(ex.cancel_calls(), 0);

        sibling.unlock(&cancel_lock_key("BTCUSDT", &o.order_id)).await.unwrap();
        assert_eq!(exec.cancel_order("BTCUSDT", &o.order_id).await.unwrap(), CancelOutcome::Canceled);
    }

    #[tokio::test]
    async fn batch_flags_margin_insufficient() {
        let ex = Arc::new(PaperExchange::new("USDT", Decimal::ZERO).with_balance("USDT", dec!(150)));
        let exec = OrderExecutor::new(ex.clone(), Arc::new(NoopLock), cfg());
        let reqs = vec![
            OrderRequest::new("BTCUSDT", Side::Buy, dec!(990), dec!(0.1)),
            OrderRequest::new("BTCUSDT", Side::Buy, dec!(980), dec!(0.1)),
        ];
        let out = exec.batch_place_orders(&reqs).await;
        assert_eq!(out.results.len(), 2);
        assert_eq!(out.placed(), 1);
        assert_eq!(out.failed(), 1);
        assert!(out.margin_insufficient);
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_spreads_requests() {
        let ex = paper();
        let exec = OrderExecutor::new(ex.clone(), Arc::new(NoopLock), ExecutorConfig { max_qps: 10, ..cfg() });
        let start = Instant::now();
        let reqs: Vec<_> = (0..5).map(|i| OrderRequest::new("BTCUSDT", Side::Buy, dec!(900) - Decimal::from(i * 10), dec!(0.01))).collect();
        let out = exec.batch_place_orders(&reqs).await;
        assert_eq!(out.placed(), 5);
        assert!(Instant::now() - start >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_venue_times_out_as_transient() {
        let ex = Arc::new(
            PaperExchange::new("USDT", Decimal::ZERO)
                .with_balance("USDT", dec!(10000))
                .with_latency(Duration::from_secs(3)),
        );
        let exec = OrderExecutor::new(ex.clone(), Arc::new(NoopLock), cfg());
        let err = exec.place_order(&OrderRequest::new("BTCUSDT", Side::Buy, dec!(990), dec!(0.1))).await.unwrap_err();
        assert!(matches!(err, ExecError::RetriesExhausted { attempts: 3, last: ExchangeError::Timeout }));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_cancel_failure_is_retried() {
        let ex = paper();
        let exec = OrderExecutor::new(ex.clone(), Arc::new(NoopLock), cfg());
        let PlaceOutcome::Placed(o) = exec.place_order(&OrderRequest::new("BTCUSDT", Side::Buy, dec!(990), dec!(0.1))).await.unwrap() else {
            panic!("expected placement");
        };
        ex.fail_next_cancel(ExchangeError::Network("reset".into()));
        assert_eq!(exec.cancel_order("BTCUSDT", &o.order_id).await.unwrap(), CancelOutcome::Canceled);
        assert_eq!(ex.cancel_calls(), 2);
    }
}
