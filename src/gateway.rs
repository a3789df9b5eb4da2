// ===============================
// src/gateway.rs (paper venue)
// ===============================
//
// In-memory venue: resting limit orders fill at their limit price once the
// simulated price crosses them. Used by the mock run mode and by tests.
//
// - place  -> ACK (Placed update) immediately, fill later on a crossing tick
// - buys reserve quote balance (notional + fee) / leverage
// - sells need free inventory, otherwise a reduce-only rejection
// - failures can be queued up front to exercise retry paths
//
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use tokio::{sync::mpsc, time::sleep};
use tracing::debug;

use crate::domain::{Order, OrderRequest, OrderStatus, OrderUpdate, Position, PriceTick, Side};
use crate::exchange::{Exchange, ExchangeError, ToOrderUpdate};
use crate::metrics::EXECS;

const CHANNEL_CAP: usize = 4096;

/// What the paper engine emits internally; translated at the boundary like
/// any other venue payload.
#[derive(Debug, Clone)]
struct PaperExecution {
    order: Order,
    status: OrderStatus,
    filled_qty: Decimal,
    fee: Decimal,
}

impl ToOrderUpdate for PaperExecution {
    fn to_order_update(&self) -> Option<OrderUpdate> {
        Some(OrderUpdate {
            symbol: self.order.symbol.clone(),
            order_id: self.order.order_id.clone(),
            client_order_id: self.order.client_order_id.clone(),
            side: self.order.side,
            status: self.status,
            price: self.order.price,
            avg_fill_price: if self.filled_qty.is_zero() { Decimal::ZERO } else { self.order.price },
            filled_qty: self.filled_qty,
            fee: self.fee,
            ts: Utc::now(),
        })
    }
}

#[derive(Debug, Default)]
struct PaperBook {
    last_price: Option<Decimal>,
    open: Vec<Order>,
    position: Decimal,
    entry_price: Decimal,
    update_tx: Option<mpsc::Sender<OrderUpdate>>,
    price_tx: Option<mpsc::Sender<PriceTick>>,
}

impl PaperBook {
    fn reserved_inventory(&self) -> Decimal {
        self.open.iter().filter(|o| o.side == Side::Sell).map(|o| o.quantity).sum()
    }
}

#[derive(Debug, Default)]
struct PaperState {
    balances: HashMap<String, Decimal>,
    books: HashMap<String, PaperBook>,
    next_id: u64,
    place_failures: VecDeque<ExchangeError>,
    cancel_failures: VecDeque<ExchangeError>,
}

pub struct PaperExchange {
    quote_asset: String,
    fee_rate: Decimal,
    leverage: Decimal,
    latency: Duration,
    state: Mutex<PaperState>,
    place_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
}

impl PaperExchange {
    pub fn new(quote_asset: &str, fee_rate: Decimal) -> Self {
        Self {
            quote_asset: quote_asset.to_string(),
            fee_rate,
            leverage: Decimal::ONE,
            latency: Duration::ZERO,
            state: Mutex::new(PaperState::default()),
            place_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_balance(self, asset: &str, amount: Decimal) -> Self {
        self.state.lock().balances.insert(asset.to_string(), amount);
        self
    }

    pub fn with_position(self, symbol: &str, qty: Decimal, entry_price: Decimal) -> Self {
        {
            let mut st = self.state.lock();
            let book = st.books.entry(symbol.to_string()).or_default();
            book.position = qty;
            book.entry_price = entry_price;
        }
        self
    }

    pub fn with_leverage(mut self, leverage: Decimal) -> Self {
        self.leverage = leverage.max(Decimal::ONE);
        self
    }

    /// Simulated round-trip time for order entry
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    #[cfg(test)]
    pub fn fail_next_place(&self, err: ExchangeError) { self.state.lock().place_failures.push_back(err); }
    #[cfg(test)]
    pub fn fail_next_cancel(&self, err: ExchangeError) { self.state.lock().cancel_failures.push_back(err); }

    pub fn place_calls(&self) -> usize { self.place_calls.load(Ordering::SeqCst) }
    pub fn cancel_calls(&self) -> usize { self.cancel_calls.load(Ordering::SeqCst) }

    #[cfg(test)]
    pub fn last_price(&self, symbol: &str) -> Option<Decimal> {
        self.state.lock().books.get(symbol).and_then(|b| b.last_price)
    }

    /// Overwrite the venue-side inventory, e.g. to simulate an external trade.
    pub fn set_position(&self, symbol: &str, qty: Decimal) {
        self.state.lock().books.entry(symbol.to_string()).or_default().position = qty;
    }

    /// Move the simulated market. Crossed orders fill at their limit price,
    /// then the tick goes out on the price stream.
    pub async fn set_price(&self, symbol: &str, price: Decimal, volume: Decimal) {
        let (fills, update_tx, price_tx) = {
            let mut st = self.state.lock();
            let quote = self.quote_asset.clone();
            let fee_rate = self.fee_rate;
            let leverage = self.leverage;
            let PaperState { balances, books, .. } = &mut *st;
            let book = books.entry(symbol.to_string()).or_default();
            book.last_price = Some(price);

            let (crossed, resting): (Vec<Order>, Vec<Order>) = book.open.drain(..).partition(|o| match o.side {
                Side::Buy => price <= o.price,
                Side::Sell => price >= o.price,
            });
            book.open = resting;

            let mut fills = Vec::with_capacity(crossed.len());
            for mut o in crossed {
                let notional = o.price * o.quantity;
                let fee = notional * fee_rate;
                let bal = balances.entry(quote.clone()).or_insert(Decimal::ZERO);
                match o.side {
                    Side::Buy => {
                        // reservation was (notional + fee) / leverage
                        *bal += (notional + fee) / leverage;
                        *bal -= notional + fee;
                        let total = book.position + o.quantity;
                        if !total.is_zero() {
                            book.entry_price = (book.entry_price * book.position + notional) / total;
                        }
                        book.position = total;
                    }
                    Side::Sell => {
                        *bal += notional - fee;
                        book.position -= o.quantity;
                        if book.position.is_zero() {
                            book.entry_price = Decimal::ZERO;
                        }
                    }
                }
                o.status = OrderStatus::Filled;
                fills.push(PaperExecution { filled_qty: o.quantity, fee, order: o, status: OrderStatus::Filled });
            }
            (fills, book.update_tx.clone(), book.price_tx.clone())
        };

        if let Some(tx) = update_tx {
            for f in &fills {
                EXECS.with_label_values(&["filled", "paper"]).inc();
                if let Some(u) = f.to_order_update() {
                    let _ = tx.send(u).await;
                }
            }
        }
        if let Some(tx) = price_tx {
            let _ = tx.send(PriceTick { symbol: symbol.to_string(), price, volume, ts: Utc::now() }).await;
        }
    }

    async fn emit(&self, symbol: &str, exec: PaperExecution) {
        let tx = self.state.lock().books.get(symbol).and_then(|b| b.update_tx.clone());
        if let (Some(tx), Some(u)) = (tx, exec.to_order_update()) {
            let _ = tx.send(u).await;
        }
    }

    fn release(&self, st: &mut PaperState, o: &Order) {
        if o.side == Side::Buy {
            let notional = o.price * o.quantity;
            let held = (notional + notional * self.fee_rate) / self.leverage;
            *st.balances.entry(self.quote_asset.clone()).or_insert(Decimal::ZERO) += held;
        }
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &str { "paper" }

    async fn place_order(&self, req: &OrderRequest) -> Result<Order, ExchangeError> {
        self.place_calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }

        let order = {
            let mut st = self.state.lock();
            if let Some(err) = st.place_failures.pop_front() {
                return Err(err);
            }
            if req.price <= Decimal::ZERO || req.quantity <= Decimal::ZERO {
                return Err(ExchangeError::InvalidOrder(format!("price={} qty={}", req.price, req.quantity)));
            }

            match req.side {
                Side::Buy => {
                    let notional = req.price * req.quantity;
                    let needed = (notional + notional * self.fee_rate) / self.leverage;
                    let free = st.balances.get(&self.quote_asset).copied().unwrap_or(Decimal::ZERO);
                    if free < needed {
                        return Err(ExchangeError::InsufficientMargin(format!("need {needed}, free {free}")));
                    }
                    st.balances.insert(self.quote_asset.clone(), free - needed);
                }
                Side::Sell => {
                    let book = st.books.entry(req.symbol.clone()).or_default();
                    let free = book.position - book.reserved_inventory();
                    if free < req.quantity {
                        return Err(ExchangeError::ReduceOnly(format!("sell {} exceeds free inventory {}", req.quantity, free)));
                    }
                }
            }

            st.next_id += 1;
            let order = Order {
                order_id: format!("P{}", st.next_id),
                client_order_id: req.client_order_id.0.clone(),
                symbol: req.symbol.clone(),
                side: req.side,
                price: req.price,
                quantity: req.quantity,
                status: OrderStatus::Placed,
                created_at: Utc::now(),
            };
            st.books.entry(req.symbol.clone()).or_default().open.push(order.clone());
            order
        };

        EXECS.with_label_values(&["ack", "paper"]).inc();
        debug!(symbol = %order.symbol, side = %order.side, price = %order.price, id = %order.order_id, "paper order resting");
        self.emit(&order.symbol, PaperExecution { order: order.clone(), status: OrderStatus::Placed, filled_qty: Decimal::ZERO, fee: Decimal::ZERO })
            .await;
        Ok(order)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        let canceled = {
            let mut st = self.state.lock();
            if let Some(err) = st.cancel_failures.pop_front() {
                return Err(err);
            }
            let book = st.books.entry(symbol.to_string()).or_default();
            let Some(idx) = book.open.iter().position(|o| o.order_id == order_id) else {
                return Err(ExchangeError::OrderNotFound(order_id.to_string()));
            };
            let mut o = book.open.remove(idx);
            o.status = OrderStatus::Canceled;
            self.release(&mut st, &o);
            o
        };
        EXECS.with_label_values(&["canceled", "paper"]).inc();
        self.emit(symbol, PaperExecution { order: canceled, status: OrderStatus::Canceled, filled_qty: Decimal::ZERO, fee: Decimal::ZERO })
            .await;
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ExchangeError> {
        let ids: Vec<String> = {
            let st = self.state.lock();
            st.books.get(symbol).map(|b| b.open.iter().map(|o| o.order_id.clone()).collect()).unwrap_or_default()
        };
        for id in ids {
            match self.cancel_order(symbol, &id).await {
                Ok(()) | Err(ExchangeError::OrderNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn get_positions(&self, symbol: &str) -> Result<Vec<Position>, ExchangeError> {
        let st = self.state.lock();
        Ok(st
            .books
            .get(symbol)
            .filter(|b| !b.position.is_zero())
            .map(|b| vec![Position { symbol: symbol.to_string(), qty: b.position, entry_price: b.entry_price }])
            .unwrap_or_default())
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<Order>, ExchangeError> {
        let st = self.state.lock();
        Ok(st.books.get(symbol).map(|b| b.open.clone()).unwrap_or_default())
    }

    async fn get_order(&self, symbol: &str, order_id: &str) -> Result<Order, ExchangeError> {
        let st = self.state.lock();
        st.books
            .get(symbol)
            .and_then(|b| b.open.iter().find(|o| o.order_id == order_id).cloned())
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))
    }

    async fn get_balance(&self, asset: &str) -> Result<Decimal, ExchangeError> {
        Ok(self.state.lock().balances.get(asset).copied().unwrap_or(Decimal::ZERO))
    }

    async fn subscribe_order_updates(&self, symbol: &str) -> Result<mpsc::Receiver<OrderUpdate>, ExchangeError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAP);
        self.state.lock().books.entry(symbol.to_string()).or_default().update_tx = Some(tx);
        Ok(rx)
    }

    async fn subscribe_prices(&self, symbol: &str) -> Result<mpsc::Receiver<PriceTick>, ExchangeError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAP);
        self.state.lock().books.entry(symbol.to_string()).or_default().price_tx = Some(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn venue() -> PaperExchange {
        PaperExchange::new("USDT", dec!(0.001)).with_balance("USDT", dec!(1000))
    }

    #[tokio::test]
    async fn buy_rests_then_fills_on_cross() {
        let ex = venue();
        let mut updates = ex.subscribe_order_updates("BTCUSDT").await.unwrap();
        let req = OrderRequest::new("BTCUSDT", Side::Buy, dec!(990), dec!(0.1));
        let o = ex.place_order(&req).await.unwrap();

        let ack = updates.recv().await.unwrap();
        assert_eq!(ack.status, OrderStatus::Placed);
        assert_eq!(ack.client_order_id, req.client_order_id.0);

        ex.set_price("BTCUSDT", dec!(995), dec!(1)).await;
        assert_eq!(ex.get_open_orders("BTCUSDT").await.unwrap().len(), 1);

        ex.set_price("BTCUSDT", dec!(990), dec!(1)).await;
        let fill = updates.recv().await.unwrap();
        assert_eq!(fill.status, OrderStatus::Filled);
        assert_eq!(fill.order_id, o.order_id);
        assert_eq!(fill.filled_qty, dec!(0.1));
        assert_eq!(fill.avg_fill_price, dec!(990));
        assert_eq!(fill.fee, dec!(0.099));

        let pos = ex.get_positions("BTCUSDT").await.unwrap();
        assert_eq!(pos[0].qty, dec!(0.1));
        assert_eq!(ex.get_balance("USDT").await.unwrap(), dec!(1000) - dec!(99) - dec!(0.099));
    }

    #[tokio::test]
    async fn buy_beyond_balance_is_margin_rejection() {
        let ex = venue();
        let err = ex.place_order(&OrderRequest::new("BTCUSDT", Side::Buy, dec!(1000), dec!(2))).await.unwrap_err();
        assert!(err.is_margin_insufficient());
    }

    #[tokio::test]
    async fn sell_without_inventory_is_reduce_only() {
        let ex = venue();
        let err = ex.place_order(&OrderRequest::new("BTCUSDT", Side::Sell, dec!(1000), dec!(1))).await.unwrap_err();
        assert!(matches!(err, ExchangeError::ReduceOnly(_)));
    }

    #[tokio::test]
    async fn cancel_releases_reservation() {
        let ex = venue();
        let o = ex.place_order(&OrderRequest::new("BTCUSDT", Side::Buy, dec!(500), dec!(1))).await.unwrap();
        assert!(ex.get_balance("USDT").await.unwrap() < dec!(1000));
        ex.cancel_order("BTCUSDT", &o.order_id).await.unwrap();
        assert_eq!(ex.get_balance("USDT").await.unwrap(), dec!(1000));
        assert!(matches!(ex.cancel_order("BTCUSDT", &o.order_id).await, Err(ExchangeError::OrderNotFound(_))));
    }

    #[tokio::test]
    async fn queued_failures_fire_once() {
        let ex = venue();
        ex.fail_next_place(ExchangeError::Timeout);
        let req = OrderRequest::new("BTCUSDT", Side::Buy, dec!(100), dec!(1));
        assert_eq!(ex.place_order(&req).await.unwrap_err(), ExchangeError::Timeout);
        assert!(ex.place_order(&req).await.is_ok());
        assert_eq!(ex.place_calls(), 2);
    }

    #[tokio::test]
    async fn leverage_shrinks_reservation() {
        let ex = PaperExchange::new("USDT", Decimal::ZERO).with_balance("USDT", dec!(100)).with_leverage(dec!(5));
        let o = ex.place_order(&OrderRequest::new("BTCUSDT", Side::Buy, dec!(400), dec!(1))).await.unwrap();
        assert_eq!(ex.get_balance("USDT").await.unwrap(), dec!(20));
        assert_eq!(ex.get_order("BTCUSDT", &o.order_id).await.unwrap().price, dec!(400));
    }

    #[tokio::test]
    async fn queued_cancel_failure_keeps_order_resting() {
        let ex = venue();
        let o = ex.place_order(&OrderRequest::new("BTCUSDT", Side::Buy, dec!(500), dec!(1))).await.unwrap();
        ex.fail_next_cancel(ExchangeError::Network("reset".into()));
        assert!(ex.cancel_order("BTCUSDT", &o.order_id).await.is_err());
        assert!(ex.get_order("BTCUSDT", &o.order_id).await.is_ok());
        ex.cancel_order("BTCUSDT", &o.order_id).await.unwrap();
        assert!(matches!(ex.get_order("BTCUSDT", &o.order_id).await, Err(ExchangeError::OrderNotFound(_))));
    }
}
