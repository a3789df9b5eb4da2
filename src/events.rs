// ===============================
// src/events.rs
// ===============================
//
// Bounded event queue drained by a fixed worker pool.
//
// Backpressure depends on the event class:
//   - Critical (risk edges, trades, drift, system) : publisher waits for room
//   - Lossy    (order filled / canceled)           : oldest queued lossy event is evicted
//
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::domain::{ReconciliationRecord, Side, Trade};
use crate::metrics::EVENTS_DROPPED;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    SystemStarted { symbol: String, price: Decimal, ts: DateTime<Utc> },
    SystemStopped { symbol: String, ts: DateTime<Utc> },
    RiskTriggered { symbol: String, reason: String, ts: DateTime<Utc> },
    RiskRecovered { symbol: String, ts: DateTime<Utc> },
    OrderFilled { symbol: String, order_id: String, side: Side, price: Decimal, qty: Decimal, ts: DateTime<Utc> },
    OrderCanceled { symbol: String, order_id: String, side: Side, price: Decimal, ts: DateTime<Utc> },
    TradeClosed { trade: Trade },
    ReconciliationDrift { record: ReconciliationRecord },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass { Critical, Lossy }

impl Event {
    pub fn class(&self) -> EventClass {
        match self {
            Event::OrderFilled { .. } | Event::OrderCanceled { .. } => EventClass::Lossy,
            _ => EventClass::Critical,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::SystemStarted { .. } => "system_started",
            Event::SystemStopped { .. } => "system_stopped",
            Event::RiskTriggered { .. } => "risk_triggered",
            Event::RiskRecovered { .. } => "risk_recovered",
            Event::OrderFilled { .. } => "order_filled",
            Event::OrderCanceled { .. } => "order_canceled",
            Event::TradeClosed { .. } => "trade_closed",
            Event::ReconciliationDrift { .. } => "reconciliation_drift",
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Event::SystemStarted { symbol, .. }
            | Event::SystemStopped { symbol, .. }
            | Event::RiskTriggered { symbol, .. }
            | Event::RiskRecovered { symbol, .. }
            | Event::OrderFilled { symbol, .. }
            | Event::OrderCanceled { symbol, .. } => symbol,
            Event::TradeClosed { trade } => &trade.symbol,
            Event::ReconciliationDrift { record } => &record.symbol,
        }
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn handle(&self, ev: &Event);
}

/// Structured log line per event
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn handle(&self, ev: &Event) {
        match ev {
            Event::TradeClosed { trade } => info!(
                symbol = %trade.symbol,
                buy = %trade.buy_price,
                sell = %trade.sell_price,
                qty = %trade.quantity,
                pnl = %trade.pnl,
                "event: trade closed"
            ),
            Event::RiskTriggered { symbol, reason, .. } => warn!(%symbol, %reason, "event: risk triggered"),
            Event::ReconciliationDrift { record } => warn!(
                symbol = %record.symbol,
                diff = %record.position_diff,
                local_orders = record.active_buy_orders + record.active_sell_orders,
                venue_orders = record.exchange_open_orders,
                "event: reconciliation drift"
            ),
            other => debug!(symbol = %other.symbol(), kind = other.kind(), "event"),
        }
    }
}

/// Forwards events to the JSONL recorder task
pub struct RecorderSink {
    tx: mpsc::Sender<Event>,
}

impl RecorderSink {
    pub fn new(tx: mpsc::Sender<Event>) -> Self { Self { tx } }
}

#[async_trait]
impl EventSink for RecorderSink {
    async fn handle(&self, ev: &Event) {
        if self.tx.send(ev.clone()).await.is_err() {
            debug!(kind = ev.kind(), "recorder gone, event not recorded");
        }
    }
}

struct Inner {
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
    closed: AtomicBool,
}

impl Inner {
    fn pop(&self) -> Option<Event> {
        let ev = self.queue.lock().pop_front();
        if ev.is_some() {
            self.not_full.notify_one();
        }
        ev
    }
}

enum Offer {
    Queued,
    Dropped,
    Full(Event),
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
                capacity: capacity.max(1),
                not_empty: Notify::new(),
                not_full: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn len(&self) -> usize { self.inner.queue.lock().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn offer(&self, ev: Event) -> Offer {
        let mut q = self.inner.queue.lock();
        if self.inner.closed.load(Ordering::Acquire) {
            return Offer::Dropped;
        }
        if q.len() < self.inner.capacity {
            q.push_back(ev);
            return Offer::Queued;
        }
        match ev.class() {
            EventClass::Critical => Offer::Full(ev),
            EventClass::Lossy => {
                EVENTS_DROPPED.with_label_values(&[ev.kind()]).inc();
                match q.iter().position(|e| e.class() == EventClass::Lossy) {
                    Some(idx) => {
                        q.remove(idx);
                        q.push_back(ev);
                        Offer::Queued
                    }
                    None => Offer::Dropped,
                }
            }
        }
    }

    pub async fn publish(&self, ev: Event) {
        let mut ev = ev;
        loop {
            let notified = self.inner.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.offer(ev) {
                Offer::Queued => {
                    self.inner.not_empty.notify_one();
                    return;
                }
                Offer::Dropped => return,
                Offer::Full(back) => {
                    debug!(kind = back.kind(), "event queue full, waiting");
                    ev = back;
                }
            }
            notified.await;
        }
    }

    /// Workers drain whatever is queued, then exit once the bus is closed.
    pub fn spawn_workers(&self, n: usize, sinks: Vec<Arc<dyn EventSink>>) -> Vec<JoinHandle<()>> {
        let sinks: Arc<[Arc<dyn EventSink>]> = sinks.into();
        (0..n.max(1))
            .map(|id| {
                let inner = self.inner.clone();
                let sinks = sinks.clone();
                tokio::spawn(async move {
                    loop {
                        let notified = inner.not_empty.notified();
                        tokio::pin!(notified);
                        notified.as_mut().enable();

                        match inner.pop() {
                            Some(ev) => {
                                for s in sinks.iter() {
                                    s.handle(&ev).await;
                                }
                            }
                            None if inner.closed.load(Ordering::Acquire) => break,
                            None => notified.await,
                        }
                    }
                    debug!(worker = id, "event worker stopped");
                })
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn drain(&self) -> Vec<Event> {
        let out: Vec<Event> = self.inner.queue.lock().drain(..).collect();
        self.inner.not_full.notify_waiters();
        out
    }

    /// Stop accepting events; blocked publishers give up.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.not_empty.notify_waiters();
        self.inner.not_full.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::CollectSink;
    use std::time::Duration;

    fn filled(n: u32) -> Event {
        Event::OrderFilled {
            symbol: "BTCUSDT".into(),
            order_id: format!("P{n}"),
            side: Side::Buy,
            price: Decimal::from(990),
            qty: Decimal::ONE,
            ts: Utc::now(),
        }
    }

    fn triggered() -> Event {
        Event::RiskTriggered { symbol: "BTCUSDT".into(), reason: "gap".into(), ts: Utc::now() }
    }

    #[test]
    fn classes() {
        assert_eq!(filled(1).class(), EventClass::Lossy);
        assert_eq!(triggered().class(), EventClass::Critical);
        let json = serde_json::to_value(triggered()).unwrap();
        assert_eq!(json["type"], "risk_triggered");
    }

    #[tokio::test]
    async fn lossy_events_evict_oldest_lossy() {
        let bus = EventBus::new(3);
        bus.publish(filled(1)).await;
        bus.publish(triggered()).await;
        bus.publish(filled(2)).await;
        bus.publish(filled(3)).await;
        assert_eq!(bus.len(), 3);

        let sink = Arc::new(CollectSink::default());
        let workers = bus.spawn_workers(1, vec![sink.clone()]);
        bus.close();
        for w in workers {
            w.await.unwrap();
        }
        let kinds: Vec<String> = sink
            .events()
            .iter()
            .map(|e| match e {
                Event::OrderFilled { order_id, .. } => order_id.clone(),
                other => other.kind().to_string(),
            })
            .collect();
        assert_eq!(kinds, vec!["risk_triggered", "P2", "P3"]);
    }

    #[tokio::test]
    async fn critical_publisher_waits_for_room() {
        let bus = EventBus::new(1);
        bus.publish(triggered()).await;

        let b2 = bus.clone();
        let blocked = tokio::spawn(async move { b2.publish(triggered()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        let sink = Arc::new(CollectSink::default());
        let workers = bus.spawn_workers(2, vec![sink.clone()]);
        blocked.await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while sink.events().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        bus.close();
        for w in workers {
            w.await.unwrap();
        }
        assert_eq!(sink.events().len(), 2);
    }

    #[tokio::test]
    async fn closed_bus_drops_new_events() {
        let bus = EventBus::new(4);
        bus.close();
        bus.publish(triggered()).await;
        assert!(bus.is_empty());
    }
}
