// ===============================
// src/testkit.rs
// ===============================
//
// Test wiring: paper venue + memory lock/store + event bus around one engine.
//
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

use crate::config::{ExecutorConfig, GridConfig};
use crate::domain::OrderUpdate;
use crate::engine::SlotEngine;
use crate::events::{Event, EventBus, EventSink};
use crate::exchange::Exchange;
use crate::executor::OrderExecutor;
use crate::gateway::PaperExchange;
use crate::lock::MemoryLock;
use crate::store::MemoryStore;

#[derive(Default)]
pub(crate) struct CollectSink {
    events: Mutex<Vec<Event>>,
}

impl CollectSink {
    pub(crate) fn events(&self) -> Vec<Event> { self.events.lock().clone() }
}

#[async_trait]
impl EventSink for CollectSink {
    async fn handle(&self, ev: &Event) { self.events.lock().push(ev.clone()); }
}

/// Formatted log lines (INFO and up) for tests that assert on log levels.
#[derive(Clone, Default)]
pub(crate) struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub(crate) fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync + 'static {
        let out = self.clone();
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || out.clone())
            .finish()
    }

    pub(crate) fn contents(&self) -> String { String::from_utf8_lossy(&self.buf.lock()).into_owned() }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
        self.buf.lock().extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> std::io::Result<()> { Ok(()) }
}

pub(crate) fn executor_config() -> ExecutorConfig {
    ExecutorConfig {
        lock_ttl: Duration::from_secs(5),
        max_attempts: 3,
        base_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        call_timeout: Duration::from_secs(2),
        max_qps: 0,
    }
}

pub(crate) struct Harness {
    pub exchange: Arc<PaperExchange>,
    pub executor: Arc<OrderExecutor>,
    pub engine: Arc<SlotEngine>,
    pub store: Arc<MemoryStore>,
    pub lock: MemoryLock,
    pub bus: EventBus,
    pub updates: mpsc::Receiver<OrderUpdate>,
    /// every update fed to the engine so far
    pub applied: Vec<OrderUpdate>,
}

impl Harness {
    /// Feed queued order updates to the engine the way the order consumer does.
    pub async fn drain(&mut self) -> usize {
        let mut n = 0;
        while let Ok(u) = self.updates.try_recv() {
            self.applied.push(u.clone());
            self.engine.on_order_update(u).await;
            n += 1;
        }
        n
    }

    /// Move the paper market and apply the resulting fills.
    pub async fn tick(&mut self, price: Decimal) {
        let symbol = self.engine.symbol().to_string();
        self.exchange.set_price(&symbol, price, Decimal::ONE).await;
        self.drain().await;
    }
}

pub(crate) async fn harness(cfg: GridConfig, quote_balance: Decimal) -> Harness {
    let ex = PaperExchange::new(&cfg.quote_asset, Decimal::new(1, 3)).with_balance(&cfg.quote_asset, quote_balance);
    harness_with(cfg, ex).await
}

pub(crate) async fn harness_with(cfg: GridConfig, exchange: PaperExchange) -> Harness {
    harness_with_bus(cfg, exchange, 4096).await
}

pub(crate) async fn harness_with_bus(cfg: GridConfig, exchange: PaperExchange, bus_capacity: usize) -> Harness {
    let exchange = Arc::new(exchange);
    let updates = exchange.subscribe_order_updates(&cfg.symbol).await.expect("paper subscribe");
    let lock = MemoryLock::new();
    let executor = Arc::new(
        OrderExecutor::new(exchange.clone(), Arc::new(lock.clone()), executor_config()).with_lock_bucket(cfg.lock_bucket_size),
    );
    let store = Arc::new(MemoryStore::new());
    let bus = EventBus::new(bus_capacity);
    let engine = Arc::new(SlotEngine::new(cfg, executor.clone(), store.clone(), bus.clone()));
    Harness { exchange, executor, engine, store, lock, bus, updates, applied: Vec::new() }
}
