// ===============================
// src/runtime.rs
// ===============================
//
// Per-symbol wiring. Startup (any failure aborts this symbol only):
//   subscribe -> first price (bounded wait) -> safety check -> optional
//   cancel-all -> pick up venue inventory -> Initialize
//
// Then six tasks, all selecting on the shared shutdown signal:
//   price pump      : venue ticks -> watch (latest price wins) + candle builder
//   price consumer  : risk edges, AdjustOrders
//   order consumer  : OnOrderUpdate, strictly in arrival order
//   reconciler      : periodic audit
//   risk evaluator  : closed candles -> breaker
//   window cleanup  : prune idle slots outside the window
//
use chrono::Utc;
use rust_decimal::Decimal;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval, timeout, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::candles::CandleBuilder;
use crate::config::{ExecutorConfig, GridConfig, RiskConfig};
use crate::domain::{Candle, OrderUpdate, PriceTick};
use crate::engine::{EngineError, SlotEngine};
use crate::events::{Event, EventBus};
use crate::exchange::{Exchange, ExchangeError};
use crate::executor::{ExecError, OrderExecutor};
use crate::lock::DistributedLock;
use crate::metrics::TICKS;
use crate::reconciler::Reconciler;
use crate::risk::RiskMonitor;
use crate::store::Store;

const CANDLE_CHANNEL_CAP: usize = 256;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("stream subscription failed: {0}")]
    Subscribe(ExchangeError),
    #[error("no price within {0:?}")]
    NoPrice(Duration),
    #[error("price stream closed before the first tick")]
    StreamClosed,
    #[error("safety check failed: balance {balance} x leverage {leverage} < {required} required")]
    Safety { balance: Decimal, leverage: Decimal, required: Decimal },
    #[error("venue call failed: {0}")]
    Exchange(#[from] ExecError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Process-wide collaborators, built once in main and shared by every symbol.
#[derive(Clone)]
pub struct Services {
    pub exchange: Arc<dyn Exchange>,
    pub lock: Arc<dyn DistributedLock>,
    pub store: Arc<dyn Store>,
    pub bus: EventBus,
    pub executor: ExecutorConfig,
    pub risk: RiskConfig,
    pub startup_price_timeout: Duration,
    pub shutdown_cancel_timeout: Duration,
}

/// The account must fund `position_safety_check` levels before quoting.
pub fn safety_check(cfg: &GridConfig, balance: Decimal) -> Result<(), StartupError> {
    let required = cfg.order_quantity * Decimal::from(cfg.position_safety_check);
    if balance * cfg.max_leverage < required {
        return Err(StartupError::Safety { balance, leverage: cfg.max_leverage, required });
    }
    Ok(())
}

pub struct SymbolRuntime {
    symbol: String,
    engine: Arc<SlotEngine>,
    risk: Arc<RiskMonitor>,
    bus: EventBus,
    tasks: Vec<JoinHandle<()>>,
    cancel_timeout: Duration,
}

impl SymbolRuntime {
    pub fn symbol(&self) -> &str { &self.symbol }

    pub fn engine(&self) -> &Arc<SlotEngine> { &self.engine }

    pub fn risk(&self) -> &Arc<RiskMonitor> { &self.risk }

    /// Call after the shutdown signal fired: pull resting buys (bounded), then
    /// wait for the tasks.
    pub async fn stop(self) {
        match timeout(self.cancel_timeout, self.engine.cancel_all_buy_orders()).await {
            Ok(n) => info!(symbol = %self.symbol, canceled = n, "resting buys canceled on shutdown"),
            Err(_) => warn!(symbol = %self.symbol, timeout = ?self.cancel_timeout, "shutdown cancel timed out, buys may remain"),
        }
        for t in self.tasks {
            if let Err(e) = t.await {
                error!(symbol = %self.symbol, ?e, "task panicked");
            }
        }
        self.bus.publish(Event::SystemStopped { symbol: self.symbol.clone(), ts: Utc::now() }).await;
        info!(symbol = %self.symbol, "symbol stopped");
    }
}

pub async fn start(cfg: GridConfig, svc: &Services, shutdown: watch::Receiver<bool>) -> Result<SymbolRuntime, StartupError> {
    let sym = cfg.symbol.clone();
    let ex = svc.exchange.clone();
    let executor = Arc::new(
        OrderExecutor::new(ex.clone(), svc.lock.clone(), svc.executor.clone()).with_lock_bucket(cfg.lock_bucket_size),
    );

    let mut price_rx = ex.subscribe_prices(&sym).await.map_err(StartupError::Subscribe)?;
    let order_rx = ex.subscribe_order_updates(&sym).await.map_err(StartupError::Subscribe)?;

    let first = timeout(svc.startup_price_timeout, price_rx.recv())
        .await
        .map_err(|_| StartupError::NoPrice(svc.startup_price_timeout))?
        .ok_or(StartupError::StreamClosed)?;
    info!(symbol = %sym, venue = ex.name(), price = %first.price, "first price");

    let quote = cfg.quote_asset.clone();
    let balance = executor.read("get_balance", &sym, || ex.get_balance(&quote)).await?;
    safety_check(&cfg, balance)?;

    if cfg.cancel_on_start {
        executor.read("cancel_all_orders", &sym, || ex.cancel_all_orders(&sym)).await?;
        info!(symbol = %sym, "stale orders canceled");
    }

    let existing = executor
        .read("get_positions", &sym, || ex.get_positions(&sym))
        .await?
        .into_iter()
        .find(|p| p.symbol == sym && p.qty > Decimal::ZERO);

    match svc.store.get_trades(&sym).await {
        Ok(trades) if !trades.is_empty() => {
            let pnl: Decimal = trades.iter().map(|t| t.pnl).sum();
            info!(symbol = %sym, trades = trades.len(), %pnl, "round trips on record");
        }
        Ok(_) => {}
        Err(e) => warn!(symbol = %sym, error = %e, "trade history unavailable"),
    }

    let engine = Arc::new(SlotEngine::new(cfg.clone(), executor.clone(), svc.store.clone(), svc.bus.clone()));
    engine.initialize(first.price, existing).await?;
    svc.bus.publish(Event::SystemStarted { symbol: sym.clone(), price: first.price, ts: Utc::now() }).await;

    let risk = Arc::new(RiskMonitor::new(&sym, svc.risk.clone()));
    let reconciler = Arc::new(Reconciler::new(
        engine.clone(),
        executor.clone(),
        svc.lock.clone(),
        svc.store.clone(),
        svc.bus.clone(),
        risk.clone(),
        cfg.reconcile_tolerance,
        cfg.reconcile_interval.max(Duration::from_secs(5)),
    ));

    let (px_tx, px_rx) = watch::channel(first.price);
    let (candle_tx, candle_rx) = mpsc::channel(CANDLE_CHANNEL_CAP);
    let builder = CandleBuilder::new(&sym, svc.risk.candle_secs);

    let tasks = vec![
        tokio::spawn(price_pump(sym.clone(), price_rx, px_tx, builder, candle_tx, shutdown.clone())),
        tokio::spawn(price_loop(engine.clone(), risk.clone(), px_rx, shutdown.clone())),
        tokio::spawn(order_loop(engine.clone(), order_rx, shutdown.clone())),
        tokio::spawn(reconciler.run(cfg.reconcile_interval, shutdown.clone())),
        tokio::spawn(risk.clone().run(candle_rx, svc.bus.clone(), shutdown.clone())),
        tokio::spawn(cleanup_loop(engine.clone(), cfg.cleanup_interval, shutdown)),
    ];

    info!(symbol = %sym, "symbol running");
    Ok(SymbolRuntime { symbol: sym, engine, risk, bus: svc.bus.clone(), tasks, cancel_timeout: svc.shutdown_cancel_timeout })
}

async fn price_pump(
    symbol: String,
    mut ticks: mpsc::Receiver<PriceTick>,
    latest: watch::Sender<Decimal>,
    mut builder: CandleBuilder,
    candles: mpsc::Sender<Candle>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
            }
            maybe = ticks.recv() => {
                let Some(t) = maybe else {
                    warn!(%symbol, "price stream closed");
                    break;
                };
                TICKS.with_label_values(&[&symbol]).inc();
                let _ = latest.send(t.price);
                if let Some(c) = builder.on_tick(&t) {
                    if candles.send(c).await.is_err() {
                        debug!(%symbol, "risk evaluator gone, candle dropped");
                    }
                }
            }
        }
    }
    debug!(%symbol, "price pump stopped");
}

/// Checks the breaker on every price: cancels buys once on the rising edge,
/// resumes on the falling edge, then moves the window.
pub(crate) async fn price_loop(
    engine: Arc<SlotEngine>,
    risk: Arc<RiskMonitor>,
    mut prices: watch::Receiver<Decimal>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut was_triggered = false;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
            }
            changed = prices.changed() => {
                if changed.is_err() { break; }
                let price = *prices.borrow_and_update();

                let triggered = risk.is_triggered();
                if triggered && !was_triggered {
                    let n = engine.cancel_all_buy_orders().await;
                    warn!(symbol = %engine.symbol(), canceled = n, reason = ?risk.reason(), "breaker open, buy side pulled");
                } else if !triggered && was_triggered {
                    engine.resume_buys();
                }
                was_triggered = triggered;

                if let Err(e) = engine.adjust_orders(price).await {
                    warn!(symbol = %engine.symbol(), %price, error = %e, "adjust failed");
                }
            }
        }
    }
    debug!(symbol = %engine.symbol(), "price consumer stopped");
}

async fn order_loop(engine: Arc<SlotEngine>, mut updates: mpsc::Receiver<OrderUpdate>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
            }
            maybe = updates.recv() => {
                let Some(u) = maybe else {
                    warn!(symbol = %engine.symbol(), "order update stream closed");
                    break;
                };
                engine.on_order_update(u).await;
            }
        }
    }
    debug!(symbol = %engine.symbol(), "order consumer stopped");
}

async fn cleanup_loop(engine: Arc<SlotEngine>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
            }
            _ = tick.tick() => {
                engine.prune_outside_window().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_grid;
    use crate::domain::Side;
    use crate::gateway::PaperExchange;
    use crate::lock::MemoryLock;
    use crate::store::MemoryStore;
    use crate::testkit::{executor_config, harness};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::future::Future;
    use tokio::time::sleep;

    async fn eventually<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let ok = timeout(Duration::from_secs(5), async {
            while !check().await {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(ok.is_ok(), "timed out waiting for {what}");
    }

    fn risk_cfg() -> RiskConfig {
        RiskConfig {
            enabled: true,
            candle_secs: 60,
            window: 10,
            min_candles: 3,
            volume_spike_multiplier: dec!(5),
            price_gap_pct: dec!(0.03),
            cooldown_secs: 120,
        }
    }

    fn candle(minute: i64, open: Decimal, close: Decimal) -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            open_time: Utc.timestamp_opt(1_700_000_040 + minute * 60, 0).unwrap(),
            open,
            high: open.max(close),
            low: open.min(close),
            close,
            volume: dec!(1),
        }
    }

    fn services(ex: Arc<PaperExchange>, bus: EventBus) -> Services {
        Services {
            exchange: ex,
            lock: Arc::new(MemoryLock::new()),
            store: Arc::new(MemoryStore::new()),
            bus,
            executor: executor_config(),
            risk: risk_cfg(),
            startup_price_timeout: Duration::from_secs(2),
            shutdown_cancel_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn safety_check_uses_leverage() {
        let mut cfg = test_grid("BTCUSDT");
        assert!(safety_check(&cfg, dec!(300)).is_ok());
        assert!(matches!(safety_check(&cfg, dec!(299)), Err(StartupError::Safety { .. })));
        cfg.max_leverage = dec!(2);
        assert!(safety_check(&cfg, dec!(150)).is_ok());
    }

    #[tokio::test]
    async fn risk_cycle_cancels_each_buy_once_and_resumes() {
        let mut h = harness(test_grid("BTCUSDT"), dec!(10000)).await;
        h.exchange.set_price("BTCUSDT", dec!(1000), dec!(1)).await;
        h.engine.initialize(dec!(1000), None).await.unwrap();
        h.drain().await;

        let risk = Arc::new(RiskMonitor::new("BTCUSDT", risk_cfg()));
        let (px_tx, px_rx) = watch::channel(dec!(1000));
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(price_loop(h.engine.clone(), risk.clone(), px_rx, stop_rx));

        assert!(risk.evaluate(candle(0, dec!(1000), dec!(1040))).is_some());
        for px in [dec!(1001), dec!(1003), dec!(1002), dec!(1004)] {
            px_tx.send(px).unwrap();
            sleep(Duration::from_millis(20)).await;
            h.drain().await;
        }
        let ex = h.exchange.clone();
        eventually("buys canceled", || {
            let ex = ex.clone();
            async move { ex.cancel_calls() == 3 }
        })
        .await;
        h.drain().await;

        let snap = h.engine.snapshot().await;
        assert!(snap.buys_suspended);
        assert_eq!(snap.active_orders(Side::Buy), 0);
        assert_eq!(h.exchange.cancel_calls(), 3);

        // clean candle after the cooldown closes the breaker
        assert!(risk.evaluate(candle(3, dec!(1040), dec!(1041))).is_some());
        px_tx.send(dec!(1005)).unwrap();
        let engine = h.engine.clone();
        eventually("buys back", || {
            let engine = engine.clone();
            async move { engine.snapshot().await.active_orders(Side::Buy) == 3 }
        })
        .await;
        assert!(!h.engine.buys_suspended());
        assert_eq!(h.exchange.cancel_calls(), 3);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn start_quotes_grid_and_stop_pulls_buys() {
        let ex = Arc::new(PaperExchange::new("USDT", dec!(0.001)).with_balance("USDT", dec!(10000)));
        let bus = EventBus::new(1024);
        let svc = services(ex.clone(), bus.clone());
        let (stop_tx, stop_rx) = watch::channel(false);

        let feeder = ex.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            feeder.set_price("BTCUSDT", dec!(1000), dec!(1)).await;
        });
        let rt = start(test_grid("BTCUSDT"), &svc, stop_rx).await.unwrap();
        assert_eq!(ex.get_open_orders("BTCUSDT").await.unwrap().len(), 3);

        // fills flow through the order consumer
        ex.set_price("BTCUSDT", dec!(990), dec!(1)).await;
        let engine = rt.engine().clone();
        eventually("sell quoted", || {
            let engine = engine.clone();
            async move { engine.snapshot().await.active_orders(Side::Sell) == 1 }
        })
        .await;

        stop_tx.send(true).unwrap();
        rt.stop().await;
        let open = ex.get_open_orders("BTCUSDT").await.unwrap();
        assert!(open.iter().all(|o| o.side == Side::Sell));
        assert_eq!(open.len(), 1);

        let kinds: Vec<&str> = bus.drain().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds.first(), Some(&"system_started"));
        assert_eq!(kinds.last(), Some(&"system_stopped"));
    }

    #[tokio::test]
    async fn startup_aborts_on_safety_check() {
        let ex = Arc::new(PaperExchange::new("USDT", dec!(0.001)).with_balance("USDT", dec!(100)));
        let svc = services(ex.clone(), EventBus::new(16));
        let (_stop_tx, stop_rx) = watch::channel(false);
        let feeder = ex.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            feeder.set_price("BTCUSDT", dec!(1000), dec!(1)).await;
        });
        let err = start(test_grid("BTCUSDT"), &svc, stop_rx).await.err().unwrap();
        assert!(matches!(err, StartupError::Safety { .. }));
        assert!(ex.get_open_orders("BTCUSDT").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn startup_aborts_without_price() {
        let ex = Arc::new(PaperExchange::new("USDT", dec!(0.001)).with_balance("USDT", dec!(10000)));
        let svc = services(ex, EventBus::new(16));
        let (_stop_tx, stop_rx) = watch::channel(false);
        let err = start(test_grid("BTCUSDT"), &svc, stop_rx).await.err().unwrap();
        assert!(matches!(err, StartupError::NoPrice(_)));
    }
}
