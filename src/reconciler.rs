// ===============================
// src/reconciler.rs
// ===============================
//
// Periodic read-only audit: local grid view vs. venue truth.
//
// - takes `reconcile:{symbol}` with the BLOCKING lock, so every cycle runs to
//   completion on exactly one instance
// - writes one ReconciliationRecord per cycle, seq resumed from the store
// - drift is logged and published, never corrected
// - while the risk breaker is open its logging drops to debug
//
use chrono::Utc;
use rust_decimal::{prelude::ToPrimitive, Decimal};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::watch,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::domain::{ReconciliationRecord, Side};
use crate::engine::SlotEngine;
use crate::events::{Event, EventBus};
use crate::executor::{ExecError, OrderExecutor};
use crate::lock::{DistributedLock, LockError};
use crate::metrics::{RECON_DIFF, RECON_DRIFT};
use crate::risk::RiskMonitor;
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("venue read failed: {0}")]
    Exchange(#[from] ExecError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Reconciler {
    symbol: String,
    engine: Arc<SlotEngine>,
    executor: Arc<OrderExecutor>,
    lock: Arc<dyn DistributedLock>,
    store: Arc<dyn Store>,
    bus: EventBus,
    risk: Arc<RiskMonitor>,
    tolerance: Decimal,
    lock_ttl: Duration,
    seq: AtomicU64,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<SlotEngine>,
        executor: Arc<OrderExecutor>,
        lock: Arc<dyn DistributedLock>,
        store: Arc<dyn Store>,
        bus: EventBus,
        risk: Arc<RiskMonitor>,
        tolerance: Decimal,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            symbol: engine.symbol().to_string(),
            engine,
            executor,
            lock,
            store,
            bus,
            risk,
            tolerance,
            lock_ttl,
            seq: AtomicU64::new(0),
        }
    }

    fn lock_key(&self) -> String { format!("reconcile:{}", self.symbol) }

    /// Continue the record sequence after a restart.
    pub async fn resume(&self) -> Result<u64, StoreError> {
        let n = self.store.get_reconciliation_count(&self.symbol).await?;
        if let Some(last) = self.store.get_latest_reconciliation_history(&self.symbol).await? {
            info!(symbol = %self.symbol, seq = last.seq, at = %last.timestamp, drift = last.drift, diff = %last.position_diff, "last reconcile on record");
        }
        self.seq.store(n, Ordering::SeqCst);
        Ok(n)
    }

    pub async fn reconcile_once(&self) -> Result<ReconciliationRecord, ReconcileError> {
        let key = self.lock_key();
        self.lock.lock(&key, self.lock_ttl).await?;
        let res = self.audit().await;
        if let Err(e) = self.lock.unlock(&key).await {
            warn!(symbol = %self.symbol, error = %e, "reconcile lock release failed, will expire by ttl");
        }
        res
    }

    async fn audit(&self) -> Result<ReconciliationRecord, ReconcileError> {
        let sym = self.symbol.as_str();
        let ex = self.executor.exchange();
        let positions = self.executor.read("get_positions", sym, || ex.get_positions(sym)).await?;
        let open = self.executor.read("get_open_orders", sym, || ex.get_open_orders(sym)).await?;
        let snap = self.engine.snapshot().await;

        let exchange_qty: Decimal = positions.iter().filter(|p| p.symbol == sym).map(|p| p.qty).sum();
        let local_qty = snap.position_qty();
        let diff = local_qty - exchange_qty;
        let buys = snap.active_orders(Side::Buy);
        let sells = snap.active_orders(Side::Sell);
        let drift = diff.abs() > self.tolerance || open.len() != buys + sells;

        let record = ReconciliationRecord {
            symbol: self.symbol.clone(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            timestamp: Utc::now(),
            local_position_qty: local_qty,
            exchange_position_qty: exchange_qty,
            position_diff: diff,
            active_buy_orders: buys,
            active_sell_orders: sells,
            exchange_open_orders: open.len(),
            estimated_profit: snap.estimated_profit(),
            drift,
        };
        self.store.save_reconciliation_history(&record).await?;
        RECON_DIFF.with_label_values(&[sym]).set(diff.to_f64().unwrap_or(0.0));

        let quiet = self.risk.is_triggered();
        if drift {
            RECON_DRIFT.with_label_values(&[sym]).inc();
            if quiet {
                debug!(symbol = sym, seq = record.seq, diff = %diff, venue_orders = open.len(), local_orders = buys + sells, "reconcile drift (risk triggered)");
            } else {
                warn!(
                    symbol = sym,
                    seq = record.seq,
                    local = %local_qty,
                    venue = %exchange_qty,
                    diff = %diff,
                    venue_orders = open.len(),
                    local_orders = buys + sells,
                    "reconcile drift, operator action required"
                );
            }
            self.bus.publish(Event::ReconciliationDrift { record: record.clone() }).await;
        } else if quiet {
            debug!(symbol = sym, seq = record.seq, "reconcile ok");
        } else {
            info!(symbol = sym, seq = record.seq, position = %local_qty, buys, sells, profit = %record.estimated_profit, "reconcile ok");
        }
        Ok(record)
    }

    pub async fn run(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) {
        match self.resume().await {
            Ok(n) => debug!(symbol = %self.symbol, resumed_at = n, "reconciler started"),
            Err(e) => warn!(symbol = %self.symbol, error = %e, "reconcile count unavailable, sequence restarts at 1"),
        }
        let mut tick = interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // first tick fires immediately; the grid was just built
        tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                _ = tick.tick() => {
                    let cycle = self.reconcile_once();
                    tokio::pin!(cycle);
                    tokio::select! {
                        res = &mut cycle => {
                            if let Err(e) = res {
                                warn!(symbol = %self.symbol, error = %e, "reconcile cycle failed");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        debug!(symbol = %self.symbol, "reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{test_grid, RiskConfig};
    use crate::domain::Candle;
    use crate::testkit::{harness, Harness, LogCapture};
    use rust_decimal_macros::dec;

    fn reconciler(h: &Harness, risk: Arc<RiskMonitor>) -> Reconciler {
        Reconciler::new(
            h.engine.clone(),
            h.executor.clone(),
            Arc::new(h.lock.clone()),
            h.store.clone(),
            h.bus.clone(),
            risk,
            dec!(0.000001),
            Duration::from_secs(30),
        )
    }

    fn calm_risk() -> Arc<RiskMonitor> { Arc::new(RiskMonitor::new("BTCUSDT", RiskConfig::default())) }

    async fn setup() -> (Harness, Reconciler) {
        let mut h = harness(test_grid("BTCUSDT"), dec!(10000)).await;
        h.exchange.set_price("BTCUSDT", dec!(1000), dec!(1)).await;
        h.engine.initialize(dec!(1000), None).await.unwrap();
        h.drain().await;
        let rec = reconciler(&h, calm_risk());
        (h, rec)
    }

    #[tokio::test]
    async fn consistent_state_records_without_drift() {
        let (mut h, rec) = setup().await;
        h.tick(dec!(990)).await;

        let r = rec.reconcile_once().await.unwrap();
        assert_eq!(r.seq, 1);
        assert!(!r.drift);
        assert_eq!(r.local_position_qty, dec!(0.10101));
        assert_eq!(r.exchange_position_qty, dec!(0.10101));
        assert_eq!(r.position_diff, Decimal::ZERO);
        assert_eq!((r.active_buy_orders, r.active_sell_orders, r.exchange_open_orders), (2, 1, 3));
        assert_eq!(h.store.get_reconciliation_count("BTCUSDT").await.unwrap(), 1);
        assert!(!h.lock.is_locked("reconcile:BTCUSDT"));
    }

    #[tokio::test]
    async fn drift_is_reported_not_corrected() {
        let (h, rec) = setup().await;
        h.exchange.set_position("BTCUSDT", dec!(0.5));

        let r = rec.reconcile_once().await.unwrap();
        assert!(r.drift);
        assert_eq!(r.position_diff, dec!(-0.5));
        assert!(h.bus.drain().iter().any(|e| matches!(e, Event::ReconciliationDrift { record } if record.seq == 1)));

        let snap = h.engine.snapshot().await;
        assert_eq!(snap.position_qty(), Decimal::ZERO);
        assert_eq!(snap.active_orders(Side::Buy), 3);
    }

    #[tokio::test]
    async fn sequence_resumes_from_store() {
        let (h, rec) = setup().await;
        rec.reconcile_once().await.unwrap();
        rec.reconcile_once().await.unwrap();

        let again = reconciler(&h, calm_risk());
        assert_eq!(again.resume().await.unwrap(), 2);
        assert_eq!(again.reconcile_once().await.unwrap().seq, 3);
        let latest = h.store.get_latest_reconciliation_history("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(latest.seq, 3);
    }

    #[tokio::test]
    async fn waits_for_sibling_holding_the_symbol_lock() {
        let (h, rec) = setup().await;
        let sibling = h.lock.sibling();
        assert!(sibling.try_lock("reconcile:BTCUSDT", Duration::from_secs(30)).await.unwrap());

        let rec = Arc::new(rec);
        let r2 = rec.clone();
        let cycle = tokio::spawn(async move { r2.reconcile_once().await });
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!cycle.is_finished());
        assert_eq!(h.store.get_reconciliation_count("BTCUSDT").await.unwrap(), 0);

        sibling.unlock("reconcile:BTCUSDT").await.unwrap();
        let r = tokio::time::timeout(Duration::from_secs(5), cycle).await.unwrap().unwrap().unwrap();
        assert_eq!(r.seq, 1);
    }

    #[tokio::test]
    async fn logging_drops_to_debug_while_risk_triggered() {
        let logs = LogCapture::default();
        let _guard = tracing::subscriber::set_default(logs.subscriber());
        let (h, _) = setup().await;

        let risk = calm_risk();
        let crash = Candle {
            symbol: "BTCUSDT".into(),
            open_time: Utc::now(),
            open: dec!(1000),
            high: dec!(1000),
            low: dec!(960),
            close: dec!(960),
            volume: dec!(1),
        };
        assert!(risk.evaluate(crash).is_some());
        assert!(risk.is_triggered());
        let quiet = reconciler(&h, risk);

        assert!(!quiet.reconcile_once().await.unwrap().drift);
        h.exchange.set_position("BTCUSDT", dec!(0.5));
        let r = quiet.reconcile_once().await.unwrap();
        assert!(r.drift);
        assert!(h.bus.drain().iter().any(|e| matches!(e, Event::ReconciliationDrift { .. })));
        let out = logs.contents();
        assert!(!out.contains("reconcile ok"), "{out}");
        assert!(!out.contains("operator action required"), "{out}");

        // same drift with the breaker closed is a warning again
        reconciler(&h, calm_risk()).reconcile_once().await.unwrap();
        assert!(logs.contents().contains("operator action required"));
    }
}
