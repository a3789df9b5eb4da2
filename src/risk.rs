// ===============================
// src/risk.rs
// ===============================
//
// Market-anomaly circuit breaker: NORMAL -> TRIGGERED -> NORMAL.
//
// Each closed candle is checked against the rolling window of earlier ones:
//   - volume spike : volume > mean(previous volumes) * multiplier
//                    (only once `min_candles` of history exist)
//   - price move   : |close - open| / open > gap_pct
//   - price gap    : |open - previous close| / previous close > gap_pct
//
// Recovery needs a clean candle at least `cooldown_secs` (candle time) after
// the last anomalous one. The flag itself is a plain atomic so the price loop
// can read it on every tick.
//
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::RiskConfig;
use crate::domain::Candle;
use crate::events::{Event, EventBus};
use crate::metrics::{CANDLES, RISK_TRIGGERED};

#[derive(Debug, Clone, PartialEq)]
pub enum RiskTransition {
    Triggered { reason: String },
    Recovered,
}

#[derive(Debug, Default)]
struct Window {
    candles: VecDeque<Candle>,
    last_anomaly: Option<DateTime<Utc>>,
    reason: Option<String>,
}

pub struct RiskMonitor {
    symbol: String,
    cfg: RiskConfig,
    triggered: AtomicBool,
    window: Mutex<Window>,
}

impl RiskMonitor {
    pub fn new(symbol: &str, cfg: RiskConfig) -> Self {
        Self { symbol: symbol.to_string(), cfg, triggered: AtomicBool::new(false), window: Mutex::new(Window::default()) }
    }

    pub fn is_triggered(&self) -> bool { self.triggered.load(Ordering::Acquire) }

    pub fn reason(&self) -> Option<String> { self.window.lock().reason.clone() }

    fn detect(&self, w: &Window, c: &Candle) -> Option<String> {
        let gap = self.cfg.price_gap_pct;

        if w.candles.len() >= self.cfg.min_candles {
            let n = Decimal::from(w.candles.len());
            let mean = w.candles.iter().map(|p| p.volume).sum::<Decimal>() / n;
            if mean > Decimal::ZERO && c.volume > mean * self.cfg.volume_spike_multiplier {
                return Some(format!("volume spike {} vs mean {}", c.volume, mean.round_dp(8)));
            }
        }

        if c.open > Decimal::ZERO {
            let body = (c.close - c.open).abs() / c.open;
            if body > gap {
                return Some(format!("price move {}% within candle", (body * Decimal::ONE_HUNDRED).round_dp(2)));
            }
        }

        if let Some(prev) = w.candles.back() {
            if prev.close > Decimal::ZERO {
                let jump = (c.open - prev.close).abs() / prev.close;
                if jump > gap {
                    return Some(format!("price gap {}% from previous close", (jump * Decimal::ONE_HUNDRED).round_dp(2)));
                }
            }
        }
        None
    }

    /// Feed one closed candle; returns the edge it caused, if any.
    pub fn evaluate(&self, candle: Candle) -> Option<RiskTransition> {
        if !self.cfg.enabled {
            return None;
        }
        let mut w = self.window.lock();
        let anomaly = self.detect(&w, &candle);
        let open_time = candle.open_time;

        w.candles.push_back(candle);
        while w.candles.len() > self.cfg.window {
            w.candles.pop_front();
        }

        match anomaly {
            Some(reason) => {
                w.last_anomaly = Some(open_time);
                w.reason = Some(reason.clone());
                if self.triggered.swap(true, Ordering::AcqRel) {
                    debug!(symbol = %self.symbol, %reason, "anomaly while already triggered, cooldown restarted");
                    return None;
                }
                RISK_TRIGGERED.with_label_values(&[&self.symbol]).set(1);
                Some(RiskTransition::Triggered { reason })
            }
            None => {
                if !self.is_triggered() {
                    return None;
                }
                let cooled = w
                    .last_anomaly
                    .map(|t| open_time - t >= ChronoDuration::seconds(self.cfg.cooldown_secs))
                    .unwrap_or(true);
                if !cooled {
                    return None;
                }
                w.reason = None;
                self.triggered.store(false, Ordering::Release);
                RISK_TRIGGERED.with_label_values(&[&self.symbol]).set(0);
                Some(RiskTransition::Recovered)
            }
        }
    }

    /// Evaluator task: consumes closed candles, publishes both edges.
    pub async fn run(self: Arc<Self>, mut candles: mpsc::Receiver<Candle>, bus: EventBus, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                maybe = candles.recv() => {
                    let Some(c) = maybe else { break };
                    CANDLES.with_label_values(&[&self.symbol]).inc();
                    match self.evaluate(c) {
                        Some(RiskTransition::Triggered { reason }) => {
                            warn!(symbol = %self.symbol, %reason, "risk breaker TRIGGERED, buys suspended");
                            bus.publish(Event::RiskTriggered { symbol: self.symbol.clone(), reason, ts: Utc::now() }).await;
                        }
                        Some(RiskTransition::Recovered) => {
                            info!(symbol = %self.symbol, "risk breaker recovered, buys resume");
                            bus.publish(Event::RiskRecovered { symbol: self.symbol.clone(), ts: Utc::now() }).await;
                        }
                        None => {}
                    }
                }
            }
        }
        debug!(symbol = %self.symbol, "risk evaluator stopped");
    }
}
