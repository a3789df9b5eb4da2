// ===============================
// src/engine.rs
// ===============================
//
// Slot engine: owns the grid for one symbol and decides which orders exist.
//
// Slots are keyed by integer level (price = level * interval). With
// anchor = floor(price / interval):
//   window    = [anchor - buy_window, anchor + sell_window]
//   buy range = [anchor - buy_window, anchor - 1]
//
// Per slot: EMPTY -> PENDING_BUY -> FILLED -> PENDING_SELL -> EMPTY, at most one
// live order. The sell for a slot rests one interval above it.
//
// Every public mutation takes the same async mutex and holds it across the
// executor calls it makes, so the order-update consumer always sees an order
// attached to its slot before it can apply that order's fill.
//
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use chrono::Utc;
use futures_util::future::join_all;
use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, warn};

use crate::config::GridConfig;
use crate::domain::{ClientOrderId, Order, OrderRequest, OrderStatus, OrderUpdate, Position, PositionStatus, Side, Slot, Trade};
use crate::events::{Event, EventBus};
use crate::executor::{CancelOutcome, ExecError, OrderExecutor, PlaceOutcome};
use crate::metrics::{FILLS, MARGIN_BLOCKS, PNL_REALIZED, SLOTS, TRADES};
use crate::store::Store;

const SEEN_CAPACITY: usize = 10_000;

#[derive(Debug, Error, PartialEq)]
pub enum EngineError {
    #[error("engine already initialized")]
    AlreadyInitialized,
    #[error("engine not initialized")]
    NotInitialized,
    #[error("price {0} cannot be mapped onto the grid")]
    InvalidPrice(Decimal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    Duplicate,
    /// acks, foreign orders, other symbols
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdjustReport {
    pub placed: usize,
    pub canceled: usize,
    pub pruned: usize,
}

/// Read-only copy of the grid
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub symbol: String,
    pub interval: Decimal,
    pub initialized: bool,
    pub anchor_price: Option<Decimal>,
    pub last_price: Option<Decimal>,
    pub slots: Vec<Slot>,
    pub realized_pnl: Decimal,
    pub trades: u64,
    pub buys_suspended: bool,
}

impl EngineSnapshot {
    /// Inventory the engine believes it holds
    pub fn position_qty(&self) -> Decimal {
        self.slots
            .iter()
            .filter(|s| matches!(s.status, PositionStatus::Filled | PositionStatus::PendingSell))
            .map(|s| s.position_qty)
            .sum()
    }

    pub fn active_orders(&self, side: Side) -> usize {
        self.slots.iter().filter(|s| s.active_order.as_ref().map(|o| o.side == side).unwrap_or(false)).count()
    }

    /// Realized PnL plus what the held slots make if their sells fill
    pub fn estimated_profit(&self) -> Decimal {
        let pending: Decimal = self
            .slots
            .iter()
            .filter(|s| !s.position_qty.is_zero())
            .map(|s| (s.price + self.interval - s.entry_price) * s.position_qty - s.buy_fee)
            .sum();
        self.realized_pnl + pending
    }

    #[cfg(test)]
    pub fn slot_at(&self, price: Decimal) -> Option<&Slot> { self.slots.iter().find(|s| s.price == price) }
}

/// Bounded set of applied `(client id, status)` keys
#[derive(Debug, Default)]
struct Seen {
    order: VecDeque<String>,
    set: HashSet<String>,
}

impl Seen {
    fn insert(&mut self, key: String) -> bool {
        if !self.set.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > SEEN_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }
}

#[derive(Debug, Default)]
struct EngineState {
    initialized: bool,
    anchor: i64,
    last_price: Option<Decimal>,
    slots: BTreeMap<i64, Slot>,
    by_client_id: HashMap<String, i64>,
    seen: Seen,
    buy_blocked_until: Option<Instant>,
    sell_blocked_until: Option<Instant>,
    realized_pnl: Decimal,
    trades: u64,
    /// published once the state lock is released
    outbox: Vec<Event>,
}

struct Intent {
    level: i64,
    req: OrderRequest,
}

pub struct SlotEngine {
    cfg: GridConfig,
    executor: Arc<OrderExecutor>,
    store: Arc<dyn Store>,
    bus: EventBus,
    state: Mutex<EngineState>,
    buys_suspended: AtomicBool,
}

impl SlotEngine {
    pub fn new(cfg: GridConfig, executor: Arc<OrderExecutor>, store: Arc<dyn Store>, bus: EventBus) -> Self {
        Self { cfg, executor, store, bus, state: Mutex::new(EngineState::default()), buys_suspended: AtomicBool::new(false) }
    }

    pub fn symbol(&self) -> &str { &self.cfg.symbol }

    pub fn buys_suspended(&self) -> bool { self.buys_suspended.load(Ordering::Acquire) }

    // ---------------------------------------------------------------------
    // grid arithmetic
    // ---------------------------------------------------------------------
    fn level_of(&self, price: Decimal) -> Result<i64, EngineError> {
        if price <= Decimal::ZERO {
            return Err(EngineError::InvalidPrice(price));
        }
        (price / self.cfg.price_interval).floor().to_i64().ok_or(EngineError::InvalidPrice(price))
    }

    fn price_of(&self, level: i64) -> Decimal { Decimal::from(level) * self.cfg.price_interval }

    /// Level 0 and below have no positive price, so the window floor stops at 1.
    fn window(&self, anchor: i64) -> (i64, i64) {
        ((anchor - i64::from(self.cfg.buy_window_size)).max(1), anchor + i64::from(self.cfg.sell_window_size))
    }

    fn in_buy_range(&self, anchor: i64, level: i64) -> bool { level >= self.window(anchor).0 && level < anchor }

    /// Quote-sized level converted to base units, truncated to the venue precision.
    fn base_qty(&self, price: Decimal) -> Decimal {
        if price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.cfg.order_quantity / price).round_dp_with_strategy(self.cfg.quantity_precision, RoundingStrategy::ToZero)
    }

    fn buy_intent(&self, level: i64) -> Option<Intent> {
        let price = self.price_of(level);
        let qty = self.base_qty(price);
        if qty.is_zero() {
            warn!(symbol = %self.cfg.symbol, %price, "level quantity rounds to zero, not quoting");
            return None;
        }
        Some(Intent { level, req: OrderRequest::new(&self.cfg.symbol, Side::Buy, price, qty) })
    }

    fn sell_intent(&self, slot: &Slot) -> Intent {
        let price = slot.price + self.cfg.price_interval;
        Intent { level: slot.level, req: OrderRequest::new(&self.cfg.symbol, Side::Sell, price, slot.position_qty) }
    }

    fn side_blocked(st: &EngineState, side: Side) -> bool {
        let until = match side {
            Side::Buy => st.buy_blocked_until,
            Side::Sell => st.sell_blocked_until,
        };
        until.map(|t| Instant::now() < t).unwrap_or(false)
    }

    fn buys_allowed(&self, st: &EngineState) -> bool { !self.buys_suspended() && !Self::side_blocked(st, Side::Buy) }

    // ---------------------------------------------------------------------
    // order plumbing
    // ---------------------------------------------------------------------
    fn assign(&self, st: &mut EngineState, level: i64, order: Order) {
        let Some(slot) = st.slots.get_mut(&level) else {
            warn!(symbol = %self.cfg.symbol, level, id = %order.order_id, "placed order has no slot");
            return;
        };
        slot.status = match order.side {
            Side::Buy => PositionStatus::PendingBuy,
            Side::Sell => PositionStatus::PendingSell,
        };
        slot.cancel_requested = false;
        st.by_client_id.insert(order.client_order_id.clone(), level);
        slot.active_order = Some(order);
    }

    fn on_place_error(&self, st: &mut EngineState, req: &OrderRequest, err: &ExecError) {
        if err.is_margin_insufficient() {
            let until = Instant::now() + self.cfg.margin_lock_duration;
            match req.side {
                Side::Buy => st.buy_blocked_until = Some(until),
                Side::Sell => st.sell_blocked_until = Some(until),
            }
            MARGIN_BLOCKS.with_label_values(&[&self.cfg.symbol, req.side.as_str()]).inc();
            warn!(
                symbol = %self.cfg.symbol,
                side = %req.side,
                price = %req.price,
                secs = self.cfg.margin_lock_duration.as_secs(),
                "insufficient margin, side blocked"
            );
        } else {
            warn!(symbol = %self.cfg.symbol, side = %req.side, price = %req.price, error = %err, "order placement failed");
        }
    }

    async fn place(&self, st: &mut EngineState, intents: Vec<Intent>) -> usize {
        if intents.is_empty() {
            return 0;
        }
        let reqs: Vec<OrderRequest> = intents.iter().map(|i| i.req.clone()).collect();
        let out = self.executor.batch_place_orders(&reqs).await;
        if out.margin_insufficient {
            debug!(symbol = %self.cfg.symbol, placed = out.placed(), skipped = out.skipped(), failed = out.failed(), "batch hit the margin limit");
        }

        let mut placed = 0;
        for (intent, res) in intents.into_iter().zip(out.results) {
            match res {
                Ok(PlaceOutcome::Placed(order)) => {
                    self.assign(st, intent.level, order);
                    placed += 1;
                }
                Ok(PlaceOutcome::Skipped) => {}
                Err(e) => self.on_place_error(st, &intent.req, &e),
            }
        }
        placed
    }

    /// One cancel per order: slots already flagged are left alone.
    async fn cancel(&self, st: &mut EngineState, levels: Vec<i64>) -> usize {
        let targets: Vec<(i64, String)> = levels
            .into_iter()
            .filter_map(|level| {
                let slot = st.slots.get(&level)?;
                if slot.cancel_requested {
                    return None;
                }
                slot.active_order.as_ref().map(|o| (level, o.order_id.clone()))
            })
            .collect();
        if targets.is_empty() {
            return 0;
        }

        let results = join_all(targets.iter().map(|(_, id)| self.executor.cancel_order(&self.cfg.symbol, id))).await;
        let mut canceled = 0;
        for ((level, id), res) in targets.into_iter().zip(results) {
            let mark = match res {
                Ok(CancelOutcome::Canceled) => {
                    canceled += 1;
                    true
                }
                Ok(CancelOutcome::Skipped) => true,
                Err(e) if e.is_not_found() => {
                    warn!(symbol = %self.cfg.symbol, level, %id, "cancel target already gone, waiting for its final update");
                    true
                }
                Err(e) => {
                    warn!(symbol = %self.cfg.symbol, level, %id, error = %e, "cancel failed, will retry");
                    false
                }
            };
            if let Some(slot) = st.slots.get_mut(&level) {
                slot.cancel_requested |= mark;
            }
        }
        canceled
    }

    /// Drops idle slots outside the window; returns live buys out there to cancel.
    fn sweep_outside(&self, st: &mut EngineState) -> (usize, Vec<i64>) {
        let (lo, hi) = self.window(st.anchor);
        let mut prune = Vec::new();
        let mut cancel = Vec::new();
        for (level, slot) in st.slots.range(..lo).chain(st.slots.range(hi + 1..)) {
            match &slot.active_order {
                None if slot.status == PositionStatus::Empty => prune.push(*level),
                Some(o) if o.side == Side::Buy && slot.position_qty.is_zero() => cancel.push(*level),
                _ => {}
            }
        }
        for level in &prune {
            st.slots.remove(level);
        }
        (prune.len(), cancel)
    }

    fn ensure_window(&self, st: &mut EngineState) {
        let (lo, hi) = self.window(st.anchor);
        for level in lo..=hi {
            let price = self.price_of(level);
            st.slots.entry(level).or_insert_with(|| Slot::empty(level, price));
        }
    }

    fn publish_gauges(&self, st: &EngineState) {
        let mut counts = [0i64; 4];
        for s in st.slots.values() {
            let idx = match s.status {
                PositionStatus::Empty => 0,
                PositionStatus::PendingBuy => 1,
                PositionStatus::Filled => 2,
                PositionStatus::PendingSell => 3,
            };
            counts[idx] += 1;
        }
        for (status, n) in [
            PositionStatus::Empty,
            PositionStatus::PendingBuy,
            PositionStatus::Filled,
            PositionStatus::PendingSell,
        ]
        .iter()
        .zip(counts)
        {
            SLOTS.with_label_values(&[&self.cfg.symbol, status.as_str()]).set(n);
        }
    }

    // ---------------------------------------------------------------------
    // public operations
    // ---------------------------------------------------------------------

    /// Anchor the grid, hand pre-existing inventory to sell-side slots and
    /// quote the buy range.
    pub async fn initialize(&self, price: Decimal, existing: Option<Position>) -> Result<AdjustReport, EngineError> {
        let anchor = self.level_of(price)?;
        let mut st = self.state.lock().await;
        if st.initialized {
            return Err(EngineError::AlreadyInitialized);
        }
        st.initialized = true;
        st.anchor = anchor;
        st.last_price = Some(price);
        self.ensure_window(&mut st);

        let mut intents = Vec::new();
        if let Some(pos) = existing.filter(|p| p.qty > Decimal::ZERO) {
            let (_, hi) = self.window(anchor);
            let mut remaining = pos.qty;
            let mut level = anchor;
            while remaining > Decimal::ZERO {
                let slot_price = self.price_of(level);
                let per_level = self.base_qty(slot_price);
                let qty = if level >= hi || per_level.is_zero() { remaining } else { per_level.min(remaining) };
                let entry = if pos.entry_price > Decimal::ZERO { pos.entry_price } else { slot_price };

                let slot = st.slots.entry(level).or_insert_with(|| Slot::empty(level, slot_price));
                slot.status = PositionStatus::Filled;
                slot.position_qty = qty;
                slot.entry_price = entry;
                intents.push(self.sell_intent(slot));

                remaining -= qty;
                level += 1;
            }
            info!(symbol = %self.cfg.symbol, qty = %pos.qty, slots = intents.len(), "existing inventory allocated to sell side");
        }

        if self.buys_allowed(&st) {
            let (lo, _) = self.window(anchor);
            intents.extend((lo..anchor).filter_map(|level| self.buy_intent(level)));
        }

        let placed = self.place(&mut st, intents).await;
        self.publish_gauges(&st);
        info!(symbol = %self.cfg.symbol, %price, placed, slots = st.slots.len(), "grid initialized");
        Ok(AdjustReport { placed, ..AdjustReport::default() })
    }

    /// Move the window to `price`. Idempotent for an unchanged price.
    pub async fn adjust_orders(&self, price: Decimal) -> Result<AdjustReport, EngineError> {
        let anchor = self.level_of(price)?;
        let mut st = self.state.lock().await;
        if !st.initialized {
            return Err(EngineError::NotInitialized);
        }
        if st.anchor != anchor {
            debug!(symbol = %self.cfg.symbol, from = st.anchor, to = anchor, "window shift");
        }
        st.anchor = anchor;
        st.last_price = Some(price);
        self.ensure_window(&mut st);

        let (pruned, mut stale) = self.sweep_outside(&mut st);
        if self.buys_suspended() {
            // buys whose cancel failed on the breaker edge
            stale.extend(
                st.slots
                    .iter()
                    .filter(|(_, s)| !s.cancel_requested && s.active_order.as_ref().map(|o| o.side == Side::Buy).unwrap_or(false))
                    .map(|(l, _)| *l),
            );
            stale.sort_unstable();
            stale.dedup();
        }
        let canceled = self.cancel(&mut st, stale).await;

        let mut intents = Vec::new();
        if !Self::side_blocked(&st, Side::Sell) {
            // filled slots whose sell was skipped or rejected earlier
            intents.extend(
                st.slots
                    .values()
                    .filter(|s| s.status == PositionStatus::Filled && s.active_order.is_none())
                    .map(|s| self.sell_intent(s)),
            );
        }
        if self.buys_allowed(&st) {
            let (lo, _) = self.window(anchor);
            let idle: Vec<i64> = st.slots.range(lo..anchor).filter(|(_, s)| s.is_idle()).map(|(l, _)| *l).collect();
            intents.extend(idle.into_iter().filter_map(|level| self.buy_intent(level)));
        }

        let placed = self.place(&mut st, intents).await;
        self.publish_gauges(&st);
        Ok(AdjustReport { placed, canceled, pruned })
    }

    /// State transition for one canonical order event. Must be fed in
    /// arrival order.
    pub async fn on_order_update(&self, u: OrderUpdate) -> UpdateOutcome {
        if u.symbol != self.cfg.symbol {
            return UpdateOutcome::Ignored;
        }
        let mut st = self.state.lock().await;
        if !st.seen.insert(u.dedup_key()) {
            debug!(symbol = %u.symbol, cid = %u.client_order_id, status = u.status.as_str(), "duplicate order update");
            return UpdateOutcome::Duplicate;
        }
        if !u.status.is_terminal() {
            return UpdateOutcome::Ignored;
        }
        let Some(&level) = st.by_client_id.get(&u.client_order_id) else {
            match ClientOrderId::parse(&u.client_order_id) {
                Some((side, price, _)) => {
                    debug!(symbol = %u.symbol, cid = %u.client_order_id, %side, %price, "update for a grid order no slot tracks")
                }
                None => debug!(symbol = %u.symbol, cid = %u.client_order_id, "update for a foreign order"),
            }
            return UpdateOutcome::Ignored;
        };
        st.by_client_id.remove(&u.client_order_id);

        match (u.side, u.status) {
            (Side::Buy, OrderStatus::Filled) => self.apply_buy_fill(&mut st, level, &u).await,
            (Side::Buy, OrderStatus::Canceled) if u.filled_qty > Decimal::ZERO => {
                info!(symbol = %u.symbol, level, filled = %u.filled_qty, "partially filled buy canceled, keeping the fill");
                st.outbox.push(canceled_event(&u));
                self.apply_buy_fill(&mut st, level, &u).await;
            }
            (Side::Sell, OrderStatus::Filled) => self.apply_sell_fill(&mut st, level, &u).await,
            (side, _) => {
                if let Some(slot) = st.slots.get_mut(&level) {
                    if side == Side::Sell && !slot.position_qty.is_zero() {
                        warn!(
                            symbol = %u.symbol,
                            level,
                            qty = %slot.position_qty,
                            "sell canceled externally, slot released with inventory still held"
                        );
                    }
                    slot.reset();
                }
                st.outbox.push(canceled_event(&u));
            }
        }
        self.publish_gauges(&st);
        let events = std::mem::take(&mut st.outbox);
        drop(st);
        for ev in events {
            self.bus.publish(ev).await;
        }
        UpdateOutcome::Applied
    }

    async fn apply_buy_fill(&self, st: &mut EngineState, level: i64, u: &OrderUpdate) {
        let Some(slot) = st.slots.get_mut(&level) else { return };
        let ordered = slot.active_order.as_ref().map(|o| o.quantity).unwrap_or(Decimal::ZERO);
        let qty = if u.filled_qty > Decimal::ZERO { u.filled_qty } else { ordered };
        let px = if u.avg_fill_price > Decimal::ZERO { u.avg_fill_price } else { u.price };

        slot.status = PositionStatus::Filled;
        slot.position_qty = qty;
        slot.entry_price = px;
        slot.buy_order_id = Some(u.order_id.clone());
        slot.buy_fee = u.fee;
        slot.active_order = None;
        slot.cancel_requested = false;
        let sell = self.sell_intent(slot);

        FILLS.with_label_values(&[&self.cfg.symbol, "buy"]).inc();
        info!(symbol = %self.cfg.symbol, price = %px, %qty, "buy filled, quoting sell");
        st.outbox.push(Event::OrderFilled {
            symbol: self.cfg.symbol.clone(),
            order_id: u.order_id.clone(),
            side: Side::Buy,
            price: px,
            qty,
            ts: u.ts,
        });

        if Self::side_blocked(st, Side::Sell) {
            debug!(symbol = %self.cfg.symbol, level, "sell side blocked, sell deferred");
            return;
        }
        self.place(st, vec![sell]).await;
    }

    async fn apply_sell_fill(&self, st: &mut EngineState, level: i64, u: &OrderUpdate) {
        let Some(slot) = st.slots.get_mut(&level) else { return };
        let qty = slot.position_qty;
        let sell_px = if u.avg_fill_price > Decimal::ZERO { u.avg_fill_price } else { u.price };
        let pnl = (sell_px - slot.entry_price) * qty - slot.buy_fee - u.fee;
        let trade = Trade {
            buy_order_id: slot.buy_order_id.clone().unwrap_or_default(),
            sell_order_id: u.order_id.clone(),
            symbol: self.cfg.symbol.clone(),
            buy_price: slot.entry_price,
            sell_price: sell_px,
            quantity: qty,
            pnl,
            created_at: Utc::now(),
        };
        slot.reset();

        st.realized_pnl += pnl;
        st.trades += 1;
        FILLS.with_label_values(&[&self.cfg.symbol, "sell"]).inc();
        TRADES.with_label_values(&[&self.cfg.symbol]).inc();
        PNL_REALIZED.with_label_values(&[&self.cfg.symbol]).set(st.realized_pnl.to_f64().unwrap_or(0.0));
        info!(
            symbol = %self.cfg.symbol,
            buy = %trade.buy_price,
            sell = %trade.sell_price,
            qty = %qty,
            pnl = %pnl,
            "round trip closed"
        );

        if let Err(e) = self.store.save_trade(&trade).await {
            warn!(symbol = %self.cfg.symbol, error = %e, "trade not persisted");
        }
        st.outbox.push(Event::OrderFilled {
            symbol: self.cfg.symbol.clone(),
            order_id: u.order_id.clone(),
            side: Side::Sell,
            price: sell_px,
            qty,
            ts: u.ts,
        });
        st.outbox.push(Event::TradeClosed { trade });

        if self.in_buy_range(st.anchor, level) && self.buys_allowed(st) {
            if let Some(intent) = self.buy_intent(level) {
                self.place(st, vec![intent]).await;
            }
        }
    }

    /// Risk rising edge: cancel every live buy once and stop quoting buys
    /// until [`resume_buys`](Self::resume_buys). Sells keep resting.
    pub async fn cancel_all_buy_orders(&self) -> usize {
        self.buys_suspended.store(true, Ordering::Release);
        let mut st = self.state.lock().await;
        let levels: Vec<i64> = st
            .slots
            .iter()
            .filter(|(_, s)| s.active_order.as_ref().map(|o| o.side == Side::Buy).unwrap_or(false))
            .map(|(l, _)| *l)
            .collect();
        let canceled = self.cancel(&mut st, levels).await;
        info!(symbol = %self.cfg.symbol, canceled, "buy side suspended");
        canceled
    }

    pub fn resume_buys(&self) {
        if self.buys_suspended.swap(false, Ordering::AcqRel) {
            info!(symbol = %self.cfg.symbol, "buy side resumed");
        }
    }

    /// Window-cleanup pass without moving the anchor.
    pub async fn prune_outside_window(&self) -> AdjustReport {
        let mut st = self.state.lock().await;
        if !st.initialized {
            return AdjustReport::default();
        }
        let (pruned, stale) = self.sweep_outside(&mut st);
        let canceled = self.cancel(&mut st, stale).await;
        if pruned > 0 || canceled > 0 {
            debug!(symbol = %self.cfg.symbol, pruned, canceled, "window cleanup");
        }
        self.publish_gauges(&st);
        AdjustReport { placed: 0, canceled, pruned }
    }

    pub async fn snapshot(&self) -> EngineSnapshot {
        let st = self.state.lock().await;
        EngineSnapshot {
            symbol: self.cfg.symbol.clone(),
            interval: self.cfg.price_interval,
            initialized: st.initialized,
            anchor_price: st.initialized.then(|| self.price_of(st.anchor)),
            last_price: st.last_price,
            slots: st.slots.values().cloned().collect(),
            realized_pnl: st.realized_pnl,
            trades: st.trades,
            buys_suspended: self.buys_suspended(),
        }
    }
}

fn canceled_event(u: &OrderUpdate) -> Event {
    Event::OrderCanceled { symbol: u.symbol.clone(), order_id: u.order_id.clone(), side: u.side, price: u.price, ts: u.ts }
}
