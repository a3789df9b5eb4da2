// ===============================
// src/main.rs
// ===============================
/*
 # quick checks while running
curl -s localhost:9898/metrics | grep '^config_symbol'
curl -s localhost:9898/metrics | egrep '^(grid_slots|fills_total|pnl_realized)'
curl -s localhost:9898/metrics | egrep '^(risk_triggered|reconcile_drift_total)'
*/
/*
=============================================================================
Project : grid_bot_rust — concurrent grid liquidity engine in Rust
Module  : main.rs
Version : 0.5.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Keeps a window of resting limit orders around a moving price per
          symbol, reacts to fills with mirrored orders, gates buys behind a
          market-anomaly breaker, audits local state against the venue, and
          guards order placement with a cross-instance lock.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
mod domain;
mod config;
mod backoff;
mod lock;
mod exchange;
mod gateway;          // paper venue (rests orders, fills on cross)
mod executor;
mod metrics;
mod store;
mod events;
mod recorder;
mod candles;
mod risk;
mod engine;
mod reconciler;
mod feed;
mod runtime;
#[cfg(test)]
mod testkit;

use ahash::AHashSet as HashSet;
use anyhow::Context;
use clap::Parser;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::{
    select,
    sync::{mpsc, watch},
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, LockMode};
use crate::domain::Side;
use crate::events::{Event, EventBus, EventSink, LogSink, RecorderSink};
use crate::gateway::PaperExchange;
use crate::lock::{DistributedLock, MemoryLock, NoopLock, RedisLock};
use crate::store::{JsonlStore, MemoryStore, Store};

const HEARTBEAT_SECS: u64 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Config ----
    let cli = Cli::parse();
    let settings = config::load(&cli).context("loading configuration")?;
    let args = settings.args.clone();

    // ---- Metrics ----
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    metrics::init();
    let metrics_task = tokio::spawn(metrics::serve_metrics(args.metrics_port, shutdown_rx.clone()));

    let lock_mode_str = match args.lock_mode {
        LockMode::None => "none",
        LockMode::Memory => "memory",
        LockMode::Redis => "redis",
    };
    info!(
        symbols = ?args.symbols,
        lock_mode = lock_mode_str,
        data_dir = ?args.data_dir,
        record_file = ?args.record_file,
        event_workers = args.event_workers,
        max_qps = settings.executor.max_qps,
        risk_enabled = settings.risk.enabled,
        "startup config"
    );
    for g in &settings.grids {
        metrics::CONFIG_SYMBOL.with_label_values(&[&g.symbol]).set(1);
        info!(
            symbol = %g.symbol,
            interval = %g.price_interval,
            qty = %g.order_quantity,
            buy_window = g.buy_window_size,
            sell_window = g.sell_window_size,
            "grid config"
        );
    }

    // ---- Lock backend ----
    let lock: Arc<dyn DistributedLock> = match args.lock_mode {
        LockMode::None => Arc::new(NoopLock),
        LockMode::Memory => Arc::new(MemoryLock::new()),
        LockMode::Redis => Arc::new(
            RedisLock::connect(&args.redis_url, "grid")
                .await
                .with_context(|| format!("connecting lock backend at {}", args.redis_url))?,
        ),
    };

    // ---- Persistence ----
    let store: Arc<dyn Store> = match &args.data_dir {
        Some(dir) => Arc::new(JsonlStore::open(dir).await.with_context(|| format!("opening store in {}", dir.display()))?),
        None => {
            warn!("DATA_DIR not set, trades and reconcile history stay in memory");
            Arc::new(MemoryStore::new())
        }
    };

    // ---- Events + recorder (optional) ----
    let bus = EventBus::new(args.event_queue_capacity);
    let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(LogSink)];
    let mut recorder_task = None;
    if let Some(path) = args.record_file.clone() {
        let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
        recorder_task = Some(tokio::spawn(recorder::run(rec_rx, path)));
        sinks.push(Arc::new(RecorderSink::new(rec_tx)));
    }
    let workers = bus.spawn_workers(args.event_workers, sinks);

    // ---- Venue + mock feed ----
    let quotes: HashSet<String> = settings.grids.iter().map(|g| g.quote_asset.clone()).collect();
    let mut paper = PaperExchange::new(
        settings.grids.first().map(|g| g.quote_asset.as_str()).unwrap_or("USDT"),
        settings.paper.fee_rate,
    )
    .with_leverage(settings.paper.leverage)
    .with_latency(Duration::from_millis(settings.paper.latency_ms));
    for q in &quotes {
        paper = paper.with_balance(q, settings.paper.quote_balance);
    }
    if settings.paper.start_position > Decimal::ZERO {
        for g in &settings.grids {
            paper = paper.with_position(&g.symbol, settings.paper.start_position, settings.paper.start_price);
        }
    }
    let venue = Arc::new(paper);
    let mut feeds = Vec::new();
    for g in &settings.grids {
        feeds.push(tokio::spawn(feed::run_mock(venue.clone(), g.symbol.clone(), settings.paper.clone(), shutdown_rx.clone())));
    }

    // ---- Per-symbol runtimes ----
    let services = runtime::Services {
        exchange: venue.clone(),
        lock,
        store,
        bus: bus.clone(),
        executor: settings.executor.clone(),
        risk: settings.risk.clone(),
        startup_price_timeout: args.startup_price_timeout,
        shutdown_cancel_timeout: args.shutdown_cancel_timeout,
    };
    let mut runtimes = Vec::new();
    for g in settings.grids.iter().cloned() {
        let symbol = g.symbol.clone();
        match runtime::start(g, &services, shutdown_rx.clone()).await {
            Ok(rt) => runtimes.push(rt),
            Err(e) => error!(%symbol, error = %e, "symbol failed to start, others keep running"),
        }
    }
    if runtimes.is_empty() {
        warn!("no symbol started");
    }

    // ---- Heartbeat until Ctrl-C ----
    let mut hb = interval(Duration::from_secs(HEARTBEAT_SECS));
    hb.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!(?e, "signal handler failed, shutting down");
                }
                break;
            }
            _ = hb.tick() => {
                for rt in &runtimes {
                    let snap = rt.engine().snapshot().await;
                    info!(
                        symbol = %rt.symbol(),
                        price = ?snap.last_price,
                        position = %snap.position_qty(),
                        buys = snap.active_orders(Side::Buy),
                        sells = snap.active_orders(Side::Sell),
                        trades = snap.trades,
                        pnl = %snap.realized_pnl,
                        risk = rt.risk().is_triggered(),
                        "heartbeat"
                    );
                }
            }
        }
    }

    // ---- Shutdown ----
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    for rt in runtimes {
        rt.stop().await;
    }
    for f in feeds {
        let _ = f.await;
    }
    if !bus.is_empty() {
        info!(queued = bus.len(), "draining event queue");
    }
    bus.close();
    for w in workers {
        let _ = w.await;
    }
    if let Some(t) = recorder_task {
        let _ = t.await;
    }
    let _ = metrics_task.await;
    info!("bye");
    Ok(())
}
