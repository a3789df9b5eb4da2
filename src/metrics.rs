// ===============================
// src/metrics.rs
// ===============================
use hyper::{
    header::CONTENT_TYPE,
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server,
};
use once_cell::sync::Lazy;
use prometheus::{Encoder, GaugeVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::{convert::Infallible, net::SocketAddr};
use tokio::sync::watch;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Market data --------
pub static TICKS: Lazy<IntCounterVec> =
    Lazy::new(|| IntCounterVec::new(Opts::new("ticks_total", "price ticks per symbol"), &["symbol"]).unwrap());

pub static CANDLES: Lazy<IntCounterVec> =
    Lazy::new(|| IntCounterVec::new(Opts::new("candles_closed_total", "closed candles per symbol"), &["symbol"]).unwrap());

// -------- Execution --------
pub static EXECS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("exec_reports_total", "execution reports"), &["status", "venue"]).unwrap()
});

pub static ORDERS_PLACED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("orders_placed_total", "orders accepted by the venue"), &["symbol", "side"]).unwrap()
});

pub static ORDER_CANCELS: Lazy<IntCounterVec> =
    Lazy::new(|| IntCounterVec::new(Opts::new("order_cancels_total", "cancels accepted by the venue"), &["symbol"]).unwrap());

pub static ORDER_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("order_errors_total", "failed order calls (labels: symbol, op, kind)"),
        &["symbol", "op", "kind"],
    )
    .unwrap()
});

pub static EXEC_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("exec_retries_total", "transient errors retried"), &["symbol", "op"]).unwrap()
});

pub static LOCK_CONTENDED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("lock_contended_total", "operations skipped because another instance held the key"),
        &["symbol", "op"],
    )
    .unwrap()
});

// -------- Grid state --------
pub static FILLS: Lazy<IntCounterVec> =
    Lazy::new(|| IntCounterVec::new(Opts::new("fills_total", "order fills applied"), &["symbol", "side"]).unwrap());

pub static TRADES: Lazy<IntCounterVec> =
    Lazy::new(|| IntCounterVec::new(Opts::new("trades_total", "closed buy/sell round trips"), &["symbol"]).unwrap());

pub static PNL_REALIZED: Lazy<GaugeVec> =
    Lazy::new(|| GaugeVec::new(Opts::new("pnl_realized", "realized PnL (quote)"), &["symbol"]).unwrap());

pub static SLOTS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("grid_slots", "slots by position status"), &["symbol", "status"]).unwrap()
});

pub static MARGIN_BLOCKS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("margin_blocks_total", "sides blocked after a margin rejection"), &["symbol", "side"])
        .unwrap()
});

// -------- Risk / reconciliation --------
pub static RISK_TRIGGERED: Lazy<IntGaugeVec> =
    Lazy::new(|| IntGaugeVec::new(Opts::new("risk_triggered", "1 while the breaker is open"), &["symbol"]).unwrap());

pub static RECON_DIFF: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("reconcile_position_diff", "local minus venue position"), &["symbol"]).unwrap()
});

pub static RECON_DRIFT: Lazy<IntCounterVec> =
    Lazy::new(|| IntCounterVec::new(Opts::new("reconcile_drift_total", "reconciliations with drift"), &["symbol"]).unwrap());

// -------- Events --------
pub static EVENTS_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("events_dropped_total", "informational events evicted from a full queue"), &["kind"])
        .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_symbol", "configured symbols (label: symbol)"), &["symbol"]).unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry; a second call is a no-op
    for m in [
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(CANDLES.clone())),
        REGISTRY.register(Box::new(EXECS.clone())),
        REGISTRY.register(Box::new(ORDERS_PLACED.clone())),
        REGISTRY.register(Box::new(ORDER_CANCELS.clone())),
        REGISTRY.register(Box::new(ORDER_ERRORS.clone())),
        REGISTRY.register(Box::new(EXEC_RETRIES.clone())),
        REGISTRY.register(Box::new(LOCK_CONTENDED.clone())),
        REGISTRY.register(Box::new(FILLS.clone())),
        REGISTRY.register(Box::new(TRADES.clone())),
        REGISTRY.register(Box::new(PNL_REALIZED.clone())),
        REGISTRY.register(Box::new(SLOTS.clone())),
        REGISTRY.register(Box::new(MARGIN_BLOCKS.clone())),
        REGISTRY.register(Box::new(RISK_TRIGGERED.clone())),
        REGISTRY.register(Box::new(RECON_DIFF.clone())),
        REGISTRY.register(Box::new(RECON_DRIFT.clone())),
        REGISTRY.register(Box::new(EVENTS_DROPPED.clone())),
        REGISTRY.register(Box::new(CONFIG_SYMBOL.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let mut resp = Response::new(Body::from(encode_metrics()));
    if let Ok(v) = "text/plain; version=0.0.4; charset=utf-8".parse() {
        resp.headers_mut().insert(CONTENT_TYPE, v);
    }
    Ok(resp)
}

/// Serves every path with the registry dump until `shutdown` flips.
pub async fn serve_metrics(port: u16, mut shutdown: watch::Receiver<bool>) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let builder = match Server::try_bind(&addr) {
        Ok(b) => b,
        Err(e) => {
            error!(?e, %addr, "metrics bind failed, continuing without /metrics");
            return;
        }
    };
    info!(%addr, "metrics listening on http://{addr}/metrics");

    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });
    let server = builder.serve(make_svc).with_graceful_shutdown(async move {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
    });
    if let Err(e) = server.await {
        error!(?e, "metrics server error");
    }
}
