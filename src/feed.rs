// ===============================
// src/feed.rs
// ===============================
//
// Mock market data: a bounded random walk per symbol pushed into the paper
// venue, which fills crossed orders and forwards the tick on its price stream.
//
use rand::Rng;
use rust_decimal::Decimal;
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, time::sleep};
use tracing::{debug, info};

use crate::config::PaperConfig;
use crate::gateway::PaperExchange;

/// One random-walk step: +/- up to `step`, never below one `step`.
pub fn next_price(price: Decimal, step: Decimal, scale: u32) -> Decimal {
    // ThreadRng is !Send, keep it out of the async loop
    let r: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
    let delta = Decimal::from_f64_retain(r).unwrap_or(Decimal::ZERO) * step;
    (price + delta).round_dp(scale).max(step)
}

fn volume() -> Decimal {
    let v: u32 = rand::thread_rng().gen_range(1..=100);
    Decimal::new(i64::from(v), 2)
}

pub async fn run_mock(venue: Arc<PaperExchange>, symbol: String, cfg: PaperConfig, mut shutdown: watch::Receiver<bool>) {
    let scale = cfg.start_price.scale().max(cfg.step.scale());
    let mut price = cfg.start_price;
    let period = Duration::from_millis(cfg.tick_ms.max(1));
    info!(%symbol, start = %price, tick_ms = cfg.tick_ms, "mock feed started");

    loop {
        venue.set_price(&symbol, price, volume()).await;
        price = next_price(price, cfg.step, scale);

        tokio::select! {
            _ = sleep(period) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
            }
        }
    }
    debug!(%symbol, "mock feed stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Exchange;
    use rust_decimal_macros::dec;

    #[test]
    fn walk_stays_within_step_and_floor() {
        let mut p = dec!(1000);
        for _ in 0..500 {
            let next = next_price(p, dec!(2), 2);
            assert!((next - p).abs() <= dec!(2));
            assert!(next >= dec!(2));
            p = next;
        }
        assert!(next_price(dec!(0.5), dec!(0.01), 2) >= dec!(0.01));
    }

    #[tokio::test]
    async fn feed_drives_price_stream_until_shutdown() {
        let venue = Arc::new(PaperExchange::new("USDT", Decimal::ZERO));
        let mut prices = venue.subscribe_prices("BTCUSDT").await.unwrap();
        let (tx, rx) = watch::channel(false);
        let cfg = PaperConfig {
            quote_balance: dec!(1000),
            fee_rate: Decimal::ZERO,
            start_price: dec!(1000),
            tick_ms: 5,
            step: dec!(2),
            leverage: Decimal::ONE,
            start_position: Decimal::ZERO,
            latency_ms: 0,
        };
        let task = tokio::spawn(run_mock(venue.clone(), "BTCUSDT".into(), cfg, rx));

        let first = prices.recv().await.unwrap();
        assert_eq!(first.price, dec!(1000));
        assert!(prices.recv().await.is_some());

        tx.send(true).unwrap();
        task.await.unwrap();
        assert!(venue.last_price("BTCUSDT").is_some());
    }
}
