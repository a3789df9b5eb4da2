// ===============================
// src/candles.rs
// ===============================
//
// Folds the tick stream into fixed-width OHLCV candles for the risk monitor.
// A candle closes when the first tick of a later bucket arrives; late ticks
// are folded into the open candle.
//
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;

use crate::domain::{Candle, PriceTick};

pub struct CandleBuilder {
    symbol: String,
    secs: i64,
    current: Option<Candle>,
}

impl CandleBuilder {
    pub fn new(symbol: &str, secs: i64) -> Self { Self { symbol: symbol.to_string(), secs: secs.max(1), current: None } }

    fn bucket(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let t = ts.timestamp();
        let start = t - t.rem_euclid(self.secs);
        Utc.timestamp_opt(start, 0).single().unwrap_or(ts)
    }

    fn open(&self, tick: &PriceTick, open_time: DateTime<Utc>) -> Candle {
        Candle {
            symbol: self.symbol.clone(),
            open_time,
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.volume.max(Decimal::ZERO),
        }
    }

    /// Returns the candle closed by this tick, if any.
    pub fn on_tick(&mut self, tick: &PriceTick) -> Option<Candle> {
        let open_time = self.bucket(tick.ts);
        match self.current.as_mut() {
            Some(c) if open_time <= c.open_time => {
                c.high = c.high.max(tick.price);
                c.low = c.low.min(tick.price);
                c.close = tick.price;
                c.volume += tick.volume.max(Decimal::ZERO);
                None
            }
            _ => {
                let next = self.open(tick, open_time);
                self.current.replace(next)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tick(secs: i64, price: Decimal, volume: Decimal) -> PriceTick {
        PriceTick { symbol: "BTCUSDT".into(), price, volume, ts: Utc.timestamp_opt(1_700_000_040 + secs, 0).unwrap() }
    }

    #[test]
    fn aggregates_ohlcv_per_bucket() {
        let mut b = CandleBuilder::new("BTCUSDT", 60);
        assert!(b.on_tick(&tick(20, dec!(100), dec!(1))).is_none());
        assert!(b.on_tick(&tick(30, dec!(105), dec!(2))).is_none());
        assert!(b.on_tick(&tick(40, dec!(98), dec!(1))).is_none());
        assert!(b.on_tick(&tick(50, dec!(101), dec!(0.5))).is_none());

        let c = b.on_tick(&tick(80, dec!(102), dec!(1))).unwrap();
        assert_eq!((c.open, c.high, c.low, c.close), (dec!(100), dec!(105), dec!(98), dec!(101)));
        assert_eq!(c.volume, dec!(4.5));
        assert_eq!(c.open_time.timestamp() % 60, 0);
    }

    #[test]
    fn late_tick_folds_into_open_candle() {
        let mut b = CandleBuilder::new("BTCUSDT", 60);
        b.on_tick(&tick(80, dec!(100), dec!(1)));
        assert!(b.on_tick(&tick(10, dec!(90), dec!(1))).is_none());
        let c = b.on_tick(&tick(200, dec!(100), dec!(1))).unwrap();
        assert_eq!(c.low, dec!(90));
        assert_eq!(c.volume, dec!(2));
    }
}
