// ===============================
// src/backoff.rs
// ===============================
//
// Exponential backoff + jitter, shared by the order executor (transient
// exchange errors) and the blocking lock acquisition loop.
//
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    /// jitter as a fraction of the computed delay (0.0 = deterministic)
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self { base, max, jitter: jitter.clamp(0.0, 1.0), attempt: 0 }
    }

    /// base * 2^attempt, capped, then +/- jitter
    pub fn next_delay(&mut self) -> Duration {
        let shift = self.attempt.min(16);
        let capped = self.base.saturating_mul(1u32 << shift).min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        let spread = capped.as_secs_f64() * self.jitter;
        if spread <= 0.0 {
            return capped;
        }
        // don't keep ThreadRng alive across an .await in callers
        let j = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((capped.as_secs_f64() + j).max(0.0))
    }

    pub fn attempt(&self) -> u32 { self.attempt }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(500), 0.0);
        let got: Vec<u128> = (0..5).map(|_| b.next_delay().as_millis()).collect();
        assert_eq!(got, vec![100, 200, 400, 500, 500]);
        assert_eq!(b.attempt(), 5);
    }

    #[test]
    fn jitter_stays_in_band() {
        let mut b = Backoff::new(Duration::from_secs(10), Duration::from_secs(60), 0.2);
        let secs = b.next_delay().as_secs_f64();
        assert!((8.0..=12.0).contains(&secs), "delay was {secs}");
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 0.0);
        for _ in 0..100 {
            b.next_delay();
        }
        assert_eq!(b.next_delay(), Duration::from_secs(30));
    }
}
