/// Per-token position record and its price/activity bookkeeping

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::core::types::TokenId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Price is tracked, nothing bought yet
    Watching,
    Holding,
    /// Terminal
    Sold,
}

/// Direction of a price change relative to the previous observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Increased,
    Decreased,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct PositionState {
    pub token: TokenId,
    pub phase: Phase,
    pub buy_price: f64,
    pub peak_price: f64,
    pub low_price: f64,
    pub last_price: f64,
    pub last_activity: Instant,
    pub buy_count: u32,
    pub sell_count: u32,
    pub has_second_buy: bool,
    pub cumulative_sold_pct: f64,
    pub open_price: Option<f64>,
    /// Trailing stop breached on the previous evaluation
    pub peak_stop_armed: bool,
}

impl PositionState {
    pub fn new(token: TokenId, now: Instant) -> Self {
        Self {
            token,
            phase: Phase::Watching,
            buy_price: 0.0,
            peak_price: 0.0,
            low_price: 0.0,
            last_price: 0.0,
            last_activity: now,
            buy_count: 0,
            sell_count: 0,
            has_second_buy: false,
            cumulative_sold_pct: 0.0,
            open_price: None,
            peak_stop_armed: false,
        }
    }

    /// Records the open price; later calls never overwrite it.
    pub fn set_open_price(&mut self, price: f64) {
        if self.open_price.is_none() && price > 0.0 {
            self.open_price = Some(price);
        }
    }

    /// Applies one observed price. Non-positive prices are ignored.
    pub fn observe(&mut self, price: f64, now: Instant) -> Tick {
        if !(price > 0.0) || price == self.last_price {
            return Tick::Unchanged;
        }

        let tick = if price > self.last_price {
            self.buy_count += 1;
            Tick::Increased
        } else {
            self.sell_count += 1;
            Tick::Decreased
        };

        self.last_activity = now;
        self.peak_price = self.peak_price.max(price);
        if self.low_price == 0.0 || price < self.low_price {
            self.low_price = price;
        }
        self.last_price = price;
        tick
    }

    /// Enters Holding; the buy price is only taken from the first buy.
    pub fn record_buy(&mut self, price: f64) {
        if self.phase == Phase::Watching {
            self.phase = Phase::Holding;
        }
        if self.buy_price == 0.0 {
            self.buy_price = price;
        }
    }

    pub fn record_second_buy(&mut self, price: f64) {
        self.has_second_buy = true;
        self.record_buy(price);
    }

    /// Adds a checkpoint sell; returns true once the position is fully sold.
    pub fn record_checkpoint(&mut self, percentage: f64) -> bool {
        self.cumulative_sold_pct = (self.cumulative_sold_pct + percentage).min(100.0);
        self.peak_stop_armed = false;
        self.cumulative_sold_pct >= 100.0
    }

    pub fn mark_sold(&mut self) {
        self.phase = Phase::Sold;
        self.peak_stop_armed = false;
    }

    pub fn is_holding(&self) -> bool {
        self.phase == Phase::Holding
    }

    pub fn is_sold(&self) -> bool {
        self.phase == Phase::Sold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;

    fn state() -> PositionState {
        PositionState::new(TokenId::from_bytes([1u8; 32]), Instant::now())
    }

    #[test]
    fn test_tick_direction_and_counters() {
        let mut s = state();
        let t0 = s.last_activity;

        assert_eq!(s.observe(1.0, t0 + Duration::from_secs(1)), Tick::Increased);
        assert_eq!(s.observe(1.5, t0 + Duration::from_secs(2)), Tick::Increased);
        assert_eq!(s.observe(1.2, t0 + Duration::from_secs(3)), Tick::Decreased);
        assert_eq!(s.observe(1.2, t0 + Duration::from_secs(9)), Tick::Unchanged);

        assert_eq!(s.buy_count, 2);
        assert_eq!(s.sell_count, 1);
        assert_eq!(s.peak_price, 1.5);
        assert_eq!(s.low_price, 1.0);
        assert_eq!(s.last_activity, t0 + Duration::from_secs(3));
    }

    #[test]
    fn test_non_positive_prices_ignored() {
        let mut s = state();
        let now = s.last_activity;
        s.observe(2.0, now);
        assert_eq!(s.observe(0.0, now), Tick::Unchanged);
        assert_eq!(s.observe(-1.0, now), Tick::Unchanged);
        assert_eq!(s.observe(f64::NAN, now), Tick::Unchanged);
        assert_eq!(s.last_price, 2.0);
        assert_eq!(s.low_price, 2.0);
    }

    #[test]
    fn test_peak_and_low_are_monotonic() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..50 {
            let mut s = state();
            s.record_buy(1.0);
            let mut now = s.last_activity;
            let mut price = 1.0f64;
            let (mut peak, mut low) = (0.0f64, f64::MAX);

            for _ in 0..500 {
                price = (price * rng.gen_range(0.8..1.25)).max(1e-12);
                now += Duration::from_millis(100);
                s.observe(price, now);

                assert!(s.peak_price >= peak);
                assert!(s.low_price <= low);
                assert!(s.low_price <= s.last_price && s.last_price <= s.peak_price);
                peak = s.peak_price;
                low = s.low_price;
            }
        }
    }

    #[test]
    fn test_open_price_is_set_once() {
        let mut s = state();
        s.set_open_price(0.0);
        assert_eq!(s.open_price, None);
        s.set_open_price(3.0);
        s.set_open_price(4.0);
        assert_eq!(s.open_price, Some(3.0));
    }

    #[test]
    fn test_buy_price_kept_from_first_buy() {
        let mut s = state();
        s.record_buy(2.0);
        assert!(s.is_holding());
        s.record_second_buy(5.0);
        assert_eq!(s.buy_price, 2.0);
        assert!(s.has_second_buy);
    }

    #[test]
    fn test_checkpoint_clamped_at_100() {
        let mut s = state();
        s.record_buy(1.0);
        assert!(!s.record_checkpoint(30.0));
        assert!(!s.record_checkpoint(30.0));
        assert!(!s.record_checkpoint(30.0));
        assert!(s.record_checkpoint(30.0));
        assert_eq!(s.cumulative_sold_pct, 100.0);
    }
}
