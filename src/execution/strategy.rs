/// Exit and re-entry policy, evaluated on every position tick

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use super::position::PositionState;
use crate::config::Settings;

/// Share of `target_profit` the price must rise above open before a second buy
const SECOND_BUY_STEP: f64 = 0.05;

/// Buy ticks after which the "not enough buys yet" notice is worth logging
pub const BUYS_NOTICE_FLOOR: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    PeakStop,
    TargetProfit,
    MaxLoss,
    NoActivity,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::PeakStop => "peak stop",
            ExitReason::TargetProfit => "target profit",
            ExitReason::MaxLoss => "max loss",
            ExitReason::NoActivity => "no activity",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Hold,
    /// First trailing-stop breach: remember it, sell nothing yet
    ArmPeakStop,
    Sell { percentage: f64, reason: ExitReason },
    /// Profit target hit with nothing left to sell
    MarkSold,
}

/// Evaluates the exit rules in priority order; the first match wins.
pub fn evaluate(settings: &Settings, state: &PositionState, price: f64, now: Instant) -> Decision {
    if !state.is_holding() || !(price > 0.0) {
        return Decision::Hold;
    }

    if price <= state.peak_price * (1.0 - settings.max_loss_from_peak) {
        return if state.peak_stop_armed {
            Decision::Sell {
                percentage: 100.0,
                reason: ExitReason::PeakStop,
            }
        } else {
            Decision::ArmPeakStop
        };
    }

    if price > state.buy_price * settings.target_profit {
        return if state.cumulative_sold_pct < 100.0 {
            Decision::Sell {
                percentage: settings.checkpoint_sell_pct,
                reason: ExitReason::TargetProfit,
            }
        } else {
            Decision::MarkSold
        };
    }

    if price <= state.buy_price * settings.max_loss {
        return Decision::Sell {
            percentage: 100.0,
            reason: ExitReason::MaxLoss,
        };
    }

    let idle = now.saturating_duration_since(state.last_activity);
    if idle >= Duration::from_secs(settings.no_activity_seconds) {
        return Decision::Sell {
            percentage: 100.0,
            reason: ExitReason::NoActivity,
        };
    }

    Decision::Hold
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondBuy {
    Due,
    /// Price qualifies but too few buy ticks so far
    NotEnoughBuys,
    NotDue,
}

/// Re-entry check, run on increasing ticks only.
pub fn second_buy(settings: &Settings, state: &PositionState, price: f64) -> SecondBuy {
    if state.has_second_buy || state.is_sold() {
        return SecondBuy::NotDue;
    }
    let Some(open) = state.open_price else {
        return SecondBuy::NotDue;
    };

    if price > open * (1.0 + settings.target_profit * SECOND_BUY_STEP) {
        if state.buy_count > settings.min_buys_threshold {
            SecondBuy::Due
        } else {
            SecondBuy::NotEnoughBuys
        }
    } else {
        SecondBuy::NotDue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TokenId;
    use crate::execution::position::Phase;

    fn holding(buy_price: f64, peak: f64) -> PositionState {
        let mut state = PositionState::new(TokenId::from_bytes([1u8; 32]), Instant::now());
        state.record_buy(buy_price);
        state.peak_price = peak;
        state.low_price = buy_price;
        state.last_price = buy_price;
        state
    }

    #[test]
    fn test_watching_never_sells() {
        let settings = Settings::default();
        let state = PositionState::new(TokenId::from_bytes([1u8; 32]), Instant::now());
        let later = state.last_activity + Duration::from_secs(3600);
        assert_eq!(evaluate(&settings, &state, 0.01, later), Decision::Hold);
    }

    #[test]
    fn test_peak_stop_arms_before_selling() {
        let settings = Settings::default();
        let mut state = holding(5.0, 10.0);
        let now = state.last_activity;

        assert_eq!(evaluate(&settings, &state, 9.0, now), Decision::ArmPeakStop);
        state.peak_stop_armed = true;
        let decision = evaluate(&settings, &state, 8.9, now);
        assert_eq!(
            decision,
            Decision::Sell {
                percentage: 100.0,
                reason: ExitReason::PeakStop
            }
        );
    }

    #[test]
    fn test_peak_stop_takes_priority_over_max_loss() {
        let settings = Settings::default();
        let state = holding(1.0, 2.0);
        assert_eq!(evaluate(&settings, &state, 0.5, state.last_activity), Decision::ArmPeakStop);
    }

    #[test]
    fn test_target_profit_checkpoint() {
        let settings = Settings::default();
        let mut state = holding(1.0, 4.5);
        let now = state.last_activity;
        assert_eq!(
            evaluate(&settings, &state, 4.5, now),
            Decision::Sell {
                percentage: 50.0,
                reason: ExitReason::TargetProfit
            }
        );

        state.cumulative_sold_pct = 100.0;
        assert_eq!(evaluate(&settings, &state, 4.5, now), Decision::MarkSold);
    }

    #[test]
    fn test_max_loss_independent_of_peak() {
        let settings = Settings {
            max_loss_from_peak: 0.2,
            ..Settings::default()
        };
        let state = holding(1.0, 1.0);
        assert_eq!(
            evaluate(&settings, &state, 0.85, state.last_activity),
            Decision::Sell {
                percentage: 100.0,
                reason: ExitReason::MaxLoss
            }
        );
    }

    #[test]
    fn test_inactivity_boundary() {
        let settings = Settings::default();
        let state = holding(1.0, 1.0);
        let t0 = state.last_activity;
        assert_eq!(evaluate(&settings, &state, 1.0, t0 + Duration::from_millis(9_999)), Decision::Hold);
        assert_eq!(
            evaluate(&settings, &state, 1.0, t0 + Duration::from_secs(10)),
            Decision::Sell {
                percentage: 100.0,
                reason: ExitReason::NoActivity
            }
        );
    }

    #[test]
    fn test_reason_strings() {
        assert_eq!(ExitReason::PeakStop.to_string(), "peak stop");
        assert_eq!(ExitReason::TargetProfit.to_string(), "target profit");
        assert_eq!(ExitReason::MaxLoss.to_string(), "max loss");
        assert_eq!(ExitReason::NoActivity.to_string(), "no activity");
    }

    #[test]
    fn test_second_buy_gates() {
        let settings = Settings::default();
        let mut state = PositionState::new(TokenId::from_bytes([1u8; 32]), Instant::now());
        assert_eq!(second_buy(&settings, &state, 10.0), SecondBuy::NotDue);

        // threshold = open * (1 + 4.0 * 0.05) = 1.2
        state.set_open_price(1.0);
        state.buy_count = 16;
        assert_eq!(second_buy(&settings, &state, 1.2), SecondBuy::NotDue);
        assert_eq!(second_buy(&settings, &state, 1.21), SecondBuy::Due);

        state.buy_count = 15;
        assert_eq!(second_buy(&settings, &state, 1.21), SecondBuy::NotEnoughBuys);

        state.buy_count = 16;
        state.has_second_buy = true;
        assert_eq!(second_buy(&settings, &state, 5.0), SecondBuy::NotDue);

        state.has_second_buy = false;
        state.phase = Phase::Sold;
        assert_eq!(second_buy(&settings, &state, 5.0), SecondBuy::NotDue);
    }
}
