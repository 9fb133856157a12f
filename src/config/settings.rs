/// Trading policy thresholds, fixed for the lifetime of the process

use serde::{Deserialize, Serialize};

use super::{parse_bool, parse_var, ConfigError};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    /// Sell a checkpoint once price exceeds `buy_price * target_profit`
    pub target_profit: f64,
    /// Full exit once price falls to `buy_price * max_loss`
    pub max_loss: f64,
    /// Percent of the balance sold per profit checkpoint
    pub checkpoint_sell_pct: f64,
    /// Full exit after this many seconds without a price change
    pub no_activity_seconds: u64,
    /// Trailing stop distance from the peak, as a fraction
    pub max_loss_from_peak: f64,
    /// Buy ticks required before the second buy may fire
    pub min_buys_threshold: u32,
    /// SOL spent on the first buy
    pub first_buy_amount: f64,
    /// SOL spent on the second buy
    pub second_buy_amount: f64,
    /// Priority fee in SOL attached to every trade
    pub fee_sol: f64,
    pub disable_first_buy: bool,
    /// 0 = quiet, 1 or 2 = log every price tick
    pub debug_sensitivity: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target_profit: 4.0,
            max_loss: 0.9,
            checkpoint_sell_pct: 50.0,
            no_activity_seconds: 10,
            max_loss_from_peak: 0.1,
            min_buys_threshold: 15,
            first_buy_amount: 0.00001,
            second_buy_amount: 0.00001,
            fee_sol: 0.00001,
            disable_first_buy: false,
            debug_sensitivity: 1,
        }
    }
}

impl Settings {
    /// Builds settings from a variable lookup, falling back to defaults for absent keys.
    pub fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let settings = Self {
            target_profit: parse_var(lookup, "TARGET_PROFIT")?.unwrap_or(defaults.target_profit),
            max_loss: parse_var(lookup, "MAX_LOSS")?.unwrap_or(defaults.max_loss),
            checkpoint_sell_pct: parse_var(lookup, "CHECKPOINT_BALANCE_PERCENTAGE")?
                .unwrap_or(defaults.checkpoint_sell_pct),
            no_activity_seconds: parse_var(lookup, "NO_ACTIVITY_IN_SECONDS")?
                .unwrap_or(defaults.no_activity_seconds),
            max_loss_from_peak: parse_var(lookup, "MAX_LOSS_FROM_PEAK_PERCENTAGE")?
                .unwrap_or(defaults.max_loss_from_peak),
            min_buys_threshold: parse_var(lookup, "MIN_BUYS_THRESHOLD")?
                .unwrap_or(defaults.min_buys_threshold),
            first_buy_amount: parse_var(lookup, "FIRST_BUY_AMOUNT")?
                .unwrap_or(defaults.first_buy_amount),
            second_buy_amount: parse_var(lookup, "NEXT_BUY_AMOUNT")?
                .unwrap_or(defaults.second_buy_amount),
            fee_sol: parse_var(lookup, "GAS")?.unwrap_or(defaults.fee_sol),
            disable_first_buy: parse_bool(lookup, "DISABLE_FIRST_BUY")?
                .unwrap_or(defaults.disable_first_buy),
            debug_sensitivity: parse_var(lookup, "DEBUG_SENSITIVITY")?
                .unwrap_or(defaults.debug_sensitivity),
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.checkpoint_sell_pct > 0.0 && self.checkpoint_sell_pct <= 100.0) {
            return Err(ConfigError::invalid(
                "CHECKPOINT_BALANCE_PERCENTAGE",
                "must be in (0, 100]",
            ));
        }
        if !(0.0..1.0).contains(&self.max_loss_from_peak) {
            return Err(ConfigError::invalid("MAX_LOSS_FROM_PEAK_PERCENTAGE", "must be in [0, 1)"));
        }
        if !(0.0..=1.0).contains(&self.max_loss) {
            return Err(ConfigError::invalid("MAX_LOSS", "must be in [0, 1]"));
        }
        positive("TARGET_PROFIT", self.target_profit)?;
        positive("FIRST_BUY_AMOUNT", self.first_buy_amount)?;
        positive("NEXT_BUY_AMOUNT", self.second_buy_amount)?;
        if !(self.fee_sol.is_finite() && self.fee_sol >= 0.0) {
            return Err(ConfigError::invalid("GAS", "must be a finite, non-negative amount"));
        }
        Ok(())
    }

    /// Price ticks and trend changes are logged at info level.
    pub fn verbose_prices(&self) -> bool {
        matches!(self.debug_sensitivity, 1 | 2)
    }
}

fn positive(key: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(key, format!("{} is not a finite positive number", value)))
    }
}
