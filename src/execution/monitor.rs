/// Per-token position task: polls the latest quote, applies the policy, issues intents

use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use super::position::{PositionState, Tick};
use super::strategy::{evaluate, second_buy, Decision, ExitReason, SecondBuy, BUYS_NOTICE_FLOOR};
use super::trading::{ExecutionGateway, TradeOutcome};
use crate::config::Settings;
use crate::core::types::TokenId;
use crate::ingest::websocket::StopSignal;
use crate::transport::price_feed::PriceQuote;

/// Pause after arming the trailing stop before the next evaluation
pub const PEAK_CONFIRM_DELAY: Duration = Duration::from_secs(1);

/// How a position task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionOutcome {
    Sold { reason: ExitReason },
    Migrated,
    Stopped,
}

/// What a single evaluation step asks the task loop to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    PeakStopArmed,
    Finished(PositionOutcome),
}

/// Owns the state of exactly one token for the lifetime of its tracking
pub struct PositionTask {
    state: PositionState,
    settings: Settings,
    gateway: Arc<dyn ExecutionGateway>,
    quotes: watch::Receiver<Option<PriceQuote>>,
    poll_interval: Duration,
    buys_notice_logged: bool,
    sold_reason: Option<ExitReason>,
}

impl PositionTask {
    pub fn new(
        token: TokenId,
        settings: Settings,
        gateway: Arc<dyn ExecutionGateway>,
        quotes: watch::Receiver<Option<PriceQuote>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            state: PositionState::new(token, Instant::now()),
            settings,
            gateway,
            quotes,
            poll_interval,
            buys_notice_logged: false,
            sold_reason: None,
        }
    }

    pub fn state(&self) -> &PositionState {
        &self.state
    }

    fn token(&self) -> TokenId {
        self.state.token
    }

    /// Latest price on the feed, read again after an awaited trade.
    fn current_price(&self, fallback: f64) -> f64 {
        self.quotes
            .borrow()
            .as_ref()
            .map(|quote| quote.latest.price)
            .filter(|price| *price > 0.0)
            .unwrap_or(fallback)
    }

    /// Runs until the position is sold, the pool migrates or `stop` fires.
    #[instrument(skip_all, fields(token = %self.state.token))]
    pub async fn run(mut self, stop: StopSignal) -> Result<PositionOutcome> {
        if self.settings.verbose_prices() {
            info!("Starting position handler");
        }

        let opened = tokio::select! {
            _ = stop.stopped() => return Ok(PositionOutcome::Stopped),
            opened = self.quotes.wait_for(|quote| quote.as_ref().is_some_and(|q| q.open_price.is_some())) => opened.is_ok(),
        };
        if !opened {
            bail!("price feed closed before an open price arrived");
        }

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop.stopped() => return Ok(PositionOutcome::Stopped),
                _ = ticker.tick() => {}
            }

            let quote = match self.quotes.borrow_and_update().clone() {
                Some(quote) => quote,
                None => continue,
            };

            match self.step(&quote, Instant::now()).await? {
                Step::Continue => {}
                Step::PeakStopArmed => {
                    tokio::select! {
                        _ = stop.stopped() => return Ok(PositionOutcome::Stopped),
                        _ = sleep(PEAK_CONFIRM_DELAY) => {}
                    }
                }
                Step::Finished(outcome) => return Ok(outcome),
            }
        }
    }

    /// One evaluation of the latest quote.
    ///
    /// A buy that fails for any reason other than migration is returned as an
    /// error; a failed sell leaves the state untouched for the next tick.
    pub async fn step(&mut self, quote: &PriceQuote, now: Instant) -> Result<Step> {
        if let Some(reason) = self.sold_reason {
            return Ok(Step::Finished(PositionOutcome::Sold { reason }));
        }
        if quote.latest.pool_migrated {
            info!(token = %self.token(), "Pool reports migrated, ending tracking");
            return Ok(Step::Finished(PositionOutcome::Migrated));
        }
        if let Some(open) = quote.open_price {
            self.state.set_open_price(open);
        }

        let price = quote.latest.price;
        if !(price > 0.0) {
            return Ok(Step::Continue);
        }

        let tick = self.state.observe(price, now);
        self.log_tick(tick, price);

        if tick == Tick::Increased {
            if let Some(finished) = self.try_second_buy(price).await? {
                return Ok(finished);
            }
        }

        if !self.state.is_holding() {
            return self.try_first_buy(price).await;
        }

        self.apply(evaluate(&self.settings, &self.state, price, now)).await
    }

    fn log_tick(&self, tick: Tick, price: f64) {
        let verbose = self.settings.verbose_prices();
        let direction = match tick {
            Tick::Increased => "Price is increasing!",
            Tick::Decreased => "Price is decreasing!",
            Tick::Unchanged => return,
        };
        if verbose {
            info!(token = %self.token(), price = %format!("{:.10}", price), "{}", direction);
        } else {
            debug!(token = %self.token(), price, "{}", direction);
        }
    }

    async fn try_first_buy(&mut self, price: f64) -> Result<Step> {
        if self.settings.disable_first_buy {
            return Ok(Step::Continue);
        }

        let token = self.token();
        match self
            .gateway
            .buy(&token, self.settings.first_buy_amount, self.settings.fee_sol)
            .await?
        {
            TradeOutcome::Migrated => Ok(Step::Finished(PositionOutcome::Migrated)),
            TradeOutcome::Submitted(_) => {
                let bought_at = self.current_price(price);
                self.state.record_buy(bought_at);
                info!(token = %token, price = %format!("{:.10}", bought_at), "Bought at approx. price");
                Ok(Step::Continue)
            }
        }
    }

    async fn try_second_buy(&mut self, price: f64) -> Result<Option<Step>> {
        match second_buy(&self.settings, &self.state, price) {
            SecondBuy::NotDue => Ok(None),
            SecondBuy::NotEnoughBuys => {
                if self.settings.verbose_prices()
                    && !self.buys_notice_logged
                    && self.state.buy_count > BUYS_NOTICE_FLOOR
                {
                    self.buys_notice_logged = true;
                    info!(
                        token = %self.token(),
                        buys = self.state.buy_count,
                        threshold = self.settings.min_buys_threshold,
                        "Not enough buys to buy yet"
                    );
                }
                Ok(None)
            }
            SecondBuy::Due => {
                let token = self.token();
                info!(token = %token, buys = self.state.buy_count, "Buying due to min buys threshold");
                match self
                    .gateway
                    .buy(&token, self.settings.second_buy_amount, self.settings.fee_sol)
                    .await?
                {
                    TradeOutcome::Migrated => Ok(Some(Step::Finished(PositionOutcome::Migrated))),
                    TradeOutcome::Submitted(_) => {
                        let bought_at = self.current_price(price);
                        self.state.record_second_buy(bought_at);
                        Ok(None)
                    }
                }
            }
        }
    }

    fn finish_sold(&mut self, reason: ExitReason) -> Step {
        self.state.mark_sold();
        self.sold_reason = Some(reason);
        Step::Finished(PositionOutcome::Sold { reason })
    }

    async fn apply(&mut self, decision: Decision) -> Result<Step> {
        let token = self.token();
        match decision {
            Decision::Hold => {
                self.state.peak_stop_armed = false;
                Ok(Step::Continue)
            }
            Decision::ArmPeakStop => {
                self.state.peak_stop_armed = true;
                info!(token = %token, peak = self.state.peak_price, "Trailing stop breached, waiting for confirmation");
                Ok(Step::PeakStopArmed)
            }
            Decision::MarkSold => {
                info!(token = %token, sold_pct = self.state.cumulative_sold_pct, "Already sold everything");
                Ok(self.finish_sold(ExitReason::TargetProfit))
            }
            Decision::Sell { percentage, reason } => {
                match self.gateway.sell(&token, percentage, self.settings.fee_sol).await {
                    Ok(TradeOutcome::Migrated) => {
                        info!(token = %token, "Pool is migrated, skipping sell");
                        Ok(Step::Finished(PositionOutcome::Migrated))
                    }
                    Ok(TradeOutcome::Submitted(_)) => {
                        let finished = if reason == ExitReason::TargetProfit {
                            self.state.record_checkpoint(percentage)
                        } else {
                            true
                        };
                        info!(
                            token = %token,
                            reason = %reason,
                            percentage,
                            sold_pct = self.state.cumulative_sold_pct,
                            "Sold due to {}",
                            reason
                        );
                        if finished {
                            Ok(self.finish_sold(reason))
                        } else {
                            Ok(Step::Continue)
                        }
                    }
                    Err(e) => {
                        warn!(token = %token, reason = %reason, error = %e, "Sell failed, retrying next tick");
                        Ok(Step::Continue)
                    }
                }
            }
        }
    }
}
