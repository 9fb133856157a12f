/// One position task per discovered token, and the ledger of how each ended

use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

use super::monitor::{PositionOutcome, PositionTask};
use super::trading::ExecutionGateway;
use crate::config::Settings;
use crate::core::types::{Pool, PriceSample, TokenId};
use crate::ingest::rpc::{resolve_pool, ChainLookup};
use crate::ingest::websocket::{AccountSubscriptions, StopSignal, SubscribeOutcome};
use crate::transport::price_feed::PriceFeed;

/// Why a discovered token was not admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    AlreadyTracked,
    Sold,
    Migrated,
    Retired,
}

/// How a position task ended, with the pool it traded against
#[derive(Debug, Clone, PartialEq)]
pub struct Closed {
    pub pool: Pool,
    pub outcome: PositionOutcome,
}

/// Terminal bookkeeping across all tokens seen by this process
#[derive(Debug, Default, Clone)]
pub struct Ledger {
    sold: HashSet<TokenId>,
    /// Pools reported migrated, kept with their flag set
    migrated: HashMap<TokenId, Pool>,
    /// Tokens whose task failed; never restarted
    retired: HashSet<TokenId>,
}

impl Ledger {
    pub fn rejection(&self, token: &TokenId) -> Option<Rejection> {
        if self.sold.contains(token) {
            Some(Rejection::Sold)
        } else if self.migrated.contains_key(token) {
            Some(Rejection::Migrated)
        } else if self.retired.contains(token) {
            Some(Rejection::Retired)
        } else {
            None
        }
    }

    pub fn record(&mut self, token: TokenId, result: &Result<Closed>) {
        match result {
            Ok(Closed {
                outcome: PositionOutcome::Sold { .. },
                ..
            }) => {
                self.sold.insert(token);
            }
            Ok(Closed {
                pool,
                outcome: PositionOutcome::Migrated,
            }) => {
                self.migrated.insert(token, pool.clone());
            }
            Ok(Closed {
                outcome: PositionOutcome::Stopped,
                ..
            }) => {}
            Err(_) => {
                self.retired.insert(token);
            }
        }
    }

    pub fn is_sold(&self, token: &TokenId) -> bool {
        self.sold.contains(token)
    }

    pub fn is_migrated(&self, token: &TokenId) -> bool {
        self.migrated.contains_key(token)
    }

    pub fn migrated_pool(&self, token: &TokenId) -> Option<&Pool> {
        self.migrated.get(token)
    }

    pub fn is_retired(&self, token: &TokenId) -> bool {
        self.retired.contains(token)
    }
}

/// Everything a position task needs, cloned into each spawned task
#[derive(Clone)]
pub struct TaskContext {
    pub settings: Settings,
    pub poll_interval: Duration,
    pub lookup: Arc<dyn ChainLookup>,
    pub gateway: Arc<dyn ExecutionGateway>,
    pub subscriptions: AccountSubscriptions,
    pub feed: PriceFeed,
    pub samples: mpsc::Sender<PriceSample>,
}

pub struct PositionSupervisor {
    ctx: TaskContext,
    ledger: Ledger,
    tracked: HashSet<TokenId>,
    tasks: JoinSet<(TokenId, Result<Closed>)>,
}

impl PositionSupervisor {
    pub fn new(ctx: TaskContext) -> Self {
        Self {
            ctx,
            ledger: Ledger::default(),
            tracked: HashSet::new(),
            tasks: JoinSet::new(),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Spawns a task for `token` unless it is tracked or already finished.
    pub fn admit(&mut self, token: TokenId, stop: &StopSignal) -> Result<(), Rejection> {
        if self.tracked.contains(&token) {
            return Err(Rejection::AlreadyTracked);
        }
        if let Some(rejection) = self.ledger.rejection(&token) {
            return Err(rejection);
        }

        self.tracked.insert(token);
        let ctx = self.ctx.clone();
        let child = stop.child();
        self.tasks.spawn(async move {
            let result = match tokio::spawn(track_token(ctx, token, child)).await {
                Ok(result) => result,
                Err(e) => Err(anyhow!("position task panicked: {}", e)),
            };
            (token, result)
        });
        Ok(())
    }

    fn finish(&mut self, token: TokenId, result: Result<Closed>) {
        self.tracked.remove(&token);
        match &result {
            Ok(closed) => match &closed.outcome {
                PositionOutcome::Sold { reason } => info!(token = %token, reason = %reason, "Position closed"),
                PositionOutcome::Migrated => {
                    info!(token = %token, pool = %closed.pool.address, "Pool migrated, tracking ended")
                }
                PositionOutcome::Stopped => info!(token = %token, "Position task stopped"),
            },
            Err(e) => error!(token = %token, error = ?e, "Position task failed, not restarting"),
        }
        self.ledger.record(token, &result);
    }

    /// Admits discovered tokens and collects task outcomes until `stop`
    /// fires or discovery ends, then waits for running tasks to wind down.
    #[instrument(skip_all)]
    pub async fn run(mut self, mut discovered: mpsc::Receiver<TokenId>, stop: StopSignal) -> Ledger {
        info!("Position supervisor started");
        loop {
            tokio::select! {
                _ = stop.stopped() => break,
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => match joined {
                    Ok((token, result)) => self.finish(token, result),
                    Err(e) => error!(error = %e, "Supervisor lost a position task"),
                },
                next = discovered.recv() => match next {
                    Some(token) => {
                        if let Err(rejection) = self.admit(token, &stop) {
                            warn!(token = %token, ?rejection, "Ignoring discovered token");
                        }
                    }
                    None => break,
                },
            }
        }

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((token, result)) => self.finish(token, result),
                Err(e) => error!(error = %e, "Supervisor lost a position task"),
            }
        }
        info!("Position supervisor stopped");
        self.ledger
    }
}

/// Resolves the pool, opens its price stream and drives the position to completion.
async fn track_token(ctx: TaskContext, token: TokenId, stop: StopSignal) -> Result<Closed> {
    let result = drive(&ctx, token, &stop).await;
    stop.stop();
    ctx.feed.remove(&token);
    result
}

async fn drive(ctx: &TaskContext, token: TokenId, stop: &StopSignal) -> Result<Closed> {
    let mut pool = resolve_pool(ctx.lookup.as_ref(), &token).await?;
    if stop.is_stopped() {
        return Ok(Closed {
            pool,
            outcome: PositionOutcome::Stopped,
        });
    }
    info!(token = %token, pool = %pool.address, base_decimals = pool.base_decimals, "Pool resolved");

    let quotes = ctx.feed.subscribe(token);
    if ctx.subscriptions.subscribe(&pool, stop.clone(), ctx.samples.clone()) == SubscribeOutcome::AlreadySubscribed {
        warn!(token = %token, "Reusing existing price subscription");
    }

    let outcome = PositionTask::new(
        token,
        ctx.settings.clone(),
        Arc::clone(&ctx.gateway),
        quotes,
        ctx.poll_interval,
    )
    .run(stop.clone())
    .await?;

    if outcome == PositionOutcome::Migrated {
        pool.mark_migrated();
    }
    Ok(Closed { pool, outcome })
}
