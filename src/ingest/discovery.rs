/// Listing detection: log batches in, newly created token ids out

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::rpc::ChainLookup;
use super::websocket::StopSignal;
use crate::core::constants::{INITIALIZE_MINT_MARKER, VAULT_EXECUTE_MARKER, WSOL_MINT};
use crate::core::types::{LogEvent, TokenBalance, TokenId};

/// A log batch is a listing only when both markers appear in it.
pub fn is_listing(logs: &[String]) -> bool {
    let mut vault_execute = false;
    let mut initialize_mint = false;
    for line in logs {
        if line.contains(VAULT_EXECUTE_MARKER) {
            vault_execute = true;
        } else if line.contains(INITIALIZE_MINT_MARKER) {
            initialize_mint = true;
        }
    }
    vault_execute && initialize_mint
}

/// First post-balance mint that is not wrapped SOL.
pub fn first_non_native_mint(balances: &[TokenBalance]) -> Option<TokenId> {
    balances
        .iter()
        .filter(|balance| balance.mint != WSOL_MINT)
        .find_map(|balance| match balance.mint.parse::<TokenId>() {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(mint = %balance.mint, error = %e, "Skipping unparseable mint in balances");
                None
            }
        })
}

pub struct MintDiscovery {
    lookup: Arc<dyn ChainLookup>,
}

impl MintDiscovery {
    pub fn new(lookup: Arc<dyn ChainLookup>) -> Self {
        Self { lookup }
    }

    /// Classifies one log event and resolves the new token if it is a listing.
    pub async fn classify(&self, event: &LogEvent) -> Option<TokenId> {
        if event.failed() || !is_listing(&event.logs) {
            return None;
        }

        let meta = match self.lookup.transaction_meta(&event.signature).await {
            Ok(Some(meta)) => meta,
            Ok(None) => {
                warn!(signature = %event.signature, "Listing transaction not found");
                return None;
            }
            Err(e) => {
                warn!(signature = %event.signature, error = %e, "Listing transaction lookup failed");
                return None;
            }
        };

        let token = first_non_native_mint(&meta.post_token_balances);
        if token.is_none() {
            debug!(signature = %event.signature, "Listing without a non-native balance");
        }
        token
    }

    /// Consumes log events until the stream ends or `stop` fires.
    #[instrument(skip_all)]
    pub async fn run(
        self,
        mut events: mpsc::Receiver<LogEvent>,
        discovered: mpsc::Sender<TokenId>,
        stop: StopSignal,
    ) {
        info!("Mint discovery started");
        loop {
            let event = tokio::select! {
                _ = stop.stopped() => break,
                next = events.recv() => match next {
                    Some(event) => event,
                    None => break,
                },
            };

            if let Some(token) = self.classify(&event).await {
                info!(token = %token, signature = %event.signature, "Mint detected!");
                if discovered.send(token).await.is_err() {
                    break;
                }
            }
        }
        info!("Mint discovery stopped");
    }
}
