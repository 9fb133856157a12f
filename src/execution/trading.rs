/// Trade execution through the PumpPortal local-transaction API

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSendTransactionConfig;
use solana_sdk::signature::{Keypair, Signer};
use solana_sdk::transaction::VersionedTransaction;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::TradeApiConfig;
use crate::core::constants::SOLSCAN_TX;
use crate::core::types::TokenId;

/// Result of a trade request that did not fail outright
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradeOutcome {
    /// Transaction submitted; carries its signature
    Submitted(String),
    /// Pool graduated off the bonding curve, nothing can be traded here anymore
    Migrated,
}

#[derive(Debug, Error)]
pub enum TradeError {
    #[error("trade API request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("trade API rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid transaction from trade API: {0}")]
    Transaction(String),
    #[error("failed to submit transaction: {0}")]
    Rpc(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeAction {
    Buy,
    Sell,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "buy",
            TradeAction::Sell => "sell",
        }
    }
}

/// Buy/sell intents from position tasks and the sell command
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    async fn buy(&self, token: &TokenId, sol_amount: f64, fee_sol: f64) -> Result<TradeOutcome, TradeError>;

    /// Sells `percentage` of the wallet's current balance of `token`.
    async fn sell(&self, token: &TokenId, percentage: f64, fee_sol: f64) -> Result<TradeOutcome, TradeError>;
}

/// Error text from the API or the node that means the pool is gone.
pub fn is_migrated_message(text: &str) -> bool {
    text.to_ascii_lowercase().contains("migrated")
}

pub struct TradeApiGateway {
    client: Client,
    config: TradeApiConfig,
    keypair: Arc<Keypair>,
    rpc: Arc<RpcClient>,
    max_retry_attempts: u32,
}

impl TradeApiGateway {
    pub fn new(config: TradeApiConfig, keypair: Arc<Keypair>, rpc: Arc<RpcClient>) -> Result<Self, TradeError> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            client,
            config,
            keypair,
            rpc,
            max_retry_attempts: 3,
        })
    }

    /// Request body for the trade API.
    pub fn trade_request(&self, action: TradeAction, token: &TokenId, amount: Value, fee_sol: f64) -> Value {
        json!({
            "publicKey": self.keypair.pubkey().to_string(),
            "action": action.as_str(),
            "mint": token.to_string(),
            "amount": amount,
            "denominatedInSol": if action == TradeAction::Buy { "true" } else { "false" },
            "slippage": self.config.slippage_percent,
            "priorityFee": fee_sol,
            "pool": self.config.pool,
        })
    }

    async fn execute(&self, action: TradeAction, token: &TokenId, amount: Value, fee_sol: f64) -> Result<TradeOutcome, TradeError> {
        let payload = self.trade_request(action, token, amount, fee_sol);

        for attempt in 1..=self.max_retry_attempts {
            let response = self.client.post(&self.config.url).json(&payload).send().await?;
            let status = response.status();

            if status.is_success() {
                let bytes = response.bytes().await?;
                return self.sign_and_send(&bytes).await;
            }

            let body = response.text().await.unwrap_or_default();
            if is_migrated_message(&body) {
                info!(token = %token, action = action.as_str(), "Pool is migrated, skipping trade");
                return Ok(TradeOutcome::Migrated);
            }
            if attempt < self.max_retry_attempts {
                warn!(token = %token, attempt, status = status.as_u16(), body = %body, "Trade attempt failed, retrying");
                tokio::time::sleep(Duration::from_millis(1000)).await;
            } else {
                return Err(TradeError::Rejected {
                    status: status.as_u16(),
                    body,
                });
            }
        }

        Err(TradeError::Rejected {
            status: 0,
            body: "max retries exceeded".to_string(),
        })
    }

    async fn sign_and_send(&self, bytes: &[u8]) -> Result<TradeOutcome, TradeError> {
        let unsigned: VersionedTransaction =
            bincode::deserialize(bytes).map_err(|e| TradeError::Transaction(e.to_string()))?;
        let signed = VersionedTransaction::try_new(unsigned.message, &[self.keypair.as_ref()])
            .map_err(|e| TradeError::Transaction(e.to_string()))?;

        let config = RpcSendTransactionConfig {
            skip_preflight: false,
            preflight_commitment: None,
            encoding: None,
            max_retries: Some(3),
            min_context_slot: None,
        };

        match self.rpc.send_transaction_with_config(&signed, config).await {
            Ok(signature) => Ok(TradeOutcome::Submitted(signature.to_string())),
            Err(e) if is_migrated_message(&e.to_string()) => Ok(TradeOutcome::Migrated),
            Err(e) => Err(TradeError::Rpc(e.to_string())),
        }
    }
}

#[async_trait]
impl ExecutionGateway for TradeApiGateway {
    async fn buy(&self, token: &TokenId, sol_amount: f64, fee_sol: f64) -> Result<TradeOutcome, TradeError> {
        let outcome = self.execute(TradeAction::Buy, token, json!(sol_amount), fee_sol).await?;
        if let TradeOutcome::Submitted(signature) = &outcome {
            info!(token = %token, sol = sol_amount, "Buy transaction sent: {}/{}", SOLSCAN_TX, signature);
        }
        Ok(outcome)
    }

    async fn sell(&self, token: &TokenId, percentage: f64, fee_sol: f64) -> Result<TradeOutcome, TradeError> {
        let amount = json!(format!("{}%", percentage));
        let outcome = self.execute(TradeAction::Sell, token, amount, fee_sol).await?;
        if let TradeOutcome::Submitted(signature) = &outcome {
            info!(token = %token, percentage, "Sell transaction sent: {}/{}", SOLSCAN_TX, signature);
        }
        Ok(outcome)
    }
}
