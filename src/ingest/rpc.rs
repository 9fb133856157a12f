/// Request/response chain lookups: transactions, pools, mint decimals

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use solana_account_decoder::{UiAccountEncoding, UiDataSliceConfig};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::{RpcAccountInfoConfig, RpcProgramAccountsConfig};
use solana_client::rpc_filter::{Memcmp, RpcFilterType};
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use spl_token::solana_program::program_pack::Pack;
use spl_token::state::Mint;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::constants::{DBC_PROGRAM, POOL_BASE_MINT_OFFSET, WSOL_DECIMALS, WSOL_MINT};
use crate::core::types::{Pool, TokenBalance, TokenId};

/// `meta` section of a confirmed transaction
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMeta {
    #[serde(default)]
    pub err: Option<Value>,
    #[serde(default)]
    pub post_token_balances: Vec<TokenBalance>,
}

impl TransactionMeta {
    pub fn succeeded(&self) -> bool {
        matches!(&self.err, None | Some(Value::Null))
    }
}

/// Outcome of waiting for a submitted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    Failed,
    /// Attempts exhausted without a definite answer
    Unknown,
}

/// Chain lookups used by discovery, pool resolution and confirmation polling
#[async_trait]
pub trait ChainLookup: Send + Sync {
    /// `Ok(None)` when the node does not (yet) know the transaction.
    async fn transaction_meta(&self, signature: &str) -> Result<Option<TransactionMeta>>;

    /// Address of the bonding-curve pool whose base mint is `token`.
    async fn find_pool(&self, token: &TokenId) -> Result<Pubkey>;

    async fn mint_decimals(&self, mint: &Pubkey) -> Result<u8>;
}

/// Resolves the pool and both decimal counts for a freshly discovered token.
pub async fn resolve_pool(lookup: &dyn ChainLookup, token: &TokenId) -> Result<Pool> {
    let address = lookup
        .find_pool(token)
        .await
        .with_context(|| format!("no pool found for {}", token))?;
    let base_decimals = lookup
        .mint_decimals(token.pubkey())
        .await
        .with_context(|| format!("failed to read decimals of {}", token))?;
    let quote_mint = Pubkey::from_str(WSOL_MINT)?;
    let quote_decimals = lookup.mint_decimals(&quote_mint).await?;
    Ok(Pool::new(*token, address, base_decimals, quote_decimals))
}

/// Polls a signature until it lands, fails, or `attempts` run out.
pub async fn await_confirmation(
    lookup: &dyn ChainLookup,
    signature: &str,
    attempts: u32,
    delay: Duration,
) -> Confirmation {
    for attempt in 1..=attempts {
        match lookup.transaction_meta(signature).await {
            Ok(Some(meta)) if meta.succeeded() => return Confirmation::Confirmed,
            Ok(Some(meta)) => {
                debug!(signature, err = ?meta.err, "Transaction failed on chain");
                return Confirmation::Failed;
            }
            Ok(None) => debug!(signature, attempt, "Transaction not visible yet"),
            Err(e) => debug!(signature, attempt, error = %e, "Confirmation lookup failed"),
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    info!(signature, attempts, "Max attempts reached, confirmation unknown");
    Confirmation::Unknown
}

/// JSON-RPC backed implementation of [`ChainLookup`]
pub struct RpcLookup {
    http: Client,
    rpc_url: String,
    rpc: Arc<RpcClient>,
    dbc_program: Pubkey,
    decimals: DashMap<Pubkey, u8>,
}

impl RpcLookup {
    pub fn new(rpc_url: impl Into<String>) -> Result<Self> {
        let rpc_url = rpc_url.into();
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        let rpc = Arc::new(RpcClient::new_with_commitment(
            rpc_url.clone(),
            CommitmentConfig::confirmed(),
        ));
        let dbc_program = Pubkey::from_str(DBC_PROGRAM)?;
        let decimals = DashMap::new();
        decimals.insert(Pubkey::from_str(WSOL_MINT)?, WSOL_DECIMALS);

        Ok(Self {
            http,
            rpc_url,
            rpc,
            dbc_program,
            decimals,
        })
    }

    pub fn rpc_client(&self) -> Arc<RpcClient> {
        Arc::clone(&self.rpc)
    }
}

#[async_trait]
impl ChainLookup for RpcLookup {
    async fn transaction_meta(&self, signature: &str) -> Result<Option<TransactionMeta>> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getTransaction",
            "params": [
                signature,
                {"commitment": "confirmed", "encoding": "json", "maxSupportedTransactionVersion": 0}
            ]
        });

        let response = self
            .http
            .post(&self.rpc_url)
            .json(&payload)
            .send()
            .await
            .context("getTransaction request failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("HTTP error {}: {}", status, body);
        }

        let body: Value = response.json().await.context("getTransaction returned invalid JSON")?;
        if let Some(error) = body.get("error") {
            bail!("getTransaction error: {}", error);
        }
        match body.pointer("/result/meta") {
            Some(meta) if !meta.is_null() => Ok(Some(
                serde_json::from_value(meta.clone()).context("unexpected transaction meta shape")?,
            )),
            _ => Ok(None),
        }
    }

    async fn find_pool(&self, token: &TokenId) -> Result<Pubkey> {
        let config = RpcProgramAccountsConfig {
            filters: Some(vec![RpcFilterType::Memcmp(Memcmp::new_base58_encoded(
                POOL_BASE_MINT_OFFSET,
                &token.to_bytes(),
            ))]),
            account_config: RpcAccountInfoConfig {
                encoding: Some(UiAccountEncoding::Base64),
                data_slice: Some(UiDataSliceConfig {
                    offset: 0,
                    length: POOL_BASE_MINT_OFFSET + 32,
                }),
                commitment: Some(CommitmentConfig::confirmed()),
                min_context_slot: None,
            },
            with_context: None,
        };

        let accounts = self
            .rpc
            .get_program_accounts_with_config(&self.dbc_program, config)
            .await
            .context("getProgramAccounts failed")?;
        if accounts.len() > 1 {
            warn!(token = %token, count = accounts.len(), "Multiple pools found, using the first");
        }
        accounts
            .into_iter()
            .next()
            .map(|(address, _)| address)
            .ok_or_else(|| anyhow!("no pools found"))
    }

    async fn mint_decimals(&self, mint: &Pubkey) -> Result<u8> {
        if let Some(cached) = self.decimals.get(mint) {
            return Ok(*cached);
        }

        let data = self
            .rpc
            .get_account_data(mint)
            .await
            .with_context(|| format!("failed to fetch mint account {}", mint))?;
        if data.len() < Mint::LEN {
            bail!("account {} is not a mint ({} bytes)", mint, data.len());
        }
        let state = Mint::unpack(&data[..Mint::LEN]).map_err(|e| anyhow!("invalid mint {}: {}", mint, e))?;

        self.decimals.insert(*mint, state.decimals);
        Ok(state.decimals)
    }
}
