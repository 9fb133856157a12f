use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a token identifier fails validation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenIdError {
    #[error("token identifier is empty")]
    Empty,
    #[error("invalid token identifier {0:?}: not a 32-byte base58 address")]
    Invalid(String),
}

/// Mint address of a fungible token, the identity key for all per-token state.
///
/// Constructed once at the boundary (log notifications, CLI arguments,
/// RPC responses) through [`FromStr`]; everything past that point works with
/// the typed value only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId(Pubkey);

impl TokenId {
    pub fn new(pubkey: Pubkey) -> Self {
        Self(pubkey)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Pubkey::new_from_array(bytes))
    }

    pub fn pubkey(&self) -> &Pubkey {
        &self.0
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }
}

impl FromStr for TokenId {
    type Err = TokenIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(TokenIdError::Empty);
        }
        Pubkey::from_str(trimmed)
            .map(Self)
            .map_err(|_| TokenIdError::Invalid(trimmed.to_string()))
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Pubkey> for TokenId {
    fn from(pubkey: Pubkey) -> Self {
        Self(pubkey)
    }
}

impl Serialize for TokenId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TokenId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Bonding-curve pool backing a discovered token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub token: TokenId,
    pub address: Pubkey,
    pub base_decimals: u8,
    pub quote_decimals: u8,
    pub migrated: bool,
}

impl Pool {
    pub fn new(token: TokenId, address: Pubkey, base_decimals: u8, quote_decimals: u8) -> Self {
        Self {
            token,
            address,
            base_decimals,
            quote_decimals,
            migrated: false,
        }
    }

    /// Flips the pool to migrated; a migrated pool never flips back.
    pub fn mark_migrated(&mut self) {
        self.migrated = true;
    }
}

/// One decoded price observation for a token's pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSample {
    pub token: TokenId,
    pub price: f64,
    pub raw_sqrt_price: u128,
    /// Pool reported itself as migrated off the bonding curve
    pub pool_migrated: bool,
    pub timestamp: DateTime<Utc>,
}

/// Post-execution token balance entry of a transaction
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalance {
    pub mint: String,
    #[serde(default)]
    pub owner: Option<String>,
    pub ui_token_amount: UiTokenAmount,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiTokenAmount {
    pub amount: String,
    pub decimals: u8,
}

/// Log notification emitted by a `logsSubscribe` stream
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogEvent {
    pub signature: String,
    #[serde(default)]
    pub err: Option<serde_json::Value>,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl LogEvent {
    /// True when the node reported the transaction as failed.
    pub fn failed(&self) -> bool {
        matches!(&self.err, Some(err) if !err.is_null())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_id_parsing() {
        let raw = "So11111111111111111111111111111111111111112";
        let token: TokenId = raw.parse().unwrap();
        assert_eq!(token.to_string(), raw);

        let padded: TokenId = format!("  {}\n", raw).parse().unwrap();
        assert_eq!(padded, token);
    }

    #[test]
    fn test_token_id_rejects_garbage() {
        assert_eq!("".parse::<TokenId>(), Err(TokenIdError::Empty));
        assert!(matches!("not-a-key".parse::<TokenId>(), Err(TokenIdError::Invalid(_))));
        // valid base58 but wrong length
        assert!("3yZe7d".parse::<TokenId>().is_err());
    }

    #[test]
    fn test_token_id_serde() {
        let token = TokenId::from_bytes([7u8; 32]);
        let json = serde_json::to_string(&token).unwrap();
        assert_eq!(json, format!("\"{}\"", token));
        let back: TokenId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, token);
    }

    #[test]
    fn test_log_event_failure_flag() {
        let ok: LogEvent = serde_json::from_value(serde_json::json!({
            "signature": "abc",
            "err": null,
            "logs": ["Program log: hi"]
        }))
        .unwrap();
        assert!(!ok.failed());

        let failed: LogEvent = serde_json::from_value(serde_json::json!({
            "signature": "abc",
            "err": {"InstructionError": [0, "Custom"]},
            "logs": []
        }))
        .unwrap();
        assert!(failed.failed());
    }

    #[test]
    fn test_pool_migration_is_sticky() {
        let mut pool = Pool::new(TokenId::from_bytes([1u8; 32]), Pubkey::new_unique(), 6, 9);
        assert!(!pool.migrated);
        pool.mark_migrated();
        pool.mark_migrated();
        assert!(pool.migrated);
    }
}
