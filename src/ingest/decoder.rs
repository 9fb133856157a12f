/// Virtual pool account decoding: raw account bytes to a comparable price

use borsh::BorshDeserialize;
use thiserror::Error;

use crate::core::constants::DISCRIMINATOR_LEN;
use crate::core::types::TokenId;

/// 2^64, the scale of a Q64.64 fixed-point value
const Q64: f64 = 18_446_744_073_709_551_616.0;

/// Bytes of the pool layout read after the discriminator
pub const POOL_LAYOUT_LEN: usize = 64 + 5 * 32 + 6 * 8 + 16 + 8 + 1 + 1;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("account data too short: need {needed} bytes, got {got}")]
    ShortBuffer { needed: usize, got: usize },
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is missing {0}")]
    MissingField(&'static str),
    #[error("unparseable pool layout: {0}")]
    Layout(String),
}

#[derive(Debug, Clone, BorshDeserialize)]
struct VolatilityTracker {
    _last_update_timestamp: u64,
    _padding: [u8; 8],
    _sqrt_price_reference: u128,
    _volatility_accumulator: u128,
    _volatility_reference: u128,
}

/// Leading fields of a bonding-curve virtual pool account
#[derive(Debug, Clone, BorshDeserialize)]
struct VirtualPoolHead {
    _volatility_tracker: VolatilityTracker,
    _config: [u8; 32],
    _creator: [u8; 32],
    base_mint: [u8; 32],
    _base_vault: [u8; 32],
    _quote_vault: [u8; 32],
    _base_reserve: u64,
    _quote_reserve: u64,
    _protocol_base_fee: u64,
    _protocol_quote_fee: u64,
    _partner_base_fee: u64,
    _partner_quote_fee: u64,
    sqrt_price: u128,
    _activation_point: u64,
    _pool_type: u8,
    is_migrated: u8,
}

/// Result of decoding one pool account update
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPool {
    pub base_mint: TokenId,
    pub raw_sqrt_price: u128,
    pub price: f64,
    pub migrated: bool,
}

/// Converts a Q64 square-root price into a quote-per-base price.
pub fn price_from_sqrt(raw_sqrt_price: u128, base_decimals: u8, quote_decimals: u8) -> f64 {
    let ratio = raw_sqrt_price as f64 / Q64;
    let exponent = i32::from(base_decimals) - i32::from(quote_decimals);
    ratio * ratio * 10f64.powi(exponent)
}

/// Decodes a pool account (discriminator included) into its price.
pub fn decode_pool(data: &[u8], base_decimals: u8, quote_decimals: u8) -> Result<DecodedPool, DecodeError> {
    let needed = DISCRIMINATOR_LEN + POOL_LAYOUT_LEN;
    if data.len() < needed {
        return Err(DecodeError::ShortBuffer {
            needed,
            got: data.len(),
        });
    }

    let mut body = &data[DISCRIMINATOR_LEN..];
    let head = VirtualPoolHead::deserialize(&mut body).map_err(|e| DecodeError::Layout(e.to_string()))?;

    Ok(DecodedPool {
        base_mint: TokenId::from_bytes(head.base_mint),
        raw_sqrt_price: head.sqrt_price,
        price: price_from_sqrt(head.sqrt_price, base_decimals, quote_decimals),
        migrated: head.is_migrated != 0,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    const SQRT_OFFSET: usize = DISCRIMINATOR_LEN + 272;
    const MIGRATED_OFFSET: usize = DISCRIMINATOR_LEN + 297;
    const BASE_MINT_OFFSET: usize = DISCRIMINATOR_LEN + 128;

    /// Builds a pool account buffer with the given mint, sqrt price and migration flag.
    pub(crate) fn pool_account(base_mint: [u8; 32], sqrt_price: u128, migrated: bool) -> Vec<u8> {
        let mut data = vec![0u8; DISCRIMINATOR_LEN + POOL_LAYOUT_LEN + 16];
        data[..DISCRIMINATOR_LEN].copy_from_slice(&[0xd5, 0x4b, 0x1f, 0x0e, 0x9a, 0x33, 0x71, 0x02]);
        data[BASE_MINT_OFFSET..BASE_MINT_OFFSET + 32].copy_from_slice(&base_mint);
        data[SQRT_OFFSET..SQRT_OFFSET + 16].copy_from_slice(&sqrt_price.to_le_bytes());
        data[MIGRATED_OFFSET] = migrated as u8;
        data
    }

    #[test]
    fn test_layout_length_matches_offsets() {
        assert_eq!(POOL_LAYOUT_LEN, 298);
        assert_eq!(BASE_MINT_OFFSET, crate::core::constants::POOL_BASE_MINT_OFFSET);
    }

    #[test]
    fn test_unit_price() {
        let price = price_from_sqrt(1u128 << 64, 9, 9);
        assert!((price - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_decimal_adjustment() {
        // sqrt 2.0 -> ratio 4.0, shifted by 10^(6-9)
        let price = price_from_sqrt(2u128 << 64, 6, 9);
        assert!((price - 0.004).abs() < 1e-15);

        let price = price_from_sqrt(1u128 << 63, 9, 6);
        assert!((price - 250.0).abs() < 1e-9);
    }

    #[test]
    fn test_decode_account() {
        let mint = [9u8; 32];
        let data = pool_account(mint, 3u128 << 64, false);
        let decoded = decode_pool(&data, 9, 9).unwrap();

        assert_eq!(decoded.base_mint, TokenId::from_bytes(mint));
        assert_eq!(decoded.raw_sqrt_price, 3u128 << 64);
        assert!((decoded.price - 9.0).abs() < 1e-9);
        assert!(!decoded.migrated);
    }

    #[test]
    fn test_decode_migrated_flag() {
        let data = pool_account([2u8; 32], 1u128 << 64, true);
        assert!(decode_pool(&data, 6, 9).unwrap().migrated);
    }

    #[test]
    fn test_short_buffer() {
        let data = vec![0u8; 100];
        match decode_pool(&data, 9, 9) {
            Err(DecodeError::ShortBuffer { needed, got }) => {
                assert_eq!(needed, 306);
                assert_eq!(got, 100);
            }
            other => panic!("expected short buffer, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_sqrt_price() {
        let data = pool_account([2u8; 32], 0, false);
        assert_eq!(decode_pool(&data, 6, 9).unwrap().price, 0.0);
    }
}
