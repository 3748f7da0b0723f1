use anyhow::{anyhow, Result};
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::chain_rpc::ChainRpc;

/// Cache of mint -> decimals.
///
/// Every raw/whole conversion in the engine goes through here; prices are
/// SOL per whole token, on-chain amounts are raw base units.
#[derive(Clone)]
pub struct TokenDecimals {
    cache: Arc<RwLock<HashMap<String, u8>>>,
    rpc: Arc<ChainRpc>,
}

impl TokenDecimals {
    pub fn new(rpc: Arc<ChainRpc>) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            rpc,
        }
    }

    /// Pre-seed well-known mints so the hot path never pays an RPC for them.
    pub async fn seed_known(&self) {
        let mut cache = self.cache.write().await;
        cache.insert("So11111111111111111111111111111111111111112".to_string(), 9); // SOL
        cache.insert("EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v".to_string(), 6); // USDC
        debug!("🔢 Seeded decimal cache with {} known mints", cache.len());
    }

    /// Seed a known decimals value directly (adapters and tests).
    pub async fn preload(&self, token_mint: &str, decimals: u8) {
        self.cache
            .write()
            .await
            .insert(token_mint.to_string(), decimals);
    }

    pub async fn get(&self, token_mint: &str) -> Result<u8> {
        {
            let cache = self.cache.read().await;
            if let Some(&decimals) = cache.get(token_mint) {
                return Ok(decimals);
            }
        }

        let decimals = self.fetch(token_mint).await?;
        self.cache
            .write()
            .await
            .insert(token_mint.to_string(), decimals);
        debug!("🔢 Cached decimals for {}: {}", token_mint, decimals);
        Ok(decimals)
    }

    async fn fetch(&self, token_mint: &str) -> Result<u8> {
        let pubkey = Pubkey::from_str(token_mint).map_err(|e| anyhow!("invalid mint: {}", e))?;
        let data = self.rpc.get_account_data(&pubkey).await?;

        // SPL mint layout: authority (36) + supply (8) + decimals at byte 44.
        if data.len() < 45 {
            return Err(anyhow!("mint account too small: {} bytes", data.len()));
        }
        let decimals = data[44];
        if decimals > 18 {
            warn!("⚠️  Unusual decimals {} for mint {}", decimals, token_mint);
        }
        Ok(decimals)
    }
}

/// Raw base units -> whole tokens.
pub fn raw_to_whole(raw: u64, decimals: u8) -> f64 {
    raw as f64 / 10f64.powi(decimals as i32)
}

/// Whole tokens -> raw base units (floor).
pub fn whole_to_raw(whole: f64, decimals: u8) -> u64 {
    (whole * 10f64.powi(decimals as i32)) as u64
}

/// Entry price in SOL per whole token from actual fill amounts.
pub fn fill_price_sol(cost_lamports: u64, tokens_raw: u64, decimals: u8) -> f64 {
    if tokens_raw == 0 {
        return 0.0;
    }
    let sol = cost_lamports as f64 / crate::constants::SOL_DECIMALS as f64;
    sol / raw_to_whole(tokens_raw, decimals)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_round_trip() {
        assert_eq!(raw_to_whole(1_000_000, 6), 1.0);
        assert_eq!(whole_to_raw(1.5, 6), 1_500_000);
        assert_eq!(whole_to_raw(raw_to_whole(123_456_789, 6), 6), 123_456_789);
    }

    #[test]
    fn fill_price_from_amounts() {
        // 0.05 SOL buys 40,000 whole tokens (6 decimals).
        let price = fill_price_sol(50_000_000, 40_000_000_000, 6);
        assert!((price - 0.00000125).abs() < 1e-12);
        assert_eq!(fill_price_sol(1, 0, 6), 0.0);
    }
}
