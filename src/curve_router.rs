use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use borsh::BorshDeserialize;
use chrono::{Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use solana_sdk::{
    compute_budget::ComputeBudgetInstruction,
    instruction::{AccountMeta, Instruction},
    message::Message,
    pubkey::Pubkey,
    transaction::Transaction,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::chain_rpc::{associated_token_address, ChainRpc};
use crate::constants::*;
use crate::error_classifier::{classify_error, ErrorCode};
use crate::models::{LifecycleState, TradeAction};
use crate::swap_router::{
    min_output_after_slippage, ExecuteOptions, SwapIntent, SwapQuote, SwapResult, SwapRouter,
    UnsignedSwap,
};
use crate::wallet_vault::SigningKey;

static CURVE_PROGRAM: Lazy<Pubkey> =
    Lazy::new(|| Pubkey::from_str(CURVE_PROGRAM_ID).expect("static program id"));
static FEE_RECIPIENT: Lazy<Pubkey> = Lazy::new(|| {
    Pubkey::from_str("CebN5WGQ4jvEPvsVU4EoHEpgzq1VV7AbicfhtW4xC9iM").expect("static account")
});

/// On-chain bonding curve account state (Borsh, behind an 8-byte Anchor
/// discriminator).
#[derive(Debug, Clone, BorshDeserialize)]
pub struct CurveState {
    pub virtual_token_reserves: u64,
    pub virtual_sol_reserves: u64,
    pub real_token_reserves: u64,
    pub real_sol_reserves: u64,
    pub token_total_supply: u64,
    pub complete: bool,
}

impl CurveState {
    /// Tokens out for a SOL input, constant product over virtual reserves.
    pub fn buy_output(&self, sol_in: u64) -> Result<u64> {
        if self.virtual_sol_reserves == 0 || self.virtual_token_reserves == 0 {
            bail!("curve has empty virtual reserves");
        }
        let k = self.virtual_sol_reserves as u128 * self.virtual_token_reserves as u128;
        let new_sol = self.virtual_sol_reserves as u128 + sol_in as u128;
        let new_tokens = k / new_sol;
        let out = self.virtual_token_reserves as u128 - new_tokens;
        // Cannot exceed what the curve actually holds.
        Ok((out.min(self.real_token_reserves as u128)) as u64)
    }

    /// Lamports out for a raw token input.
    pub fn sell_output(&self, tokens_in: u64) -> Result<u64> {
        if self.virtual_sol_reserves == 0 || self.virtual_token_reserves == 0 {
            bail!("curve has empty virtual reserves");
        }
        let k = self.virtual_sol_reserves as u128 * self.virtual_token_reserves as u128;
        let new_tokens = self.virtual_token_reserves as u128 + tokens_in as u128;
        let new_sol = k / new_tokens;
        let out = self.virtual_sol_reserves as u128 - new_sol;
        Ok((out.min(self.real_sol_reserves as u128)) as u64)
    }

    /// Spot price in lamports per raw token unit.
    pub fn spot_price_lamports(&self) -> f64 {
        if self.virtual_token_reserves == 0 {
            return 0.0;
        }
        self.virtual_sol_reserves as f64 / self.virtual_token_reserves as f64
    }

    /// Graduated: completed flag set or reserves past the migration line.
    pub fn is_graduated(&self) -> bool {
        self.complete || self.virtual_sol_reserves >= CURVE_GRADUATION_LAMPORTS
    }
}

/// Direct bonding-curve venue: derives the curve PDA, reads reserves, prices
/// with constant-product math, and builds program instructions locally.
pub struct CurveRouter {
    rpc: Arc<ChainRpc>,
}

impl CurveRouter {
    pub fn new(rpc: Arc<ChainRpc>) -> Self {
        Self { rpc }
    }

    /// Curve PDA for a mint.
    pub fn derive_curve(token_mint: &Pubkey) -> Pubkey {
        Pubkey::find_program_address(&[CURVE_SEED, token_mint.as_ref()], &CURVE_PROGRAM).0
    }

    /// Load and decode the curve account, using the hinted pubkey when the
    /// candidate carried one.
    pub async fn fetch_state(&self, token_mint: &Pubkey, hint: Option<&Pubkey>) -> Result<CurveState> {
        let curve = hint.copied().unwrap_or_else(|| Self::derive_curve(token_mint));
        let data = self.rpc.get_account_data(&curve).await?;
        if data.len() <= 8 {
            bail!("curve account too small: {} bytes", data.len());
        }
        // Skip the 8-byte discriminator.
        CurveState::try_from_slice(&data[8..])
            .map_err(|e| anyhow!("failed to decode curve state: {}", e))
    }

    fn swap_instruction(
        &self,
        intent: &SwapIntent,
        token_mint: &Pubkey,
        curve: &Pubkey,
        amount: u64,
        limit: u64,
    ) -> Instruction {
        let user_ata = associated_token_address(&intent.user_pubkey, token_mint);
        let curve_ata = associated_token_address(curve, token_mint);

        let mut data = Vec::with_capacity(24);
        match intent.side {
            TradeAction::Buy => {
                data.extend_from_slice(&CURVE_BUY_DISCRIMINATOR);
                // amount = tokens expected, limit = max SOL cost
                data.extend_from_slice(&limit.to_le_bytes());
                data.extend_from_slice(&amount.to_le_bytes());
            }
            TradeAction::Sell => {
                data.extend_from_slice(&CURVE_SELL_DISCRIMINATOR);
                // amount = tokens in, limit = min SOL out
                data.extend_from_slice(&amount.to_le_bytes());
                data.extend_from_slice(&limit.to_le_bytes());
            }
        }

        Instruction {
            program_id: *CURVE_PROGRAM,
            accounts: vec![
                AccountMeta::new(*FEE_RECIPIENT, false),
                AccountMeta::new_readonly(*token_mint, false),
                AccountMeta::new(*curve, false),
                AccountMeta::new(curve_ata, false),
                AccountMeta::new(user_ata, false),
                AccountMeta::new(intent.user_pubkey, true),
                AccountMeta::new_readonly(solana_sdk::system_program::id(), false),
                AccountMeta::new_readonly(spl_token::id(), false),
            ],
            data,
        }
    }
}

#[async_trait]
impl SwapRouter for CurveRouter {
    fn name(&self) -> &'static str {
        "curve"
    }

    fn can_handle(&self, intent: &SwapIntent) -> bool {
        intent.chain == "solana"
            && (intent.bonding_curve.is_some()
                || matches!(intent.lifecycle_state, Some(LifecycleState::PreGraduation)))
    }

    async fn quote(&self, intent: &SwapIntent) -> Result<SwapQuote> {
        let token_mint = Pubkey::from_str(&intent.token_mint)
            .map_err(|e| anyhow!("invalid mint {}: {}", intent.token_mint, e))?;
        let state = self
            .fetch_state(&token_mint, intent.bonding_curve.as_ref())
            .await?;

        if state.is_graduated() {
            bail!("token has graduated from the bonding curve");
        }

        let expected_output = match intent.side {
            TradeAction::Buy => state.buy_output(intent.amount)?,
            TradeAction::Sell => state.sell_output(intent.amount)?,
        };
        let min_output = min_output_after_slippage(expected_output, intent.slippage_bps);

        // Price impact: spot price vs effective fill price.
        let spot = state.spot_price_lamports();
        let effective = match intent.side {
            TradeAction::Buy if expected_output > 0 => intent.amount as f64 / expected_output as f64,
            TradeAction::Sell if intent.amount > 0 => expected_output as f64 / intent.amount as f64,
            _ => spot,
        };
        let price_impact_percent = if spot > 0.0 {
            ((effective - spot) / spot * 100.0).abs()
        } else {
            0.0
        };

        let quoted_at = Utc::now();
        debug!(
            "💱 Curve quote {} {}: in={} out={} (min {})",
            intent.side.as_str(),
            intent.token_mint,
            intent.amount,
            expected_output,
            min_output
        );

        Ok(SwapQuote {
            router: self.name(),
            expected_output,
            min_output,
            price_impact_percent,
            route_plan: serde_json::json!({
                "venue": "bonding-curve",
                "virtual_sol_reserves": state.virtual_sol_reserves,
                "virtual_token_reserves": state.virtual_token_reserves,
            }),
            quoted_at,
            // Curve quotes go stale with the blockhash window (~60s of slots);
            // be stricter than that.
            expires_at: quoted_at + ChronoDuration::seconds(20),
            last_valid_block_height: None,
        })
    }

    async fn build_tx(&self, quote: &SwapQuote, intent: &SwapIntent) -> Result<UnsignedSwap> {
        let token_mint = Pubkey::from_str(&intent.token_mint)?;
        let curve = intent
            .bonding_curve
            .unwrap_or_else(|| Self::derive_curve(&token_mint));

        let limit = match intent.side {
            // Max SOL we are willing to pay: input plus slippage headroom.
            TradeAction::Buy => {
                (intent.amount as u128 * (10_000u128 + intent.slippage_bps as u128) / 10_000u128)
                    as u64
            }
            TradeAction::Sell => quote.min_output,
        };
        let amount = match intent.side {
            TradeAction::Buy => quote.expected_output,
            TradeAction::Sell => intent.amount,
        };

        let instruction = self.swap_instruction(intent, &token_mint, &curve, amount, limit);
        let blockhash_info = self.rpc.latest_blockhash().await?;

        Ok(UnsignedSwap::Instructions {
            instructions: vec![instruction],
            payer: intent.user_pubkey,
            blockhash: blockhash_info.blockhash,
            last_valid_block_height: blockhash_info.last_valid_block_height,
        })
    }

    async fn execute(
        &self,
        unsigned: UnsignedSwap,
        signer: &SigningKey,
        options: &ExecuteOptions,
    ) -> Result<SwapResult> {
        let UnsignedSwap::Instructions {
            instructions,
            payer,
            blockhash,
            last_valid_block_height,
        } = unsigned
        else {
            bail!("curve router executes locally built instructions only");
        };

        let mut all = Vec::with_capacity(instructions.len() + 2);
        if options.priority_fee_lamports > 0 {
            // Compute unit price is micro-lamports per CU; budget 200k CUs.
            let micro_lamports = options.priority_fee_lamports.saturating_mul(5); // 1e6 / 200k
            all.push(ComputeBudgetInstruction::set_compute_unit_limit(200_000));
            all.push(ComputeBudgetInstruction::set_compute_unit_price(micro_lamports));
        }
        all.extend(instructions);

        let keypair = signer.keypair()?;
        let message = Message::new_with_blockhash(&all, Some(&payer), &blockhash);
        let mut tx = Transaction::new_unsigned(message);
        tx.try_sign(&[&keypair], blockhash)
            .map_err(|e| anyhow!("signing failed: {}", e))?;

        let guard = options.last_valid_block_height.unwrap_or(last_valid_block_height);
        let timeout = Duration::from_millis(options.confirm_timeout_ms);

        match self
            .rpc
            .send_and_confirm(&tx, timeout, guard, options.use_anti_mev)
            .await
        {
            Ok(signature) => {
                info!("✅ Curve swap confirmed: {}", signature);
                Ok(SwapResult {
                    success: true,
                    signature: Some(signature.to_string()),
                    actual_input: None,
                    actual_output: None,
                    error: None,
                    error_code: None,
                    router: self.name(),
                })
            }
            Err(e) => {
                let msg = e.to_string();
                let code = classify_error(&msg);
                warn!("❌ Curve swap failed ({}): {}", code.as_str(), msg);
                Ok(SwapResult::failure(self.name(), msg, code))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(v_sol: u64, v_tok: u64) -> CurveState {
        CurveState {
            virtual_token_reserves: v_tok,
            virtual_sol_reserves: v_sol,
            real_token_reserves: v_tok,
            real_sol_reserves: v_sol,
            token_total_supply: 1_000_000_000_000_000,
            complete: false,
        }
    }

    #[test]
    fn buy_output_follows_constant_product() {
        let s = state(30_000_000_000, 1_000_000_000_000_000);
        let out = s.buy_output(1_000_000_000).unwrap(); // 1 SOL in
        // k/(vS+in) leaves ~vT*30/31; out ~ vT/31
        let expected = 1_000_000_000_000_000u128
            - (30_000_000_000u128 * 1_000_000_000_000_000u128) / 31_000_000_000u128;
        assert_eq!(out as u128, expected);
        assert!(out > 0);
    }

    #[test]
    fn sell_output_is_inverse_shaped() {
        let s = state(30_000_000_000, 1_000_000_000_000_000);
        let tokens = s.buy_output(1_000_000_000).unwrap();
        let back = s.sell_output(tokens).unwrap();
        // Selling the tokens just bought against the same reserves returns
        // slightly less than 1 SOL due to curve movement, never more.
        assert!(back <= 1_000_000_000);
        assert!(back > 900_000_000);
    }

    #[test]
    fn graduation_detection() {
        let mut s = state(30_000_000_000, 1_000_000_000_000_000);
        assert!(!s.is_graduated());
        s.complete = true;
        assert!(s.is_graduated());

        let big = state(CURVE_GRADUATION_LAMPORTS, 1_000_000_000_000_000);
        assert!(big.is_graduated());
    }

    #[test]
    fn buy_output_capped_by_real_reserves() {
        let mut s = state(1_000_000_000, 1_000_000_000_000);
        s.real_token_reserves = 10;
        let out = s.buy_output(100_000_000_000).unwrap();
        assert_eq!(out, 10);
    }

    #[test]
    fn curve_pda_is_deterministic() {
        let mint = Pubkey::new_unique();
        assert_eq!(CurveRouter::derive_curve(&mint), CurveRouter::derive_curve(&mint));
    }

    #[test]
    fn empty_reserves_error_instead_of_divide_by_zero() {
        let s = state(0, 0);
        assert!(s.buy_output(1).is_err());
        assert!(s.sell_output(1).is_err());
    }
}
