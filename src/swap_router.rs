// Venue-agnostic swap abstraction.
// Every venue implements the same three-step lifecycle (quote, build,
// execute) behind the SwapRouter trait; the factory picks the venue from the
// position's lifecycle state. Slippage is always explicit and every execute
// is bounded by a confirmation timeout.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use solana_sdk::{hash::Hash, instruction::Instruction, pubkey::Pubkey, transaction::Transaction};
use std::sync::Arc;

use crate::constants::DUST_SELL_PERCENT;
use crate::error_classifier::ErrorCode;
use crate::models::{LifecycleState, TradeAction};
use crate::wallet_vault::SigningKey;

/// What the caller wants swapped.
#[derive(Debug, Clone)]
pub struct SwapIntent {
    pub chain: String,
    pub token_mint: String,
    pub side: TradeAction,
    /// Lamports in for a buy, raw token base units in for a sell.
    pub amount: u64,
    pub slippage_bps: u16,
    pub user_pubkey: Pubkey,
    pub bonding_curve: Option<Pubkey>,
    pub lifecycle_state: Option<LifecycleState>,
    pub position_uuid: Option<String>,
}

/// A priced route, valid until roughly `expires_at`.
#[derive(Debug, Clone)]
pub struct SwapQuote {
    pub router: &'static str,
    pub expected_output: u64,
    pub min_output: u64,
    pub price_impact_percent: f64,
    pub route_plan: serde_json::Value,
    pub quoted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_valid_block_height: Option<u64>,
}

/// Built but unsigned transaction plus its blockhash validity guard.
///
/// Locally-built venues carry raw instructions so execute can prepend
/// compute-budget instructions for the priority fee before signing;
/// API-built venues carry the wire transaction as returned.
pub enum UnsignedSwap {
    Instructions {
        instructions: Vec<Instruction>,
        payer: Pubkey,
        blockhash: Hash,
        last_valid_block_height: u64,
    },
    Prebuilt {
        tx: Transaction,
        last_valid_block_height: u64,
        /// (owner, mint) whose token balance is read before and after the
        /// swap so the result reports actual tokens received, not the quote.
        verify_owner_mint: Option<(Pubkey, Pubkey)>,
    },
}

impl UnsignedSwap {
    pub fn last_valid_block_height(&self) -> u64 {
        match self {
            UnsignedSwap::Instructions {
                last_valid_block_height,
                ..
            } => *last_valid_block_height,
            UnsignedSwap::Prebuilt {
                last_valid_block_height,
                ..
            } => *last_valid_block_height,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub use_anti_mev: bool,
    pub priority_fee_lamports: u64,
    pub confirm_timeout_ms: u64,
    pub last_valid_block_height: Option<u64>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            use_anti_mev: false,
            priority_fee_lamports: 0,
            confirm_timeout_ms: crate::constants::DEFAULT_CONFIRM_TIMEOUT_MS,
            last_valid_block_height: None,
        }
    }
}

/// Outcome of one swap attempt. `actual_output` is read back from chain state
/// where the venue supports it, not echoed from the quote.
#[derive(Debug, Clone)]
pub struct SwapResult {
    pub success: bool,
    pub signature: Option<String>,
    pub actual_input: Option<u64>,
    pub actual_output: Option<u64>,
    pub error: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub router: &'static str,
}

impl SwapResult {
    pub fn failure(router: &'static str, error: String, code: ErrorCode) -> Self {
        Self {
            success: false,
            signature: None,
            actual_input: None,
            actual_output: None,
            error: Some(error),
            error_code: Some(code),
            router,
        }
    }
}

/// The uniform venue contract.
#[async_trait]
pub trait SwapRouter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fast predicate on (lifecycle state, chain, venue hints).
    fn can_handle(&self, intent: &SwapIntent) -> bool;

    async fn quote(&self, intent: &SwapIntent) -> Result<SwapQuote>;

    async fn build_tx(&self, quote: &SwapQuote, intent: &SwapIntent) -> Result<UnsignedSwap>;

    async fn execute(
        &self,
        unsigned: UnsignedSwap,
        signer: &SigningKey,
        options: &ExecuteOptions,
    ) -> Result<SwapResult>;
}

/// Venue selection: bonding-curve router pre-graduation (or when a curve
/// account is hinted), aggregator for everything else.
#[derive(Clone)]
pub struct RouterFactory {
    curve: Arc<dyn SwapRouter>,
    aggregator: Arc<dyn SwapRouter>,
}

impl RouterFactory {
    pub fn new(curve: Arc<dyn SwapRouter>, aggregator: Arc<dyn SwapRouter>) -> Self {
        Self { curve, aggregator }
    }

    pub fn select(&self, intent: &SwapIntent) -> Arc<dyn SwapRouter> {
        let pre_graduation = matches!(intent.lifecycle_state, Some(LifecycleState::PreGraduation))
            || intent.bonding_curve.is_some();
        if pre_graduation && self.curve.can_handle(intent) {
            Arc::clone(&self.curve)
        } else {
            Arc::clone(&self.aggregator)
        }
    }
}

/// Apply slippage tolerance to an expected output.
pub fn min_output_after_slippage(expected_output: u64, slippage_bps: u16) -> u64 {
    let expected = expected_output as u128;
    let kept = expected * (10_000u128 - slippage_bps as u128) / 10_000u128;
    kept as u64
}

/// Convert a sell percent into a raw token amount against a live balance.
/// Selling >= 95% rounds up to the full balance so positions never strand
/// dust below the venue's minimum trade size.
pub fn raw_sell_amount(balance_raw: u64, sell_percent: f64) -> u64 {
    let percent = sell_percent.clamp(0.0, 100.0);
    if percent >= DUST_SELL_PERCENT {
        return balance_raw;
    }
    ((balance_raw as u128) * ((percent * 100.0) as u128) / 10_000u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slippage_math_is_exact_at_boundaries() {
        assert_eq!(min_output_after_slippage(10_000, 0), 10_000);
        assert_eq!(min_output_after_slippage(10_000, 100), 9_900);
        assert_eq!(min_output_after_slippage(10_000, 10_000), 0);
        // No overflow on large raw amounts.
        assert_eq!(min_output_after_slippage(u64::MAX, 0), u64::MAX);
    }

    #[test]
    fn dust_rule_rounds_up_to_full_balance() {
        assert_eq!(raw_sell_amount(1_000_000, 100.0), 1_000_000);
        assert_eq!(raw_sell_amount(1_000_000, 95.0), 1_000_000);
        assert_eq!(raw_sell_amount(1_000_000, 96.5), 1_000_000);
        assert_eq!(raw_sell_amount(1_000_000, 50.0), 500_000);
        assert_eq!(raw_sell_amount(1_000_000, 0.0), 0);
    }

    struct StubRouter(&'static str, bool);

    #[async_trait]
    impl SwapRouter for StubRouter {
        fn name(&self) -> &'static str {
            self.0
        }
        fn can_handle(&self, _intent: &SwapIntent) -> bool {
            self.1
        }
        async fn quote(&self, _intent: &SwapIntent) -> Result<SwapQuote> {
            unimplemented!()
        }
        async fn build_tx(&self, _quote: &SwapQuote, _intent: &SwapIntent) -> Result<UnsignedSwap> {
            unimplemented!()
        }
        async fn execute(
            &self,
            _unsigned: UnsignedSwap,
            _signer: &SigningKey,
            _options: &ExecuteOptions,
        ) -> Result<SwapResult> {
            unimplemented!()
        }
    }

    fn intent(lifecycle: Option<LifecycleState>, curve: Option<Pubkey>) -> SwapIntent {
        SwapIntent {
            chain: "solana".to_string(),
            token_mint: "Mint".to_string(),
            side: TradeAction::Buy,
            amount: 1,
            slippage_bps: 100,
            user_pubkey: Pubkey::new_unique(),
            bonding_curve: curve,
            lifecycle_state: lifecycle,
            position_uuid: None,
        }
    }

    #[test]
    fn factory_selects_by_lifecycle_and_falls_through() {
        let factory = RouterFactory::new(
            Arc::new(StubRouter("curve", true)),
            Arc::new(StubRouter("aggregator", true)),
        );

        let pre = intent(Some(LifecycleState::PreGraduation), None);
        assert_eq!(factory.select(&pre).name(), "curve");

        let hinted = intent(None, Some(Pubkey::new_unique()));
        assert_eq!(factory.select(&hinted).name(), "curve");

        let post = intent(Some(LifecycleState::PostGraduation), None);
        assert_eq!(factory.select(&post).name(), "aggregator");

        // Curve refuses -> aggregator handles even pre-graduation.
        let refusing = RouterFactory::new(
            Arc::new(StubRouter("curve", false)),
            Arc::new(StubRouter("aggregator", true)),
        );
        assert_eq!(refusing.select(&pre).name(), "aggregator");
    }
}
