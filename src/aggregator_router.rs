use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use base64::Engine as _;
use chrono::{Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use reqwest::Client;
use serde_json::{json, Value};
use solana_sdk::{pubkey::Pubkey, transaction::Transaction};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::chain_rpc::ChainRpc;
use crate::error_classifier::{classify_error, ErrorCode};
use crate::models::TradeAction;
use crate::swap_router::{
    min_output_after_slippage, ExecuteOptions, SwapIntent, SwapQuote, SwapResult, SwapRouter,
    UnsignedSwap,
};
use crate::wallet_vault::SigningKey;

/// Wrapped SOL mint, the SOL leg of every aggregator route.
static WSOL_MINT: Lazy<Pubkey> = Lazy::new(|| {
    Pubkey::from_str("So11111111111111111111111111111111111111112").expect("static mint")
});

/// Post-graduation venue: quote -> unsigned swap transaction -> signed
/// submission against the aggregator HTTP API.
pub struct AggregatorRouter {
    rpc: Arc<ChainRpc>,
    client: Client,
    base_url: String,
}

impl AggregatorRouter {
    pub fn new(rpc: Arc<ChainRpc>, base_url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .gzip(true)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            rpc,
            client,
            base_url,
        }
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("aggregator API error {}: {}", status, body);
        }
        Ok(response.json().await?)
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value> {
        let response = self.client.post(url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("aggregator API error {}: {}", status, body);
        }
        Ok(response.json().await?)
    }

    fn route_legs(&self, intent: &SwapIntent) -> (String, String) {
        match intent.side {
            TradeAction::Buy => (WSOL_MINT.to_string(), intent.token_mint.clone()),
            TradeAction::Sell => (intent.token_mint.clone(), WSOL_MINT.to_string()),
        }
    }
}

#[async_trait]
impl SwapRouter for AggregatorRouter {
    fn name(&self) -> &'static str {
        "aggregator"
    }

    /// The aggregator is the fall-through venue: anything on this chain.
    fn can_handle(&self, intent: &SwapIntent) -> bool {
        intent.chain == "solana"
    }

    async fn quote(&self, intent: &SwapIntent) -> Result<SwapQuote> {
        let (input_mint, output_mint) = self.route_legs(intent);
        let url = format!(
            "{}/quote?inputMint={}&outputMint={}&amount={}&slippageBps={}&swapMode=ExactIn&asLegacyTransaction=true",
            self.base_url, input_mint, output_mint, intent.amount, intent.slippage_bps
        );

        let body = self.get_json(&url).await?;
        let expected_output: u64 = body
            .get("outAmount")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow!("quote response missing outAmount"))?;
        let min_output = body
            .get("otherAmountThreshold")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| min_output_after_slippage(expected_output, intent.slippage_bps));
        let price_impact_percent = body
            .get("priceImpactPct")
            .and_then(|v| match v {
                Value::String(s) => s.parse::<f64>().ok(),
                Value::Number(n) => n.as_f64(),
                _ => None,
            })
            .map(|p| p * 100.0)
            .unwrap_or(0.0);

        let quoted_at = Utc::now();
        debug!(
            "💱 Aggregator quote {} {}: in={} out={} impact={:.3}%",
            intent.side.as_str(),
            intent.token_mint,
            intent.amount,
            expected_output,
            price_impact_percent
        );

        Ok(SwapQuote {
            router: self.name(),
            expected_output,
            min_output,
            price_impact_percent,
            // The swap call replays the whole quote response.
            route_plan: body,
            quoted_at,
            expires_at: quoted_at + ChronoDuration::seconds(20),
            last_valid_block_height: None,
        })
    }

    async fn build_tx(&self, quote: &SwapQuote, intent: &SwapIntent) -> Result<UnsignedSwap> {
        let request = json!({
            "quoteResponse": quote.route_plan,
            "userPublicKey": intent.user_pubkey.to_string(),
            "wrapAndUnwrapSol": true,
            "asLegacyTransaction": true,
            "prioritizationFeeLamports": "auto",
        });

        let body = self.post_json(&format!("{}/swap", self.base_url), &request).await?;

        let tx_b64 = body
            .get("swapTransaction")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("swap response missing swapTransaction"))?;
        let tx_bytes = base64::engine::general_purpose::STANDARD
            .decode(tx_b64)
            .map_err(|e| anyhow!("swapTransaction is not valid base64: {}", e))?;
        let tx: Transaction = bincode::deserialize(&tx_bytes)
            .map_err(|e| anyhow!("swapTransaction failed to decode: {}", e))?;

        let last_valid_block_height = match body
            .get("lastValidBlockHeight")
            .and_then(|v| v.as_u64())
        {
            Some(h) => h,
            None => self.rpc.latest_blockhash().await?.last_valid_block_height,
        };

        // Buys must report actual tokens received, not the quoted amount.
        let verify_owner_mint = if intent.side == TradeAction::Buy {
            Some((intent.user_pubkey, Pubkey::from_str(&intent.token_mint)?))
        } else {
            None
        };

        Ok(UnsignedSwap::Prebuilt {
            tx,
            last_valid_block_height,
            verify_owner_mint,
        })
    }

    async fn execute(
        &self,
        unsigned: UnsignedSwap,
        signer: &SigningKey,
        options: &ExecuteOptions,
    ) -> Result<SwapResult> {
        let UnsignedSwap::Prebuilt {
            mut tx,
            last_valid_block_height,
            verify_owner_mint,
        } = unsigned
        else {
            bail!("aggregator router executes prebuilt transactions only");
        };

        let balance_before = match &verify_owner_mint {
            Some((owner, mint)) => Some(self.rpc.get_token_balance_raw(owner, mint).await.unwrap_or(0)),
            None => None,
        };

        let keypair = signer.keypair()?;
        let blockhash = tx.message.recent_blockhash;
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
                // Output verification: read chain state, never trust the quote.
                let actual_output = match &verify_owner_mint {
                    Some((owner, mint)) => {
                        let after = self.rpc.get_token_balance_raw(owner, mint).await.unwrap_or(0);
                        Some(after.saturating_sub(balance_before.unwrap_or(0)))
                    }
                    None => None,
                };

                info!(
                    "✅ Aggregator swap confirmed: {} (actual out {:?})",
                    signature, actual_output
                );
                Ok(SwapResult {
                    success: true,
                    signature: Some(signature.to_string()),
                    actual_input: None,
                    actual_output,
                    error: None,
                    error_code: None,
                    router: self.name(),
                })
            }
            Err(e) => {
                let msg = e.to_string();
                let code = classify_error(&msg);
                warn!("❌ Aggregator swap failed ({}): {}", code.as_str(), msg);
                Ok(SwapResult::failure(self.name(), msg, code))
            }
        }
    }
}
