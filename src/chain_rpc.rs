// Chain RPC wrapper.
// Thin async layer over the Solana JSON-RPC client: balances, blockhash with
// validity window, transaction submission, and confirmation bounded by an
// explicit timeout plus a last-valid-block-height guard. Nothing here may
// hang: every wait path has a deadline.

use anyhow::{anyhow, bail, Context, Result};
use once_cell::sync::Lazy;
use solana_rpc_client::nonblocking::rpc_client::RpcClient;
use solana_rpc_client_api::config::RpcSendTransactionConfig;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    hash::Hash,
    pubkey::Pubkey,
    signature::Signature,
    transaction::Transaction,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Associated token account program.
static ATA_PROGRAM_ID: Lazy<Pubkey> = Lazy::new(|| {
    Pubkey::from_str("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL").expect("static program id")
});

/// Derive the associated token account for (owner, mint).
pub fn associated_token_address(owner: &Pubkey, mint: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(
        &[owner.as_ref(), spl_token::id().as_ref(), mint.as_ref()],
        &ATA_PROGRAM_ID,
    )
    .0
}

/// Blockhash plus the block height after which it is dead.
#[derive(Debug, Clone, Copy)]
pub struct BlockhashInfo {
    pub blockhash: Hash,
    pub last_valid_block_height: u64,
}

/// Token balance reads, split out so the trade flows can be driven against
/// scripted balances.
#[async_trait::async_trait]
pub trait BalanceReader: Send + Sync {
    async fn token_balance_raw(&self, owner: &Pubkey, mint: &Pubkey) -> Result<u64>;
}

#[async_trait::async_trait]
impl BalanceReader for ChainRpc {
    async fn token_balance_raw(&self, owner: &Pubkey, mint: &Pubkey) -> Result<u64> {
        self.get_token_balance_raw(owner, mint).await
    }
}

#[derive(Clone)]
pub struct ChainRpc {
    client: Arc<RpcClient>,
    url: String,
}

impl ChainRpc {
    pub fn new(url: String) -> Self {
        let client = RpcClient::new_with_commitment(url.clone(), CommitmentConfig::confirmed());
        Self {
            client: Arc::new(client),
            url,
        }
    }

    /// Startup readiness probe: a no-op RPC that proves the endpoint answers.
    pub async fn health_check(&self) -> Result<()> {
        self.client
            .get_latest_blockhash()
            .await
            .with_context(|| format!("Chain RPC health check failed against {}", self.url))?;
        info!("✅ Chain RPC healthy: {}", self.url);
        Ok(())
    }

    pub async fn get_balance(&self, pubkey: &Pubkey) -> Result<u64> {
        self.client
            .get_balance(pubkey)
            .await
            .context("get_balance failed")
    }

    /// Raw token balance (base units) of the owner's associated token account.
    /// A missing account reads as zero.
    pub async fn get_token_balance_raw(&self, owner: &Pubkey, mint: &Pubkey) -> Result<u64> {
        let ata = associated_token_address(owner, mint);
        match self.client.get_token_account_balance(&ata).await {
            Ok(balance) => balance
                .amount
                .parse::<u64>()
                .context("token balance is not a valid u64"),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("could not find account") || msg.contains("Invalid param") {
                    Ok(0)
                } else {
                    Err(anyhow!("get_token_account_balance failed: {}", msg))
                }
            }
        }
    }

    pub async fn get_account_data(&self, pubkey: &Pubkey) -> Result<Vec<u8>> {
        let account = self
            .client
            .get_account(pubkey)
            .await
            .with_context(|| format!("Account not found: {}", pubkey))?;
        Ok(account.data)
    }

    pub async fn latest_blockhash(&self) -> Result<BlockhashInfo> {
        let (blockhash, last_valid_block_height) = self
            .client
            .get_latest_blockhash_with_commitment(CommitmentConfig::confirmed())
            .await
            .context("get_latest_blockhash failed")?;
        Ok(BlockhashInfo {
            blockhash,
            last_valid_block_height,
        })
    }

    /// Submit a signed transaction and wait for confirmation.
    ///
    /// Returns the signature once the transaction reaches confirmed
    /// commitment. Fails closed with a "blockhash expired"-classifiable error
    /// when the chain passes `last_valid_block_height` or the deadline lapses;
    /// never blocks past `timeout`.
    pub async fn send_and_confirm(
        &self,
        tx: &Transaction,
        timeout: Duration,
        last_valid_block_height: u64,
        skip_preflight: bool,
    ) -> Result<Signature> {
        let config = RpcSendTransactionConfig {
            skip_preflight,
            max_retries: Some(3),
            ..RpcSendTransactionConfig::default()
        };

        let signature = self
            .client
            .send_transaction_with_config(tx, config)
            .await
            .context("send_transaction failed")?;
        debug!("📤 Submitted {}", signature);

        let confirm = self.wait_for_confirmation(&signature, last_valid_block_height);
        match tokio::time::timeout(timeout, confirm).await {
            Ok(result) => result.map(|_| signature),
            Err(_) => {
                warn!("⏰ Confirmation timed out for {}", signature);
                bail!(
                    "confirmation timed out after {:?}: blockhash expired for {}",
                    timeout,
                    signature
                );
            }
        }
    }

    async fn wait_for_confirmation(
        &self,
        signature: &Signature,
        last_valid_block_height: u64,
    ) -> Result<()> {
        loop {
            let statuses = self
                .client
                .get_signature_statuses(&[*signature])
                .await
                .context("get_signature_statuses failed")?;

            if let Some(Some(status)) = statuses.value.first() {
                if let Some(err) = &status.err {
                    bail!("transaction failed on chain: {:?}", err);
                }
                if status.satisfies_commitment(CommitmentConfig::confirmed()) {
                    debug!("✅ Confirmed {}", signature);
                    return Ok(());
                }
            }

            let block_height = self
                .client
                .get_block_height()
                .await
                .context("get_block_height failed")?;
            if block_height > last_valid_block_height {
                bail!(
                    "blockhash expired: block height {} exceeded last valid {}",
                    block_height,
                    last_valid_block_height
                );
            }

            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_classifier::{classify_error, ErrorCode};

    #[test]
    fn ata_derivation_is_deterministic() {
        let owner = Pubkey::new_unique();
        let mint = Pubkey::new_unique();
        assert_eq!(
            associated_token_address(&owner, &mint),
            associated_token_address(&owner, &mint)
        );
        assert_ne!(
            associated_token_address(&owner, &mint),
            associated_token_address(&mint, &owner)
        );
    }

    #[test]
    fn confirmation_failures_classify_as_retryable() {
        // The error strings emitted above must map onto the retryable side of
        // the taxonomy so jobs requeue instead of dying.
        assert_eq!(
            classify_error("blockhash expired: block height 120 exceeded last valid 100"),
            ErrorCode::BlockhashExpired
        );
        assert_eq!(
            classify_error("confirmation timed out after 30s: blockhash expired for 5Gq..."),
            ErrorCode::BlockhashExpired
        );
    }
}
