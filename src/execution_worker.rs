// Execution worker.
// Claims trade jobs, drives the router three-step lifecycle, and records
// every state transition through the store's execution machine. The inner
// TradeExecutor is shared with the exit queue so triggered sells and manual
// sells take the same code path.

use anyhow::Result;
use serde_json::json;
use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::budget_gate::BudgetGate;
use crate::chain_rpc::BalanceReader;
use crate::config::EngineConfig;
use crate::error_classifier::ErrorCode;
use crate::job_queue::JobQueue;
use crate::models::*;
use crate::store::Store;
use crate::swap_router::{raw_sell_amount, ExecuteOptions, RouterFactory, SwapIntent};
use crate::token_decimals::{fill_price_sol, raw_to_whole, TokenDecimals};
use crate::wallet_vault::{EncryptedKeyMaterial, WalletVault};

/// A failed trade step: taxonomy code plus the raw message.
pub type TradeError = (ErrorCode, String);

fn trade_err<T>(code: ErrorCode, message: impl Into<String>) -> std::result::Result<T, TradeError> {
    Err((code, message.into()))
}

/// Confirmed sell details handed back to the caller for bookkeeping.
#[derive(Debug, Clone)]
pub struct SellOutcome {
    pub execution_id: i64,
    pub tx_sig: String,
    pub sol_out_lamports: u64,
    pub tokens_sold_raw: u64,
    pub exit_price: f64,
}

/// Router-facing trade flows shared by the job worker and the exit queue.
#[derive(Clone)]
pub struct TradeExecutor {
    pub store: Store,
    pub vault: WalletVault,
    pub balances: Arc<dyn BalanceReader>,
    pub decimals: TokenDecimals,
    pub routers: RouterFactory,
    pub confirm_timeout_ms: u64,
}

impl TradeExecutor {
    fn wallet_material(wallet: &Wallet) -> EncryptedKeyMaterial {
        EncryptedKeyMaterial {
            ciphertext: wallet.encrypted_key.clone(),
            nonce: wallet.key_nonce.clone(),
            salt: wallet.key_salt.clone(),
        }
    }

    fn load_wallet(&self, user_id: i64, chain: &str) -> std::result::Result<Wallet, TradeError> {
        match self.store.active_wallet(user_id, chain) {
            Ok(Some(wallet)) => Ok(wallet),
            Ok(None) => trade_err(
                ErrorCode::InvalidAccount,
                format!("no active wallet for user {} on {}", user_id, chain),
            ),
            Err(e) => trade_err(ErrorCode::NetworkError, e.to_string()),
        }
    }

    /// Ensure the execution row is in RESERVED before a new attempt. A
    /// CONFIRMED row means a previous attempt already landed: report it so
    /// the caller can finalize without re-trading (exactly-once).
    pub(crate) fn prepare_execution(
        &self,
        execution_id: i64,
        allow_retry: bool,
    ) -> std::result::Result<Option<Execution>, TradeError> {
        let execution = self
            .store
            .get_execution(execution_id)
            .map_err(|e| (ErrorCode::ProgramError, e.to_string()))?;

        match execution.status {
            ExecutionStatus::Reserved => Ok(None),
            ExecutionStatus::Confirmed => Ok(Some(execution)),
            ExecutionStatus::Failed if allow_retry => {
                // Flip back to RESERVED through the gate's idempotency path.
                let outcome = self
                    .store
                    .reserve_trade_budget(
                        execution.mode,
                        execution.user_id,
                        None,
                        &execution.chain,
                        execution.action,
                        &execution.token_mint,
                        execution.amount_lamports,
                        &execution.idempotency_key,
                        None,
                        true,
                    )
                    .map_err(|e| (ErrorCode::ProgramError, e.to_string()))?;
                if !outcome.allowed {
                    return trade_err(
                        ErrorCode::ProgramError,
                        format!("retry reservation denied: {:?}", outcome.reason),
                    );
                }
                Ok(None)
            }
            ExecutionStatus::Failed => trade_err(
                ErrorCode::ProgramError,
                format!("execution {} already failed terminally", execution_id),
            ),
            ExecutionStatus::Submitted => {
                // A prior attempt is (or was) in flight. Leave it for the
                // stale-execution reaper; retry after it resolves.
                trade_err(
                    ErrorCode::RpcTimeout,
                    format!("execution {} still SUBMITTED from a prior attempt", execution_id),
                )
            }
        }
    }

    /// BUY: quote, build, sign, execute, confirm. Returns
    /// (tx_sig, tokens_out_raw, entry_price) on success.
    pub async fn execute_buy_flow(
        &self,
        execution_id: i64,
        user: &User,
        wallet: &Wallet,
        strategy: &Strategy,
        token_mint: &str,
        amount_lamports: u64,
        bonding_curve: Option<&str>,
    ) -> std::result::Result<(String, u64, f64), TradeError> {
        let user_pubkey = Pubkey::from_str(&wallet.public_address)
            .map_err(|e| (ErrorCode::InvalidAccount, format!("bad wallet address: {}", e)))?;
        let curve_pubkey = match bonding_curve {
            Some(raw) => Some(
                Pubkey::from_str(raw)
                    .map_err(|e| (ErrorCode::InvalidAccount, format!("bad curve pubkey: {}", e)))?,
            ),
            None => None,
        };

        let intent = SwapIntent {
            chain: wallet.chain.clone(),
            token_mint: token_mint.to_string(),
            side: TradeAction::Buy,
            amount: amount_lamports,
            slippage_bps: strategy.slippage_bps,
            user_pubkey,
            bonding_curve: curve_pubkey,
            lifecycle_state: curve_pubkey.map(|_| LifecycleState::PreGraduation),
            position_uuid: None,
        };

        let router = self.routers.select(&intent);
        debug!("🧭 BUY {} via {} router", token_mint, router.name());

        let quote = router
            .quote(&intent)
            .await
            .map_err(|e| classify(&e))?;

        let unsigned = router
            .build_tx(&quote, &intent)
            .await
            .map_err(|e| classify(&e))?;

        self.store
            .update_execution(
                execution_id,
                ExecutionStatus::Submitted,
                None,
                None,
                None,
                None,
                None,
                None,
            )
            .map_err(|e| (ErrorCode::ProgramError, e.to_string()))?;

        let signer = self
            .vault
            .decrypt(&Self::wallet_material(wallet))
            .map_err(|e| (ErrorCode::InvalidAccount, e.to_string()))?;

        let options = ExecuteOptions {
            use_anti_mev: user.use_anti_mev,
            priority_fee_lamports: strategy.priority_fee_lamports,
            confirm_timeout_ms: self.confirm_timeout_ms,
            last_valid_block_height: Some(unsigned.last_valid_block_height()),
        };

        let result = match router.execute(unsigned, &signer, &options).await {
            Ok(result) => result,
            Err(e) => {
                let (code, message) = classify(&e);
                self.store
                    .update_execution(
                        execution_id,
                        ExecutionStatus::Failed,
                        None,
                        None,
                        None,
                        Some(&message),
                        Some(code),
                        None,
                    )
                    .ok();
                return Err((code, message));
            }
        };
        drop(signer);

        if !result.success {
            let code = result.error_code.unwrap_or(ErrorCode::ProgramError);
            let message = result.error.unwrap_or_else(|| "swap failed".to_string());
            self.store
                .update_execution(
                    execution_id,
                    ExecutionStatus::Failed,
                    None,
                    None,
                    None,
                    Some(&message),
                    Some(code),
                    None,
                )
                .ok();
            return Err((code, message));
        }

        let tx_sig = result
            .signature
            .ok_or((ErrorCode::ProgramError, "success without signature".to_string()))?;
        let tokens_out = result.actual_output.unwrap_or(quote.expected_output);
        let decimals = self
            .decimals
            .get(token_mint)
            .await
            .unwrap_or(6);
        let entry_price = fill_price_sol(amount_lamports, tokens_out, decimals);

        self.store
            .update_execution(
                execution_id,
                ExecutionStatus::Confirmed,
                Some(&tx_sig),
                Some(tokens_out),
                Some(entry_price),
                None,
                None,
                Some(&json!({ "router": result.router })),
            )
            .map_err(|e| (ErrorCode::ProgramError, e.to_string()))?;

        Ok((tx_sig, tokens_out, entry_price))
    }

    /// SELL: fetch live balance, apply the sell-percent dust rule, swap, and
    /// confirm. The caller owns position bookkeeping.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_sell_flow(
        &self,
        execution_id: i64,
        user: &User,
        wallet: &Wallet,
        slippage_bps: u16,
        priority_fee_lamports: u64,
        position: &Position,
        sell_percent: f64,
    ) -> std::result::Result<SellOutcome, TradeError> {
        let user_pubkey = Pubkey::from_str(&wallet.public_address)
            .map_err(|e| (ErrorCode::InvalidAccount, format!("bad wallet address: {}", e)))?;
        let mint_pubkey = Pubkey::from_str(&position.token_mint)
            .map_err(|e| (ErrorCode::InvalidAccount, format!("bad mint: {}", e)))?;

        // Raw amount always comes from the live on-chain balance, not the
        // stored position size: airdrops, partial fills, and external
        // transfers all drift.
        let balance_raw = self
            .balances
            .token_balance_raw(&user_pubkey, &mint_pubkey)
            .await
            .map_err(|e| classify(&e))?;
        let amount_raw = raw_sell_amount(balance_raw, sell_percent);
        if amount_raw == 0 {
            return trade_err(
                ErrorCode::InsufficientFunds,
                format!("no token balance to sell for {}", position.token_mint),
            );
        }

        let curve_pubkey = position
            .bonding_curve
            .as_deref()
            .and_then(|raw| Pubkey::from_str(raw).ok());

        let intent = SwapIntent {
            chain: position.chain.clone(),
            token_mint: position.token_mint.clone(),
            side: TradeAction::Sell,
            amount: amount_raw,
            slippage_bps,
            user_pubkey,
            bonding_curve: if position.lifecycle_state == LifecycleState::PreGraduation {
                curve_pubkey
            } else {
                None
            },
            lifecycle_state: Some(position.lifecycle_state),
            position_uuid: Some(position.uuid_id.clone()),
        };

        let router = self.routers.select(&intent);
        debug!(
            "🧭 SELL {} ({}% = {} raw) via {} router",
            position.token_mint,
            sell_percent,
            amount_raw,
            router.name()
        );

        let quote = router.quote(&intent).await.map_err(|e| classify(&e))?;
        let unsigned = router
            .build_tx(&quote, &intent)
            .await
            .map_err(|e| classify(&e))?;

        self.store
            .update_execution(
                execution_id,
                ExecutionStatus::Submitted,
                None,
                None,
                None,
                None,
                None,
                None,
            )
            .map_err(|e| (ErrorCode::ProgramError, e.to_string()))?;

        let signer = self
            .vault
            .decrypt(&Self::wallet_material(wallet))
            .map_err(|e| (ErrorCode::InvalidAccount, e.to_string()))?;

        let options = ExecuteOptions {
            use_anti_mev: user.use_anti_mev,
            priority_fee_lamports,
            confirm_timeout_ms: self.confirm_timeout_ms,
            last_valid_block_height: Some(unsigned.last_valid_block_height()),
        };

        let result = match router.execute(unsigned, &signer, &options).await {
            Ok(result) => result,
            Err(e) => {
                let (code, message) = classify(&e);
                self.store
                    .update_execution(
                        execution_id,
                        ExecutionStatus::Failed,
                        None,
                        None,
                        None,
                        Some(&message),
                        Some(code),
                        None,
                    )
                    .ok();
                return Err((code, message));
            }
        };
        drop(signer);

        if !result.success {
            let code = result.error_code.unwrap_or(ErrorCode::ProgramError);
            let message = result.error.unwrap_or_else(|| "swap failed".to_string());
            self.store
                .update_execution(
                    execution_id,
                    ExecutionStatus::Failed,
                    None,
                    None,
                    None,
                    Some(&message),
                    Some(code),
                    None,
                )
                .ok();
            return Err((code, message));
        }

        let tx_sig = result
            .signature
            .ok_or((ErrorCode::ProgramError, "success without signature".to_string()))?;
        let sol_out = result.actual_output.unwrap_or(quote.expected_output);
        let decimals = self.decimals.get(&position.token_mint).await.unwrap_or(6);
        let tokens_whole = raw_to_whole(amount_raw, decimals);
        let exit_price = if tokens_whole > 0.0 {
            (sol_out as f64 / crate::constants::SOL_DECIMALS as f64) / tokens_whole
        } else {
            0.0
        };

        self.store
            .update_execution(
                execution_id,
                ExecutionStatus::Confirmed,
                Some(&tx_sig),
                Some(sol_out),
                Some(exit_price),
                None,
                None,
                Some(&json!({ "router": result.router })),
            )
            .map_err(|e| (ErrorCode::ProgramError, e.to_string()))?;

        Ok(SellOutcome {
            execution_id,
            tx_sig,
            sol_out_lamports: sol_out,
            tokens_sold_raw: amount_raw,
            exit_price,
        })
    }
}

fn classify(e: &anyhow::Error) -> TradeError {
    let message = e.to_string();
    (crate::error_classifier::classify_error(&message), message)
}

/// Realized pnl for a sold slice against its proportional entry cost.
pub fn realized_pnl(
    sol_out_lamports: u64,
    entry_cost_lamports: u64,
    sold_raw: u64,
    size_raw: u64,
) -> (i64, f64) {
    let proportional_cost = if size_raw > 0 {
        ((entry_cost_lamports as u128 * sold_raw as u128) / size_raw as u128) as u64
    } else {
        entry_cost_lamports
    };
    let pnl = sol_out_lamports as i64 - proportional_cost as i64;
    let percent = if proportional_cost > 0 {
        pnl as f64 / proportional_cost as f64 * 100.0
    } else {
        0.0
    };
    (pnl, percent)
}

// ============================================================================
// JOB WORKER
// ============================================================================

pub struct ExecutionWorker {
    executor: TradeExecutor,
    queue: JobQueue,
    gate: BudgetGate,
    poll_interval: Duration,
    chain: String,
}

impl ExecutionWorker {
    pub fn new(executor: TradeExecutor, queue: JobQueue, gate: BudgetGate, config: &EngineConfig) -> Self {
        Self {
            executor,
            queue,
            gate,
            poll_interval: Duration::from_millis(config.job_poll_interval_ms),
            chain: config.chain.clone(),
        }
    }

    pub async fn run(self, mut stop: watch::Receiver<bool>) -> Result<()> {
        info!(
            "⚙️  Execution worker {} started (poll {:?})",
            self.queue.worker_id(),
            self.poll_interval
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.drain_once().await {
                        error!("❌ Job poll failed: {}", e);
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }

        info!("⚙️  Execution worker {} stopped", self.queue.worker_id());
        Ok(())
    }

    /// Claim one batch and process it to completion. Returns the number of
    /// jobs processed.
    pub async fn drain_once(&self) -> Result<usize> {
        let jobs = self.queue.poll(Some(&self.chain))?;
        let count = jobs.len();
        for job in jobs {
            self.process_job(job).await;
        }
        Ok(count)
    }

    async fn process_job(&self, job: TradeJob) {
        match self.queue.mark_running(job.id) {
            Ok(true) => {}
            Ok(false) => {
                debug!("👋 Job {} lease changed hands before start", job.id);
                return;
            }
            Err(e) => {
                error!("❌ mark_running failed for job {}: {}", job.id, e);
                return;
            }
        }

        // Keep the lease alive while router calls are in flight.
        let _heartbeat = self.queue.spawn_heartbeat(job.id);

        let outcome = match job.action {
            TradeAction::Buy => self.handle_buy(&job).await,
            TradeAction::Sell => self.handle_sell(&job).await,
        };

        match outcome {
            Ok(()) => {
                if let Err(e) = self.queue.finalize(job.id, JobStatus::Done, false, None) {
                    error!("❌ finalize(DONE) failed for job {}: {}", job.id, e);
                }
            }
            Err((code, message)) => {
                let retryable = code.is_retryable();
                match self.queue.finalize(job.id, JobStatus::Failed, retryable, Some(&message)) {
                    Ok(crate::store::FinalizeResult::Requeued) => {
                        debug!("🔁 Job {} requeued after {}: {}", job.id, code.as_str(), message);
                    }
                    Ok(crate::store::FinalizeResult::Terminal) => {
                        // Exactly one user notification per terminal failure.
                        self.notify_failure(&job, code, &message);
                    }
                    Err(e) => error!("❌ finalize(FAILED) failed for job {}: {}", job.id, e),
                }
            }
        }
    }

    async fn handle_buy(&self, job: &TradeJob) -> std::result::Result<(), TradeError> {
        let execution_id = job
            .payload
            .execution_id
            .ok_or((ErrorCode::ProgramError, "BUY job without execution_id".to_string()))?;

        // Exactly-once: a confirmed execution means a prior attempt landed.
        // job.attempts is the claim-time snapshot: >= 1 means a prior attempt
        // ran, so a FAILED execution row may be reused.
        if let Some(done) = self.executor.prepare_execution(execution_id, job.attempts > 0)? {
            info!(
                "↩️  Job {} found execution {} already CONFIRMED ({:?}), skipping re-buy",
                job.id, execution_id, done.tx_sig
            );
            return Ok(());
        }

        let user = self
            .executor
            .store
            .get_user(job.user_id)
            .map_err(|e| (ErrorCode::ProgramError, e.to_string()))?;
        let wallet = self.executor.load_wallet(job.user_id, &job.chain)?;
        let strategy_id = job
            .strategy_id
            .ok_or((ErrorCode::ProgramError, "BUY job without strategy".to_string()))?;
        let strategy = self
            .executor
            .store
            .get_strategy(strategy_id)
            .map_err(|e| (ErrorCode::ProgramError, e.to_string()))?;
        let candidate = match job.candidate_id {
            Some(id) => self.executor.store.get_candidate(id).ok(),
            None => None,
        };

        let (tx_sig, tokens_out, entry_price) = self
            .executor
            .execute_buy_flow(
                execution_id,
                &user,
                &wallet,
                &strategy,
                &job.payload.token_mint,
                job.payload.amount_lamports,
                job.payload.bonding_curve.as_deref(),
            )
            .await?;

        let lifecycle = if job.payload.bonding_curve.is_some() {
            LifecycleState::PreGraduation
        } else {
            LifecycleState::PostGraduation
        };

        let uuid = self
            .executor
            .store
            .insert_position(
                job.user_id,
                &strategy,
                job.candidate_id,
                &job.chain,
                &job.payload.token_mint,
                candidate.as_ref().and_then(|c| c.token_symbol.as_deref()),
                execution_id,
                &tx_sig,
                job.payload.amount_lamports,
                entry_price,
                tokens_out,
                job.payload.bonding_curve.as_deref(),
                candidate.as_ref().and_then(|c| c.initial_liquidity_lamports),
                lifecycle,
            )
            .map_err(|e| (ErrorCode::ProgramError, e.to_string()))?;

        // Post-buy cooldown stops immediate re-entry on the same mint.
        if strategy.cooldown_seconds > 0 {
            let target = format!("{}:{}", job.user_id, job.payload.token_mint);
            self.executor
                .store
                .set_cooldown(&job.chain, CooldownKind::UserMint, &target, strategy.cooldown_seconds, "post-buy")
                .ok();
        }

        let position = self
            .executor
            .store
            .get_position(&uuid)
            .map_err(|e| (ErrorCode::ProgramError, e.to_string()))?;
        let execution = self
            .executor
            .store
            .get_execution(execution_id)
            .map_err(|e| (ErrorCode::ProgramError, e.to_string()))?;

        let kind = match execution.mode {
            ExecutionMode::Auto => NotificationKind::PositionOpened,
            ExecutionMode::Manual => NotificationKind::BuyConfirmed,
        };
        self.executor
            .store
            .enqueue_notification(
                job.user_id,
                kind,
                &json!({
                    "position_uuid": uuid,
                    "token_mint": position.token_mint,
                    "token_symbol": position.token_symbol,
                    "chain": position.chain,
                    "entry_price": entry_price,
                    "size_tokens": tokens_out,
                    "cost_lamports": job.payload.amount_lamports,
                    "tp_price": position.tp_price,
                    "sl_price": position.sl_price,
                    "tx_sig": tx_sig,
                }),
            )
            .ok();

        Ok(())
    }

    async fn handle_sell(&self, job: &TradeJob) -> std::result::Result<(), TradeError> {
        let position_uuid = job
            .payload
            .position_uuid
            .as_deref()
            .ok_or((ErrorCode::ProgramError, "SELL job without position".to_string()))?;
        let position = self
            .executor
            .store
            .get_position(position_uuid)
            .map_err(|e| (ErrorCode::InvalidAccount, e.to_string()))?;
        if position.status == PositionStatus::Closed {
            info!("↩️  Position {} already closed, SELL job is a no-op", position_uuid);
            return Ok(());
        }

        let user = self
            .executor
            .store
            .get_user(job.user_id)
            .map_err(|e| (ErrorCode::ProgramError, e.to_string()))?;
        let wallet = self.executor.load_wallet(job.user_id, &job.chain)?;
        let sell_percent = job.payload.sell_percent.unwrap_or(100.0);

        // Manual sells reserve on demand; jobs from the trigger path carry
        // the execution reserved at claim time.
        let execution_id = match job.payload.execution_id {
            Some(id) => {
                if let Some(done) = self.executor.prepare_execution(id, job.attempts > 0)? {
                    info!(
                        "↩️  SELL execution {} already CONFIRMED ({:?})",
                        id, done.tx_sig
                    );
                    return Ok(());
                }
                id
            }
            None => {
                let outcome = self
                    .gate
                    .reserve(
                        ExecutionMode::Manual,
                        job.user_id,
                        job.strategy_id,
                        &job.chain,
                        TradeAction::Sell,
                        &position.token_mint,
                        0,
                        &job.idempotency_key,
                        None,
                        job.attempts > 0,
                        true,
                    )
                    .map_err(|e| (ErrorCode::ProgramError, e.to_string()))?;
                match outcome.execution_id {
                    Some(id) if outcome.allowed => id,
                    Some(id) => {
                        // Already executed: confirm idempotent completion.
                        if let Some(done) = self.executor.prepare_execution(id, false)? {
                            info!("↩️  SELL already executed: {:?}", done.tx_sig);
                            return Ok(());
                        }
                        id
                    }
                    None => {
                        let code = outcome.code.unwrap_or(ErrorCode::ProgramError);
                        return trade_err(code, outcome.reason.unwrap_or_default());
                    }
                }
            }
        };

        let slippage = user.default_slippage_bps;
        let priority_fee = user.priority_fee_lamports;
        let sell = self
            .executor
            .execute_sell_flow(
                execution_id,
                &user,
                &wallet,
                slippage,
                priority_fee,
                &position,
                sell_percent,
            )
            .await?;

        let (pnl, pnl_percent) = realized_pnl(
            sell.sol_out_lamports,
            position.entry_cost_lamports,
            sell.tokens_sold_raw,
            position.size_tokens.max(sell.tokens_sold_raw),
        );

        if sell_percent >= crate::constants::DUST_SELL_PERCENT {
            self.executor
                .store
                .close_position(
                    position_uuid,
                    execution_id,
                    &sell.tx_sig,
                    sell.exit_price,
                    pnl,
                    pnl_percent,
                    false,
                )
                .map_err(|e| (ErrorCode::ProgramError, e.to_string()))?;
        } else {
            let proportional = (position.entry_cost_lamports as u128
                * sell.tokens_sold_raw as u128
                / position.size_tokens.max(1) as u128) as u64;
            self.executor
                .store
                .shrink_position(position_uuid, sell.tokens_sold_raw, proportional)
                .map_err(|e| (ErrorCode::ProgramError, e.to_string()))?;
        }

        self.executor
            .store
            .enqueue_notification(
                job.user_id,
                NotificationKind::SellConfirmed,
                &json!({
                    "position_uuid": position_uuid,
                    "token_mint": position.token_mint,
                    "token_symbol": position.token_symbol,
                    "chain": position.chain,
                    "sell_percent": sell_percent,
                    "sol_out_lamports": sell.sol_out_lamports,
                    "exit_price": sell.exit_price,
                    "realized_pnl_lamports": pnl,
                    "realized_pnl_percent": pnl_percent,
                    "tx_sig": sell.tx_sig,
                }),
            )
            .ok();

        Ok(())
    }

    fn notify_failure(&self, job: &TradeJob, code: ErrorCode, message: &str) {
        warn!(
            "💥 Job {} terminally failed ({}): {}",
            job.id,
            code.as_str(),
            message
        );
        let kind = match job.action {
            TradeAction::Buy => NotificationKind::BuyFailed,
            TradeAction::Sell => NotificationKind::SellFailed,
        };
        self.executor
            .store
            .enqueue_notification(
                job.user_id,
                kind,
                &json!({
                    "token_mint": job.payload.token_mint,
                    "chain": job.chain,
                    "error_code": code.as_str(),
                    "message": code.user_message(),
                }),
            )
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realized_pnl_is_proportional() {
        // Sold half the position for 40M lamports against a 50M entry.
        let (pnl, percent) = realized_pnl(40_000_000, 50_000_000, 500, 1_000);
        assert_eq!(pnl, 15_000_000);
        assert!((percent - 60.0).abs() < 1e-9);
    }

    #[test]
    fn realized_pnl_handles_full_and_zero_sizes() {
        let (pnl, percent) = realized_pnl(30_000_000, 50_000_000, 1_000, 1_000);
        assert_eq!(pnl, -20_000_000);
        assert!(percent < 0.0);

        let (pnl, _) = realized_pnl(10, 0, 5, 0);
        assert_eq!(pnl, 10);
    }
}
