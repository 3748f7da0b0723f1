// Store Module
// Durable state and the atomic coordination primitives every worker shares.
// All cross-worker synchronization happens here: claims, leases, the trigger
// CAS, and the unique constraints that act as locks.

use anyhow::{bail, Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error_classifier::ErrorCode;
use crate::models::*;

/// Shared store handle. rusqlite connections are not Sync, so the single
/// connection sits behind a std Mutex; transactions run `BEGIN IMMEDIATE` so a
/// claim is single-writer for its whole duration (the SQLite equivalent of
/// `FOR UPDATE SKIP LOCKED` on a one-writer database).
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

/// Result of `reserve_trade_budget`.
#[derive(Debug, Clone)]
pub struct ReserveOutcome {
    pub allowed: bool,
    pub execution_id: Option<i64>,
    pub reason: Option<String>,
    pub code: Option<ErrorCode>,
}

impl ReserveOutcome {
    fn denied(code: ErrorCode, reason: &str) -> Self {
        Self {
            allowed: false,
            execution_id: None,
            reason: Some(reason.to_string()),
            code: Some(code),
        }
    }
}

/// Result of `finalize_job`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeResult {
    Requeued,
    Terminal,
}

/// Result of the trigger CAS.
#[derive(Debug, Clone)]
pub struct TriggerClaim {
    pub triggered: bool,
    pub reason: Option<String>,
}

impl Store {
    /// Open (or create) the store at `db_path` and apply the schema.
    pub fn open(db_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent).context("Failed to create data directory")?;
        }

        let conn = Connection::open(db_path).context("Failed to open database")?;
        Self::init(conn, db_path)
    }

    /// In-memory store, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn, ":memory:")
    }

    fn init(conn: Connection, label: &str) -> Result<Self> {
        conn.execute_batch(include_str!("../schema.sql"))
            .context("Failed to initialize database schema")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        info!("✅ Store initialized: {}", label);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Startup readiness probe.
    pub fn health_check(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .context("Store health check failed")?;
        Ok(())
    }

    // ========================================================================
    // USERS / WALLETS / STRATEGIES
    // ========================================================================

    pub fn get_or_create_user(&self, chat_id: &str) -> Result<User> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO users (chat_id, created_at) VALUES (?1, ?2)",
            params![chat_id, now_ts()],
        )?;
        let user = conn.query_row(
            "SELECT id, chat_id, default_slippage_bps, priority_fee_lamports, use_anti_mev, created_at
             FROM users WHERE chat_id = ?1",
            params![chat_id],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    chat_id: row.get(1)?,
                    default_slippage_bps: row.get::<_, i64>(2)? as u16,
                    priority_fee_lamports: row.get::<_, i64>(3)? as u64,
                    use_anti_mev: row.get::<_, i64>(4)? != 0,
                    created_at: row.get(5)?,
                })
            },
        )?;
        Ok(user)
    }

    pub fn get_user(&self, user_id: i64) -> Result<User> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, chat_id, default_slippage_bps, priority_fee_lamports, use_anti_mev, created_at
             FROM users WHERE id = ?1",
            params![user_id],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    chat_id: row.get(1)?,
                    default_slippage_bps: row.get::<_, i64>(2)? as u16,
                    priority_fee_lamports: row.get::<_, i64>(3)? as u64,
                    use_anti_mev: row.get::<_, i64>(4)? != 0,
                    created_at: row.get(5)?,
                })
            },
        )
        .with_context(|| format!("User {} not found", user_id))
    }

    /// Create a wallet. The first wallet on a chain becomes active.
    pub fn create_wallet(
        &self,
        user_id: i64,
        chain: &str,
        wallet_index: u8,
        label: &str,
        public_address: &str,
        encrypted_key: &str,
        key_nonce: &str,
        key_salt: &str,
    ) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: i64 = tx.query_row(
            "SELECT COUNT(*) FROM wallets WHERE user_id = ?1 AND chain = ?2",
            params![user_id, chain],
            |row| row.get(0),
        )?;
        let is_active = existing == 0;

        tx.execute(
            "INSERT INTO wallets
                (user_id, chain, wallet_index, label, is_active, public_address,
                 encrypted_key, key_nonce, key_salt, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                user_id,
                chain,
                wallet_index as i64,
                label,
                is_active as i64,
                public_address,
                encrypted_key,
                key_nonce,
                key_salt,
                now_ts(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    pub fn active_wallet(&self, user_id: i64, chain: &str) -> Result<Option<Wallet>> {
        let conn = self.conn.lock().unwrap();
        let wallet = conn
            .query_row(
                "SELECT id, user_id, chain, wallet_index, label, is_active, public_address,
                        encrypted_key, key_nonce, key_salt, created_at
                 FROM wallets WHERE user_id = ?1 AND chain = ?2 AND is_active = 1",
                params![user_id, chain],
                row_to_wallet,
            )
            .optional()?;
        Ok(wallet)
    }

    /// Switch the active wallet for (user, chain) atomically.
    pub fn set_active_wallet(&self, user_id: i64, chain: &str, wallet_id: i64) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE wallets SET is_active = 0 WHERE user_id = ?1 AND chain = ?2",
            params![user_id, chain],
        )?;
        let changed = tx.execute(
            "UPDATE wallets SET is_active = 1 WHERE id = ?1 AND user_id = ?2 AND chain = ?3",
            params![wallet_id, user_id, chain],
        )?;
        if changed == 0 {
            bail!("Wallet {} not found for user {} on {}", wallet_id, user_id, chain);
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete a wallet. Deleting the only wallet on a chain is forbidden;
    /// deleting the active wallet promotes the lowest-index survivor.
    pub fn delete_wallet(&self, user_id: i64, chain: &str, wallet_id: i64) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let total: i64 = tx.query_row(
            "SELECT COUNT(*) FROM wallets WHERE user_id = ?1 AND chain = ?2",
            params![user_id, chain],
            |row| row.get(0),
        )?;
        if total <= 1 {
            bail!("Cannot delete the only wallet on {}", chain);
        }

        let was_active: i64 = tx
            .query_row(
                "SELECT is_active FROM wallets WHERE id = ?1 AND user_id = ?2 AND chain = ?3",
                params![wallet_id, user_id, chain],
                |row| row.get(0),
            )
            .optional()?
            .with_context(|| format!("Wallet {} not found", wallet_id))?;

        tx.execute("DELETE FROM wallets WHERE id = ?1", params![wallet_id])?;

        if was_active != 0 {
            tx.execute(
                "UPDATE wallets SET is_active = 1
                 WHERE id = (SELECT id FROM wallets
                             WHERE user_id = ?1 AND chain = ?2
                             ORDER BY wallet_index LIMIT 1)",
                params![user_id, chain],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Upsert the one strategy per (user, kind, chain).
    pub fn upsert_strategy(&self, s: &Strategy) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO strategies
                (user_id, kind, chain, enabled, auto_execute, risk_profile, max_positions,
                 per_trade_cap_lamports, daily_cap_lamports, max_open_exposure_lamports,
                 slippage_bps, priority_fee_lamports, take_profit_percent, stop_loss_percent,
                 max_hold_minutes, trailing_enabled, trail_activation_percent,
                 trail_distance_percent, moon_bag_percent, min_score, launchpad_allowlist,
                 cooldown_seconds, token_allowlist, token_denylist, snipe_mode, filter_mode,
                 updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27)
             ON CONFLICT (user_id, kind, chain) DO UPDATE SET
                 enabled = excluded.enabled,
                 auto_execute = excluded.auto_execute,
                 risk_profile = excluded.risk_profile,
                 max_positions = excluded.max_positions,
                 per_trade_cap_lamports = excluded.per_trade_cap_lamports,
                 daily_cap_lamports = excluded.daily_cap_lamports,
                 max_open_exposure_lamports = excluded.max_open_exposure_lamports,
                 slippage_bps = excluded.slippage_bps,
                 priority_fee_lamports = excluded.priority_fee_lamports,
                 take_profit_percent = excluded.take_profit_percent,
                 stop_loss_percent = excluded.stop_loss_percent,
                 max_hold_minutes = excluded.max_hold_minutes,
                 trailing_enabled = excluded.trailing_enabled,
                 trail_activation_percent = excluded.trail_activation_percent,
                 trail_distance_percent = excluded.trail_distance_percent,
                 moon_bag_percent = excluded.moon_bag_percent,
                 min_score = excluded.min_score,
                 launchpad_allowlist = excluded.launchpad_allowlist,
                 cooldown_seconds = excluded.cooldown_seconds,
                 token_allowlist = excluded.token_allowlist,
                 token_denylist = excluded.token_denylist,
                 snipe_mode = excluded.snipe_mode,
                 filter_mode = excluded.filter_mode,
                 updated_at = excluded.updated_at",
            params![
                s.user_id,
                s.kind.as_str(),
                s.chain,
                s.enabled as i64,
                s.auto_execute as i64,
                s.risk_profile,
                s.max_positions as i64,
                s.per_trade_cap_lamports as i64,
                s.daily_cap_lamports as i64,
                s.max_open_exposure_lamports as i64,
                s.slippage_bps as i64,
                s.priority_fee_lamports as i64,
                s.take_profit_percent,
                s.stop_loss_percent,
                s.max_hold_minutes as i64,
                s.trailing_enabled as i64,
                s.trail_activation_percent,
                s.trail_distance_percent,
                s.moon_bag_percent,
                s.min_score,
                s.launchpad_allowlist.as_ref().map(|v| v.join(",")),
                s.cooldown_seconds as i64,
                s.token_allowlist.as_ref().map(|v| v.join(",")),
                s.token_denylist.as_ref().map(|v| v.join(",")),
                s.snipe_mode,
                s.filter_mode,
                now_ts(),
            ],
        )?;
        let id = conn.query_row(
            "SELECT id FROM strategies WHERE user_id = ?1 AND kind = ?2 AND chain = ?3",
            params![s.user_id, s.kind.as_str(), s.chain],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_strategy(&self, strategy_id: i64) -> Result<Strategy> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("{} WHERE id = ?1", STRATEGY_SELECT),
            params![strategy_id],
            row_to_strategy,
        )
        .with_context(|| format!("Strategy {} not found", strategy_id))
    }

    /// Enabled AUTO strategies with auto_execute on this chain, i.e. the users
    /// the candidate consumer evaluates.
    pub fn active_auto_strategies(&self, chain: &str) -> Result<Vec<Strategy>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE kind = 'AUTO' AND chain = ?1 AND enabled = 1 AND auto_execute = 1",
            STRATEGY_SELECT
        ))?;
        let rows = stmt
            .query_map(params![chain], row_to_strategy)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ========================================================================
    // SAFETY CONTROLS / COOLDOWNS
    // ========================================================================

    pub fn safety_controls(&self) -> Result<SafetyControls> {
        let conn = self.conn.lock().unwrap();
        let row = conn.query_row(
            "SELECT trading_paused, circuit_open_until FROM safety_controls WHERE scope = 'GLOBAL'",
            [],
            |row| {
                Ok(SafetyControls {
                    trading_paused: row.get::<_, i64>(0)? != 0,
                    circuit_open_until: row.get(1)?,
                })
            },
        )?;
        Ok(row)
    }

    pub fn set_trading_paused(&self, paused: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE safety_controls SET trading_paused = ?1, updated_at = ?2 WHERE scope = 'GLOBAL'",
            params![paused as i64, now_ts()],
        )?;
        warn!("🛑 Trading paused = {}", paused);
        Ok(())
    }

    pub fn open_circuit(&self, seconds: u64) -> Result<()> {
        let until = fmt_ts(Utc::now() + ChronoDuration::seconds(seconds as i64));
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE safety_controls SET circuit_open_until = ?1, updated_at = ?2 WHERE scope = 'GLOBAL'",
            params![until, now_ts()],
        )?;
        warn!("🚨 Circuit OPEN until {}", until);
        Ok(())
    }

    pub fn set_cooldown(
        &self,
        chain: &str,
        kind: CooldownKind,
        target: &str,
        seconds: u64,
        reason: &str,
    ) -> Result<()> {
        let until = fmt_ts(Utc::now() + ChronoDuration::seconds(seconds as i64));
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO cooldowns (chain, kind, target, cooldown_until, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (chain, kind, target) DO UPDATE SET
                 cooldown_until = excluded.cooldown_until,
                 reason = excluded.reason",
            params![chain, kind.as_str(), target, until, reason, now_ts()],
        )?;
        debug!("⏳ Cooldown set: {} {} {} for {}s", chain, kind.as_str(), target, seconds);
        Ok(())
    }

    pub fn cooldown_active(&self, chain: &str, kind: CooldownKind, target: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let active: Option<String> = conn
            .query_row(
                "SELECT cooldown_until FROM cooldowns
                 WHERE chain = ?1 AND kind = ?2 AND target = ?3 AND cooldown_until > ?4",
                params![chain, kind.as_str(), target, now_ts()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(active.is_some())
    }

    // ========================================================================
    // RESERVE TRADE BUDGET (the budget & safety gate's one RPC)
    // ========================================================================

    /// One transaction that enforces execution idempotency, global pause /
    /// circuit state, strategy caps, and cooldowns, then inserts the
    /// `RESERVED` execution row that anchors everything downstream.
    #[allow(clippy::too_many_arguments)]
    pub fn reserve_trade_budget(
        &self,
        mode: ExecutionMode,
        user_id: i64,
        strategy_id: Option<i64>,
        chain: &str,
        action: TradeAction,
        token_mint: &str,
        amount_lamports: u64,
        idempotency_key: &str,
        deployer: Option<&str>,
        allow_retry: bool,
    ) -> Result<ReserveOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_ts();

        // (a) Execution idempotency.
        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, status FROM executions WHERE idempotency_key = ?1",
                params![idempotency_key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((execution_id, status)) = existing {
            let status = ExecutionStatus::parse(&status)
                .with_context(|| format!("Corrupt execution status: {}", status))?;
            if status == ExecutionStatus::Failed && allow_retry {
                tx.execute(
                    "UPDATE executions SET status = 'RESERVED', error = NULL, error_code = NULL,
                            amount_lamports = ?2, updated_at = ?3
                     WHERE id = ?1",
                    params![execution_id, amount_lamports as i64, now],
                )?;
                tx.commit()?;
                debug!("♻️  Reusing failed execution {} for retry", execution_id);
                return Ok(ReserveOutcome {
                    allowed: true,
                    execution_id: Some(execution_id),
                    reason: None,
                    code: None,
                });
            }
            tx.commit()?;
            return Ok(ReserveOutcome {
                allowed: false,
                execution_id: Some(execution_id),
                reason: Some("Already executed".to_string()),
                code: None,
            });
        }

        // (b) Global safety state.
        let (paused, circuit_until): (i64, Option<String>) = tx.query_row(
            "SELECT trading_paused, circuit_open_until FROM safety_controls WHERE scope = 'GLOBAL'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if paused != 0 {
            tx.commit()?;
            return Ok(ReserveOutcome::denied(ErrorCode::TradingPaused, "trading_paused"));
        }
        if let Some(until) = circuit_until {
            if until > now {
                tx.commit()?;
                return Ok(ReserveOutcome::denied(ErrorCode::CircuitOpen, "circuit_open"));
            }
        }

        // (c) Strategy caps, BUY only: sells reduce exposure.
        if action == TradeAction::Buy {
            if let Some(strategy_id) = strategy_id {
                let caps: Option<(i64, i64, i64, i64)> = tx
                    .query_row(
                        "SELECT max_positions, per_trade_cap_lamports, daily_cap_lamports,
                                max_open_exposure_lamports
                         FROM strategies WHERE id = ?1",
                        params![strategy_id],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                    )
                    .optional()?;
                let (max_positions, per_trade_cap, daily_cap, exposure_cap) =
                    caps.with_context(|| format!("Strategy {} not found", strategy_id))?;

                if amount_lamports as i64 > per_trade_cap {
                    tx.commit()?;
                    return Ok(ReserveOutcome::denied(ErrorCode::BudgetExceeded, "cap_exceeded"));
                }

                let open_positions: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM positions
                     WHERE strategy_id = ?1 AND status != 'CLOSED'",
                    params![strategy_id],
                    |row| row.get(0),
                )?;
                if open_positions >= max_positions {
                    tx.commit()?;
                    return Ok(ReserveOutcome::denied(ErrorCode::BudgetExceeded, "cap_exceeded"));
                }

                let open_exposure: i64 = tx.query_row(
                    "SELECT COALESCE(SUM(entry_cost_lamports), 0) FROM positions
                     WHERE user_id = ?1 AND chain = ?2 AND status != 'CLOSED'",
                    params![user_id, chain],
                    |row| row.get(0),
                )?;
                if open_exposure + amount_lamports as i64 > exposure_cap {
                    tx.commit()?;
                    return Ok(ReserveOutcome::denied(ErrorCode::BudgetExceeded, "cap_exceeded"));
                }

                let day_start = fmt_ts(
                    Utc::now()
                        .date_naive()
                        .and_hms_opt(0, 0, 0)
                        .expect("midnight is valid")
                        .and_utc(),
                );
                let daily_spend: i64 = tx.query_row(
                    "SELECT COALESCE(SUM(amount_lamports), 0) FROM executions
                     WHERE user_id = ?1 AND chain = ?2 AND action = 'BUY'
                       AND status != 'FAILED' AND created_at >= ?3",
                    params![user_id, chain, day_start],
                    |row| row.get(0),
                )?;
                if daily_spend + amount_lamports as i64 > daily_cap {
                    tx.commit()?;
                    return Ok(ReserveOutcome::denied(ErrorCode::BudgetExceeded, "cap_exceeded"));
                }
            }

            // (d) Cooldowns: mint, (user, mint) pair, deployer.
            let user_mint = format!("{}:{}", user_id, token_mint);
            let mut cooldown_hit = tx
                .query_row(
                    "SELECT 1 FROM cooldowns
                     WHERE chain = ?1 AND cooldown_until > ?2
                       AND ((kind = 'MINT' AND target = ?3)
                         OR (kind = 'USER_MINT' AND target = ?4))
                     LIMIT 1",
                    params![chain, now, token_mint, user_mint],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !cooldown_hit {
                if let Some(deployer) = deployer {
                    cooldown_hit = tx
                        .query_row(
                            "SELECT 1 FROM cooldowns
                             WHERE chain = ?1 AND kind = 'DEPLOYER' AND target = ?2
                               AND cooldown_until > ?3",
                            params![chain, deployer, now],
                            |_| Ok(()),
                        )
                        .optional()?
                        .is_some();
                }
            }
            if cooldown_hit {
                tx.commit()?;
                return Ok(ReserveOutcome::denied(ErrorCode::CooldownActive, "cooldown"));
            }
        }

        // (e) Reserve.
        tx.execute(
            "INSERT INTO executions
                (idempotency_key, user_id, chain, token_mint, action, mode, status,
                 amount_lamports, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'RESERVED', ?7, ?8, ?8)",
            params![
                idempotency_key,
                user_id,
                chain,
                token_mint,
                action.as_str(),
                mode.as_str(),
                amount_lamports as i64,
                now,
            ],
        )?;
        let execution_id = tx.last_insert_rowid();
        tx.commit()?;

        debug!(
            "💰 Budget reserved: execution {} ({} {} {} lamports)",
            execution_id,
            action.as_str(),
            token_mint,
            amount_lamports
        );

        Ok(ReserveOutcome {
            allowed: true,
            execution_id: Some(execution_id),
            reason: None,
            code: None,
        })
    }

    // ========================================================================
    // TRADE JOBS
    // ========================================================================

    /// Insert a job; a duplicate idempotency key returns the existing row.
    /// The bool is true when a new row was created.
    pub fn enqueue_job(
        &self,
        strategy_id: Option<i64>,
        user_id: i64,
        chain: &str,
        action: TradeAction,
        candidate_id: Option<i64>,
        priority: i64,
        payload: &JobPayload,
        idempotency_key: &str,
        max_attempts: u32,
    ) -> Result<(TradeJob, bool)> {
        let conn = self.conn.lock().unwrap();
        let now = now_ts();
        let inserted = conn.execute(
            "INSERT INTO trade_jobs
                (strategy_id, user_id, chain, action, candidate_id, priority, payload,
                 idempotency_key, status, max_attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'PENDING', ?9, ?10, ?10)
             ON CONFLICT (idempotency_key) DO NOTHING",
            params![
                strategy_id,
                user_id,
                chain,
                action.as_str(),
                candidate_id,
                priority,
                serde_json::to_string(payload)?,
                idempotency_key,
                max_attempts as i64,
                now,
            ],
        )?;
        let job = conn.query_row(
            &format!("{} WHERE idempotency_key = ?1", JOB_SELECT),
            params![idempotency_key],
            row_to_job,
        )?;
        Ok((job, inserted > 0))
    }

    /// Claim up to `limit` pending jobs with absent or expired leases,
    /// ordered by priority then age, writing the caller's lease in the same
    /// transaction.
    pub fn claim_trade_jobs(
        &self,
        worker_id: &str,
        limit: usize,
        lease_seconds: u64,
        chain: Option<&str>,
    ) -> Result<Vec<TradeJob>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_ts();
        let lease = fmt_ts(Utc::now() + ChronoDuration::seconds(lease_seconds as i64));

        let ids: Vec<i64> = {
            let (sql, chain_filter) = match chain {
                Some(_) => (
                    format!(
                        "SELECT id FROM trade_jobs
                         WHERE status = 'PENDING'
                           AND (lease_expires_at IS NULL OR lease_expires_at <= ?1)
                           AND (next_available_at IS NULL OR next_available_at <= ?1)
                           AND chain = ?2
                         ORDER BY priority, created_at LIMIT {}",
                        limit
                    ),
                    true,
                ),
                None => (
                    format!(
                        "SELECT id FROM trade_jobs
                         WHERE status = 'PENDING'
                           AND (lease_expires_at IS NULL OR lease_expires_at <= ?1)
                           AND (next_available_at IS NULL OR next_available_at <= ?1)
                         ORDER BY priority, created_at LIMIT {}",
                        limit
                    ),
                    false,
                ),
            };
            let mut stmt = tx.prepare(&sql)?;
            let mapped = if chain_filter {
                stmt.query_map(params![now, chain.unwrap()], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<i64>, _>>()?
            } else {
                stmt.query_map(params![now], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<i64>, _>>()?
            };
            mapped
        };

        let mut claimed = Vec::with_capacity(ids.len());
        for id in &ids {
            tx.execute(
                "UPDATE trade_jobs SET worker_id = ?1, lease_expires_at = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![worker_id, lease, now, id],
            )?;
        }
        for id in &ids {
            let job = tx.query_row(&format!("{} WHERE id = ?1", JOB_SELECT), params![id], row_to_job)?;
            claimed.push(job);
        }
        tx.commit()?;

        if !claimed.is_empty() {
            debug!("📋 {} claimed {} job(s)", worker_id, claimed.len());
        }
        Ok(claimed)
    }

    /// Transition a claimed job to RUNNING, bumping attempts. Returns false if
    /// the lease changed hands.
    pub fn mark_job_running(&self, job_id: i64, worker_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE trade_jobs SET status = 'RUNNING', attempts = attempts + 1, updated_at = ?1
             WHERE id = ?2 AND worker_id = ?3 AND status = 'PENDING'
               AND lease_expires_at > ?1",
            params![now_ts(), job_id, worker_id],
        )?;
        Ok(changed == 1)
    }

    /// Heartbeat. No-op when the lease no longer belongs to the caller.
    pub fn extend_lease(&self, job_id: i64, worker_id: &str, seconds: u64) -> Result<bool> {
        let lease = fmt_ts(Utc::now() + ChronoDuration::seconds(seconds as i64));
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE trade_jobs SET lease_expires_at = ?1, updated_at = ?2
             WHERE id = ?3 AND worker_id = ?4 AND status IN ('PENDING', 'RUNNING')",
            params![lease, now_ts(), job_id, worker_id],
        )?;
        Ok(changed == 1)
    }

    /// Terminal transition. A retryable failure below max_attempts re-enqueues
    /// as PENDING with a cleared lease and exponential next_available_at.
    pub fn finalize_job(
        &self,
        job_id: i64,
        worker_id: &str,
        status: JobStatus,
        retryable: bool,
        error: Option<&str>,
    ) -> Result<FinalizeResult> {
        if !matches!(status, JobStatus::Done | JobStatus::Failed | JobStatus::Canceled) {
            bail!("finalize_job requires a terminal status, got {}", status.as_str());
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_ts();

        let row: Option<(u32, u32)> = tx
            .query_row(
                "SELECT attempts, max_attempts FROM trade_jobs
                 WHERE id = ?1 AND worker_id = ?2",
                params![job_id, worker_id],
                |row| Ok((row.get::<_, i64>(0)? as u32, row.get::<_, i64>(1)? as u32)),
            )
            .optional()?;
        let Some((attempts, max_attempts)) = row else {
            tx.commit()?;
            warn!("⚠️  finalize_job: job {} no longer owned by {}", job_id, worker_id);
            return Ok(FinalizeResult::Terminal);
        };

        if status == JobStatus::Failed && retryable && attempts < max_attempts {
            let backoff_secs = 2u64.saturating_pow(attempts.min(6)).min(60);
            let next = fmt_ts(Utc::now() + ChronoDuration::seconds(backoff_secs as i64));
            tx.execute(
                "UPDATE trade_jobs SET status = 'PENDING', worker_id = NULL,
                        lease_expires_at = NULL, next_available_at = ?1,
                        last_error = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![next, error, now, job_id],
            )?;
            tx.commit()?;
            debug!("🔁 Job {} requeued (attempt {}/{}, backoff {}s)", job_id, attempts, max_attempts, backoff_secs);
            return Ok(FinalizeResult::Requeued);
        }

        tx.execute(
            "UPDATE trade_jobs SET status = ?1, worker_id = NULL, lease_expires_at = NULL,
                    last_error = ?2, updated_at = ?3
             WHERE id = ?4",
            params![status.as_str(), error, now, job_id],
        )?;
        tx.commit()?;
        Ok(FinalizeResult::Terminal)
    }

    pub fn get_job(&self, job_id: i64) -> Result<TradeJob> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(&format!("{} WHERE id = ?1", JOB_SELECT), params![job_id], row_to_job)
            .with_context(|| format!("Job {} not found", job_id))
    }

    // ========================================================================
    // EXECUTIONS
    // ========================================================================

    /// Strict state machine: RESERVED -> SUBMITTED -> {CONFIRMED|FAILED}.
    /// CONFIRMED requires a tx signature (uniqueness enforced by the schema).
    #[allow(clippy::too_many_arguments)]
    pub fn update_execution(
        &self,
        execution_id: i64,
        status: ExecutionStatus,
        tx_sig: Option<&str>,
        tokens_out: Option<u64>,
        price_per_token: Option<f64>,
        error: Option<&str>,
        error_code: Option<ErrorCode>,
        result: Option<&serde_json::Value>,
    ) -> Result<()> {
        if status == ExecutionStatus::Confirmed && tx_sig.is_none() {
            bail!("CONFIRMED execution requires a tx_sig");
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: String = tx
            .query_row(
                "SELECT status FROM executions WHERE id = ?1",
                params![execution_id],
                |row| row.get(0),
            )
            .optional()?
            .with_context(|| format!("Execution {} not found", execution_id))?;
        let current = ExecutionStatus::parse(&current)
            .with_context(|| format!("Corrupt execution status: {}", current))?;

        if !current.can_transition_to(status) {
            bail!(
                "Invalid execution transition {} -> {} for execution {}",
                current.as_str(),
                status.as_str(),
                execution_id
            );
        }

        tx.execute(
            "UPDATE executions SET
                status = ?1,
                tx_sig = COALESCE(?2, tx_sig),
                tokens_out = COALESCE(?3, tokens_out),
                price_per_token = COALESCE(?4, price_per_token),
                error = ?5,
                error_code = ?6,
                result = COALESCE(?7, result),
                updated_at = ?8
             WHERE id = ?9",
            params![
                status.as_str(),
                tx_sig,
                tokens_out.map(|v| v as i64),
                price_per_token,
                error,
                error_code.map(|c| c.as_str()),
                result.map(|v| v.to_string()),
                now_ts(),
                execution_id,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_execution(&self, execution_id: i64) -> Result<Execution> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("{} WHERE id = ?1", EXECUTION_SELECT),
            params![execution_id],
            row_to_execution,
        )
        .with_context(|| format!("Execution {} not found", execution_id))
    }

    pub fn get_execution_by_key(&self, idempotency_key: &str) -> Result<Option<Execution>> {
        let conn = self.conn.lock().unwrap();
        let execution = conn
            .query_row(
                &format!("{} WHERE idempotency_key = ?1", EXECUTION_SELECT),
                params![idempotency_key],
                row_to_execution,
            )
            .optional()?;
        Ok(execution)
    }

    /// RESERVED/SUBMITTED rows older than `minutes` with no confirmation are
    /// failed with an RPC_TIMEOUT code. Returns the number transitioned.
    pub fn cleanup_stale_executions(&self, minutes: i64) -> Result<usize> {
        let cutoff = fmt_ts(Utc::now() - ChronoDuration::minutes(minutes));
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE executions SET status = 'FAILED',
                    error = 'stale execution reaped by maintenance',
                    error_code = ?1, updated_at = ?2
             WHERE status IN ('RESERVED', 'SUBMITTED') AND updated_at < ?3",
            params![ErrorCode::RpcTimeout.as_str(), now_ts(), cutoff],
        )?;
        if changed > 0 {
            info!("🧹 Reaped {} stale execution(s)", changed);
        }
        Ok(changed)
    }

    // ========================================================================
    // POSITIONS
    // ========================================================================

    /// Create a position in MONITORING. tp/sl/trail activation prices are
    /// computed here once and never recomputed afterwards.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_position(
        &self,
        user_id: i64,
        strategy: &Strategy,
        candidate_id: Option<i64>,
        chain: &str,
        token_mint: &str,
        token_symbol: Option<&str>,
        entry_execution_id: i64,
        entry_tx_sig: &str,
        entry_cost_lamports: u64,
        entry_price: f64,
        size_tokens: u64,
        bonding_curve: Option<&str>,
        entry_mc_lamports: Option<u64>,
        lifecycle_state: LifecycleState,
    ) -> Result<String> {
        let uuid_id = Uuid::new_v4().to_string();
        let tp_price = entry_price * (1.0 + strategy.take_profit_percent / 100.0);
        let sl_price = entry_price * (1.0 - strategy.stop_loss_percent / 100.0);
        let trail_activation_price = if strategy.trailing_enabled {
            Some(entry_price * (1.0 + strategy.trail_activation_percent / 100.0))
        } else {
            None
        };

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO positions
                (uuid_id, user_id, strategy_id, candidate_id, chain, token_mint, token_symbol,
                 entry_execution_id, entry_tx_sig, entry_cost_lamports, entry_price,
                 size_tokens, current_price, peak_price, tp_price, sl_price,
                 trail_activation_price, trail_distance_percent, moon_bag_percent,
                 max_hold_minutes, bonding_curve, entry_mc_lamports, lifecycle_state,
                 status, trigger_state, opened_at, price_updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?11, ?11, ?13, ?14,
                     ?15, ?16, ?17, ?18, ?19, ?20, ?21, 'ACTIVE', 'MONITORING', ?22, ?22)",
            params![
                uuid_id,
                user_id,
                strategy.id,
                candidate_id,
                chain,
                token_mint,
                token_symbol,
                entry_execution_id,
                entry_tx_sig,
                entry_cost_lamports as i64,
                entry_price,
                size_tokens as i64,
                tp_price,
                sl_price,
                trail_activation_price,
                if strategy.trailing_enabled { Some(strategy.trail_distance_percent) } else { None },
                strategy.moon_bag_percent,
                strategy.max_hold_minutes as i64,
                bonding_curve,
                entry_mc_lamports.map(|v| v as i64),
                lifecycle_state.as_str(),
                now_ts(),
            ],
        )?;

        info!(
            "📈 Position opened: {} {} tp={:.12} sl={:.12}",
            uuid_id, token_mint, tp_price, sl_price
        );
        Ok(uuid_id)
    }

    pub fn get_position(&self, uuid_id: &str) -> Result<Position> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("{} WHERE uuid_id = ?1", POSITION_SELECT),
            params![uuid_id],
            row_to_position,
        )
        .with_context(|| format!("Position {} not found", uuid_id))
    }

    /// Positions the monitor should watch: open and observable.
    pub fn watchable_positions(&self) -> Result<Vec<Position>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE status IN ('ACTIVE', 'CLOSING_EMERGENCY')
               AND trigger_state IN ('MONITORING', 'FAILED')",
            POSITION_SELECT
        ))?;
        let rows = stmt
            .query_map([], row_to_position)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Record a price observation. `peak_price` only ever moves up; the MAX in
    /// SQL keeps that invariant even under concurrent writers.
    pub fn record_price(&self, uuid_id: &str, price: f64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE positions SET current_price = ?1,
                    peak_price = MAX(peak_price, ?1),
                    price_updated_at = ?2
             WHERE uuid_id = ?3",
            params![price, now_ts(), uuid_id],
        )?;
        Ok(())
    }

    /// The anti-double-exit CAS: MONITORING -> TRIGGERED, exactly one winner.
    pub fn trigger_exit_atomically(
        &self,
        uuid_id: &str,
        trigger: ExitTrigger,
        trigger_price: f64,
    ) -> Result<TriggerClaim> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE positions SET trigger_state = 'TRIGGERED', exit_trigger = ?1,
                    trigger_price = ?2
             WHERE uuid_id = ?3 AND trigger_state = 'MONITORING' AND status != 'CLOSED'",
            params![trigger.as_str(), trigger_price, uuid_id],
        )?;
        if changed == 1 {
            info!(
                "🎯 Exit claimed: {} trigger={} price={:.12}",
                uuid_id,
                trigger.as_str(),
                trigger_price
            );
            Ok(TriggerClaim { triggered: true, reason: None })
        } else {
            let state: Option<String> = conn
                .query_row(
                    "SELECT trigger_state FROM positions WHERE uuid_id = ?1",
                    params![uuid_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(TriggerClaim {
                triggered: false,
                reason: Some(match state {
                    Some(s) => format!("trigger_state is {}", s),
                    None => "position not found".to_string(),
                }),
            })
        }
    }

    /// TRIGGERED -> EXECUTING; also flips position status into CLOSING unless
    /// an emergency close already promoted it.
    pub fn mark_position_executing(&self, uuid_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE positions SET trigger_state = 'EXECUTING',
                    status = CASE WHEN status = 'CLOSING_EMERGENCY' THEN status ELSE 'CLOSING' END
             WHERE uuid_id = ?1 AND trigger_state = 'TRIGGERED'",
            params![uuid_id],
        )?;
        Ok(changed == 1)
    }

    /// EXECUTING -> COMPLETED. `close_position` performs the same transition
    /// as part of its close; this standalone form covers partial exits.
    pub fn mark_trigger_completed(&self, uuid_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE positions SET trigger_state = 'COMPLETED'
             WHERE uuid_id = ?1 AND trigger_state = 'EXECUTING'",
            params![uuid_id],
        )?;
        Ok(changed == 1)
    }

    pub fn mark_trigger_failed(&self, uuid_id: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE positions SET trigger_state = 'FAILED'
             WHERE uuid_id = ?1 AND trigger_state IN ('TRIGGERED', 'EXECUTING')",
            params![uuid_id],
        )?;
        warn!("⚠️  Exit failed for {}: {}", uuid_id, error);
        Ok(())
    }

    /// FAILED -> MONITORING so the monitor can re-observe and retry.
    pub fn reset_trigger_to_monitoring(&self, uuid_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE positions SET trigger_state = 'MONITORING', exit_trigger = NULL,
                    trigger_price = NULL,
                    status = CASE WHEN status = 'CLOSING' THEN 'ACTIVE' ELSE status END
             WHERE uuid_id = ?1 AND trigger_state = 'FAILED'",
            params![uuid_id],
        )?;
        Ok(())
    }

    /// Full close after a confirmed exit: records exit fields, realized pnl,
    /// and completes the trigger machine in one transaction.
    #[allow(clippy::too_many_arguments)]
    pub fn close_position(
        &self,
        uuid_id: &str,
        exit_execution_id: i64,
        exit_tx_sig: &str,
        exit_price: f64,
        realized_pnl_lamports: i64,
        realized_pnl_percent: f64,
        emergency: bool,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE positions SET
                status = 'CLOSED', lifecycle_state = 'CLOSED', trigger_state = 'COMPLETED',
                exit_execution_id = ?1, exit_tx_sig = ?2, exit_price = ?3,
                realized_pnl_lamports = ?4, realized_pnl_percent = ?5, closed_at = ?6
             WHERE uuid_id = ?7",
            params![
                exit_execution_id,
                exit_tx_sig,
                exit_price,
                realized_pnl_lamports,
                realized_pnl_percent,
                now_ts(),
                uuid_id,
            ],
        )?;
        info!(
            "📉 Position closed{}: {} pnl={:.4} SOL ({:+.1}%)",
            if emergency { " (EMERGENCY)" } else { "" },
            uuid_id,
            realized_pnl_lamports as f64 / crate::constants::SOL_DECIMALS as f64,
            realized_pnl_percent
        );
        Ok(())
    }

    /// Partial close for a moon-bag TP: shrink size and entry cost
    /// proportionally and return the remainder to MONITORING on the same row.
    pub fn shrink_position(
        &self,
        uuid_id: &str,
        sold_tokens: u64,
        proportional_cost_lamports: u64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE positions SET
                size_tokens = MAX(size_tokens - ?1, 0),
                entry_cost_lamports = MAX(entry_cost_lamports - ?2, 0),
                trigger_state = 'MONITORING', exit_trigger = NULL, trigger_price = NULL,
                status = 'ACTIVE'
             WHERE uuid_id = ?3",
            params![sold_tokens as i64, proportional_cost_lamports as i64, uuid_id],
        )?;
        info!("🌙 Moon bag retained on {}: sold {} tokens", uuid_id, sold_tokens);
        Ok(())
    }

    /// Promote an open position to an emergency close.
    pub fn promote_to_emergency(&self, uuid_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE positions SET status = 'CLOSING_EMERGENCY'
             WHERE uuid_id = ?1 AND status != 'CLOSED'",
            params![uuid_id],
        )?;
        Ok(changed == 1)
    }

    /// Bonding curve completed: flip router selection for future exits.
    pub fn graduate_position(&self, uuid_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE positions SET lifecycle_state = 'POST_GRADUATION'
             WHERE uuid_id = ?1 AND lifecycle_state = 'PRE_GRADUATION'",
            params![uuid_id],
        )?;
        if changed == 1 {
            info!("🎓 Position graduated: {}", uuid_id);
        }
        Ok(())
    }

    // ========================================================================
    // LAUNCH CANDIDATES
    // ========================================================================

    /// Dedup-insert a discovery event. Returns the stored row id.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_candidate(
        &self,
        chain: &str,
        source: &str,
        token_mint: &str,
        token_name: Option<&str>,
        token_symbol: Option<&str>,
        score: Option<f64>,
        deployer: Option<&str>,
        bonding_curve: Option<&str>,
        initial_liquidity_lamports: Option<u64>,
        raw_payload: Option<&serde_json::Value>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO launch_candidates
                (chain, source, token_mint, token_name, token_symbol, score, deployer,
                 bonding_curve, initial_liquidity_lamports, raw_payload, status, first_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'new', ?11)
             ON CONFLICT (chain, source, token_mint) DO NOTHING",
            params![
                chain,
                source,
                token_mint,
                token_name,
                token_symbol,
                score,
                deployer,
                bonding_curve,
                initial_liquidity_lamports.map(|v| v as i64),
                raw_payload.map(|v| v.to_string()),
                now_ts(),
            ],
        )?;
        let id = conn.query_row(
            "SELECT id FROM launch_candidates WHERE chain = ?1 AND source = ?2 AND token_mint = ?3",
            params![chain, source, token_mint],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn new_candidates(&self, limit: usize) -> Result<Vec<LaunchCandidate>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE status = 'new' ORDER BY first_seen_at LIMIT {}",
            CANDIDATE_SELECT, limit
        ))?;
        let rows = stmt
            .query_map([], row_to_candidate)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_candidate(&self, candidate_id: i64) -> Result<LaunchCandidate> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("{} WHERE id = ?1", CANDIDATE_SELECT),
            params![candidate_id],
            row_to_candidate,
        )
        .with_context(|| format!("Candidate {} not found", candidate_id))
    }

    pub fn set_candidate_status(&self, candidate_id: i64, status: CandidateStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE launch_candidates SET status = ?1 WHERE id = ?2",
            params![status.as_str(), candidate_id],
        )?;
        Ok(())
    }

    // ========================================================================
    // NOTIFICATIONS OUTBOX
    // ========================================================================

    pub fn enqueue_notification(
        &self,
        user_id: i64,
        kind: NotificationKind,
        payload: &serde_json::Value,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO notifications_outbox (user_id, kind, payload, status, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![user_id, kind.as_str(), payload.to_string(), now_ts()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Lease up to `limit` deliverable rows. Rows stuck in `sending` with an
    /// expired lease are reclaimable (crash recovery).
    pub fn claim_notifications(
        &self,
        worker_id: &str,
        limit: usize,
        lease_seconds: u64,
    ) -> Result<Vec<NotificationRow>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_ts();
        let lease = fmt_ts(Utc::now() + ChronoDuration::seconds(lease_seconds as i64));

        let ids: Vec<i64> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT id FROM notifications_outbox
                 WHERE attempts < max_attempts
                   AND ((status = 'pending' AND (sending_expires_at IS NULL OR sending_expires_at < ?1))
                     OR (status = 'sending' AND sending_expires_at < ?1))
                 ORDER BY created_at LIMIT {}",
                limit
            ))?;
            let result = stmt
                .query_map(params![now], |row| row.get(0))?
                .collect::<std::result::Result<Vec<i64>, _>>()?;
            result
        };

        for id in &ids {
            tx.execute(
                "UPDATE notifications_outbox
                 SET status = 'sending', worker_id = ?1, sending_expires_at = ?2,
                     attempts = attempts + 1
                 WHERE id = ?3",
                params![worker_id, lease, id],
            )?;
        }

        let mut claimed = Vec::with_capacity(ids.len());
        for id in &ids {
            let row = tx.query_row(
                "SELECT id, user_id, kind, payload, status, attempts, max_attempts, worker_id, created_at
                 FROM notifications_outbox WHERE id = ?1",
                params![id],
                |row| {
                    Ok(NotificationRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        kind: row.get(2)?,
                        payload: serde_json::from_str(&row.get::<_, String>(3)?)
                            .unwrap_or(serde_json::Value::Null),
                        status: row.get(4)?,
                        attempts: row.get::<_, i64>(5)? as u32,
                        max_attempts: row.get::<_, i64>(6)? as u32,
                        worker_id: row.get(7)?,
                        created_at: row.get(8)?,
                    })
                },
            )?;
            claimed.push(row);
        }
        tx.commit()?;
        Ok(claimed)
    }

    pub fn mark_notification_delivered(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE notifications_outbox SET status = 'sent', sent_at = ?1,
                    sending_expires_at = NULL, worker_id = NULL
             WHERE id = ?2",
            params![now_ts(), id],
        )?;
        Ok(())
    }

    /// Transient failure reopens the row; exhausted attempts terminate it.
    pub fn mark_notification_failed(&self, id: i64, error: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let (attempts, max_attempts): (i64, i64) = tx.query_row(
            "SELECT attempts, max_attempts FROM notifications_outbox WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if attempts >= max_attempts {
            tx.execute(
                "UPDATE notifications_outbox SET status = 'failed', last_error = ?1,
                        sending_expires_at = NULL, worker_id = NULL
                 WHERE id = ?2",
                params![error, id],
            )?;
        } else {
            tx.execute(
                "UPDATE notifications_outbox SET status = 'pending', last_error = ?1,
                        sending_expires_at = NULL, worker_id = NULL
                 WHERE id = ?2",
                params![error, id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn purge_sent_notifications(&self, older_than_hours: i64) -> Result<usize> {
        let cutoff = fmt_ts(Utc::now() - ChronoDuration::hours(older_than_hours));
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM notifications_outbox WHERE status = 'sent' AND sent_at < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }

    // ========================================================================
    // TRADE MONITORS / MAINTENANCE
    // ========================================================================

    /// Open a monitor panel row for (user, mint). At most one ACTIVE row per
    /// pair; re-opening returns the existing row's id.
    pub fn open_trade_monitor(
        &self,
        user_id: i64,
        token_mint: &str,
        chat_id: &str,
        ttl_seconds: u64,
    ) -> Result<i64> {
        let expires = fmt_ts(Utc::now() + ChronoDuration::seconds(ttl_seconds as i64));
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO trade_monitors (user_id, token_mint, chat_id, status, expires_at, created_at)
             VALUES (?1, ?2, ?3, 'ACTIVE', ?4, ?5)
             ON CONFLICT DO NOTHING",
            params![user_id, token_mint, chat_id, expires, now_ts()],
        )?;
        let id = conn.query_row(
            "SELECT id FROM trade_monitors
             WHERE user_id = ?1 AND token_mint = ?2 AND status = 'ACTIVE'",
            params![user_id, token_mint],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Background snapshot refresh. `current_view` acts as a lock: a refresh
    /// only lands while the panel shows the monitor view, so a user-driven
    /// SELL or TOKEN view is never overwritten underneath them.
    pub fn refresh_trade_monitor(&self, id: i64, snapshot: &serde_json::Value) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE trade_monitors SET current_snapshot = ?1, last_refresh_at = ?2,
                    refresh_count = refresh_count + 1
             WHERE id = ?3 AND status = 'ACTIVE' AND current_view = 'MONITOR'",
            params![snapshot.to_string(), now_ts(), id],
        )?;
        Ok(changed == 1)
    }

    /// User navigation between panel views.
    pub fn set_trade_monitor_view(&self, id: i64, view: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE trade_monitors SET current_view = ?1 WHERE id = ?2 AND status = 'ACTIVE'",
            params![view, id],
        )?;
        Ok(changed == 1)
    }

    pub fn close_trade_monitor(&self, user_id: i64, token_mint: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE trade_monitors SET status = 'CLOSED'
             WHERE user_id = ?1 AND token_mint = ?2 AND status = 'ACTIVE'",
            params![user_id, token_mint],
        )?;
        Ok(())
    }

    pub fn get_trade_monitor(&self, id: i64) -> Result<TradeMonitorRow> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, user_id, token_mint, chat_id, status, current_view, expires_at, refresh_count
             FROM trade_monitors WHERE id = ?1",
            params![id],
            |row| {
                Ok(TradeMonitorRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    token_mint: row.get(2)?,
                    chat_id: row.get(3)?,
                    status: row.get(4)?,
                    current_view: row.get(5)?,
                    expires_at: row.get(6)?,
                    refresh_count: row.get::<_, i64>(7)? as u32,
                })
            },
        )
        .with_context(|| format!("Trade monitor {} not found", id))
    }

    pub fn expire_trade_monitors(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE trade_monitors SET status = 'EXPIRED'
             WHERE status = 'ACTIVE' AND expires_at < ?1",
            params![now_ts()],
        )?;
        Ok(changed)
    }

    pub fn reap_expired_cooldowns(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM cooldowns WHERE cooldown_until < ?1",
            params![now_ts()],
        )?;
        Ok(removed)
    }

    /// Raw SQL escape hatch for tests and operational tooling.
    pub fn execute_raw(&self, sql: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute(sql, [])?)
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

const STRATEGY_SELECT: &str = "SELECT id, user_id, kind, chain, enabled, auto_execute, risk_profile,
    max_positions, per_trade_cap_lamports, daily_cap_lamports, max_open_exposure_lamports,
    slippage_bps, priority_fee_lamports, take_profit_percent, stop_loss_percent,
    max_hold_minutes, trailing_enabled, trail_activation_percent, trail_distance_percent,
    moon_bag_percent, min_score, launchpad_allowlist, cooldown_seconds, token_allowlist,
    token_denylist, snipe_mode, filter_mode FROM strategies";

fn row_to_strategy(row: &rusqlite::Row<'_>) -> rusqlite::Result<Strategy> {
    let split = |v: Option<String>| {
        v.map(|s| {
            s.split(',')
                .filter(|p| !p.is_empty())
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
        })
    };
    Ok(Strategy {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: StrategyKind::parse(&row.get::<_, String>(2)?).unwrap_or(StrategyKind::Manual),
        chain: row.get(3)?,
        enabled: row.get::<_, i64>(4)? != 0,
        auto_execute: row.get::<_, i64>(5)? != 0,
        risk_profile: row.get(6)?,
        max_positions: row.get::<_, i64>(7)? as u32,
        per_trade_cap_lamports: row.get::<_, i64>(8)? as u64,
        daily_cap_lamports: row.get::<_, i64>(9)? as u64,
        max_open_exposure_lamports: row.get::<_, i64>(10)? as u64,
        slippage_bps: row.get::<_, i64>(11)? as u16,
        priority_fee_lamports: row.get::<_, i64>(12)? as u64,
        take_profit_percent: row.get(13)?,
        stop_loss_percent: row.get(14)?,
        max_hold_minutes: row.get::<_, i64>(15)? as u32,
        trailing_enabled: row.get::<_, i64>(16)? != 0,
        trail_activation_percent: row.get(17)?,
        trail_distance_percent: row.get(18)?,
        moon_bag_percent: row.get(19)?,
        min_score: row.get(20)?,
        launchpad_allowlist: split(row.get(21)?),
        cooldown_seconds: row.get::<_, i64>(22)? as u64,
        token_allowlist: split(row.get(23)?),
        token_denylist: split(row.get(24)?),
        snipe_mode: row.get(25)?,
        filter_mode: row.get(26)?,
    })
}

fn row_to_wallet(row: &rusqlite::Row<'_>) -> rusqlite::Result<Wallet> {
    Ok(Wallet {
        id: row.get(0)?,
        user_id: row.get(1)?,
        chain: row.get(2)?,
        wallet_index: row.get::<_, i64>(3)? as u8,
        label: row.get(4)?,
        is_active: row.get::<_, i64>(5)? != 0,
        public_address: row.get(6)?,
        encrypted_key: row.get(7)?,
        key_nonce: row.get(8)?,
        key_salt: row.get(9)?,
        created_at: row.get(10)?,
    })
}

const JOB_SELECT: &str = "SELECT id, strategy_id, user_id, chain, action, candidate_id, priority,
    payload, idempotency_key, status, attempts, max_attempts, worker_id, lease_expires_at,
    last_error, created_at FROM trade_jobs";

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<TradeJob> {
    let payload_raw: String = row.get(7)?;
    Ok(TradeJob {
        id: row.get(0)?,
        strategy_id: row.get(1)?,
        user_id: row.get(2)?,
        chain: row.get(3)?,
        action: TradeAction::parse(&row.get::<_, String>(4)?).unwrap_or(TradeAction::Buy),
        candidate_id: row.get(5)?,
        priority: row.get(6)?,
        payload: serde_json::from_str(&payload_raw).unwrap_or_default(),
        idempotency_key: row.get(8)?,
        status: JobStatus::parse(&row.get::<_, String>(9)?).unwrap_or(JobStatus::Pending),
        attempts: row.get::<_, i64>(10)? as u32,
        max_attempts: row.get::<_, i64>(11)? as u32,
        worker_id: row.get(12)?,
        lease_expires_at: row.get(13)?,
        last_error: row.get(14)?,
        created_at: row.get(15)?,
    })
}

const EXECUTION_SELECT: &str = "SELECT id, idempotency_key, user_id, chain, token_mint, action,
    mode, status, tx_sig, amount_lamports, tokens_out, price_per_token, error, error_code,
    created_at, updated_at FROM executions";

fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<Execution> {
    Ok(Execution {
        id: row.get(0)?,
        idempotency_key: row.get(1)?,
        user_id: row.get(2)?,
        chain: row.get(3)?,
        token_mint: row.get(4)?,
        action: TradeAction::parse(&row.get::<_, String>(5)?).unwrap_or(TradeAction::Buy),
        mode: ExecutionMode::parse(&row.get::<_, String>(6)?).unwrap_or(ExecutionMode::Auto),
        status: ExecutionStatus::parse(&row.get::<_, String>(7)?)
            .unwrap_or(ExecutionStatus::Reserved),
        tx_sig: row.get(8)?,
        amount_lamports: row.get::<_, i64>(9)? as u64,
        tokens_out: row.get::<_, Option<i64>>(10)?.map(|v| v as u64),
        price_per_token: row.get(11)?,
        error: row.get(12)?,
        error_code: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

const POSITION_SELECT: &str = "SELECT id, uuid_id, user_id, strategy_id, candidate_id, chain,
    token_mint, token_symbol, entry_execution_id, entry_tx_sig, entry_cost_lamports,
    entry_price, size_tokens, current_price, peak_price, tp_price, sl_price,
    trail_activation_price, trail_distance_percent, moon_bag_percent, max_hold_minutes,
    bonding_curve, entry_mc_lamports, lifecycle_state, status, trigger_state, exit_trigger,
    trigger_price, opened_at FROM positions";

fn row_to_position(row: &rusqlite::Row<'_>) -> rusqlite::Result<Position> {
    Ok(Position {
        id: row.get(0)?,
        uuid_id: row.get(1)?,
        user_id: row.get(2)?,
        strategy_id: row.get(3)?,
        candidate_id: row.get(4)?,
        chain: row.get(5)?,
        token_mint: row.get(6)?,
        token_symbol: row.get(7)?,
        entry_execution_id: row.get(8)?,
        entry_tx_sig: row.get(9)?,
        entry_cost_lamports: row.get::<_, i64>(10)? as u64,
        entry_price: row.get(11)?,
        size_tokens: row.get::<_, i64>(12)? as u64,
        current_price: row.get(13)?,
        peak_price: row.get(14)?,
        tp_price: row.get(15)?,
        sl_price: row.get(16)?,
        trail_activation_price: row.get(17)?,
        trail_distance_percent: row.get(18)?,
        moon_bag_percent: row.get(19)?,
        max_hold_minutes: row.get::<_, i64>(20)? as u32,
        bonding_curve: row.get(21)?,
        entry_mc_lamports: row.get::<_, Option<i64>>(22)?.map(|v| v as u64),
        lifecycle_state: LifecycleState::parse(&row.get::<_, String>(23)?)
            .unwrap_or(LifecycleState::PreGraduation),
        status: PositionStatus::parse(&row.get::<_, String>(24)?).unwrap_or(PositionStatus::Active),
        trigger_state: TriggerState::parse(&row.get::<_, String>(25)?)
            .unwrap_or(TriggerState::Monitoring),
        exit_trigger: row
            .get::<_, Option<String>>(26)?
            .and_then(|s| ExitTrigger::parse(&s)),
        trigger_price: row.get(27)?,
        opened_at: row.get(28)?,
    })
}

const CANDIDATE_SELECT: &str = "SELECT id, chain, source, token_mint, token_name, token_symbol,
    score, deployer, bonding_curve, initial_liquidity_lamports, status, first_seen_at
    FROM launch_candidates";

fn row_to_candidate(row: &rusqlite::Row<'_>) -> rusqlite::Result<LaunchCandidate> {
    Ok(LaunchCandidate {
        id: row.get(0)?,
        chain: row.get(1)?,
        source: row.get(2)?,
        token_mint: row.get(3)?,
        token_name: row.get(4)?,
        token_symbol: row.get(5)?,
        score: row.get(6)?,
        deployer: row.get(7)?,
        bonding_curve: row.get(8)?,
        initial_liquidity_lamports: row.get::<_, Option<i64>>(9)?.map(|v| v as u64),
        status: CandidateStatus::parse(&row.get::<_, String>(10)?).unwrap_or(CandidateStatus::New),
        first_seen_at: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn seed_strategy(store: &Store, user_id: i64) -> Strategy {
        let strategy = Strategy {
            id: 0,
            user_id,
            kind: StrategyKind::Auto,
            chain: "solana".to_string(),
            enabled: true,
            auto_execute: true,
            risk_profile: "standard".to_string(),
            max_positions: 2,
            per_trade_cap_lamports: 100_000_000,
            daily_cap_lamports: 1_000_000_000,
            max_open_exposure_lamports: 500_000_000,
            slippage_bps: 300,
            priority_fee_lamports: 100_000,
            take_profit_percent: 50.0,
            stop_loss_percent: 20.0,
            max_hold_minutes: 240,
            trailing_enabled: false,
            trail_activation_percent: 30.0,
            trail_distance_percent: 20.0,
            moon_bag_percent: 0.0,
            min_score: 0.0,
            launchpad_allowlist: None,
            cooldown_seconds: 300,
            token_allowlist: None,
            token_denylist: None,
            snipe_mode: "normal".to_string(),
            filter_mode: "strict".to_string(),
        };
        let id = store.upsert_strategy(&strategy).unwrap();
        store.get_strategy(id).unwrap()
    }

    #[test]
    fn reserve_is_idempotent_per_key() {
        let store = test_store();
        let user = store.get_or_create_user("chat-1").unwrap();
        let strategy = seed_strategy(&store, user.id);

        let first = store
            .reserve_trade_budget(
                ExecutionMode::Auto,
                user.id,
                Some(strategy.id),
                "solana",
                TradeAction::Buy,
                "MintA",
                50_000_000,
                "key-1",
                None,
                false,
            )
            .unwrap();
        assert!(first.allowed);

        let second = store
            .reserve_trade_budget(
                ExecutionMode::Auto,
                user.id,
                Some(strategy.id),
                "solana",
                TradeAction::Buy,
                "MintA",
                50_000_000,
                "key-1",
                None,
                false,
            )
            .unwrap();
        assert!(!second.allowed);
        assert_eq!(second.reason.as_deref(), Some("Already executed"));
        assert_eq!(second.execution_id, first.execution_id);
    }

    #[test]
    fn reserve_allows_retry_of_failed_execution() {
        let store = test_store();
        let user = store.get_or_create_user("chat-1").unwrap();
        let strategy = seed_strategy(&store, user.id);

        let first = store
            .reserve_trade_budget(
                ExecutionMode::Auto,
                user.id,
                Some(strategy.id),
                "solana",
                TradeAction::Buy,
                "MintA",
                50_000_000,
                "key-1",
                None,
                false,
            )
            .unwrap();
        let execution_id = first.execution_id.unwrap();
        store
            .update_execution(
                execution_id,
                ExecutionStatus::Failed,
                None,
                None,
                None,
                Some("boom"),
                Some(ErrorCode::BlockhashExpired),
                None,
            )
            .unwrap();

        let denied = store
            .reserve_trade_budget(
                ExecutionMode::Auto,
                user.id,
                Some(strategy.id),
                "solana",
                TradeAction::Buy,
                "MintA",
                50_000_000,
                "key-1",
                None,
                false,
            )
            .unwrap();
        assert!(!denied.allowed);

        let retried = store
            .reserve_trade_budget(
                ExecutionMode::Auto,
                user.id,
                Some(strategy.id),
                "solana",
                TradeAction::Buy,
                "MintA",
                50_000_000,
                "key-1",
                None,
                true,
            )
            .unwrap();
        assert!(retried.allowed);
        assert_eq!(retried.execution_id, Some(execution_id));
        let execution = store.get_execution(execution_id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Reserved);
    }

    #[test]
    fn reserve_denies_when_paused_or_circuit_open() {
        let store = test_store();
        let user = store.get_or_create_user("chat-1").unwrap();
        let strategy = seed_strategy(&store, user.id);

        store.set_trading_paused(true).unwrap();
        let denied = store
            .reserve_trade_budget(
                ExecutionMode::Auto,
                user.id,
                Some(strategy.id),
                "solana",
                TradeAction::Buy,
                "MintA",
                1_000,
                "key-p",
                None,
                false,
            )
            .unwrap();
        assert_eq!(denied.code, Some(ErrorCode::TradingPaused));

        store.set_trading_paused(false).unwrap();
        store.open_circuit(60).unwrap();
        let denied = store
            .reserve_trade_budget(
                ExecutionMode::Auto,
                user.id,
                Some(strategy.id),
                "solana",
                TradeAction::Buy,
                "MintA",
                1_000,
                "key-c",
                None,
                false,
            )
            .unwrap();
        assert_eq!(denied.code, Some(ErrorCode::CircuitOpen));
    }

    #[test]
    fn reserve_enforces_per_trade_cap() {
        let store = test_store();
        let user = store.get_or_create_user("chat-1").unwrap();
        let strategy = seed_strategy(&store, user.id);

        let denied = store
            .reserve_trade_budget(
                ExecutionMode::Auto,
                user.id,
                Some(strategy.id),
                "solana",
                TradeAction::Buy,
                "MintA",
                200_000_000, // above the 100M per-trade cap
                "key-cap",
                None,
                false,
            )
            .unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.code, Some(ErrorCode::BudgetExceeded));
        assert_eq!(denied.reason.as_deref(), Some("cap_exceeded"));
    }

    #[test]
    fn reserve_enforces_cooldowns() {
        let store = test_store();
        let user = store.get_or_create_user("chat-1").unwrap();
        let strategy = seed_strategy(&store, user.id);

        store
            .set_cooldown("solana", CooldownKind::Mint, "MintA", 300, "post-trade")
            .unwrap();
        let denied = store
            .reserve_trade_budget(
                ExecutionMode::Auto,
                user.id,
                Some(strategy.id),
                "solana",
                TradeAction::Buy,
                "MintA",
                1_000,
                "key-cd",
                None,
                false,
            )
            .unwrap();
        assert_eq!(denied.code, Some(ErrorCode::CooldownActive));
    }

    #[test]
    fn claim_respects_leases_and_priority() {
        let store = test_store();
        let user = store.get_or_create_user("chat-1").unwrap();

        let payload = JobPayload {
            token_mint: "MintA".to_string(),
            amount_lamports: 1_000,
            ..Default::default()
        };
        store
            .enqueue_job(None, user.id, "solana", TradeAction::Buy, None, 200, &payload, "job-low", 3)
            .unwrap();
        store
            .enqueue_job(None, user.id, "solana", TradeAction::Buy, None, 10, &payload, "job-high", 3)
            .unwrap();

        let claimed = store.claim_trade_jobs("worker-a", 1, 30, None).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].idempotency_key, "job-high");

        // Still leased: a second worker cannot steal it.
        let other = store.claim_trade_jobs("worker-b", 5, 30, None).unwrap();
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].idempotency_key, "job-low");

        // Expire worker-a's lease manually: the job becomes claimable again.
        store
            .execute_raw(
                "UPDATE trade_jobs SET lease_expires_at = '2000-01-01T00:00:00.000000Z'
                 WHERE idempotency_key = 'job-high'",
            )
            .unwrap();
        let reclaimed = store.claim_trade_jobs("worker-b", 5, 30, None).unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].idempotency_key, "job-high");
    }

    #[test]
    fn enqueue_job_dedups_by_idempotency_key() {
        let store = test_store();
        let user = store.get_or_create_user("chat-1").unwrap();
        let payload = JobPayload {
            token_mint: "MintA".to_string(),
            ..Default::default()
        };

        let (first, created) = store
            .enqueue_job(None, user.id, "solana", TradeAction::Buy, None, 100, &payload, "dup", 3)
            .unwrap();
        assert!(created);
        let (second, created) = store
            .enqueue_job(None, user.id, "solana", TradeAction::Buy, None, 100, &payload, "dup", 3)
            .unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn mark_running_requires_lease_ownership() {
        let store = test_store();
        let user = store.get_or_create_user("chat-1").unwrap();
        let payload = JobPayload {
            token_mint: "MintA".to_string(),
            ..Default::default()
        };
        store
            .enqueue_job(None, user.id, "solana", TradeAction::Buy, None, 100, &payload, "k", 3)
            .unwrap();

        let claimed = store.claim_trade_jobs("worker-a", 1, 30, None).unwrap();
        let job_id = claimed[0].id;

        assert!(!store.mark_job_running(job_id, "worker-b").unwrap());
        assert!(store.mark_job_running(job_id, "worker-a").unwrap());
        let job = store.get_job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn finalize_retryable_requeues_until_exhausted() {
        let store = test_store();
        let user = store.get_or_create_user("chat-1").unwrap();
        let payload = JobPayload {
            token_mint: "MintA".to_string(),
            ..Default::default()
        };
        store
            .enqueue_job(None, user.id, "solana", TradeAction::Buy, None, 100, &payload, "k", 2)
            .unwrap();

        // Attempt 1: retryable failure requeues.
        let claimed = store.claim_trade_jobs("w", 1, 30, None).unwrap();
        let job_id = claimed[0].id;
        assert!(store.mark_job_running(job_id, "w").unwrap());
        let outcome = store
            .finalize_job(job_id, "w", JobStatus::Failed, true, Some("timeout"))
            .unwrap();
        assert_eq!(outcome, FinalizeResult::Requeued);
        assert_eq!(store.get_job(job_id).unwrap().status, JobStatus::Pending);

        // Make it claimable immediately for the test.
        store
            .execute_raw("UPDATE trade_jobs SET next_available_at = NULL")
            .unwrap();

        // Attempt 2 (== max_attempts): failure is terminal.
        let claimed = store.claim_trade_jobs("w", 1, 30, None).unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(store.mark_job_running(job_id, "w").unwrap());
        let outcome = store
            .finalize_job(job_id, "w", JobStatus::Failed, true, Some("timeout"))
            .unwrap();
        assert_eq!(outcome, FinalizeResult::Terminal);
        assert_eq!(store.get_job(job_id).unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn execution_state_machine_rejects_reversals() {
        let store = test_store();
        let user = store.get_or_create_user("chat-1").unwrap();
        let strategy = seed_strategy(&store, user.id);
        let outcome = store
            .reserve_trade_budget(
                ExecutionMode::Auto,
                user.id,
                Some(strategy.id),
                "solana",
                TradeAction::Buy,
                "MintA",
                1_000,
                "k",
                None,
                false,
            )
            .unwrap();
        let id = outcome.execution_id.unwrap();

        store
            .update_execution(id, ExecutionStatus::Submitted, None, None, None, None, None, None)
            .unwrap();
        // Confirm without signature must fail.
        assert!(store
            .update_execution(id, ExecutionStatus::Confirmed, None, None, None, None, None, None)
            .is_err());
        store
            .update_execution(
                id,
                ExecutionStatus::Confirmed,
                Some("sig-1"),
                Some(1_000_000),
                Some(0.000001),
                None,
                None,
                None,
            )
            .unwrap();
        // No transitions out of CONFIRMED.
        assert!(store
            .update_execution(id, ExecutionStatus::Failed, None, None, None, Some("x"), None, None)
            .is_err());
    }

    fn open_test_position(store: &Store, user_id: i64, strategy: &Strategy, mint: &str) -> String {
        let outcome = store
            .reserve_trade_budget(
                ExecutionMode::Auto,
                user_id,
                Some(strategy.id),
                "solana",
                TradeAction::Buy,
                mint,
                50_000_000,
                &format!("open-test-position-{}-{}", mint, user_id),
                None,
                false,
            )
            .unwrap();
        let execution_id = outcome.execution_id.unwrap();
        store
            .insert_position(
                user_id,
                strategy,
                None,
                "solana",
                mint,
                Some("TEST"),
                execution_id,
                "entry-sig",
                50_000_000,
                0.000001,
                40_000_000_000,
                Some("CurvePubkey"),
                None,
                LifecycleState::PreGraduation,
            )
            .unwrap()
    }

    #[test]
    fn trigger_cas_has_exactly_one_winner() {
        let store = test_store();
        let user = store.get_or_create_user("chat-1").unwrap();
        let strategy = seed_strategy(&store, user.id);
        let uuid = open_test_position(&store, user.id, &strategy, "MintA");

        let first = store
            .trigger_exit_atomically(&uuid, ExitTrigger::TakeProfit, 0.0000016)
            .unwrap();
        assert!(first.triggered);

        let second = store
            .trigger_exit_atomically(&uuid, ExitTrigger::Emergency, 0.0000016)
            .unwrap();
        assert!(!second.triggered);
    }

    #[test]
    fn peak_price_is_monotone() {
        let store = test_store();
        let user = store.get_or_create_user("chat-1").unwrap();
        let strategy = seed_strategy(&store, user.id);
        let uuid = open_test_position(&store, user.id, &strategy, "MintA");

        store.record_price(&uuid, 0.000002).unwrap();
        store.record_price(&uuid, 0.0000015).unwrap();
        let position = store.get_position(&uuid).unwrap();
        assert_eq!(position.peak_price, 0.000002);
        assert_eq!(position.current_price, Some(0.0000015));
    }

    #[test]
    fn failed_trigger_resets_to_monitoring() {
        let store = test_store();
        let user = store.get_or_create_user("chat-1").unwrap();
        let strategy = seed_strategy(&store, user.id);
        let uuid = open_test_position(&store, user.id, &strategy, "MintA");

        assert!(store
            .trigger_exit_atomically(&uuid, ExitTrigger::StopLoss, 0.0000007)
            .unwrap()
            .triggered);
        assert!(store.mark_position_executing(&uuid).unwrap());
        store.mark_trigger_failed(&uuid, "router error").unwrap();
        assert_eq!(store.get_position(&uuid).unwrap().trigger_state, TriggerState::Failed);

        store.reset_trigger_to_monitoring(&uuid).unwrap();
        let position = store.get_position(&uuid).unwrap();
        assert_eq!(position.trigger_state, TriggerState::Monitoring);
        assert_eq!(position.status, PositionStatus::Active);

        // And it can be claimed again.
        assert!(store
            .trigger_exit_atomically(&uuid, ExitTrigger::StopLoss, 0.0000007)
            .unwrap()
            .triggered);
    }

    #[test]
    fn shrink_position_keeps_monitoring_with_reduced_size() {
        let store = test_store();
        let user = store.get_or_create_user("chat-1").unwrap();
        let strategy = seed_strategy(&store, user.id);
        let uuid = open_test_position(&store, user.id, &strategy, "MintA");

        assert!(store
            .trigger_exit_atomically(&uuid, ExitTrigger::TakeProfit, 0.0000016)
            .unwrap()
            .triggered);
        assert!(store.mark_position_executing(&uuid).unwrap());
        store.shrink_position(&uuid, 36_000_000_000, 45_000_000).unwrap();

        let position = store.get_position(&uuid).unwrap();
        assert_eq!(position.size_tokens, 4_000_000_000);
        assert_eq!(position.entry_cost_lamports, 5_000_000);
        assert_eq!(position.trigger_state, TriggerState::Monitoring);
        assert_eq!(position.status, PositionStatus::Active);
    }

    #[test]
    fn notification_leasing_and_crash_recovery() {
        let store = test_store();
        let user = store.get_or_create_user("chat-1").unwrap();
        store
            .enqueue_notification(user.id, NotificationKind::PositionOpened, &serde_json::json!({"a": 1}))
            .unwrap();

        let claimed = store.claim_notifications("n-1", 10, 30).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempts, 1);

        // Leased: nobody else can claim it.
        assert!(store.claim_notifications("n-2", 10, 30).unwrap().is_empty());

        // Crash: lease expires, another worker reclaims.
        store
            .execute_raw(
                "UPDATE notifications_outbox SET sending_expires_at = '2000-01-01T00:00:00.000000Z'",
            )
            .unwrap();
        let reclaimed = store.claim_notifications("n-2", 10, 30).unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].attempts, 2);
    }

    #[test]
    fn notification_fails_terminally_after_max_attempts() {
        let store = test_store();
        let user = store.get_or_create_user("chat-1").unwrap();
        let id = store
            .enqueue_notification(user.id, NotificationKind::BuyFailed, &serde_json::json!({}))
            .unwrap();
        store
            .execute_raw("UPDATE notifications_outbox SET max_attempts = 1")
            .unwrap();

        let claimed = store.claim_notifications("n-1", 10, 30).unwrap();
        assert_eq!(claimed.len(), 1);
        store.mark_notification_failed(id, "chat unreachable").unwrap();

        // attempts == max_attempts -> failed, never claimable again.
        assert!(store.claim_notifications("n-1", 10, 30).unwrap().is_empty());
    }

    #[test]
    fn cleanup_reaps_only_stale_unconfirmed() {
        let store = test_store();
        let user = store.get_or_create_user("chat-1").unwrap();
        let strategy = seed_strategy(&store, user.id);
        let outcome = store
            .reserve_trade_budget(
                ExecutionMode::Auto,
                user.id,
                Some(strategy.id),
                "solana",
                TradeAction::Buy,
                "MintA",
                1_000,
                "k",
                None,
                false,
            )
            .unwrap();
        let id = outcome.execution_id.unwrap();

        // Fresh row is left alone.
        assert_eq!(store.cleanup_stale_executions(5).unwrap(), 0);

        store
            .execute_raw("UPDATE executions SET updated_at = '2000-01-01T00:00:00.000000Z'")
            .unwrap();
        assert_eq!(store.cleanup_stale_executions(5).unwrap(), 1);
        let execution = store.get_execution(id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.error_code.as_deref(), Some("RPC_TIMEOUT"));
    }

    #[test]
    fn wallet_delete_promotes_survivor() {
        let store = test_store();
        let user = store.get_or_create_user("chat-1").unwrap();
        let w1 = store
            .create_wallet(user.id, "solana", 1, "main", "Addr1", "enc1", "n1", "s1")
            .unwrap();
        let _w2 = store
            .create_wallet(user.id, "solana", 2, "alt", "Addr2", "enc2", "n2", "s2")
            .unwrap();

        // First wallet became active.
        let active = store.active_wallet(user.id, "solana").unwrap().unwrap();
        assert_eq!(active.id, w1);

        store.delete_wallet(user.id, "solana", w1).unwrap();
        let active = store.active_wallet(user.id, "solana").unwrap().unwrap();
        assert_eq!(active.public_address, "Addr2");

        // Deleting the last wallet is forbidden.
        assert!(store.delete_wallet(user.id, "solana", active.id).is_err());
    }

    #[test]
    fn trade_monitor_view_locks_background_refresh() {
        let store = test_store();
        let user = store.get_or_create_user("chat-1").unwrap();

        let id = store
            .open_trade_monitor(user.id, "MintA", "chat-1", 300)
            .unwrap();
        // Re-open returns the same active row.
        let again = store
            .open_trade_monitor(user.id, "MintA", "chat-1", 300)
            .unwrap();
        assert_eq!(id, again);

        // Refresh lands on the MONITOR view.
        assert!(store
            .refresh_trade_monitor(id, &serde_json::json!({"price": 1.0}))
            .unwrap());

        // User flips to SELL: background refresh is locked out.
        assert!(store.set_trade_monitor_view(id, "SELL").unwrap());
        assert!(!store
            .refresh_trade_monitor(id, &serde_json::json!({"price": 2.0}))
            .unwrap());

        let row = store.get_trade_monitor(id).unwrap();
        assert_eq!(row.refresh_count, 1);
        assert_eq!(row.current_view, "SELL");

        // Past TTL the maintenance sweep expires it, freeing the pair.
        store
            .execute_raw("UPDATE trade_monitors SET expires_at = '2000-01-01T00:00:00.000000Z'")
            .unwrap();
        assert_eq!(store.expire_trade_monitors().unwrap(), 1);
        let fresh = store
            .open_trade_monitor(user.id, "MintA", "chat-1", 300)
            .unwrap();
        assert_ne!(fresh, id);
    }

    #[test]
    fn candidate_dedup_and_terminal_states() {
        let store = test_store();
        let id1 = store
            .insert_candidate("solana", "pumpfun", "MintA", Some("A"), Some("A"), Some(30.0), None, None, None, None)
            .unwrap();
        let id2 = store
            .insert_candidate("solana", "pumpfun", "MintA", Some("A"), Some("A"), Some(30.0), None, None, None, None)
            .unwrap();
        assert_eq!(id1, id2);

        store.set_candidate_status(id1, CandidateStatus::Accepted).unwrap();
        assert!(store.new_candidates(10).unwrap().is_empty());
    }
}
