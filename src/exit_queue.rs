// Exit queue.
// A bounded in-process priority queue fed by trigger claims. Drives the
// trigger_state machine (TRIGGERED -> EXECUTING -> COMPLETED|FAILED) through
// the store, executes the sell through the shared TradeExecutor, and bounds
// parallelism to one concurrent sell per wallet per chain. Emergency sells
// enter here at maximum priority.

use anyhow::Result;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::audit_log::{AuditEvent, AuditLog};
use crate::budget_gate::BudgetGate;
use crate::constants::{DUST_SELL_PERCENT, EXIT_QUEUE_HIGH_WATER, EXIT_QUEUE_LOW_WATER};
use crate::error_classifier::ErrorCode;
use crate::execution_worker::{realized_pnl, TradeExecutor};
use crate::models::*;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct ExitJob {
    pub position_uuid: String,
    pub user_id: i64,
    pub chain: String,
    pub token_mint: String,
    pub trigger: ExitTrigger,
    pub trigger_price: f64,
    pub sell_percent: f64,
}

struct HeapEntry {
    priority: u8,
    seq: u64,
    job: ExitJob,
}

// Min-heap on (priority, seq): lowest priority value first, FIFO within a
// priority band.
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}

struct QueueInner {
    heap: BinaryHeap<HeapEntry>,
    seq: u64,
    in_flight_wallets: HashSet<(i64, String)>,
    in_flight_count: usize,
}

/// Clonable handle: the monitor pushes claims and reads depth for
/// backpressure; the queue worker pops.
#[derive(Clone)]
pub struct ExitQueueHandle {
    inner: Arc<Mutex<QueueInner>>,
    notify: Arc<Notify>,
    capacity: usize,
}

impl ExitQueueHandle {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                seq: 0,
                in_flight_wallets: HashSet::new(),
                in_flight_count: 0,
            })),
            notify: Arc::new(Notify::new()),
            capacity,
        }
    }

    /// Enqueue a claimed exit. Returns false when the queue is full; the
    /// caller must not have claimed past the high-water mark, so a full
    /// queue here is a hard bug surfaced loudly.
    pub fn push(&self, job: ExitJob) -> bool {
        let mut inner = self.inner.lock();
        if inner.heap.len() >= self.capacity {
            error!("🛑 Exit queue full ({}), dropping push for {}", self.capacity, job.position_uuid);
            return false;
        }
        let seq = inner.seq;
        inner.seq += 1;
        let priority = job.trigger.queue_priority();
        inner.heap.push(HeapEntry { priority, seq, job });
        self.notify.notify_waiters();
        true
    }

    /// Pending plus in-flight work, the backpressure signal.
    pub fn depth(&self) -> usize {
        let inner = self.inner.lock();
        inner.heap.len() + inner.in_flight_count
    }

    /// Pop the most urgent job whose wallet has no sell in flight.
    fn pop_ready(&self) -> Option<ExitJob> {
        let mut inner = self.inner.lock();
        let mut parked = Vec::new();
        let mut picked = None;

        while let Some(entry) = inner.heap.pop() {
            let wallet_key = (entry.job.user_id, entry.job.chain.clone());
            if inner.in_flight_wallets.contains(&wallet_key) {
                parked.push(entry);
            } else {
                inner.in_flight_wallets.insert(wallet_key);
                inner.in_flight_count += 1;
                picked = Some(entry.job);
                break;
            }
        }
        for entry in parked {
            inner.heap.push(entry);
        }
        picked
    }

    fn release_wallet(&self, user_id: i64, chain: &str) {
        let mut inner = self.inner.lock();
        inner.in_flight_wallets.remove(&(user_id, chain.to_string()));
        inner.in_flight_count = inner.in_flight_count.saturating_sub(1);
        drop(inner);
        self.notify.notify_waiters();
    }

    fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.heap.is_empty() && inner.in_flight_count == 0
    }
}

/// Backpressure hysteresis the monitor consults before claiming triggers.
pub struct ClaimGate {
    paused: bool,
}

impl ClaimGate {
    pub fn new() -> Self {
        Self { paused: false }
    }

    /// True when the monitor may claim new triggers.
    pub fn may_claim(&mut self, queue_depth: usize) -> bool {
        if self.paused {
            if queue_depth <= EXIT_QUEUE_LOW_WATER {
                self.paused = false;
            }
        } else if queue_depth >= EXIT_QUEUE_HIGH_WATER {
            self.paused = true;
        }
        !self.paused
    }
}

impl Default for ClaimGate {
    fn default() -> Self {
        Self::new()
    }
}

/// User-initiated emergency sell. Bypasses the monitor entirely: claims the
/// trigger CAS directly, promotes the position, and enqueues at maximum
/// priority. Returns false when another exit already holds the claim.
pub async fn request_emergency_sell(
    store: &Store,
    audit: &AuditLog,
    handle: &ExitQueueHandle,
    position_uuid: &str,
) -> Result<bool> {
    let position = store.get_position(position_uuid)?;
    let price = position.current_price.unwrap_or(position.entry_price);

    let claim = store.trigger_exit_atomically(position_uuid, ExitTrigger::Emergency, price)?;
    if !claim.triggered {
        debug!(
            "🤷 Emergency sell lost the claim on {}: {:?}",
            position_uuid, claim.reason
        );
        return Ok(false);
    }

    store.promote_to_emergency(position_uuid)?;
    audit
        .record(
            AuditEvent::EmergencySell,
            Some(position.user_id),
            &position.chain,
            &format!("position {} mint {}", position_uuid, position.token_mint),
        )
        .await
        .ok();

    store
        .enqueue_notification(
            position.user_id,
            NotificationKind::EmergencySellStarted,
            &json!({
                "position_uuid": position_uuid,
                "token_mint": position.token_mint,
                "chain": position.chain,
            }),
        )
        .ok();

    handle.push(ExitJob {
        position_uuid: position_uuid.to_string(),
        user_id: position.user_id,
        chain: position.chain.clone(),
        token_mint: position.token_mint.clone(),
        trigger: ExitTrigger::Emergency,
        trigger_price: price,
        sell_percent: 100.0,
    });
    Ok(true)
}

pub struct ExitQueue {
    handle: ExitQueueHandle,
    executor: TradeExecutor,
    gate: BudgetGate,
    store: Store,
}

impl ExitQueue {
    pub fn new(handle: ExitQueueHandle, executor: TradeExecutor, gate: BudgetGate, store: Store) -> Self {
        Self {
            handle,
            executor,
            gate,
            store,
        }
    }

    /// Consume exits until stopped, then drain what is already queued.
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> Result<()> {
        info!("🚪 Exit queue started");
        let this = Arc::new(self);

        loop {
            let stopping = *stop.borrow();
            if let Some(job) = this.handle.pop_ready() {
                let runner = Arc::clone(&this);
                tokio::spawn(async move {
                    let user_id = job.user_id;
                    let chain = job.chain.clone();
                    runner.process(job).await;
                    runner.handle.release_wallet(user_id, &chain);
                });
                continue;
            }

            if stopping {
                if this.handle.is_idle() {
                    break;
                }
                // In-flight sells finish before exit.
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }

            tokio::select! {
                _ = this.handle.notify.notified() => {}
                _ = stop.changed() => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
            }
        }

        info!("🚪 Exit queue drained and stopped");
        Ok(())
    }

    async fn process(&self, job: ExitJob) {
        // TRIGGERED -> EXECUTING; a false CAS means someone else advanced it.
        match self.store.mark_position_executing(&job.position_uuid) {
            Ok(true) => {}
            Ok(false) => {
                debug!("🤷 Exit {} no longer TRIGGERED, skipping", job.position_uuid);
                return;
            }
            Err(e) => {
                error!("❌ mark_position_executing failed for {}: {}", job.position_uuid, e);
                return;
            }
        }

        if let Err((code, message)) = self.execute_exit(&job).await {
            self.store
                .mark_trigger_failed(&job.position_uuid, &message)
                .ok();
            if code.is_retryable() {
                // Return to MONITORING so the monitor can re-observe and
                // re-claim on the next evaluation.
                self.store
                    .reset_trigger_to_monitoring(&job.position_uuid)
                    .ok();
                debug!("🔁 Exit {} reset to MONITORING after {}", job.position_uuid, code.as_str());
            } else {
                let kind = if job.trigger == ExitTrigger::Emergency {
                    NotificationKind::EmergencySellFailed
                } else {
                    NotificationKind::SellFailed
                };
                self.store
                    .enqueue_notification(
                        job.user_id,
                        kind,
                        &json!({
                            "position_uuid": job.position_uuid,
                            "token_mint": job.token_mint,
                            "chain": job.chain,
                            "trigger": job.trigger.as_str(),
                            "error_code": code.as_str(),
                            "message": code.user_message(),
                        }),
                    )
                    .ok();
                warn!(
                    "💥 Exit {} terminally failed ({}): {}",
                    job.position_uuid,
                    code.as_str(),
                    message
                );
            }
        }
    }

    async fn execute_exit(&self, job: &ExitJob) -> std::result::Result<(), (ErrorCode, String)> {
        let position = self
            .store
            .get_position(&job.position_uuid)
            .map_err(|e| (ErrorCode::ProgramError, e.to_string()))?;
        let user = self
            .store
            .get_user(job.user_id)
            .map_err(|e| (ErrorCode::ProgramError, e.to_string()))?;
        let wallet = match self.store.active_wallet(job.user_id, &job.chain) {
            Ok(Some(wallet)) => wallet,
            Ok(None) => {
                return Err((
                    ErrorCode::InvalidAccount,
                    format!("no active wallet for user {} on {}", job.user_id, job.chain),
                ))
            }
            Err(e) => return Err((ErrorCode::NetworkError, e.to_string())),
        };

        // Strategy-derived slippage/fee when the position has one.
        let (slippage_bps, priority_fee) = match position.strategy_id {
            Some(id) => match self.store.get_strategy(id) {
                Ok(s) => (s.slippage_bps, s.priority_fee_lamports),
                Err(_) => (user.default_slippage_bps, user.priority_fee_lamports),
            },
            None => (user.default_slippage_bps, user.priority_fee_lamports),
        };

        let idempotency_key = exit_idempotency_key(
            &job.chain,
            &job.token_mint,
            &job.position_uuid,
            job.trigger,
            job.sell_percent,
        );
        let outcome = self
            .gate
            .reserve(
                ExecutionMode::Auto,
                job.user_id,
                position.strategy_id,
                &job.chain,
                TradeAction::Sell,
                &job.token_mint,
                0,
                &idempotency_key,
                None,
                true,
                false,
            )
            .map_err(|e| (ErrorCode::ProgramError, e.to_string()))?;

        let execution_id = match outcome.execution_id {
            Some(id) => {
                if !outcome.allowed {
                    // Replay of a finished exit: make sure bookkeeping landed.
                    if let Some(done) = self.executor.prepare_execution(id, false)? {
                        info!(
                            "↩️  Exit {} already executed ({:?})",
                            job.position_uuid, done.tx_sig
                        );
                        return Ok(());
                    }
                }
                id
            }
            None => {
                let code = outcome.code.unwrap_or(ErrorCode::ProgramError);
                return Err((code, outcome.reason.unwrap_or_default()));
            }
        };

        let sell = self
            .executor
            .execute_sell_flow(
                execution_id,
                &user,
                &wallet,
                slippage_bps,
                priority_fee,
                &position,
                job.sell_percent,
            )
            .await?;

        let (pnl, pnl_percent) = realized_pnl(
            sell.sol_out_lamports,
            position.entry_cost_lamports,
            sell.tokens_sold_raw,
            position.size_tokens.max(sell.tokens_sold_raw),
        );

        let emergency = job.trigger == ExitTrigger::Emergency;
        if job.sell_percent >= DUST_SELL_PERCENT {
            self.store
                .close_position(
                    &job.position_uuid,
                    execution_id,
                    &sell.tx_sig,
                    sell.exit_price,
                    pnl,
                    pnl_percent,
                    emergency,
                )
                .map_err(|e| (ErrorCode::ProgramError, e.to_string()))?;
        } else {
            // Moon-bag TP: the remainder keeps monitoring on the same row.
            let proportional = (position.entry_cost_lamports as u128
                * sell.tokens_sold_raw as u128
                / position.size_tokens.max(1) as u128) as u64;
            self.store
                .shrink_position(&job.position_uuid, sell.tokens_sold_raw, proportional)
                .map_err(|e| (ErrorCode::ProgramError, e.to_string()))?;
        }

        let kind = if emergency {
            NotificationKind::EmergencySellConfirmed
        } else if job.sell_percent >= DUST_SELL_PERCENT {
            NotificationKind::PositionClosed
        } else {
            NotificationKind::SellConfirmed
        };
        self.store
            .enqueue_notification(
                job.user_id,
                kind,
                &json!({
                    "position_uuid": job.position_uuid,
                    "token_mint": job.token_mint,
                    "token_symbol": position.token_symbol,
                    "chain": job.chain,
                    "trigger": job.trigger.as_str(),
                    "trigger_price": job.trigger_price,
                    "sell_percent": job.sell_percent,
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
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(uuid: &str, user: i64, trigger: ExitTrigger) -> ExitJob {
        ExitJob {
            position_uuid: uuid.to_string(),
            user_id: user,
            chain: "solana".to_string(),
            token_mint: "MintA".to_string(),
            trigger,
            trigger_price: 1.0,
            sell_percent: 100.0,
        }
    }

    #[test]
    fn pops_in_urgency_order() {
        let handle = ExitQueueHandle::new(16);
        handle.push(job("p-maxhold", 1, ExitTrigger::MaxHold));
        handle.push(job("p-tp", 2, ExitTrigger::TakeProfit));
        handle.push(job("p-sl", 3, ExitTrigger::StopLoss));
        handle.push(job("p-emergency", 4, ExitTrigger::Emergency));

        assert_eq!(handle.pop_ready().unwrap().position_uuid, "p-emergency");
        assert_eq!(handle.pop_ready().unwrap().position_uuid, "p-sl");
        assert_eq!(handle.pop_ready().unwrap().position_uuid, "p-tp");
        assert_eq!(handle.pop_ready().unwrap().position_uuid, "p-maxhold");
        assert!(handle.pop_ready().is_none());
    }

    #[test]
    fn same_priority_is_fifo() {
        let handle = ExitQueueHandle::new(16);
        handle.push(job("first", 1, ExitTrigger::StopLoss));
        handle.push(job("second", 2, ExitTrigger::StopLoss));
        assert_eq!(handle.pop_ready().unwrap().position_uuid, "first");
        assert_eq!(handle.pop_ready().unwrap().position_uuid, "second");
    }

    #[test]
    fn per_wallet_concurrency_is_one() {
        let handle = ExitQueueHandle::new(16);
        handle.push(job("a", 1, ExitTrigger::StopLoss));
        handle.push(job("b", 1, ExitTrigger::TakeProfit));
        handle.push(job("c", 2, ExitTrigger::MaxHold));

        let first = handle.pop_ready().unwrap();
        assert_eq!(first.position_uuid, "a");
        // Same wallet: parked. Different wallet: runnable.
        let second = handle.pop_ready().unwrap();
        assert_eq!(second.position_uuid, "c");
        assert!(handle.pop_ready().is_none());

        handle.release_wallet(1, "solana");
        assert_eq!(handle.pop_ready().unwrap().position_uuid, "b");
    }

    #[test]
    fn depth_counts_pending_and_in_flight() {
        let handle = ExitQueueHandle::new(16);
        handle.push(job("a", 1, ExitTrigger::StopLoss));
        handle.push(job("b", 2, ExitTrigger::StopLoss));
        assert_eq!(handle.depth(), 2);
        let _ = handle.pop_ready().unwrap();
        assert_eq!(handle.depth(), 2); // 1 pending + 1 in flight
        handle.release_wallet(1, "solana");
        assert_eq!(handle.depth(), 1);
    }

    #[test]
    fn capacity_bound_rejects_overflow() {
        let handle = ExitQueueHandle::new(1);
        assert!(handle.push(job("a", 1, ExitTrigger::StopLoss)));
        assert!(!handle.push(job("b", 2, ExitTrigger::StopLoss)));
    }

    #[test]
    fn claim_gate_hysteresis() {
        let mut gate = ClaimGate::new();
        assert!(gate.may_claim(0));
        assert!(gate.may_claim(EXIT_QUEUE_HIGH_WATER - 1));
        // Hit high water: pause.
        assert!(!gate.may_claim(EXIT_QUEUE_HIGH_WATER));
        // Still paused above low water.
        assert!(!gate.may_claim(EXIT_QUEUE_LOW_WATER + 1));
        // Resume at low water.
        assert!(gate.may_claim(EXIT_QUEUE_LOW_WATER));
    }
}
