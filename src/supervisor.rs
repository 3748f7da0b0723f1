// Supervisor.
// Owns the stop flag, runs startup readiness checks, wires every component
// for the configured role, and exposes the engine handle used by the command
// surface (emergency sells, wallet export, re-entrancy guard). Components
// never share in-process state except through the store and the explicit
// channels created here.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::aggregator_router::AggregatorRouter;
use crate::audit_log::{AuditEvent, AuditLog};
use crate::budget_gate::BudgetGate;
use crate::candidate_consumer::CandidateConsumer;
use crate::chain_rpc::ChainRpc;
use crate::config::{EngineConfig, WorkerRole};
use crate::constants::EXIT_QUEUE_HIGH_WATER;
use crate::curve_router::CurveRouter;
use crate::error_classifier::retry_backoff;
use crate::execution_worker::{ExecutionWorker, TradeExecutor};
use crate::exit_queue::{request_emergency_sell, ExitQueue, ExitQueueHandle};
use crate::job_queue::JobQueue;
use crate::maintenance::MaintenanceLoop;
use crate::models::TradeAction;
use crate::outbox_notifier::{ChatSurface, OutboxNotifier};
use crate::position_monitor::PositionMonitor;
use crate::price_oracle::PriceOracle;
use crate::store::Store;
use crate::swap_router::RouterFactory;
use crate::token_decimals::TokenDecimals;
use crate::wallet_vault::WalletVault;
use crate::ws_subscriptions::SubscriptionManager;

/// A running engine process: component tasks plus the control handle.
pub struct RunningEngine {
    stop_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<Result<()>>)>,
    pub handle: EngineHandle,
}

impl RunningEngine {
    /// Flip the stop flag and await every component. The exit queue drains
    /// before its task returns.
    pub async fn shutdown(self) {
        info!("🛑 Shutdown initiated");
        self.stop_tx.send(true).ok();
        for (name, task) in self.tasks {
            match task.await {
                Ok(Ok(())) => info!("✅ {} stopped cleanly", name),
                Ok(Err(e)) => error!("❌ {} exited with error: {}", name, e),
                Err(e) => error!("❌ {} panicked: {}", name, e),
            }
        }
        info!("👋 Shutdown complete");
    }

    /// Wait for any component to exit on its own (supervisor restart policy
    /// is the orchestrator's job; we just surface the first failure).
    pub async fn wait(&mut self) -> Result<()> {
        if self.tasks.is_empty() {
            bail!("no components started for this role");
        }
        let (result, index, _) =
            futures::future::select_all(self.tasks.iter_mut().map(|(_, t)| t)).await;
        let (name, _) = self.tasks.remove(index);
        match result {
            Ok(Ok(())) => {
                warn!("⚠️  Component {} exited", name);
                Ok(())
            }
            Ok(Err(e)) => bail!("component {} failed: {}", name, e),
            Err(e) => bail!("component {} panicked: {}", name, e),
        }
    }
}

/// Control surface for user-facing commands.
#[derive(Clone)]
pub struct EngineHandle {
    pub store: Store,
    pub audit: AuditLog,
    exit_handle: Option<ExitQueueHandle>,
    /// Re-entrancy guard keyed on (user, mint, side): one active BUY/SELL
    /// command per key at a time.
    active_commands: Arc<Mutex<HashSet<(i64, String, &'static str)>>>,
}

impl EngineHandle {
    /// Take the command slot for (user, mint, side). Returns false when a
    /// command is already in flight for the key.
    pub fn begin_command(&self, user_id: i64, token_mint: &str, side: TradeAction) -> bool {
        self.active_commands
            .lock()
            .insert((user_id, token_mint.to_string(), side.as_str()))
    }

    pub fn end_command(&self, user_id: i64, token_mint: &str, side: TradeAction) {
        self.active_commands
            .lock()
            .remove(&(user_id, token_mint.to_string(), side.as_str()));
    }

    /// User-initiated emergency sell: bypasses the monitor, claims the exit
    /// directly, queues at maximum priority.
    pub async fn emergency_sell(&self, position_uuid: &str) -> Result<bool> {
        let Some(exit_handle) = &self.exit_handle else {
            bail!("this role does not host the exit queue");
        };
        request_emergency_sell(&self.store, &self.audit, exit_handle, position_uuid).await
    }

    /// Audited export of a wallet's encrypted key material. The material
    /// stays encrypted; this is the only read path that returns it.
    pub async fn export_wallet_material(&self, user_id: i64, chain: &str) -> Result<String> {
        let wallet = self
            .store
            .active_wallet(user_id, chain)?
            .context("no active wallet to export")?;
        self.audit
            .record(
                AuditEvent::KeyExport,
                Some(user_id),
                chain,
                &format!("wallet {} ({})", wallet.id, wallet.public_address),
            )
            .await?;
        Ok(wallet.encrypted_key)
    }
}

/// Start every component the role hosts. Fails fast when readiness probes
/// fail; transient store failures back off and retry a few times before
/// giving up to the process supervisor.
pub async fn start(config: EngineConfig, surface: Arc<dyn ChatSurface>) -> Result<RunningEngine> {
    let (stop_tx, stop_rx) = watch::channel(false);

    // Readiness: store first, then chain for the roles that talk to it.
    let store = open_store_with_backoff(&config).await?;
    store.health_check()?;

    let rpc = Arc::new(ChainRpc::new(config.rpc_url.clone()));
    let needs_chain = matches!(
        config.role,
        WorkerRole::All | WorkerRole::Executor | WorkerRole::Monitor
    );
    if needs_chain {
        rpc.health_check().await?;
    }

    let audit = AuditLog::new("data/audit.jsonl");
    let vault = WalletVault::new(config.wallet_encryption_key.clone());
    let decimals = TokenDecimals::new(Arc::clone(&rpc));
    decimals.seed_known().await;

    let curve = Arc::new(CurveRouter::new(Arc::clone(&rpc)));
    let aggregator = Arc::new(AggregatorRouter::new(
        Arc::clone(&rpc),
        config.aggregator_api_url.clone(),
    ));
    let routers = RouterFactory::new(curve, aggregator);

    let executor = TradeExecutor {
        store: store.clone(),
        vault,
        balances: Arc::clone(&rpc) as Arc<dyn crate::chain_rpc::BalanceReader>,
        decimals: decimals.clone(),
        routers,
        confirm_timeout_ms: config.confirm_timeout_ms,
    };
    let gate = BudgetGate::new(store.clone());

    let mut tasks: Vec<(&'static str, JoinHandle<Result<()>>)> = Vec::new();
    let role = config.role;
    let hosts = |r: WorkerRole| role == WorkerRole::All || role == r;

    let mut exit_handle_for_api = None;

    if hosts(WorkerRole::Monitor) && config.position_monitor_enabled {
        let exit_handle = ExitQueueHandle::new(EXIT_QUEUE_HIGH_WATER * 2);
        exit_handle_for_api = Some(exit_handle.clone());

        let exit_queue = ExitQueue::new(
            exit_handle.clone(),
            executor.clone(),
            gate.clone(),
            store.clone(),
        );
        tasks.push(("exit-queue", tokio::spawn(exit_queue.run(stop_rx.clone()))));

        let (hint_tx, hint_rx) = mpsc::unbounded_channel();
        let subs = SubscriptionManager::start(config.ws_url.clone(), hint_tx, stop_rx.clone());
        let oracle = Arc::new(PriceOracle::new(
            config.price_api_url.clone(),
            config.oracle_requests_per_minute,
            config.oracle_burst,
        ));
        let monitor = PositionMonitor::new(
            store.clone(),
            oracle,
            Arc::clone(&rpc),
            decimals.clone(),
            exit_handle,
            subs,
            &config,
        );
        tasks.push((
            "position-monitor",
            tokio::spawn(monitor.run(hint_rx, stop_rx.clone())),
        ));
    }

    if hosts(WorkerRole::Executor) {
        let queue = JobQueue::new(
            store.clone(),
            config.worker_id.clone(),
            config.job_claim_limit,
            config.job_lease_seconds,
        );
        let worker = ExecutionWorker::new(executor.clone(), queue, gate.clone(), &config);
        tasks.push(("execution-worker", tokio::spawn(worker.run(stop_rx.clone()))));
    }

    if hosts(WorkerRole::Consumer) && config.candidate_consumer_enabled && config.auto_execute_enabled
    {
        let queue = JobQueue::new(
            store.clone(),
            config.worker_id.clone(),
            config.job_claim_limit,
            config.job_lease_seconds,
        );
        let consumer = CandidateConsumer::new(store.clone(), gate.clone(), queue, &config);
        tasks.push((
            "candidate-consumer",
            tokio::spawn(consumer.run(stop_rx.clone())),
        ));
    }

    if hosts(WorkerRole::Notifier) {
        let notifier = OutboxNotifier::new(store.clone(), surface, &config);
        tasks.push(("outbox-notifier", tokio::spawn(notifier.run(stop_rx.clone()))));
    }

    if hosts(WorkerRole::Maintenance) {
        let maintenance = MaintenanceLoop::new(store.clone(), &config);
        tasks.push(("maintenance", tokio::spawn(maintenance.run(stop_rx.clone()))));
    }

    info!(
        "🚀 {} component(s) running for role {}",
        tasks.len(),
        role.as_str()
    );

    Ok(RunningEngine {
        stop_tx,
        tasks,
        handle: EngineHandle {
            store,
            audit,
            exit_handle: exit_handle_for_api,
            active_commands: Arc::new(Mutex::new(HashSet::new())),
        },
    })
}

/// Store failures at startup are transient until proven otherwise: bounded
/// backoff, then exit and let the process supervisor restart us.
async fn open_store_with_backoff(config: &EngineConfig) -> Result<Store> {
    let mut attempt = 0u32;
    loop {
        match Store::open(&config.store_path) {
            Ok(store) => return Ok(store),
            Err(e) => {
                attempt += 1;
                if attempt >= 5 {
                    return Err(e.context("store unavailable after 5 attempts"));
                }
                let delay = retry_backoff(attempt, 500, 10_000);
                warn!("⚠️  Store open failed (attempt {}): {:#}; retrying in {:?}", attempt, e, delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reentrancy_guard_is_per_user_mint_side() {
        let handle = EngineHandle {
            store: Store::open_in_memory().unwrap(),
            audit: AuditLog::new("/tmp/raptor-test-audit.jsonl"),
            exit_handle: None,
            active_commands: Arc::new(Mutex::new(HashSet::new())),
        };

        assert!(handle.begin_command(1, "MintA", TradeAction::Buy));
        // Same key: blocked.
        assert!(!handle.begin_command(1, "MintA", TradeAction::Buy));
        // Different side / mint / user: allowed.
        assert!(handle.begin_command(1, "MintA", TradeAction::Sell));
        assert!(handle.begin_command(1, "MintB", TradeAction::Buy));
        assert!(handle.begin_command(2, "MintA", TradeAction::Buy));

        handle.end_command(1, "MintA", TradeAction::Buy);
        assert!(handle.begin_command(1, "MintA", TradeAction::Buy));
    }
}
