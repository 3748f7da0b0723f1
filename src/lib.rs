//! RAPTOR: autonomous trade lifecycle engine for bonding-curve tokens
//!
//! This library provides:
//! - A relational store with the atomic claim/lease/CAS primitives every
//!   worker coordinates through
//! - A lease-based trade job queue with retry classification
//! - The candidate consumer, execution worker, position monitor, exit queue,
//!   and outbox notifier components
//! - A venue-agnostic swap router with bonding-curve and aggregator backends

pub mod aggregator_router;
pub mod audit_log;
pub mod budget_gate;
pub mod candidate_consumer;
pub mod chain_rpc;
pub mod config;
pub mod constants;
pub mod curve_router;
pub mod error_classifier;
pub mod execution_worker;
pub mod exit_queue;
pub mod job_queue;
pub mod maintenance;
pub mod models;
pub mod outbox_notifier;
pub mod position_monitor;
pub mod price_cache;
pub mod price_oracle;
pub mod store;
pub mod supervisor;
pub mod swap_router;
pub mod token_decimals;
pub mod wallet_vault;
pub mod ws_subscriptions;

// Re-export main types for convenience
pub use audit_log::{AuditEvent, AuditLog};
pub use budget_gate::BudgetGate;
pub use candidate_consumer::{CandidateConsumer, ConsumerStats};
pub use chain_rpc::{associated_token_address, BalanceReader, BlockhashInfo, ChainRpc};
pub use config::{worker_id, EngineConfig, WorkerRole};
pub use curve_router::{CurveRouter, CurveState};
pub use error_classifier::{classify_error, retry_backoff, ErrorCode};
pub use execution_worker::{realized_pnl, ExecutionWorker, SellOutcome, TradeExecutor};
pub use exit_queue::{
    request_emergency_sell, ClaimGate, ExitJob, ExitQueue, ExitQueueHandle,
};
pub use job_queue::{HeartbeatGuard, JobQueue};
pub use maintenance::MaintenanceLoop;
pub use models::{
    buy_idempotency_key, exit_idempotency_key, manual_idempotency_key, CandidateStatus,
    CooldownKind, ExecutionMode, ExecutionStatus, ExitTrigger, JobPayload, JobStatus,
    LaunchCandidate, LifecycleState, NotificationKind, Position, PositionStatus, Strategy,
    StrategyKind, TradeAction, TradeJob, TriggerState, User, Wallet,
};
pub use outbox_notifier::{ChatSurface, LoggingSurface, NotifierStats, OutboxNotifier};
pub use position_monitor::{
    evaluate_trigger, sell_percent_for, MonitorStats, PositionMonitor, WatchedPosition,
};
pub use price_cache::{PriceCache, PriceCacheStats};
pub use price_oracle::{OracleStats, PriceOracle};
pub use store::{FinalizeResult, ReserveOutcome, Store, TriggerClaim};
pub use supervisor::{start, EngineHandle, RunningEngine};
pub use swap_router::{
    min_output_after_slippage, raw_sell_amount, ExecuteOptions, RouterFactory, SwapIntent,
    SwapQuote, SwapResult, SwapRouter, UnsignedSwap,
};
pub use token_decimals::{fill_price_sol, raw_to_whole, whole_to_raw, TokenDecimals};
pub use wallet_vault::{EncryptedKeyMaterial, SigningKey, WalletVault};
pub use ws_subscriptions::{ActivityHint, SubscriptionManager};
