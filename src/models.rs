//! Domain model for the trade lifecycle engine.
//!
//! Every enum that lands in a store column carries an `as_str` / `parse` pair;
//! the TEXT forms in the schema are the source of truth for the wire names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Timestamp format used everywhere in the store: UTC RFC 3339 with fixed
/// microsecond precision, so lexicographic order equals chronological order.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

pub fn now_ts() -> String {
    fmt_ts(Utc::now())
}

pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ============================================================================
// ENUMS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeAction {
    Buy,
    Sell,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
        }
    }

    pub fn parse(raw: &str) -> Option<TradeAction> {
        match raw {
            "BUY" => Some(TradeAction::Buy),
            "SELL" => Some(TradeAction::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    Auto,
    Manual,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Auto => "AUTO",
            ExecutionMode::Manual => "MANUAL",
        }
    }

    pub fn parse(raw: &str) -> Option<ExecutionMode> {
        match raw {
            "AUTO" => Some(ExecutionMode::Auto),
            "MANUAL" => Some(ExecutionMode::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Done => "DONE",
            JobStatus::Failed => "FAILED",
            JobStatus::Canceled => "CANCELED",
        }
    }

    pub fn parse(raw: &str) -> Option<JobStatus> {
        match raw {
            "PENDING" => Some(JobStatus::Pending),
            "RUNNING" => Some(JobStatus::Running),
            "DONE" => Some(JobStatus::Done),
            "FAILED" => Some(JobStatus::Failed),
            "CANCELED" => Some(JobStatus::Canceled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Reserved,
    Submitted,
    Confirmed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Reserved => "RESERVED",
            ExecutionStatus::Submitted => "SUBMITTED",
            ExecutionStatus::Confirmed => "CONFIRMED",
            ExecutionStatus::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Option<ExecutionStatus> {
        match raw {
            "RESERVED" => Some(ExecutionStatus::Reserved),
            "SUBMITTED" => Some(ExecutionStatus::Submitted),
            "CONFIRMED" => Some(ExecutionStatus::Confirmed),
            "FAILED" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }

    /// Valid forward transitions: RESERVED -> SUBMITTED -> {CONFIRMED|FAILED}.
    /// RESERVED may also fail directly (pre-submission errors).
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        matches!(
            (self, next),
            (ExecutionStatus::Reserved, ExecutionStatus::Submitted)
                | (ExecutionStatus::Reserved, ExecutionStatus::Failed)
                | (ExecutionStatus::Submitted, ExecutionStatus::Confirmed)
                | (ExecutionStatus::Submitted, ExecutionStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Active,
    Closing,
    ClosingEmergency,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Active => "ACTIVE",
            PositionStatus::Closing => "CLOSING",
            PositionStatus::ClosingEmergency => "CLOSING_EMERGENCY",
            PositionStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(raw: &str) -> Option<PositionStatus> {
        match raw {
            "ACTIVE" => Some(PositionStatus::Active),
            "CLOSING" => Some(PositionStatus::Closing),
            "CLOSING_EMERGENCY" => Some(PositionStatus::ClosingEmergency),
            "CLOSED" => Some(PositionStatus::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    PreGraduation,
    PostGraduation,
    Closed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::PreGraduation => "PRE_GRADUATION",
            LifecycleState::PostGraduation => "POST_GRADUATION",
            LifecycleState::Closed => "CLOSED",
        }
    }

    pub fn parse(raw: &str) -> Option<LifecycleState> {
        match raw {
            "PRE_GRADUATION" => Some(LifecycleState::PreGraduation),
            "POST_GRADUATION" => Some(LifecycleState::PostGraduation),
            "CLOSED" => Some(LifecycleState::Closed),
            _ => None,
        }
    }
}

/// Per-position exit machine. The CAS from MONITORING to TRIGGERED in the
/// store is the sole anti-double-exit primitive in the whole system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerState {
    Monitoring,
    Triggered,
    Executing,
    Completed,
    Failed,
}

impl TriggerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerState::Monitoring => "MONITORING",
            TriggerState::Triggered => "TRIGGERED",
            TriggerState::Executing => "EXECUTING",
            TriggerState::Completed => "COMPLETED",
            TriggerState::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Option<TriggerState> {
        match raw {
            "MONITORING" => Some(TriggerState::Monitoring),
            "TRIGGERED" => Some(TriggerState::Triggered),
            "EXECUTING" => Some(TriggerState::Executing),
            "COMPLETED" => Some(TriggerState::Completed),
            "FAILED" => Some(TriggerState::Failed),
            _ => None,
        }
    }
}

/// Exit trigger kind, in evaluation priority order (TP first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitTrigger {
    TakeProfit,
    StopLoss,
    Trailing,
    MaxHold,
    Emergency,
}

impl ExitTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitTrigger::TakeProfit => "TP",
            ExitTrigger::StopLoss => "SL",
            ExitTrigger::Trailing => "TRAIL",
            ExitTrigger::MaxHold => "MAXHOLD",
            ExitTrigger::Emergency => "EMERGENCY",
        }
    }

    pub fn parse(raw: &str) -> Option<ExitTrigger> {
        match raw {
            "TP" => Some(ExitTrigger::TakeProfit),
            "SL" => Some(ExitTrigger::StopLoss),
            "TRAIL" => Some(ExitTrigger::Trailing),
            "MAXHOLD" => Some(ExitTrigger::MaxHold),
            "EMERGENCY" => Some(ExitTrigger::Emergency),
            _ => None,
        }
    }

    /// Exit queue priority, lower is more urgent. Emergency preempts all.
    pub fn queue_priority(&self) -> u8 {
        match self {
            ExitTrigger::Emergency => 0,
            ExitTrigger::StopLoss => 1,
            ExitTrigger::TakeProfit => 2,
            ExitTrigger::Trailing => 3,
            ExitTrigger::MaxHold => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateStatus {
    New,
    Accepted,
    Rejected,
    Expired,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateStatus::New => "new",
            CandidateStatus::Accepted => "accepted",
            CandidateStatus::Rejected => "rejected",
            CandidateStatus::Expired => "expired",
        }
    }

    pub fn parse(raw: &str) -> Option<CandidateStatus> {
        match raw {
            "new" => Some(CandidateStatus::New),
            "accepted" => Some(CandidateStatus::Accepted),
            "rejected" => Some(CandidateStatus::Rejected),
            "expired" => Some(CandidateStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyKind {
    Manual,
    Auto,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Manual => "MANUAL",
            StrategyKind::Auto => "AUTO",
        }
    }

    pub fn parse(raw: &str) -> Option<StrategyKind> {
        match raw {
            "MANUAL" => Some(StrategyKind::Manual),
            "AUTO" => Some(StrategyKind::Auto),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CooldownKind {
    Mint,
    UserMint,
    Deployer,
}

impl CooldownKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CooldownKind::Mint => "MINT",
            CooldownKind::UserMint => "USER_MINT",
            CooldownKind::Deployer => "DEPLOYER",
        }
    }

    pub fn parse(raw: &str) -> Option<CooldownKind> {
        match raw {
            "MINT" => Some(CooldownKind::Mint),
            "USER_MINT" => Some(CooldownKind::UserMint),
            "DEPLOYER" => Some(CooldownKind::Deployer),
            _ => None,
        }
    }
}

/// Notification event kinds emitted toward the chat surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    PositionOpened,
    PositionClosed,
    BuyConfirmed,
    SellConfirmed,
    BuyFailed,
    SellFailed,
    EmergencySellStarted,
    EmergencySellConfirmed,
    EmergencySellFailed,
    BudgetDenied,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::PositionOpened => "POSITION_OPENED",
            NotificationKind::PositionClosed => "POSITION_CLOSED",
            NotificationKind::BuyConfirmed => "BUY_CONFIRMED",
            NotificationKind::SellConfirmed => "SELL_CONFIRMED",
            NotificationKind::BuyFailed => "BUY_FAILED",
            NotificationKind::SellFailed => "SELL_FAILED",
            NotificationKind::EmergencySellStarted => "EMERGENCY_SELL_STARTED",
            NotificationKind::EmergencySellConfirmed => "EMERGENCY_SELL_CONFIRMED",
            NotificationKind::EmergencySellFailed => "EMERGENCY_SELL_FAILED",
            NotificationKind::BudgetDenied => "BUDGET_DENIED",
        }
    }

    pub fn parse(raw: &str) -> Option<NotificationKind> {
        Some(match raw {
            "POSITION_OPENED" => NotificationKind::PositionOpened,
            "POSITION_CLOSED" => NotificationKind::PositionClosed,
            "BUY_CONFIRMED" => NotificationKind::BuyConfirmed,
            "SELL_CONFIRMED" => NotificationKind::SellConfirmed,
            "BUY_FAILED" => NotificationKind::BuyFailed,
            "SELL_FAILED" => NotificationKind::SellFailed,
            "EMERGENCY_SELL_STARTED" => NotificationKind::EmergencySellStarted,
            "EMERGENCY_SELL_CONFIRMED" => NotificationKind::EmergencySellConfirmed,
            "EMERGENCY_SELL_FAILED" => NotificationKind::EmergencySellFailed,
            "BUDGET_DENIED" => NotificationKind::BudgetDenied,
            _ => return None,
        })
    }
}

// ============================================================================
// ROW STRUCTS
// ============================================================================

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub chat_id: String,
    pub default_slippage_bps: u16,
    pub priority_fee_lamports: u64,
    pub use_anti_mev: bool,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct Wallet {
    pub id: i64,
    pub user_id: i64,
    pub chain: String,
    pub wallet_index: u8,
    pub label: String,
    pub is_active: bool,
    pub public_address: String,
    pub encrypted_key: String,
    pub key_nonce: String,
    pub key_salt: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct Strategy {
    pub id: i64,
    pub user_id: i64,
    pub kind: StrategyKind,
    pub chain: String,
    pub enabled: bool,
    pub auto_execute: bool,
    pub risk_profile: String,
    pub max_positions: u32,
    pub per_trade_cap_lamports: u64,
    pub daily_cap_lamports: u64,
    pub max_open_exposure_lamports: u64,
    pub slippage_bps: u16,
    pub priority_fee_lamports: u64,
    pub take_profit_percent: f64,
    pub stop_loss_percent: f64,
    pub max_hold_minutes: u32,
    pub trailing_enabled: bool,
    pub trail_activation_percent: f64,
    pub trail_distance_percent: f64,
    pub moon_bag_percent: f64,
    pub min_score: f64,
    pub launchpad_allowlist: Option<Vec<String>>,
    pub cooldown_seconds: u64,
    pub token_allowlist: Option<Vec<String>>,
    pub token_denylist: Option<Vec<String>>,
    pub snipe_mode: String,
    pub filter_mode: String,
}

#[derive(Debug, Clone)]
pub struct LaunchCandidate {
    pub id: i64,
    pub chain: String,
    pub source: String,
    pub token_mint: String,
    pub token_name: Option<String>,
    pub token_symbol: Option<String>,
    pub score: Option<f64>,
    pub deployer: Option<String>,
    pub bonding_curve: Option<String>,
    pub initial_liquidity_lamports: Option<u64>,
    pub status: CandidateStatus,
    pub first_seen_at: String,
}

#[derive(Debug, Clone)]
pub struct TradeJob {
    pub id: i64,
    pub strategy_id: Option<i64>,
    pub user_id: i64,
    pub chain: String,
    pub action: TradeAction,
    pub candidate_id: Option<i64>,
    pub priority: i64,
    pub payload: JobPayload,
    pub idempotency_key: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
}

/// Opaque job payload, JSON in `trade_jobs.payload`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobPayload {
    pub token_mint: String,
    #[serde(default)]
    pub amount_lamports: u64,
    #[serde(default)]
    pub sell_percent: Option<f64>,
    #[serde(default)]
    pub position_uuid: Option<String>,
    #[serde(default)]
    pub trigger: Option<String>,
    #[serde(default)]
    pub bonding_curve: Option<String>,
    #[serde(default)]
    pub execution_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Execution {
    pub id: i64,
    pub idempotency_key: String,
    pub user_id: i64,
    pub chain: String,
    pub token_mint: String,
    pub action: TradeAction,
    pub mode: ExecutionMode,
    pub status: ExecutionStatus,
    pub tx_sig: Option<String>,
    pub amount_lamports: u64,
    pub tokens_out: Option<u64>,
    pub price_per_token: Option<f64>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct Position {
    pub id: i64,
    pub uuid_id: String,
    pub user_id: i64,
    pub strategy_id: Option<i64>,
    pub candidate_id: Option<i64>,
    pub chain: String,
    pub token_mint: String,
    pub token_symbol: Option<String>,
    pub entry_execution_id: Option<i64>,
    pub entry_tx_sig: Option<String>,
    pub entry_cost_lamports: u64,
    pub entry_price: f64,
    pub size_tokens: u64,
    pub current_price: Option<f64>,
    pub peak_price: f64,
    pub tp_price: f64,
    pub sl_price: f64,
    pub trail_activation_price: Option<f64>,
    pub trail_distance_percent: Option<f64>,
    pub moon_bag_percent: f64,
    pub max_hold_minutes: u32,
    pub bonding_curve: Option<String>,
    pub entry_mc_lamports: Option<u64>,
    pub lifecycle_state: LifecycleState,
    pub status: PositionStatus,
    pub trigger_state: TriggerState,
    pub exit_trigger: Option<ExitTrigger>,
    pub trigger_price: Option<f64>,
    pub opened_at: String,
}

#[derive(Debug, Clone)]
pub struct NotificationRow {
    pub id: i64,
    pub user_id: i64,
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub worker_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct SafetyControls {
    pub trading_paused: bool,
    pub circuit_open_until: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TradeMonitorRow {
    pub id: i64,
    pub user_id: i64,
    pub token_mint: String,
    pub chat_id: String,
    pub status: String,
    pub current_view: String,
    pub expires_at: String,
    pub refresh_count: u32,
}

// ============================================================================
// IDEMPOTENCY KEYS
// ============================================================================

/// Deterministic idempotency key for an auto-buy: one per
/// (user, strategy, mint, BUY) tuple, so re-running the candidate consumer
/// over the same candidate set cannot double-queue.
pub fn buy_idempotency_key(user_id: i64, strategy_id: i64, chain: &str, token_mint: &str) -> String {
    derive_key(&format!("buy:{user_id}:{strategy_id}:{chain}:{token_mint}"))
}

/// Deterministic idempotency key for a triggered exit.
pub fn exit_idempotency_key(
    chain: &str,
    token_mint: &str,
    position_uuid: &str,
    trigger: ExitTrigger,
    sell_percent: f64,
) -> String {
    derive_key(&format!(
        "exit:{chain}:{token_mint}:{position_uuid}:{}:{sell_percent:.2}",
        trigger.as_str()
    ))
}

/// Manual trades key on an explicit client nonce so a retried command with the
/// same nonce cannot double-execute.
pub fn manual_idempotency_key(user_id: i64, token_mint: &str, action: TradeAction, nonce: &str) -> String {
    derive_key(&format!("manual:{user_id}:{token_mint}:{}:{nonce}", action.as_str()))
}

fn derive_key(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_keys_are_deterministic() {
        let a = buy_idempotency_key(1, 2, "solana", "MintAAA");
        let b = buy_idempotency_key(1, 2, "solana", "MintAAA");
        assert_eq!(a, b);
        assert_ne!(a, buy_idempotency_key(1, 2, "solana", "MintBBB"));
    }

    #[test]
    fn exit_keys_distinguish_triggers() {
        let tp = exit_idempotency_key("solana", "M", "uuid", ExitTrigger::TakeProfit, 100.0);
        let sl = exit_idempotency_key("solana", "M", "uuid", ExitTrigger::StopLoss, 100.0);
        assert_ne!(tp, sl);
    }

    #[test]
    fn trigger_priorities_order_urgency() {
        assert!(ExitTrigger::Emergency.queue_priority() < ExitTrigger::StopLoss.queue_priority());
        assert!(ExitTrigger::StopLoss.queue_priority() < ExitTrigger::TakeProfit.queue_priority());
        assert!(ExitTrigger::TakeProfit.queue_priority() < ExitTrigger::Trailing.queue_priority());
        assert!(ExitTrigger::Trailing.queue_priority() < ExitTrigger::MaxHold.queue_priority());
    }

    #[test]
    fn execution_transitions_are_monotone() {
        use ExecutionStatus::*;
        assert!(Reserved.can_transition_to(Submitted));
        assert!(Submitted.can_transition_to(Confirmed));
        assert!(Submitted.can_transition_to(Failed));
        assert!(Reserved.can_transition_to(Failed));
        assert!(!Confirmed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Submitted));
        assert!(!Confirmed.can_transition_to(Submitted));
    }

    #[test]
    fn timestamps_compare_lexicographically() {
        let early = fmt_ts(chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().into());
        let late = fmt_ts(chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:01Z").unwrap().into());
        assert!(early < late);
        assert!(parse_ts(&early).is_some());
    }
}
