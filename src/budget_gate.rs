// Budget & safety gate.
// A thin caller of the store's reserve_trade_budget RPC; the store transaction
// is the single authoritative enforcement point for caps, cooldowns, pause,
// circuit state, and execution idempotency. This layer only translates the
// outcome into the user-facing taxonomy and optionally surfaces denials.

use anyhow::Result;
use serde_json::json;
use tracing::debug;

use crate::error_classifier::ErrorCode;
use crate::models::{ExecutionMode, NotificationKind, TradeAction};
use crate::store::{ReserveOutcome, Store};

#[derive(Clone)]
pub struct BudgetGate {
    store: Store,
}

impl BudgetGate {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Ask the store to reserve budget for one trade attempt.
    ///
    /// `notify_on_denial` controls whether a terminal denial lands in the
    /// outbox: manual commands surface every denial, the auto flow stays
    /// quiet (a denial per candidate per user would flood the chat surface).
    #[allow(clippy::too_many_arguments)]
    pub fn reserve(
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
        notify_on_denial: bool,
    ) -> Result<ReserveOutcome> {
        let outcome = self.store.reserve_trade_budget(
            mode,
            user_id,
            strategy_id,
            chain,
            action,
            token_mint,
            amount_lamports,
            idempotency_key,
            deployer,
            allow_retry,
        )?;

        if !outcome.allowed {
            debug!(
                "🚫 Budget denied for user {} on {}: {:?} ({:?})",
                user_id, token_mint, outcome.reason, outcome.code
            );
            if notify_on_denial {
                if let Some(code) = outcome.code {
                    self.store.enqueue_notification(
                        user_id,
                        NotificationKind::BudgetDenied,
                        &json!({
                            "token_mint": token_mint,
                            "chain": chain,
                            "action": action.as_str(),
                            "reason": outcome.reason,
                            "error_code": code.as_str(),
                            "message": code.user_message(),
                        }),
                    )?;
                }
            }
        }

        Ok(outcome)
    }

    /// Map a denial onto the taxonomy for callers that need an ErrorCode.
    pub fn denial_code(outcome: &ReserveOutcome) -> Option<ErrorCode> {
        if outcome.allowed {
            None
        } else {
            // "Already executed" carries no code: it is not an error, just a
            // replay of a completed reservation.
            outcome.code
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Strategy, StrategyKind};

    fn seed(store: &Store) -> (i64, i64) {
        let user = store.get_or_create_user("chat-1").unwrap();
        let strategy = Strategy {
            id: 0,
            user_id: user.id,
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
            priority_fee_lamports: 0,
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
        let sid = store.upsert_strategy(&strategy).unwrap();
        (user.id, sid)
    }

    #[test]
    fn denial_surfaces_to_outbox_when_asked() {
        let store = Store::open_in_memory().unwrap();
        let (user_id, strategy_id) = seed(&store);
        let gate = BudgetGate::new(store.clone());

        store.set_trading_paused(true).unwrap();
        let outcome = gate
            .reserve(
                ExecutionMode::Manual,
                user_id,
                Some(strategy_id),
                "solana",
                TradeAction::Buy,
                "MintA",
                1_000,
                "key-1",
                None,
                false,
                true,
            )
            .unwrap();
        assert!(!outcome.allowed);
        assert_eq!(BudgetGate::denial_code(&outcome), Some(ErrorCode::TradingPaused));

        let claimed = store.claim_notifications("w", 10, 30).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].kind, "BUDGET_DENIED");
        assert_eq!(claimed[0].payload["error_code"], "TRADING_PAUSED");
    }

    #[test]
    fn auto_flow_denials_stay_quiet() {
        let store = Store::open_in_memory().unwrap();
        let (user_id, strategy_id) = seed(&store);
        let gate = BudgetGate::new(store.clone());

        store.set_trading_paused(true).unwrap();
        let outcome = gate
            .reserve(
                ExecutionMode::Auto,
                user_id,
                Some(strategy_id),
                "solana",
                TradeAction::Buy,
                "MintA",
                1_000,
                "key-1",
                None,
                false,
                false,
            )
            .unwrap();
        assert!(!outcome.allowed);
        assert!(store.claim_notifications("w", 10, 30).unwrap().is_empty());
    }
}
