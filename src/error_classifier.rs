use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Canonical error taxonomy for trade execution failures.
///
/// Classification governs retry policy: a retryable code re-enqueues the job,
/// a terminal code surfaces to the user exactly once via the outbox. Unknown
/// errors deliberately map to `ProgramError` so an unclassified failure can
/// never retry forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    // Transient
    RpcTimeout,
    RpcRateLimited,
    BlockhashExpired,
    SlotDropped,
    NetworkError,
    // Terminal
    InsufficientFunds,
    SlippageExceeded,
    InvalidAccount,
    HoneypotDetected,
    TokenFrozen,
    ProgramError,
    SimulationFailed,
    TokenBlacklisted,
    DeployerBlacklisted,
    BudgetExceeded,
    CooldownActive,
    TradingPaused,
    CircuitOpen,
}

impl ErrorCode {
    /// Transient errors re-enqueue the job; terminal errors surface to the user.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::RpcTimeout
                | ErrorCode::RpcRateLimited
                | ErrorCode::BlockhashExpired
                | ErrorCode::SlotDropped
                | ErrorCode::NetworkError
        )
    }

    /// Wire name, stored in `executions.error_code` and notification payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RpcTimeout => "RPC_TIMEOUT",
            ErrorCode::RpcRateLimited => "RPC_RATE_LIMITED",
            ErrorCode::BlockhashExpired => "BLOCKHASH_EXPIRED",
            ErrorCode::SlotDropped => "SLOT_DROPPED",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorCode::SlippageExceeded => "SLIPPAGE_EXCEEDED",
            ErrorCode::InvalidAccount => "INVALID_ACCOUNT",
            ErrorCode::HoneypotDetected => "HONEYPOT_DETECTED",
            ErrorCode::TokenFrozen => "TOKEN_FROZEN",
            ErrorCode::ProgramError => "PROGRAM_ERROR",
            ErrorCode::SimulationFailed => "SIMULATION_FAILED",
            ErrorCode::TokenBlacklisted => "TOKEN_BLACKLISTED",
            ErrorCode::DeployerBlacklisted => "DEPLOYER_BLACKLISTED",
            ErrorCode::BudgetExceeded => "BUDGET_EXCEEDED",
            ErrorCode::CooldownActive => "COOLDOWN_ACTIVE",
            ErrorCode::TradingPaused => "TRADING_PAUSED",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
        }
    }

    pub fn from_str_code(code: &str) -> Option<ErrorCode> {
        Some(match code {
            "RPC_TIMEOUT" => ErrorCode::RpcTimeout,
            "RPC_RATE_LIMITED" => ErrorCode::RpcRateLimited,
            "BLOCKHASH_EXPIRED" => ErrorCode::BlockhashExpired,
            "SLOT_DROPPED" => ErrorCode::SlotDropped,
            "NETWORK_ERROR" => ErrorCode::NetworkError,
            "INSUFFICIENT_FUNDS" => ErrorCode::InsufficientFunds,
            "SLIPPAGE_EXCEEDED" => ErrorCode::SlippageExceeded,
            "INVALID_ACCOUNT" => ErrorCode::InvalidAccount,
            "HONEYPOT_DETECTED" => ErrorCode::HoneypotDetected,
            "TOKEN_FROZEN" => ErrorCode::TokenFrozen,
            "PROGRAM_ERROR" => ErrorCode::ProgramError,
            "SIMULATION_FAILED" => ErrorCode::SimulationFailed,
            "TOKEN_BLACKLISTED" => ErrorCode::TokenBlacklisted,
            "DEPLOYER_BLACKLISTED" => ErrorCode::DeployerBlacklisted,
            "BUDGET_EXCEEDED" => ErrorCode::BudgetExceeded,
            "COOLDOWN_ACTIVE" => ErrorCode::CooldownActive,
            "TRADING_PAUSED" => ErrorCode::TradingPaused,
            "CIRCUIT_OPEN" => ErrorCode::CircuitOpen,
            _ => return None,
        })
    }

    /// Translated message for the user-facing notification.
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorCode::RpcTimeout => "Network timed out. The trade was retried automatically.",
            ErrorCode::RpcRateLimited => "Network is congested. The trade was retried automatically.",
            ErrorCode::BlockhashExpired => "Transaction expired before confirmation. Retried automatically.",
            ErrorCode::SlotDropped => "Transaction was dropped by the network. Retried automatically.",
            ErrorCode::NetworkError => "Network error. The trade was retried automatically.",
            ErrorCode::InsufficientFunds => "Insufficient balance to cover the trade and fees.",
            ErrorCode::SlippageExceeded => "Price moved beyond your slippage tolerance.",
            ErrorCode::InvalidAccount => "A required on-chain account is missing or invalid.",
            ErrorCode::HoneypotDetected => "Token failed safety checks (possible honeypot). Trade blocked.",
            ErrorCode::TokenFrozen => "Token account is frozen. Trade blocked.",
            ErrorCode::ProgramError => "The swap program rejected the transaction.",
            ErrorCode::SimulationFailed => "Transaction simulation failed. No funds were spent.",
            ErrorCode::TokenBlacklisted => "Token is on your deny list.",
            ErrorCode::DeployerBlacklisted => "Token deployer is blacklisted.",
            ErrorCode::BudgetExceeded => "Trade would exceed your configured budget caps.",
            ErrorCode::CooldownActive => "Cooldown active for this token. Try again later.",
            ErrorCode::TradingPaused => "Trading is globally paused.",
            ErrorCode::CircuitOpen => "Circuit breaker is open. Trading resumes automatically.",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a raw router / RPC / HTTP error message onto the canonical taxonomy.
///
/// Matching is substring-based against the messages the venue SDKs and the
/// chain RPC actually emit. Order matters: the most specific patterns are
/// checked first. Anything unmatched is a `ProgramError` (terminal).
pub fn classify_error(error_message: &str) -> ErrorCode {
    let msg = error_message.to_lowercase();

    if msg.contains("blockhash not found")
        || msg.contains("blockhash expired")
        || msg.contains("block height exceeded")
    {
        ErrorCode::BlockhashExpired
    } else if msg.contains("429") || msg.contains("rate limit") || msg.contains("too many requests")
    {
        ErrorCode::RpcRateLimited
    } else if msg.contains("timed out") || msg.contains("timeout") {
        ErrorCode::RpcTimeout
    } else if msg.contains("slot was skipped") || msg.contains("minimum context slot") {
        ErrorCode::SlotDropped
    } else if msg.contains("connection")
        || msg.contains("dns")
        || msg.contains("network")
        || msg.contains("broken pipe")
        || msg.contains("connection reset")
    {
        ErrorCode::NetworkError
    } else if msg.contains("insufficient funds")
        || msg.contains("insufficient lamports")
        || msg.contains("insufficient balance")
    {
        ErrorCode::InsufficientFunds
    } else if msg.contains("slippage")
        || msg.contains("exceeds desired slippage")
        || msg.contains("0x1771")
    {
        ErrorCode::SlippageExceeded
    } else if msg.contains("account not found")
        || msg.contains("invalid account")
        || msg.contains("accountnotfound")
        || msg.contains("could not find account")
    {
        ErrorCode::InvalidAccount
    } else if msg.contains("honeypot") {
        ErrorCode::HoneypotDetected
    } else if msg.contains("frozen") || msg.contains("account is frozen") {
        ErrorCode::TokenFrozen
    } else if msg.contains("simulation failed") || msg.contains("transaction simulation") {
        ErrorCode::SimulationFailed
    } else {
        ErrorCode::ProgramError
    }
}

/// Exponential backoff with jitter for transient-error retry loops.
///
/// attempt is 1-based. Delay doubles per attempt from `base_ms`, capped at
/// `max_ms`, with up to 20% random jitter to avoid thundering herds.
pub fn retry_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    let capped = exp.min(max_ms);
    let jitter = fastrand::u64(0..=capped / 5);
    Duration::from_millis(capped + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_split_matches_taxonomy() {
        assert!(ErrorCode::RpcTimeout.is_retryable());
        assert!(ErrorCode::BlockhashExpired.is_retryable());
        assert!(ErrorCode::SlotDropped.is_retryable());
        assert!(!ErrorCode::InsufficientFunds.is_retryable());
        assert!(!ErrorCode::SlippageExceeded.is_retryable());
        assert!(!ErrorCode::ProgramError.is_retryable());
        assert!(!ErrorCode::TradingPaused.is_retryable());
    }

    #[test]
    fn classifies_known_rpc_messages() {
        assert_eq!(
            classify_error("Transaction simulation failed: Blockhash not found"),
            ErrorCode::BlockhashExpired
        );
        assert_eq!(
            classify_error("HTTP status client error (429 Too Many Requests)"),
            ErrorCode::RpcRateLimited
        );
        assert_eq!(
            classify_error("Error: insufficient lamports 100, need 200"),
            ErrorCode::InsufficientFunds
        );
        assert_eq!(
            classify_error("custom program error: 0x1771"),
            ErrorCode::SlippageExceeded
        );
        assert_eq!(classify_error("operation timed out"), ErrorCode::RpcTimeout);
    }

    #[test]
    fn unknown_errors_are_terminal() {
        let code = classify_error("some exotic failure nobody has seen");
        assert_eq!(code, ErrorCode::ProgramError);
        assert!(!code.is_retryable());
    }

    #[test]
    fn blockhash_beats_timeout_when_both_present() {
        // A confirm timeout caused by an expired blockhash must classify as
        // BLOCKHASH_EXPIRED so the caller retries with a fresh blockhash.
        assert_eq!(
            classify_error("timeout waiting for confirmation: block height exceeded"),
            ErrorCode::BlockhashExpired
        );
    }

    #[test]
    fn codes_round_trip_through_wire_names() {
        for code in [
            ErrorCode::RpcTimeout,
            ErrorCode::BlockhashExpired,
            ErrorCode::BudgetExceeded,
            ErrorCode::CircuitOpen,
        ] {
            assert_eq!(ErrorCode::from_str_code(code.as_str()), Some(code));
        }
        assert_eq!(ErrorCode::from_str_code("NOT_A_CODE"), None);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let d1 = retry_backoff(1, 100, 5_000);
        let d4 = retry_backoff(4, 100, 5_000);
        assert!(d1.as_millis() >= 100);
        assert!(d4.as_millis() >= 800);
        assert!(retry_backoff(30, 100, 5_000).as_millis() <= 6_000);
    }
}
