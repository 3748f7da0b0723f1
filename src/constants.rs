/// Global constants for the RAPTOR trade lifecycle engine
///
/// This module centralizes magic numbers and tunable defaults so every
/// component clamps and defaults against the same values.

// ============================================================================
// SOLANA BLOCKCHAIN CONSTANTS
// ============================================================================

/// 1 SOL = 1 billion lamports
pub const SOL_DECIMALS: u64 = 1_000_000_000;

/// Convert lamports to SOL (floating point, display boundary only)
pub const fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / SOL_DECIMALS as f64
}

/// Convert SOL to lamports
pub const fn sol_to_lamports(sol: f64) -> u64 {
    (sol * SOL_DECIMALS as f64) as u64
}

/// Estimated gas cost for a standard transaction (~0.00005 SOL)
pub const ESTIMATED_GAS_LAMPORTS: u64 = 50_000;

/// Safety buffer for unexpected fees and rent (~0.005 SOL)
pub const SAFETY_BUFFER_LAMPORTS: u64 = 5_000_000;

/// Default swap confirmation timeout
pub const DEFAULT_CONFIRM_TIMEOUT_MS: u64 = 30_000;

// ============================================================================
// BONDING CURVE CONSTANTS
// ============================================================================

/// Bonding curve launchpad program ID
pub const CURVE_PROGRAM_ID: &str = "6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P";

/// Bonding curve PDA seed
pub const CURVE_SEED: &[u8] = b"bonding-curve";

/// Buy / sell instruction discriminators (Anchor 8-byte sighashes)
pub const CURVE_BUY_DISCRIMINATOR: [u8; 8] = [102, 6, 61, 18, 1, 218, 235, 234];
pub const CURVE_SELL_DISCRIMINATOR: [u8; 8] = [51, 230, 133, 164, 1, 127, 131, 173];

/// Virtual SOL reserves at which the curve completes and graduates (~85 SOL)
pub const CURVE_GRADUATION_LAMPORTS: u64 = 85_000_000_000;

/// Selling >= this percent of a balance rounds up to the full balance (dust rule)
pub const DUST_SELL_PERCENT: f64 = 95.0;

// ============================================================================
// JOB QUEUE TUNABLES
// ============================================================================

pub const JOB_POLL_INTERVAL_MS: u64 = 1_500;
pub const JOB_CLAIM_LIMIT_DEFAULT: usize = 5;
pub const JOB_CLAIM_LIMIT_MIN: usize = 1;
pub const JOB_CLAIM_LIMIT_MAX: usize = 20;
pub const JOB_LEASE_SECONDS_DEFAULT: u64 = 30;
pub const JOB_LEASE_SECONDS_MIN: u64 = 10;
pub const JOB_LEASE_SECONDS_MAX: u64 = 120;

// ============================================================================
// CANDIDATE CONSUMER TUNABLES
// ============================================================================

pub const CANDIDATE_POLL_INTERVAL_SECONDS_DEFAULT: u64 = 2;
pub const CANDIDATE_POLL_INTERVAL_SECONDS_MIN: u64 = 1;
pub const CANDIDATE_POLL_INTERVAL_SECONDS_MAX: u64 = 10;
pub const CANDIDATE_BATCH_DEFAULT: usize = 10;
pub const CANDIDATE_BATCH_MIN: usize = 1;
pub const CANDIDATE_BATCH_MAX: usize = 50;
pub const CANDIDATE_MAX_AGE_SECONDS_DEFAULT: u64 = 120;
pub const CANDIDATE_MAX_AGE_SECONDS_MIN: u64 = 30;
pub const CANDIDATE_MAX_AGE_SECONDS_MAX: u64 = 600;

// ============================================================================
// POSITION MONITOR TUNABLES
// ============================================================================

/// Price poll interval for watched tokens
pub const MONITOR_POLL_INTERVAL_MS: u64 = 3_000;

/// Watch set refresh cadence, in poll cycles
pub const MONITOR_REFRESH_EVERY_CYCLES: u64 = 10;

/// Price cache bounds
pub const PRICE_CACHE_MAX_ENTRIES: usize = 1_000;
pub const PRICE_CACHE_TTL_SECONDS: u64 = 10;
pub const PRICE_CACHE_SWEEP_INTERVAL_SECONDS: u64 = 300;

/// WebSocket subscription inactivity limit before teardown + resubscribe
pub const WS_INACTIVITY_TIMEOUT_SECONDS: u64 = 90;

// ============================================================================
// EXIT QUEUE TUNABLES
// ============================================================================

/// Queue depth at which the monitor stops claiming new triggers
pub const EXIT_QUEUE_HIGH_WATER: usize = 64;
/// Queue depth at which claiming resumes
pub const EXIT_QUEUE_LOW_WATER: usize = 16;
/// Concurrent sells per wallet per chain
pub const EXIT_PER_WALLET_CONCURRENCY: usize = 1;

// ============================================================================
// OUTBOX / MAINTENANCE TUNABLES
// ============================================================================

pub const NOTIFICATION_POLL_INTERVAL_MS: u64 = 1_500;
pub const NOTIFICATION_LEASE_SECONDS: u64 = 30;
pub const NOTIFICATION_CLAIM_LIMIT: usize = 10;

pub const MAINTENANCE_INTERVAL_SECONDS: u64 = 60;
/// RESERVED/SUBMITTED executions older than this are failed as RPC_TIMEOUT
pub const STALE_EXECUTION_MINUTES: i64 = 5;
/// Sent notifications older than this are purged
pub const SENT_NOTIFICATION_RETENTION_HOURS: i64 = 24;

// ============================================================================
// PRICE ORACLE TUNABLES
// ============================================================================

pub const ORACLE_REQUESTS_PER_MINUTE: u32 = 120;
pub const ORACLE_BURST: u32 = 20;
pub const ORACLE_HTTP_TIMEOUT_SECONDS: u64 = 10;
