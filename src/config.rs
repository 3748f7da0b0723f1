// Configuration, worker identity, and startup readiness.
// Each entrypoint validates only what its role actually needs; a notifier
// without a chat token must fail fast, an executor without one must not.

use anyhow::{bail, Result};
use std::env;
use tracing::info;
use uuid::Uuid;

use crate::constants::*;

/// Which process role this entrypoint runs. `All` hosts every component in a
/// single supervisor process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    All,
    Executor,
    Monitor,
    Notifier,
    Consumer,
    Maintenance,
}

impl WorkerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerRole::All => "engine",
            WorkerRole::Executor => "executor",
            WorkerRole::Monitor => "monitor",
            WorkerRole::Notifier => "notifier",
            WorkerRole::Consumer => "consumer",
            WorkerRole::Maintenance => "maintenance",
        }
    }

    fn needs_chat_token(&self) -> bool {
        matches!(self, WorkerRole::All | WorkerRole::Notifier)
    }

    fn needs_chain(&self) -> bool {
        matches!(self, WorkerRole::All | WorkerRole::Executor | WorkerRole::Monitor)
    }
}

/// Process configuration loaded from the environment, validated per role.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub role: WorkerRole,
    pub worker_id: String,

    pub store_path: String,
    pub wallet_encryption_key: String,
    pub rpc_url: String,
    pub ws_url: String,
    pub chat_token: Option<String>,
    pub price_api_url: String,
    pub aggregator_api_url: String,
    pub chain: String,
    pub production: bool,

    // Feature flags
    pub auto_execute_enabled: bool,
    pub position_monitor_enabled: bool,
    pub candidate_consumer_enabled: bool,
    pub graduation_monitor_enabled: bool,
    pub source_adapters_enabled: bool,

    // Clamped tunables
    pub job_poll_interval_ms: u64,
    pub job_claim_limit: usize,
    pub job_lease_seconds: u64,
    pub notification_poll_interval_ms: u64,
    pub candidate_poll_interval_seconds: u64,
    pub candidate_batch_size: usize,
    pub candidate_max_age_seconds: u64,
    pub monitor_poll_interval_ms: u64,
    pub confirm_timeout_ms: u64,
    pub maintenance_interval_seconds: u64,
    pub oracle_requests_per_minute: u32,
    pub oracle_burst: u32,
}

impl EngineConfig {
    /// Load and validate configuration for `role`. Fails fast on anything the
    /// role cannot run without.
    pub fn from_env(role: WorkerRole) -> Result<Self> {
        dotenvy::dotenv().ok();

        let store_path = env::var("RAPTOR_STORE_PATH").unwrap_or_else(|_| "data/raptor.db".to_string());

        let wallet_encryption_key = env::var("RAPTOR_WALLET_KEY")
            .map_err(|_| anyhow::anyhow!("RAPTOR_WALLET_KEY environment variable required"))?;
        if wallet_encryption_key.len() < 32 {
            bail!("RAPTOR_WALLET_KEY must be at least 32 characters");
        }

        let production = env_flag("RAPTOR_PRODUCTION", false);

        let rpc_url = env::var("RAPTOR_RPC_URL")
            .unwrap_or_else(|_| "https://api.mainnet-beta.solana.com".to_string());
        let ws_url = env::var("RAPTOR_WS_URL")
            .unwrap_or_else(|_| "wss://api.mainnet-beta.solana.com".to_string());

        if role.needs_chain() {
            if !rpc_url.starts_with("https://") {
                bail!("RAPTOR_RPC_URL must be an https:// endpoint, got {}", rpc_url);
            }
            if !ws_url.starts_with("wss://") {
                bail!("RAPTOR_WS_URL must be a wss:// endpoint, got {}", ws_url);
            }
            if production && is_dev_endpoint(&rpc_url) {
                bail!("Production mode rejects dev/test RPC endpoint {}", rpc_url);
            }
        }

        let chat_token = env::var("RAPTOR_CHAT_TOKEN").ok();
        if role.needs_chat_token() && chat_token.is_none() {
            bail!("RAPTOR_CHAT_TOKEN environment variable required for {} role", role.as_str());
        }

        let price_api_url = env::var("RAPTOR_PRICE_API_URL")
            .unwrap_or_else(|_| "https://lite-api.jup.ag/price/v2".to_string());
        let aggregator_api_url = env::var("RAPTOR_AGGREGATOR_API_URL")
            .unwrap_or_else(|_| "https://lite-api.jup.ag/swap/v1".to_string());
        let chain = env::var("RAPTOR_CHAIN").unwrap_or_else(|_| "solana".to_string());

        let config = Self {
            worker_id: worker_id(role),
            role,
            store_path,
            wallet_encryption_key,
            rpc_url,
            ws_url,
            chat_token,
            price_api_url,
            aggregator_api_url,
            chain,
            production,

            auto_execute_enabled: env_flag("RAPTOR_AUTO_EXECUTE", true),
            position_monitor_enabled: env_flag("RAPTOR_POSITION_MONITOR", true),
            candidate_consumer_enabled: env_flag("RAPTOR_CANDIDATE_CONSUMER", true),
            graduation_monitor_enabled: env_flag("RAPTOR_GRADUATION_MONITOR", true),
            source_adapters_enabled: env_flag("RAPTOR_SOURCE_ADAPTERS", true),

            job_poll_interval_ms: env_u64("RAPTOR_JOB_POLL_MS", JOB_POLL_INTERVAL_MS),
            job_claim_limit: clamp_usize(
                env_u64("RAPTOR_JOB_CLAIM_LIMIT", JOB_CLAIM_LIMIT_DEFAULT as u64) as usize,
                JOB_CLAIM_LIMIT_MIN,
                JOB_CLAIM_LIMIT_MAX,
            ),
            job_lease_seconds: clamp_u64(
                env_u64("RAPTOR_JOB_LEASE_SECONDS", JOB_LEASE_SECONDS_DEFAULT),
                JOB_LEASE_SECONDS_MIN,
                JOB_LEASE_SECONDS_MAX,
            ),
            notification_poll_interval_ms: env_u64(
                "RAPTOR_NOTIFY_POLL_MS",
                NOTIFICATION_POLL_INTERVAL_MS,
            ),
            candidate_poll_interval_seconds: clamp_u64(
                env_u64("RAPTOR_CANDIDATE_POLL_SECONDS", CANDIDATE_POLL_INTERVAL_SECONDS_DEFAULT),
                CANDIDATE_POLL_INTERVAL_SECONDS_MIN,
                CANDIDATE_POLL_INTERVAL_SECONDS_MAX,
            ),
            candidate_batch_size: clamp_usize(
                env_u64("RAPTOR_CANDIDATE_BATCH", CANDIDATE_BATCH_DEFAULT as u64) as usize,
                CANDIDATE_BATCH_MIN,
                CANDIDATE_BATCH_MAX,
            ),
            candidate_max_age_seconds: clamp_u64(
                env_u64("RAPTOR_CANDIDATE_MAX_AGE_SECONDS", CANDIDATE_MAX_AGE_SECONDS_DEFAULT),
                CANDIDATE_MAX_AGE_SECONDS_MIN,
                CANDIDATE_MAX_AGE_SECONDS_MAX,
            ),
            monitor_poll_interval_ms: env_u64("RAPTOR_MONITOR_POLL_MS", MONITOR_POLL_INTERVAL_MS),
            confirm_timeout_ms: env_u64("RAPTOR_CONFIRM_TIMEOUT_MS", DEFAULT_CONFIRM_TIMEOUT_MS),
            maintenance_interval_seconds: env_u64(
                "RAPTOR_MAINTENANCE_INTERVAL_SECONDS",
                MAINTENANCE_INTERVAL_SECONDS,
            ),
            oracle_requests_per_minute: env_u64(
                "RAPTOR_ORACLE_RPM",
                ORACLE_REQUESTS_PER_MINUTE as u64,
            ) as u32,
            oracle_burst: env_u64("RAPTOR_ORACLE_BURST", ORACLE_BURST as u64) as u32,
        };

        info!(
            "✅ Configuration loaded: role={} worker={} store={} chain={}",
            role.as_str(),
            config.worker_id,
            config.store_path,
            config.chain
        );

        Ok(config)
    }
}

/// Worker identity: `{role}-{host}-{uuid prefix}`. Stable for the lifetime of
/// the process, unique across restarts so stale leases never alias.
pub fn worker_id(role: WorkerRole) -> String {
    let host = env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    let nonce = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", role.as_str(), host, &nonce[..8])
}

fn is_dev_endpoint(url: &str) -> bool {
    let lower = url.to_lowercase();
    lower.contains("devnet") || lower.contains("testnet") || lower.contains("localhost") || lower.contains("127.0.0.1")
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

pub fn clamp_u64(value: u64, min: u64, max: u64) -> u64 {
    value.clamp(min, max)
}

pub fn clamp_usize(value: usize, min: usize, max: usize) -> usize {
    value.clamp(min, max)
}
