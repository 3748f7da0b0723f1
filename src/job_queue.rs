// Lease-based job queue over the trade_jobs table.
// Claims, heartbeats, and finalization all go through the store's atomic
// operations; this layer adds clamped tunables and the heartbeat guard that
// keeps long-running executions leased.

use anyhow::Result;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{clamp_u64, clamp_usize};
use crate::constants::*;
use crate::models::{JobPayload, JobStatus, TradeAction, TradeJob};
use crate::store::{FinalizeResult, Store};

#[derive(Clone)]
pub struct JobQueue {
    store: Store,
    worker_id: String,
    claim_limit: usize,
    lease_seconds: u64,
}

impl JobQueue {
    pub fn new(store: Store, worker_id: String, claim_limit: usize, lease_seconds: u64) -> Self {
        Self {
            store,
            worker_id,
            claim_limit: clamp_usize(claim_limit, JOB_CLAIM_LIMIT_MIN, JOB_CLAIM_LIMIT_MAX),
            lease_seconds: clamp_u64(lease_seconds, JOB_LEASE_SECONDS_MIN, JOB_LEASE_SECONDS_MAX),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Insert a job. A duplicate idempotency key returns the existing row.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue(
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
        self.store.enqueue_job(
            strategy_id,
            user_id,
            chain,
            action,
            candidate_id,
            priority,
            payload,
            idempotency_key,
            max_attempts,
        )
    }

    /// Claim a batch for this worker.
    pub fn poll(&self, chain: Option<&str>) -> Result<Vec<TradeJob>> {
        self.store
            .claim_trade_jobs(&self.worker_id, self.claim_limit, self.lease_seconds, chain)
    }

    pub fn mark_running(&self, job_id: i64) -> Result<bool> {
        self.store.mark_job_running(job_id, &self.worker_id)
    }

    pub fn finalize(
        &self,
        job_id: i64,
        status: JobStatus,
        retryable: bool,
        error: Option<&str>,
    ) -> Result<FinalizeResult> {
        self.store
            .finalize_job(job_id, &self.worker_id, status, retryable, error)
    }

    /// Spawn a heartbeat task that extends the lease at half-lease cadence
    /// until the returned guard drops. A worker that dies stops heartbeating
    /// and its jobs become claimable at lease expiry.
    pub fn spawn_heartbeat(&self, job_id: i64) -> HeartbeatGuard {
        let store = self.store.clone();
        let worker_id = self.worker_id.clone();
        let lease_seconds = self.lease_seconds;
        let interval = Duration::from_millis(lease_seconds * 1000 / 2);

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match store.extend_lease(job_id, &worker_id, lease_seconds) {
                    Ok(true) => debug!("💓 Heartbeat extended lease on job {}", job_id),
                    Ok(false) => {
                        // Lost the lease: another worker owns the job now.
                        warn!("💔 Lost lease on job {}, stopping heartbeat", job_id);
                        break;
                    }
                    Err(e) => {
                        warn!("⚠️  Heartbeat failed for job {}: {}", job_id, e);
                    }
                }
            }
        });

        HeartbeatGuard { handle }
    }
}

/// Aborts the heartbeat task on drop.
pub struct HeartbeatGuard {
    handle: JoinHandle<()>,
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunables_are_clamped_on_construction() {
        let store = Store::open_in_memory().unwrap();
        let queue = JobQueue::new(store, "w".to_string(), 500, 1);
        assert_eq!(queue.claim_limit, JOB_CLAIM_LIMIT_MAX);
        assert_eq!(queue.lease_seconds, JOB_LEASE_SECONDS_MIN);
    }

    #[tokio::test]
    async fn poll_claims_for_this_worker_only() {
        let store = Store::open_in_memory().unwrap();
        let user = store.get_or_create_user("c").unwrap();
        let payload = JobPayload {
            token_mint: "MintA".to_string(),
            ..Default::default()
        };
        let queue_a = JobQueue::new(store.clone(), "worker-a".to_string(), 5, 30);
        let queue_b = JobQueue::new(store.clone(), "worker-b".to_string(), 5, 30);

        queue_a
            .enqueue(None, user.id, "solana", TradeAction::Buy, None, 100, &payload, "k1", 3)
            .unwrap();

        let claimed = queue_a.poll(None).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].worker_id.as_deref(), Some("worker-a"));

        assert!(queue_b.poll(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn chain_filter_restricts_claims() {
        let store = Store::open_in_memory().unwrap();
        let user = store.get_or_create_user("c").unwrap();
        let payload = JobPayload {
            token_mint: "MintA".to_string(),
            ..Default::default()
        };
        let queue = JobQueue::new(store, "w".to_string(), 5, 30);
        queue
            .enqueue(None, user.id, "solana", TradeAction::Buy, None, 100, &payload, "k1", 3)
            .unwrap();
        queue
            .enqueue(None, user.id, "otherchain", TradeAction::Buy, None, 100, &payload, "k2", 3)
            .unwrap();

        let claimed = queue.poll(Some("solana")).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].chain, "solana");
    }
}
