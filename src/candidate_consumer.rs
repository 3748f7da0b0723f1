// Candidate consumer.
// Drains new launch_candidates, evaluates every enabled AUTO strategy's
// filters per user, reserves budget through the gate, and enqueues BUY jobs.
// Candidate acceptance is global: accepted when at least one user queued a
// job, rejected when none did, left for re-poll when only cooldowns blocked.

use anyhow::Result;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::budget_gate::BudgetGate;
use crate::config::EngineConfig;
use crate::job_queue::JobQueue;
use crate::models::*;
use crate::store::Store;

#[derive(Debug, Clone, Default)]
pub struct ConsumerStats {
    pub candidates_seen: u64,
    pub candidates_accepted: u64,
    pub candidates_rejected: u64,
    pub candidates_expired: u64,
    pub jobs_queued: u64,
}

pub struct CandidateConsumer {
    store: Store,
    gate: BudgetGate,
    queue: JobQueue,
    poll_interval: Duration,
    batch_size: usize,
    max_age_seconds: u64,
    stats: ConsumerStats,
}

impl CandidateConsumer {
    pub fn new(store: Store, gate: BudgetGate, queue: JobQueue, config: &EngineConfig) -> Self {
        Self {
            store,
            gate,
            queue,
            poll_interval: Duration::from_secs(config.candidate_poll_interval_seconds),
            batch_size: config.candidate_batch_size,
            max_age_seconds: config.candidate_max_age_seconds,
            stats: ConsumerStats::default(),
        }
    }

    /// Poll loop. Runs until the stop flag flips.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<()> {
        info!(
            "🔍 Candidate consumer started (poll {:?}, batch {})",
            self.poll_interval, self.batch_size
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.drain_batch().await {
                        warn!("⚠️  Candidate batch failed: {}", e);
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            "🔍 Candidate consumer stopped: {} seen, {} accepted, {} rejected, {} expired, {} jobs",
            self.stats.candidates_seen,
            self.stats.candidates_accepted,
            self.stats.candidates_rejected,
            self.stats.candidates_expired,
            self.stats.jobs_queued
        );
        Ok(())
    }

    /// One poll cycle over a batch of new candidates.
    pub async fn drain_batch(&mut self) -> Result<usize> {
        let candidates = self.store.new_candidates(self.batch_size)?;
        let mut processed = 0;
        for candidate in candidates {
            self.stats.candidates_seen += 1;
            self.process_candidate(&candidate).await?;
            processed += 1;
        }
        Ok(processed)
    }

    async fn process_candidate(&mut self, candidate: &LaunchCandidate) -> Result<()> {
        // Age gate first: stale launches never trade.
        if let Some(first_seen) = parse_ts(&candidate.first_seen_at) {
            let age = Utc::now().signed_duration_since(first_seen);
            if age.num_seconds() >= self.max_age_seconds as i64 {
                self.store
                    .set_candidate_status(candidate.id, CandidateStatus::Expired)?;
                self.stats.candidates_expired += 1;
                debug!(
                    "⌛ Candidate {} expired ({}s old)",
                    candidate.token_mint,
                    age.num_seconds()
                );
                return Ok(());
            }
        }

        let strategies = self.store.active_auto_strategies(&candidate.chain)?;
        let mut any_queued = false;
        let mut any_cooldown = false;

        for strategy in &strategies {
            if let Some(reason) = filter_rejection(strategy, candidate) {
                debug!(
                    "🚫 Candidate {} filtered for user {}: {}",
                    candidate.token_mint, strategy.user_id, reason
                );
                continue;
            }

            let amount_lamports = strategy.per_trade_cap_lamports;
            let idempotency_key = buy_idempotency_key(
                strategy.user_id,
                strategy.id,
                &candidate.chain,
                &candidate.token_mint,
            );

            let outcome = self.gate.reserve(
                ExecutionMode::Auto,
                strategy.user_id,
                Some(strategy.id),
                &candidate.chain,
                TradeAction::Buy,
                &candidate.token_mint,
                amount_lamports,
                &idempotency_key,
                candidate.deployer.as_deref(),
                false,
                false,
            )?;

            if outcome.allowed {
                let payload = JobPayload {
                    token_mint: candidate.token_mint.clone(),
                    amount_lamports,
                    bonding_curve: candidate.bonding_curve.clone(),
                    execution_id: outcome.execution_id,
                    ..Default::default()
                };
                let (_, created) = self.queue.enqueue(
                    Some(strategy.id),
                    strategy.user_id,
                    &candidate.chain,
                    TradeAction::Buy,
                    Some(candidate.id),
                    snipe_priority(&strategy.snipe_mode),
                    &payload,
                    &idempotency_key,
                    3,
                )?;
                if created {
                    self.stats.jobs_queued += 1;
                    info!(
                        "🎯 BUY queued: user {} mint {} ({} lamports)",
                        strategy.user_id, candidate.token_mint, amount_lamports
                    );
                }
                any_queued = true;
            } else if outcome.reason.as_deref() == Some("cooldown") {
                any_cooldown = true;
            }
            // cap_exceeded and the rest: skip for this user, others still run.
        }

        if any_queued {
            self.store
                .set_candidate_status(candidate.id, CandidateStatus::Accepted)?;
            self.stats.candidates_accepted += 1;
        } else if any_cooldown {
            // Leave status 'new': the cooldown may lapse before max age.
            debug!(
                "⏳ Candidate {} held for cooldown re-check",
                candidate.token_mint
            );
        } else {
            self.store
                .set_candidate_status(candidate.id, CandidateStatus::Rejected)?;
            self.stats.candidates_rejected += 1;
        }
        Ok(())
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }
}

/// Per-user filter predicates. Returns the rejection reason, or None to pass.
fn filter_rejection(strategy: &Strategy, candidate: &LaunchCandidate) -> Option<&'static str> {
    if candidate.score.unwrap_or(0.0) < strategy.min_score {
        return Some("score below minimum");
    }
    if let Some(allowlist) = &strategy.launchpad_allowlist {
        if !allowlist.iter().any(|s| s == &candidate.source) {
            return Some("launchpad not allowed");
        }
    }
    if let Some(denylist) = &strategy.token_denylist {
        if denylist.iter().any(|m| m == &candidate.token_mint) {
            return Some("token on deny list");
        }
    }
    if let Some(allowlist) = &strategy.token_allowlist {
        if !allowlist.iter().any(|m| m == &candidate.token_mint) {
            return Some("token not on allow list");
        }
    }
    None
}

/// Snipe mode shapes queue priority: aggressive snipes jump the line.
fn snipe_priority(snipe_mode: &str) -> i64 {
    match snipe_mode {
        "aggressive" => 10,
        "normal" => 50,
        _ => 100,
    }
}
