// Position monitor (TP/SL engine).
// Hybrid pricing: a fixed-interval poll over the deduplicated set of held
// tokens, plus WebSocket activity hints that force an immediate out-of-band
// fetch. Every price observation updates the persisted peak and runs trigger
// evaluation; a matched trigger is claimed through the store CAS, and the
// single winner enqueues an exit job. Thresholds are immutable: tp/sl/trail
// activation are read once from the position row, never from live strategy.

use anyhow::Result;
use chrono::{DateTime, Utc};
use solana_sdk::pubkey::Pubkey;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::chain_rpc::ChainRpc;
use crate::config::EngineConfig;
use crate::constants::*;
use crate::curve_router::CurveRouter;
use crate::exit_queue::{ClaimGate, ExitJob, ExitQueueHandle};
use crate::models::*;
use crate::price_cache::PriceCache;
use crate::price_oracle::PriceOracle;
use crate::store::Store;
use crate::token_decimals::TokenDecimals;
use crate::ws_subscriptions::{ActivityHint, SubscriptionManager};

/// In-process snapshot of a watched position. Trigger thresholds are loaded
/// once at watch time; only `peak_price` mutates.
#[derive(Debug, Clone)]
pub struct WatchedPosition {
    pub uuid_id: String,
    pub user_id: i64,
    pub chain: String,
    pub token_mint: String,
    pub entry_price: f64,
    pub tp_price: f64,
    pub sl_price: f64,
    pub trail_activation_price: Option<f64>,
    pub trail_distance_percent: Option<f64>,
    pub peak_price: f64,
    pub moon_bag_percent: f64,
    pub max_hold_minutes: u32,
    pub opened_at: DateTime<Utc>,
    pub bonding_curve: Option<String>,
    pub lifecycle_state: LifecycleState,
}

impl WatchedPosition {
    fn from_row(position: &Position) -> Option<Self> {
        Some(Self {
            uuid_id: position.uuid_id.clone(),
            user_id: position.user_id,
            chain: position.chain.clone(),
            token_mint: position.token_mint.clone(),
            entry_price: position.entry_price,
            tp_price: position.tp_price,
            sl_price: position.sl_price,
            trail_activation_price: position.trail_activation_price,
            trail_distance_percent: position.trail_distance_percent,
            peak_price: position.peak_price,
            moon_bag_percent: position.moon_bag_percent,
            max_hold_minutes: position.max_hold_minutes,
            opened_at: parse_ts(&position.opened_at)?,
            bonding_curve: position.bonding_curve.clone(),
            lifecycle_state: position.lifecycle_state,
        })
    }
}

/// First match wins: TP, then SL, then TRAIL, then MAXHOLD. TP and SL are
/// inclusive bounds off immutable reference prices; TRAIL needs peak state;
/// MAXHOLD is the no-price-trigger fallback.
pub fn evaluate_trigger(
    position: &WatchedPosition,
    price: f64,
    now: DateTime<Utc>,
) -> Option<ExitTrigger> {
    if price >= position.tp_price {
        return Some(ExitTrigger::TakeProfit);
    }
    if price <= position.sl_price {
        return Some(ExitTrigger::StopLoss);
    }
    if let (Some(activation), Some(distance)) = (
        position.trail_activation_price,
        position.trail_distance_percent,
    ) {
        if position.peak_price >= activation
            && price <= position.peak_price * (1.0 - distance / 100.0)
        {
            return Some(ExitTrigger::Trailing);
        }
    }
    let held = now.signed_duration_since(position.opened_at);
    if held.num_minutes() >= position.max_hold_minutes as i64 {
        return Some(ExitTrigger::MaxHold);
    }
    None
}

/// Sell percent for a claimed trigger: a TP with a configured moon bag holds
/// the bag back, everything else sells out.
pub fn sell_percent_for(trigger: ExitTrigger, moon_bag_percent: f64) -> f64 {
    match trigger {
        ExitTrigger::TakeProfit if moon_bag_percent > 0.0 => 100.0 - moon_bag_percent,
        _ => 100.0,
    }
}

#[derive(Debug, Clone, Default)]
pub struct MonitorStats {
    pub poll_cycles: u64,
    pub prices_fetched: u64,
    pub evaluations: u64,
    pub triggers_claimed: u64,
    pub claims_lost: u64,
    pub hints_received: u64,
    pub claims_paused: u64,
}

pub struct PositionMonitor {
    store: Store,
    oracle: Arc<PriceOracle>,
    cache: PriceCache,
    rpc: Arc<ChainRpc>,
    decimals: TokenDecimals,
    exit_handle: ExitQueueHandle,
    subs: SubscriptionManager,
    claim_gate: ClaimGate,
    poll_interval: Duration,
    graduation_checks: bool,

    watched: HashMap<String, WatchedPosition>,
    token_index: HashMap<String, HashSet<String>>,
    stats: MonitorStats,
}

impl PositionMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        oracle: Arc<PriceOracle>,
        rpc: Arc<ChainRpc>,
        decimals: TokenDecimals,
        exit_handle: ExitQueueHandle,
        subs: SubscriptionManager,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            oracle,
            cache: PriceCache::default(),
            rpc,
            decimals,
            exit_handle,
            subs,
            claim_gate: ClaimGate::new(),
            poll_interval: Duration::from_millis(config.monitor_poll_interval_ms),
            graduation_checks: config.graduation_monitor_enabled,
            watched: HashMap::new(),
            token_index: HashMap::new(),
            stats: MonitorStats::default(),
        }
    }

    pub async fn run(
        mut self,
        mut hint_rx: mpsc::UnboundedReceiver<ActivityHint>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<()> {
        info!("👁️  Position monitor started (poll {:?})", self.poll_interval);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut sweep = tokio::time::interval(Duration::from_secs(PRICE_CACHE_SWEEP_INTERVAL_SECONDS));
        let mut cycle: u64 = 0;

        self.refresh_watch_set().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    cycle += 1;
                    self.stats.poll_cycles += 1;
                    if cycle % MONITOR_REFRESH_EVERY_CYCLES == 0 {
                        self.refresh_watch_set().await;
                    }
                    self.poll_prices().await;
                }
                hint = hint_rx.recv() => {
                    if let Some(hint) = hint {
                        self.stats.hints_received += 1;
                        self.handle_hint(&hint.token_mint).await;
                    }
                }
                _ = sweep.tick() => {
                    self.cache.sweep_expired();
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            "👁️  Position monitor stopped: {} cycles, {} evaluations, {} claims ({} lost, {} paused)",
            self.stats.poll_cycles,
            self.stats.evaluations,
            self.stats.triggers_claimed,
            self.stats.claims_lost,
            self.stats.claims_paused
        );
        Ok(())
    }

    /// Reload the watch set from the store: picks up newly opened positions,
    /// releases closed ones, and keeps WS subscriptions refcounted per token.
    async fn refresh_watch_set(&mut self) {
        let rows = match self.store.watchable_positions() {
            Ok(rows) => rows,
            Err(e) => {
                error!("❌ Watch set refresh failed: {}", e);
                return;
            }
        };

        let fresh_ids: HashSet<String> = rows.iter().map(|p| p.uuid_id.clone()).collect();

        // Release positions that left the watchable set elsewhere.
        let dropped: Vec<String> = self
            .watched
            .keys()
            .filter(|uuid| !fresh_ids.contains(*uuid))
            .cloned()
            .collect();
        for uuid in dropped {
            self.release_position(&uuid);
        }

        // Adopt new arrivals.
        for row in &rows {
            if self.watched.contains_key(&row.uuid_id) {
                // Peak may have moved via another worker; adopt the max.
                if let Some(entry) = self.watched.get_mut(&row.uuid_id) {
                    entry.peak_price = entry.peak_price.max(row.peak_price);
                }
                continue;
            }
            let Some(snapshot) = WatchedPosition::from_row(row) else {
                warn!("⚠️  Position {} has unparseable opened_at, skipping", row.uuid_id);
                continue;
            };
            let account = snapshot
                .bonding_curve
                .clone()
                .unwrap_or_else(|| snapshot.token_mint.clone());
            self.subs.watch(&snapshot.token_mint, &account);
            self.token_index
                .entry(snapshot.token_mint.clone())
                .or_default()
                .insert(snapshot.uuid_id.clone());
            debug!("👁️  Watching {} ({})", snapshot.uuid_id, snapshot.token_mint);
            self.watched.insert(snapshot.uuid_id.clone(), snapshot);
        }

        if self.graduation_checks {
            self.check_graduations(&rows).await;
        }
    }

    fn release_position(&mut self, uuid: &str) {
        if let Some(snapshot) = self.watched.remove(uuid) {
            if let Some(set) = self.token_index.get_mut(&snapshot.token_mint) {
                set.remove(uuid);
                if set.is_empty() {
                    self.token_index.remove(&snapshot.token_mint);
                }
            }
            self.subs.unwatch(&snapshot.token_mint);
            debug!("👋 Released {} ({})", uuid, snapshot.token_mint);
        }
    }

    /// One poll pass: one price fetch per unique token, evaluation for every
    /// position holding it.
    async fn poll_prices(&mut self) {
        let tokens: Vec<String> = self.token_index.keys().cloned().collect();
        for token in tokens {
            let price = match self.price_for(&token, false).await {
                Some(price) => price,
                None => continue,
            };
            self.evaluate_token(&token, price).await;
        }
    }

    /// Activity hint: immediate out-of-band fetch bypassing the cache.
    async fn handle_hint(&mut self, token_mint: &str) {
        if !self.token_index.contains_key(token_mint) {
            return;
        }
        if let Some(price) = self.price_for(token_mint, true).await {
            self.evaluate_token(token_mint, price).await;
        }
    }

    /// Price in SOL per whole token: cache, then oracle, then the bonding
    /// curve itself for tokens the oracle does not list yet.
    async fn price_for(&mut self, token_mint: &str, bypass_cache: bool) -> Option<f64> {
        if !bypass_cache {
            if let Some(price) = self.cache.get(token_mint) {
                return Some(price);
            }
        }

        let fetched = match self.oracle.get_price(token_mint).await {
            Ok(Some(price)) => Some(price),
            Ok(None) => self.curve_price(token_mint).await,
            Err(e) => {
                warn!("⚠️  Oracle failed for {}: {}", token_mint, e);
                self.curve_price(token_mint).await
            }
        };

        if let Some(price) = fetched {
            self.stats.prices_fetched += 1;
            self.cache.put(token_mint, price);
        }
        fetched
    }

    /// Pre-graduation fallback: spot price straight off curve reserves.
    async fn curve_price(&self, token_mint: &str) -> Option<f64> {
        let holders = self.token_index.get(token_mint)?;
        let curve_hint = holders
            .iter()
            .filter_map(|uuid| self.watched.get(uuid))
            .find_map(|p| p.bonding_curve.clone())?;

        let mint_pubkey = Pubkey::from_str(token_mint).ok()?;
        let curve_pubkey = Pubkey::from_str(&curve_hint).ok()?;
        let router = CurveRouter::new(Arc::clone(&self.rpc));
        let state = router.fetch_state(&mint_pubkey, Some(&curve_pubkey)).await.ok()?;

        let decimals = self.decimals.get(token_mint).await.unwrap_or(6);
        // lamports per raw unit -> SOL per whole token
        let price = state.spot_price_lamports() * 10f64.powi(decimals as i32)
            / crate::constants::SOL_DECIMALS as f64;
        Some(price)
    }

    async fn evaluate_token(&mut self, token_mint: &str, price: f64) {
        let Some(holders) = self.token_index.get(token_mint) else {
            return;
        };
        let holders: Vec<String> = holders.iter().cloned().collect();
        let now = Utc::now();

        for uuid in holders {
            self.evaluate_position(&uuid, price, now).await;
        }
    }

    async fn evaluate_position(&mut self, uuid: &str, price: f64, now: DateTime<Utc>) {
        let Some(snapshot) = self.watched.get_mut(uuid) else {
            return;
        };
        self.stats.evaluations += 1;

        // Step 1: peak update, persisted (SQL MAX keeps it monotone under
        // concurrent monitors).
        if price > snapshot.peak_price {
            snapshot.peak_price = price;
        }
        if let Err(e) = self.store.record_price(uuid, price) {
            warn!("⚠️  record_price failed for {}: {}", uuid, e);
        }

        // Step 2: trigger evaluation on the updated peak.
        let Some(snapshot) = self.watched.get(uuid).cloned() else {
            return;
        };
        let Some(trigger) = evaluate_trigger(&snapshot, price, now) else {
            return;
        };

        // Backpressure: past high water the monitor stops claiming so the
        // queue can drain; the position stays MONITORING and any worker may
        // claim it later.
        if !self.claim_gate.may_claim(self.exit_handle.depth()) {
            self.stats.claims_paused += 1;
            debug!(
                "🧘 Claim paused (queue depth {}), deferring {} on {}",
                self.exit_handle.depth(),
                trigger.as_str(),
                uuid
            );
            return;
        }

        // Step 3: the CAS. Exactly one worker wins; losers drop silently.
        match self.store.trigger_exit_atomically(uuid, trigger, price) {
            Ok(claim) if claim.triggered => {
                self.stats.triggers_claimed += 1;
                let sell_percent = sell_percent_for(trigger, snapshot.moon_bag_percent);
                let pushed = self.exit_handle.push(ExitJob {
                    position_uuid: uuid.to_string(),
                    user_id: snapshot.user_id,
                    chain: snapshot.chain.clone(),
                    token_mint: snapshot.token_mint.clone(),
                    trigger,
                    trigger_price: price,
                    sell_percent,
                });
                if !pushed {
                    // Queue refused after we claimed: hand the claim back.
                    self.store.mark_trigger_failed(uuid, "exit queue full").ok();
                    self.store.reset_trigger_to_monitoring(uuid).ok();
                    return;
                }
                info!(
                    "🎯 {} claimed on {} at {:.12} (sell {}%)",
                    trigger.as_str(),
                    uuid,
                    price,
                    sell_percent
                );
                self.release_position(uuid);
            }
            Ok(_) => {
                // Expected contention: another worker won.
                self.stats.claims_lost += 1;
                self.release_position(uuid);
            }
            Err(e) => {
                error!("❌ trigger claim failed for {}: {}", uuid, e);
            }
        }
    }

    /// Flip PRE_GRADUATION positions whose curve has completed; router
    /// selection follows the lifecycle state automatically.
    async fn check_graduations(&mut self, rows: &[Position]) {
        for row in rows {
            if row.lifecycle_state != LifecycleState::PreGraduation {
                continue;
            }
            let Some(curve) = &row.bonding_curve else { continue };
            let (Ok(mint_pubkey), Ok(curve_pubkey)) =
                (Pubkey::from_str(&row.token_mint), Pubkey::from_str(curve))
            else {
                continue;
            };
            let router = CurveRouter::new(Arc::clone(&self.rpc));
            match router.fetch_state(&mint_pubkey, Some(&curve_pubkey)).await {
                Ok(state) if state.is_graduated() => {
                    if self.store.graduate_position(&row.uuid_id).is_ok() {
                        if let Some(entry) = self.watched.get_mut(&row.uuid_id) {
                            entry.lifecycle_state = LifecycleState::PostGraduation;
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => debug!("Graduation check skipped for {}: {}", row.uuid_id, e),
            }
        }
    }

    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(entry: f64, tp_pct: f64, sl_pct: f64) -> WatchedPosition {
        WatchedPosition {
            uuid_id: "p-1".to_string(),
            user_id: 1,
            chain: "solana".to_string(),
            token_mint: "MintA".to_string(),
            entry_price: entry,
            tp_price: entry * (1.0 + tp_pct / 100.0),
            sl_price: entry * (1.0 - sl_pct / 100.0),
            trail_activation_price: None,
            trail_distance_percent: None,
            peak_price: entry,
            moon_bag_percent: 0.0,
            max_hold_minutes: 240,
            opened_at: Utc::now(),
            bonding_curve: None,
            lifecycle_state: LifecycleState::PreGraduation,
        }
    }

    #[test]
    fn tp_is_inclusive() {
        let position = snapshot(1.0, 50.0, 20.0);
        let now = Utc::now();
        assert_eq!(
            evaluate_trigger(&position, 1.5, now),
            Some(ExitTrigger::TakeProfit)
        );
        assert_eq!(
            evaluate_trigger(&position, 1.49, now),
            None
        );
    }

    #[test]
    fn sl_is_inclusive() {
        let position = snapshot(1.0, 50.0, 20.0);
        let now = Utc::now();
        assert_eq!(
            evaluate_trigger(&position, 0.8, now),
            Some(ExitTrigger::StopLoss)
        );
        assert_eq!(evaluate_trigger(&position, 0.81, now), None);
    }

    #[test]
    fn tp_wins_tie_break_over_sl() {
        // Degenerate thresholds where both bounds match: TP evaluates first.
        let mut position = snapshot(1.0, 0.0, 0.0);
        position.tp_price = 1.0;
        position.sl_price = 1.0;
        assert_eq!(
            evaluate_trigger(&position, 1.0, Utc::now()),
            Some(ExitTrigger::TakeProfit)
        );
    }

    #[test]
    fn trailing_trips_exactly_at_distance_boundary() {
        // entry=1.00, activation=30%, distance=20%, ticks 1.10 1.30 1.50 1.20
        let mut position = snapshot(1.0, 500.0, 90.0); // wide TP/SL, out of the way
        position.trail_activation_price = Some(1.30);
        position.trail_distance_percent = Some(20.0);
        let now = Utc::now();

        for tick in [1.10, 1.30, 1.50] {
            if tick > position.peak_price {
                position.peak_price = tick;
            }
            assert_eq!(evaluate_trigger(&position, tick, now), None);
        }
        assert_eq!(position.peak_price, 1.50);

        // 1.20 <= 1.50 * 0.80 = 1.20 exactly: inclusive boundary trips TRAIL.
        assert_eq!(
            evaluate_trigger(&position, 1.20, now),
            Some(ExitTrigger::Trailing)
        );
    }

    #[test]
    fn trailing_needs_activation_first() {
        let mut position = snapshot(1.0, 500.0, 90.0);
        position.trail_activation_price = Some(1.30);
        position.trail_distance_percent = Some(20.0);
        position.peak_price = 1.20; // never reached activation

        assert_eq!(evaluate_trigger(&position, 0.95, Utc::now()), None);
    }

    #[test]
    fn max_hold_fires_only_without_price_trigger() {
        let mut position = snapshot(1.0, 50.0, 20.0);
        position.max_hold_minutes = 0;
        let now = Utc::now();

        // Price inside bounds: MAXHOLD fires.
        assert_eq!(
            evaluate_trigger(&position, 1.0, now),
            Some(ExitTrigger::MaxHold)
        );
        // Price trigger takes precedence over MAXHOLD.
        assert_eq!(
            evaluate_trigger(&position, 1.5, now),
            Some(ExitTrigger::TakeProfit)
        );
    }

    #[test]
    fn moon_bag_shapes_tp_sell_percent_only() {
        assert_eq!(sell_percent_for(ExitTrigger::TakeProfit, 15.0), 85.0);
        assert_eq!(sell_percent_for(ExitTrigger::TakeProfit, 0.0), 100.0);
        assert_eq!(sell_percent_for(ExitTrigger::StopLoss, 15.0), 100.0);
        assert_eq!(sell_percent_for(ExitTrigger::Emergency, 15.0), 100.0);
        assert_eq!(sell_percent_for(ExitTrigger::Trailing, 15.0), 100.0);
    }
}
