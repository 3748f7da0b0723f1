// Maintenance loop.
// Periodic reaper for everything the hot paths leave behind: stale
// unconfirmed executions, delivered notifications, expired trade monitor
// panels, and lapsed cooldowns.

use anyhow::Result;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::EngineConfig;
use crate::constants::{SENT_NOTIFICATION_RETENTION_HOURS, STALE_EXECUTION_MINUTES};
use crate::store::Store;

pub struct MaintenanceLoop {
    store: Store,
    interval: Duration,
}

impl MaintenanceLoop {
    pub fn new(store: Store, config: &EngineConfig) -> Self {
        Self {
            store,
            interval: Duration::from_secs(config.maintenance_interval_seconds),
        }
    }

    pub async fn run(self, mut stop: watch::Receiver<bool>) -> Result<()> {
        info!("🧰 Maintenance loop started (every {:?})", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep() {
                        error!("❌ Maintenance sweep failed: {}", e);
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }

        info!("🧰 Maintenance loop stopped");
        Ok(())
    }

    /// One full sweep. Each reaper is independent; one failing does not
    /// starve the rest.
    pub fn sweep(&self) -> Result<()> {
        let stale = self.store.cleanup_stale_executions(STALE_EXECUTION_MINUTES)?;
        let purged = self
            .store
            .purge_sent_notifications(SENT_NOTIFICATION_RETENTION_HOURS)?;
        let expired_monitors = self.store.expire_trade_monitors()?;
        let reaped_cooldowns = self.store.reap_expired_cooldowns()?;

        if stale + purged + expired_monitors + reaped_cooldowns > 0 {
            info!(
                "🧰 Sweep: {} stale executions, {} purged notifications, {} expired monitors, {} cooldowns",
                stale, purged, expired_monitors, reaped_cooldowns
            );
        }
        Ok(())
    }
}
