// Outbox notifier.
// Lease-based delivery of notifications_outbox rows to the chat surface.
// Delivery is at-least-once: a crash between send and mark re-delivers after
// lease expiry, and the chat surface owns dedupe of late duplicates.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::constants::{NOTIFICATION_CLAIM_LIMIT, NOTIFICATION_LEASE_SECONDS};
use crate::models::NotificationRow;
use crate::store::Store;

/// The chat delivery boundary. The renderer receives a self-contained
/// payload and never queries the store.
#[async_trait]
pub trait ChatSurface: Send + Sync {
    async fn deliver(&self, chat_id: &str, kind: &str, payload: &Value) -> Result<()>;
}

/// Surface used when no chat token is configured (dev / dry runs): renders
/// to the log and always succeeds.
pub struct LoggingSurface;

#[async_trait]
impl ChatSurface for LoggingSurface {
    async fn deliver(&self, chat_id: &str, kind: &str, payload: &Value) -> Result<()> {
        info!("💬 [{} -> {}] {}", kind, chat_id, payload);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct NotifierStats {
    pub delivered: u64,
    pub failed: u64,
    pub reopened: u64,
}

pub struct OutboxNotifier {
    store: Store,
    surface: Arc<dyn ChatSurface>,
    worker_id: String,
    poll_interval: Duration,
    stats: NotifierStats,
}

impl OutboxNotifier {
    pub fn new(store: Store, surface: Arc<dyn ChatSurface>, config: &EngineConfig) -> Self {
        Self {
            store,
            surface,
            worker_id: config.worker_id.clone(),
            poll_interval: Duration::from_millis(config.notification_poll_interval_ms),
            stats: NotifierStats::default(),
        }
    }

    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<()> {
        info!(
            "📮 Outbox notifier {} started (poll {:?})",
            self.worker_id, self.poll_interval
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.drain_batch().await {
                        error!("❌ Notification batch failed: {}", e);
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
            "📮 Outbox notifier stopped: {} delivered, {} failed, {} reopened",
            self.stats.delivered, self.stats.failed, self.stats.reopened
        );
        Ok(())
    }

    /// One claim-and-deliver pass.
    pub async fn drain_batch(&mut self) -> Result<usize> {
        let claimed = self.store.claim_notifications(
            &self.worker_id,
            NOTIFICATION_CLAIM_LIMIT,
            NOTIFICATION_LEASE_SECONDS,
        )?;
        let count = claimed.len();

        for row in claimed {
            self.deliver_one(row).await;
        }
        Ok(count)
    }

    async fn deliver_one(&mut self, row: NotificationRow) {
        let chat_id = match self.store.get_user(row.user_id) {
            Ok(user) => user.chat_id,
            Err(e) => {
                warn!("⚠️  Notification {} has no user: {}", row.id, e);
                self.store
                    .mark_notification_failed(row.id, "user not found")
                    .ok();
                self.stats.failed += 1;
                return;
            }
        };

        match self.surface.deliver(&chat_id, &row.kind, &row.payload).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_notification_delivered(row.id) {
                    error!("❌ mark_delivered failed for {}: {}", row.id, e);
                } else {
                    self.stats.delivered += 1;
                    debug!("✉️  Delivered notification {} ({})", row.id, row.kind);
                }
            }
            Err(e) => {
                let message = e.to_string();
                warn!(
                    "⚠️  Delivery failed for {} (attempt {}/{}): {}",
                    row.id, row.attempts, row.max_attempts, message
                );
                if self.store.mark_notification_failed(row.id, &message).is_ok() {
                    if row.attempts >= row.max_attempts {
                        self.stats.failed += 1;
                    } else {
                        self.stats.reopened += 1;
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> &NotifierStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotificationKind;
    use parking_lot::Mutex;

    /// Records deliveries; fails the first N.
    struct ScriptedSurface {
        fail_first: Mutex<u32>,
        delivered: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ChatSurface for ScriptedSurface {
        async fn deliver(&self, chat_id: &str, kind: &str, _payload: &Value) -> Result<()> {
            let mut remaining = self.fail_first.lock();
            if *remaining > 0 {
                *remaining -= 1;
                anyhow::bail!("chat surface unavailable");
            }
            self.delivered
                .lock()
                .push((chat_id.to_string(), kind.to_string()));
            Ok(())
        }
    }

    fn notifier_with(store: Store, surface: Arc<dyn ChatSurface>) -> OutboxNotifier {
        OutboxNotifier {
            store,
            surface,
            worker_id: "n-test".to_string(),
            poll_interval: Duration::from_millis(10),
            stats: NotifierStats::default(),
        }
    }

    #[tokio::test]
    async fn delivers_and_marks_sent() {
        let store = Store::open_in_memory().unwrap();
        let user = store.get_or_create_user("chat-77").unwrap();
        store
            .enqueue_notification(
                user.id,
                NotificationKind::PositionOpened,
                &serde_json::json!({"token_mint": "MintA"}),
            )
            .unwrap();

        let surface = Arc::new(ScriptedSurface {
            fail_first: Mutex::new(0),
            delivered: Mutex::new(Vec::new()),
        });
        let mut notifier = notifier_with(store.clone(), surface.clone());

        assert_eq!(notifier.drain_batch().await.unwrap(), 1);
        assert_eq!(notifier.stats.delivered, 1);
        let delivered = surface.delivered.lock();
        assert_eq!(delivered[0], ("chat-77".to_string(), "POSITION_OPENED".to_string()));

        // Nothing left to claim.
        drop(delivered);
        assert_eq!(notifier.drain_batch().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transient_failure_reopens_for_retry() {
        let store = Store::open_in_memory().unwrap();
        let user = store.get_or_create_user("chat-77").unwrap();
        store
            .enqueue_notification(user.id, NotificationKind::SellConfirmed, &serde_json::json!({}))
            .unwrap();

        let surface = Arc::new(ScriptedSurface {
            fail_first: Mutex::new(1),
            delivered: Mutex::new(Vec::new()),
        });
        let mut notifier = notifier_with(store.clone(), surface.clone());

        // First pass fails and reopens.
        assert_eq!(notifier.drain_batch().await.unwrap(), 1);
        assert_eq!(notifier.stats.reopened, 1);

        // Second pass succeeds (at-least-once).
        assert_eq!(notifier.drain_batch().await.unwrap(), 1);
        assert_eq!(notifier.stats.delivered, 1);
        assert_eq!(surface.delivered.lock().len(), 1);
    }
}
