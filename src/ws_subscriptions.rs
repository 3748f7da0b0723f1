// WebSocket activity hints.
// Maintains chain log subscriptions scoped to each watched token's pool or
// bonding-curve account and forwards raw activity as hints to the position
// monitor for an immediate out-of-band price check. Subscriptions are
// refcounted per token; a token is unsubscribed when its last position
// releases it. Connections that go silent past the inactivity limit are torn
// down and rebuilt with all active subscriptions replayed.

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::constants::WS_INACTIVITY_TIMEOUT_SECONDS;
use crate::error_classifier::retry_backoff;

/// Out-of-band activity on a watched token.
#[derive(Debug, Clone)]
pub struct ActivityHint {
    pub token_mint: String,
}

enum Command {
    Watch { token_mint: String, account: String },
    Unwatch { token_mint: String },
}

/// Handle owned by the position monitor.
#[derive(Clone)]
pub struct SubscriptionManager {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl SubscriptionManager {
    /// Spawn the connection task. Hints flow out through `hint_tx`.
    pub fn start(
        ws_url: String,
        hint_tx: mpsc::UnboundedSender<ActivityHint>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(connection_loop(ws_url, cmd_rx, hint_tx, stop));
        Self { cmd_tx }
    }

    /// Add (or refcount-bump) a token-scoped subscription.
    pub fn watch(&self, token_mint: &str, account: &str) {
        self.cmd_tx
            .send(Command::Watch {
                token_mint: token_mint.to_string(),
                account: account.to_string(),
            })
            .ok();
    }

    /// Drop one reference; unsubscribes when the count reaches zero.
    pub fn unwatch(&self, token_mint: &str) {
        self.cmd_tx
            .send(Command::Unwatch {
                token_mint: token_mint.to_string(),
            })
            .ok();
    }
}

struct TokenWatch {
    account: String,
    refcount: usize,
    subscription_id: Option<u64>,
}

struct ConnState {
    /// token mint -> watch entry
    watches: HashMap<String, TokenWatch>,
    /// chain subscription id -> token mint
    sub_to_token: HashMap<u64, String>,
    /// request id -> token mint awaiting a subscription confirmation
    pending: HashMap<u64, String>,
    next_request_id: u64,
}

impl ConnState {
    fn new() -> Self {
        Self {
            watches: HashMap::new(),
            sub_to_token: HashMap::new(),
            pending: HashMap::new(),
            next_request_id: 1,
        }
    }

    fn request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }
}

async fn connection_loop(
    ws_url: String,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    hint_tx: mpsc::UnboundedSender<ActivityHint>,
    mut stop: watch::Receiver<bool>,
) {
    let mut state = ConnState::new();
    let mut reconnect_attempt = 0u32;

    loop {
        if *stop.borrow() {
            break;
        }

        let stream = match connect_async(ws_url.as_str()).await {
            Ok((stream, _)) => {
                info!("🔌 WS connected: {}", ws_url);
                reconnect_attempt = 0;
                stream
            }
            Err(e) => {
                reconnect_attempt += 1;
                let delay = retry_backoff(reconnect_attempt, 500, 30_000);
                warn!("⚠️  WS connect failed (attempt {}): {}; retry in {:?}", reconnect_attempt, e, delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue,
                    _ = stop.changed() => break,
                }
            }
        };

        let (mut sink, mut source) = stream.split();

        // Replay every active watch on the fresh connection.
        state.sub_to_token.clear();
        state.pending.clear();
        let mints: Vec<String> = state.watches.keys().cloned().collect();
        for mint in mints {
            let account = state.watches.get(&mint).map(|w| w.account.clone());
            if let Some(account) = account {
                if let Some(entry) = state.watches.get_mut(&mint) {
                    entry.subscription_id = None;
                }
                if let Err(e) = send_subscribe(&mut sink, &mut state, &mint, &account).await {
                    warn!("⚠️  Resubscribe failed for {}: {}", mint, e);
                }
            }
        }

        let inactivity = Duration::from_secs(WS_INACTIVITY_TIMEOUT_SECONDS);
        let mut teardown = false;

        while !teardown {
            tokio::select! {
                message = tokio::time::timeout(inactivity, source.next()) => {
                    match message {
                        Ok(Some(Ok(frame))) => {
                            handle_frame(frame, &mut state, &hint_tx, &mut sink).await;
                        }
                        Ok(Some(Err(e))) => {
                            warn!("⚠️  WS stream error: {}", e);
                            teardown = true;
                        }
                        Ok(None) => {
                            warn!("📡 WS stream closed by peer");
                            teardown = true;
                        }
                        Err(_) => {
                            // No messages or pings inside the limit: rebuild.
                            warn!("⏰ WS inactive for {:?}, reconnecting", inactivity);
                            teardown = true;
                        }
                    }
                }
                command = cmd_rx.recv() => {
                    match command {
                        Some(Command::Watch { token_mint, account }) => {
                            let needs_subscribe = match state.watches.get_mut(&token_mint) {
                                Some(entry) => {
                                    entry.refcount += 1;
                                    false
                                }
                                None => {
                                    state.watches.insert(token_mint.clone(), TokenWatch {
                                        account: account.clone(),
                                        refcount: 1,
                                        subscription_id: None,
                                    });
                                    true
                                }
                            };
                            if needs_subscribe {
                                if let Err(e) = send_subscribe(&mut sink, &mut state, &token_mint, &account).await {
                                    warn!("⚠️  Subscribe failed for {}: {}", token_mint, e);
                                    teardown = true;
                                }
                            }
                        }
                        Some(Command::Unwatch { token_mint }) => {
                            let unsubscribe = match state.watches.get_mut(&token_mint) {
                                Some(entry) => {
                                    entry.refcount = entry.refcount.saturating_sub(1);
                                    if entry.refcount == 0 { entry.subscription_id } else { None }
                                }
                                None => None,
                            };
                            if state.watches.get(&token_mint).map(|w| w.refcount) == Some(0) {
                                state.watches.remove(&token_mint);
                            }
                            if let Some(sub_id) = unsubscribe {
                                state.sub_to_token.remove(&sub_id);
                                let request_id = state.request_id();
                                let frame = json!({
                                    "jsonrpc": "2.0",
                                    "id": request_id,
                                    "method": "logsUnsubscribe",
                                    "params": [sub_id],
                                });
                                if sink.send(Message::Text(frame.to_string())).await.is_err() {
                                    teardown = true;
                                }
                                debug!("➖ Unsubscribed {} (sub {})", token_mint, sub_id);
                            }
                        }
                        None => {
                            teardown = true;
                        }
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        let _ = sink.send(Message::Close(None)).await;
                        info!("🔌 WS manager stopped");
                        return;
                    }
                }
            }
        }
    }
}

async fn send_subscribe<S>(
    sink: &mut S,
    state: &mut ConnState,
    token_mint: &str,
    account: &str,
) -> Result<()>
where
    S: SinkExt<Message> + Unpin,
    <S as futures_util::Sink<Message>>::Error: std::fmt::Display,
{
    let request_id = state.request_id();
    state.pending.insert(request_id, token_mint.to_string());
    let frame = json!({
        "jsonrpc": "2.0",
        "id": request_id,
        "method": "logsSubscribe",
        "params": [
            { "mentions": [account] },
            { "commitment": "confirmed" }
        ],
    });
    sink.send(Message::Text(frame.to_string()))
        .await
        .map_err(|e| anyhow!("WS send failed: {}", e))?;
    debug!("➕ Subscribing {} (account {})", token_mint, account);
    Ok(())
}

async fn handle_frame<S>(
    frame: Message,
    state: &mut ConnState,
    hint_tx: &mpsc::UnboundedSender<ActivityHint>,
    sink: &mut S,
) where
    S: SinkExt<Message> + Unpin,
{
    let text = match frame {
        Message::Text(text) => text,
        Message::Ping(payload) => {
            let _ = sink.send(Message::Pong(payload)).await;
            return;
        }
        _ => return,
    };

    let value: Value = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(_) => return,
    };

    // Subscription confirmation: {"id": n, "result": <sub id>}
    if let (Some(request_id), Some(sub_id)) = (
        value.get("id").and_then(|v| v.as_u64()),
        value.get("result").and_then(|v| v.as_u64()),
    ) {
        if let Some(mint) = state.pending.remove(&request_id) {
            state.sub_to_token.insert(sub_id, mint.clone());
            if let Some(entry) = state.watches.get_mut(&mint) {
                entry.subscription_id = Some(sub_id);
            }
            debug!("✅ Subscription {} live for {}", sub_id, mint);
        }
        return;
    }

    // Log notification: activity on a watched account.
    if value.get("method").and_then(|m| m.as_str()) == Some("logsNotification") {
        let sub_id = value
            .pointer("/params/subscription")
            .and_then(|v| v.as_u64());
        if let Some(mint) = sub_id.and_then(|id| state.sub_to_token.get(&id)) {
            debug!("⚡ Activity hint for {}", mint);
            hint_tx
                .send(ActivityHint {
                    token_mint: mint.clone(),
                })
                .ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refcount_bookkeeping() {
        let mut state = ConnState::new();
        state.watches.insert(
            "MintA".to_string(),
            TokenWatch {
                account: "Curve".to_string(),
                refcount: 2,
                subscription_id: Some(7),
            },
        );
        state.sub_to_token.insert(7, "MintA".to_string());

        // One release keeps the watch alive.
        if let Some(entry) = state.watches.get_mut("MintA") {
            entry.refcount -= 1;
        }
        assert_eq!(state.watches.get("MintA").unwrap().refcount, 1);
    }

    #[test]
    fn request_ids_are_monotonic() {
        let mut state = ConnState::new();
        let a = state.request_id();
        let b = state.request_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn notification_routes_to_hint_channel() {
        let mut state = ConnState::new();
        state.sub_to_token.insert(42, "MintA".to_string());
        let (hint_tx, mut hint_rx) = mpsc::unbounded_channel();
        // Sink that swallows frames.
        let (mut sink, _stream) = futures::channel::mpsc::unbounded::<Message>();

        let frame = Message::Text(
            json!({
                "method": "logsNotification",
                "params": { "subscription": 42, "result": {} }
            })
            .to_string(),
        );
        handle_frame(frame, &mut state, &hint_tx, &mut sink).await;

        let hint = hint_rx.try_recv().unwrap();
        assert_eq!(hint.token_mint, "MintA");
    }
}
