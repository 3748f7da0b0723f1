// Append-only audit log for security-sensitive events.
// Key exports, withdrawal initiations, honeypot detections, and circuit-open
// events land here as one JSON line each; the file is opened in append mode
// and never rewritten.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuditEvent {
    KeyExport,
    WithdrawalInitiated,
    HoneypotDetected,
    CircuitOpen,
    TradingPaused,
    EmergencySell,
}

#[derive(Debug, Serialize)]
struct AuditRecord<'a> {
    ts: String,
    event: AuditEvent,
    user_id: Option<i64>,
    chain: &'a str,
    details: &'a str,
}

#[derive(Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append one record. Audit writes must not take the caller down, so
    /// failures log loudly and return the error for the caller to decide.
    pub async fn record(
        &self,
        event: AuditEvent,
        user_id: Option<i64>,
        chain: &str,
        details: &str,
    ) -> Result<()> {
        let record = AuditRecord {
            ts: Utc::now().to_rfc3339(),
            event,
            user_id,
            chain,
            details,
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open audit log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .context("Failed to append audit record")?;
        file.flush().await?;

        warn!("🔏 AUDIT {:?} user={:?} chain={} {}", record.event, user_id, chain, details);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_are_appended_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::new(&path);

        log.record(AuditEvent::KeyExport, Some(7), "solana", "wallet 3 exported")
            .await
            .unwrap();
        log.record(AuditEvent::CircuitOpen, None, "solana", "5 failures in 60s")
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "KeyExport");
        assert_eq!(first["user_id"], 7);
    }
}
