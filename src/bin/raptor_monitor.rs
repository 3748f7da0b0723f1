use anyhow::Result;
use raptor::{start, EngineConfig, LoggingSurface, WorkerRole};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

/// Dedicated position-monitor worker: hosts the TP/SL engine and the exit
/// queue. Multiple instances may run; the store's trigger CAS guarantees a
/// single winner per exit.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("👁️  Starting RAPTOR position monitor");

    let config = EngineConfig::from_env(WorkerRole::Monitor)?;
    let surface = Arc::new(LoggingSurface);
    let mut engine = start(config, surface).await?;

    tokio::select! {
        result = engine.wait() => {
            if let Err(e) = result {
                error!("❌ Component failure: {:#}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("🛑 Shutdown signal received");
        }
    }

    engine.shutdown().await;
    Ok(())
}
