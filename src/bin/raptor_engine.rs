use anyhow::Result;
use clap::Parser;
use raptor::{start, EngineConfig, LoggingSurface, WorkerRole};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

/// RAPTOR trade lifecycle engine.
#[derive(Parser, Debug)]
#[command(name = "raptor_engine", about = "Autonomous trade lifecycle engine")]
struct Cli {
    /// Role to host: all, executor, monitor, notifier, consumer, maintenance
    #[arg(long, default_value = "all")]
    role: String,
}

fn parse_role(raw: &str) -> Option<WorkerRole> {
    Some(match raw {
        "all" | "engine" => WorkerRole::All,
        "executor" => WorkerRole::Executor,
        "monitor" => WorkerRole::Monitor,
        "notifier" => WorkerRole::Notifier,
        "consumer" => WorkerRole::Consumer,
        "maintenance" => WorkerRole::Maintenance,
        _ => return None,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let Some(role) = parse_role(&cli.role) else {
        error!("❌ Unknown role: {}", cli.role);
        std::process::exit(2);
    };

    info!("🦖 Starting RAPTOR ({})", cli.role);
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config = match EngineConfig::from_env(role) {
        Ok(config) => config,
        Err(e) => {
            error!("❌ Configuration invalid: {:#}", e);
            return Err(e);
        }
    };

    // The chat surface is provided by the deployment; the logging surface
    // stands in when the engine runs without a connected front-end.
    let surface = Arc::new(LoggingSurface);

    let mut engine = start(config, surface).await?;

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("🦖 RAPTOR is LIVE - press Ctrl+C to stop");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

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
