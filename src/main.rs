use std::sync::Arc;

use anyhow::Context;

use inbox_pilot::agent::spawn_agent_sweep;
use inbox_pilot::automation::spawn_scheduler;
use inbox_pilot::config::PilotConfig;
use inbox_pilot::mail::HttpGateway;
use inbox_pilot::store::{Database, LibSqlBackend};
use inbox_pilot::{InboxPilot, PilotDeps};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = PilotConfig::from_env().context("reading configuration")?;

    eprintln!("📬 Inbox Pilot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Gateway: {}", config.gateway.base_url);
    eprintln!("   Database: {}", config.db_path.display());

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("opening database at {}", config.db_path.display()))?,
    );

    // ── Collaborators ────────────────────────────────────────────────────
    let gateway = Arc::new(HttpGateway::new(&config.gateway).context("building gateway client")?);

    let sweep_interval = config.agent.sweep_interval;
    let poll_interval = config.scheduler.poll_interval;
    let scheduler_enabled = config.scheduler.enabled;

    let pilot = InboxPilot::new(
        PilotDeps {
            store,
            mail: gateway.clone(),
            analysis: gateway.clone(),
            tasks: gateway,
        },
        config.agent,
        config.scheduler,
    );

    // ── Background loops ─────────────────────────────────────────────────
    let mut shutdown_flags = Vec::new();
    let mut handles = Vec::new();

    if scheduler_enabled {
        let (handle, flag) = spawn_scheduler(pilot.scheduler(), poll_interval);
        handles.push(handle);
        shutdown_flags.push(flag);
    } else {
        tracing::info!("Automation scheduler disabled");
    }

    let (handle, flag) = spawn_agent_sweep(pilot.runner(), sweep_interval);
    handles.push(handle);
    shutdown_flags.push(flag);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    tracing::info!("Shutdown requested");

    for flag in &shutdown_flags {
        flag.store(true, std::sync::atomic::Ordering::Relaxed);
    }
    // Loops only observe the flag on their next tick.
    for handle in handles {
        handle.abort();
    }

    Ok(())
}
