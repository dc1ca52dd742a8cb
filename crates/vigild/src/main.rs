//! vigild: VPN Kill-Switch Daemon
//!
//! Main entry point. Loads the configuration, applies the firewall and
//! optionally connects, then runs until SIGINT/SIGTERM, disconnecting
//! cleanly on the way out.

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vigil_tunnel::Notification;
use vigild::{CONFIG_ENV, DaemonConfig, Service};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let path = DaemonConfig::locate(std::env::args().nth(1), std::env::var(CONFIG_ENV).ok());
    let config = DaemonConfig::load(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    info!("vigild starting (config {})", path.display());

    let autoconnect = config.autoconnect.clone();
    let service = Service::from_config(config);
    service.load_firewall().await?;

    let mut events = service.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(Notification::Connected { role, server }) => {
                    info!("Connected ({role}) to {server}")
                }
                Ok(Notification::RetryPause { role }) => warn!("{role} tunnel is retrying"),
                Ok(Notification::AuthFailed { role }) => error!("{role} tunnel: authentication failed"),
                Ok(Notification::Failed { reason }) => error!("{reason}"),
                Ok(Notification::Terminated) => info!("Connection terminated"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Dropped {n} notifications")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    if let Some(auto) = autoconnect {
        if let Err(e) = service.connect(auto.server, auto.hop).await {
            error!("Autoconnect failed: {e:#}");
        }
    }

    shutdown_signal().await?;
    info!("vigild shutting down");
    service.disconnect().await;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("waiting for SIGINT")?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")
}
