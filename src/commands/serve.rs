use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, Overrides};
use crate::runner::Runner;
use crate::sandbox::DockerSandbox;
use crate::server;
use crate::technology::TechnologyRegistry;

pub async fn run(config_path: Option<&Path>, overrides: Overrides) -> Result<()> {
    let mut config = Config::load(config_path).context("Failed to load codecell.toml")?;
    config.apply(overrides);
    config.validate().context("Invalid configuration")?;

    let technologies = TechnologyRegistry::from_config(&config)?;
    info!(
        runtime = %config.sandbox.runtime,
        memory = %config.sandbox.memory,
        cpus = %config.sandbox.cpus,
        languages = ?technologies.iter().map(|t| t.key().to_string()).collect::<Vec<_>>(),
        "Starting codecell"
    );

    let sandbox = DockerSandbox::connect(&config.sandbox).await?;
    match sandbox.cleanup_orphaned().await {
        Ok(0) => {}
        Ok(n) => info!("Removed {} orphaned containers", n),
        Err(e) => warn!("Orphan cleanup failed: {:#}", e),
    }

    let shutdown = CancellationToken::new();
    let runner = Runner::new(
        Arc::new(sandbox),
        technologies,
        config.execution.clone(),
        shutdown.clone(),
    );

    let listener = TcpListener::bind(&config.server.addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.addr))?;

    let signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested, stopping active executions");
        signal.cancel();
    });

    server::serve(listener, runner, shutdown).await?;
    info!("Server stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let Ok(mut terminate) = signal(SignalKind::terminate()) else {
        let _ = tokio::signal::ctrl_c().await;
        return;
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
