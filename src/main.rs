use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use code_runner::pipeline::PipelineConfig;
use code_runner::{
    http, worker, AdmissionGate, ExecutionService, Pipeline, ProcessRunner, RunnerConfig,
    ToolchainRegistry, WorkspaceManager,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("code_runner=info".parse()?),
        )
        .init();

    let config = RunnerConfig::from_env()?;
    if config.http_bind.is_none() && config.redis_url.is_none() {
        anyhow::bail!("Neither HTTP_BIND nor REDIS_URL is set, nothing to serve");
    }

    info!("Starting Code Runner...");

    let registry = ToolchainRegistry::load(config.languages_path.as_deref())?;
    info!(
        "Loaded {} languages: {}",
        registry.len(),
        registry.languages().join(", ")
    );

    let workspaces = WorkspaceManager::new(&config.workspace_root)?;
    // Leftovers from a previous process that died mid-request
    match workspaces.sweep_stale(config.workspace_grace).await {
        Ok(removed) if removed > 0 => info!("Removed {} stale workspaces", removed),
        Ok(_) => {}
        Err(e) => warn!("Initial workspace sweep failed: {:#}", e),
    }
    info!("Workspaces under {:?}", workspaces.root());

    let shutdown = CancellationToken::new();
    let sweeper = workspaces.spawn_sweeper(
        config.sweep_interval,
        config.workspace_grace,
        shutdown.clone(),
    );

    let pipeline = Pipeline::new(
        Arc::new(registry),
        workspaces,
        Arc::new(ProcessRunner::new(config.monitor_interval)),
        PipelineConfig::from(&config),
    );
    let service = Arc::new(ExecutionService::new(
        AdmissionGate::new(config.max_concurrent, config.admission),
        pipeline,
    ));
    info!(
        "Admission: {} concurrent executions, {:?}",
        config.max_concurrent, config.admission
    );

    spawn_signal_handler(shutdown.clone())?;

    let mut intakes = tokio::task::JoinSet::new();
    if let Some(bind) = config.http_bind.clone() {
        let service = Arc::clone(&service);
        let shutdown = shutdown.clone();
        intakes.spawn(async move { http::serve(&bind, service, shutdown).await });
    }
    if let Some(redis_url) = config.redis_url.clone() {
        let service = Arc::clone(&service);
        let shutdown = shutdown.clone();
        intakes.spawn(async move { worker::run_worker(&redis_url, service, shutdown).await });
    }

    let mut failure = None;
    while let Some(joined) = intakes.join_next().await {
        let outcome = joined.context("Intake task panicked").and_then(|r| r);
        if let Err(e) = outcome {
            error!("Intake failed: {:#}", e);
            shutdown.cancel();
            failure.get_or_insert(e);
        }
    }

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        warn!("Workspace sweeper task failed: {}", e);
    }
    info!("Code Runner stopped");

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM
fn spawn_signal_handler(shutdown: CancellationToken) -> Result<()> {
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C, shutting down"),
            _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
        }
        shutdown.cancel();
    });
    Ok(())
}
