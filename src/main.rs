// podchill - scale-to-zero activity proxy for GPU inference pods
//
// The proxy sits between OpenAI/Anthropic-style clients and a single
// inference pod. It creates the pod on demand, coalesces concurrent cold
// starts, proxies requests with SSE post-processing and dialect
// translation, deletes the pod after idle, and recreates it under a
// different model profile when a client asks for one.
//
// Architecture:
// - Proxy server (axum): routing, reverse proxy, dialect translation
// - Activation controller: coalescing start/stop state machine
// - Orchestrator adapter (kube): pod lifecycle + configmap state
// - Model registry: profile custom resources with change watch
// - Background tasks: idle checker, drift reconciler, profile listener

mod activation;
mod cli;
mod config;
mod error;
mod logging;
mod metrics;
mod orchestrator;
mod proxy;
mod registry;
mod tokens;
mod translation;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};

use activation::reconciler::{spawn_profile_listener, DriftReconciler};
use activation::ActivationController;
use metrics::Metrics;
use orchestrator::{KubeOrchestrator, Orchestrator};
use registry::{KubeModelRegistry, ModelRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    // CLI subcommands (config --show) exit before the proxy starts
    let Some(config) = cli::load() else {
        return Ok(());
    };

    let _log_guard = logging::init(&config)?;
    tracing::info!(
        "podchill v{} starting (namespace {:?}, pod {:?})",
        config::VERSION,
        config.namespace,
        config.pod_name
    );

    let metrics = Arc::new(Metrics::new());

    // Orchestrator wiring; any failure here is a startup failure and the
    // process exits non-zero
    let kube_client = kube::Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;

    let orchestrator = Arc::new(KubeOrchestrator::new(kube_client.clone(), config.clone()));
    orchestrator
        .ensure_configmap()
        .await
        .context("failed to ensure state configmap")?;

    let registry = Arc::new(KubeModelRegistry::new(kube_client, &config.namespace));
    let profiles = registry
        .list()
        .await
        .context("failed to read model registry")?;
    tracing::info!("{} model profile(s) in registry", profiles.len());

    // Resume the persisted active model, falling back to the configured id
    let active_model = orchestrator
        .read_active_model()
        .await
        .context("failed to read active model from configmap")?
        .unwrap_or_else(|| config.model_id.clone());
    if !profiles.iter().any(|p| p.id() == active_model) {
        tracing::warn!(
            "active model {:?} has no profile in the registry; the first request will fail until one appears",
            active_model
        );
    }
    tracing::info!("active model: {:?}", active_model);

    let orchestrator_dyn: Arc<dyn Orchestrator> = orchestrator.clone();
    let registry_dyn: Arc<dyn ModelRegistry> = registry.clone();

    let controller = Arc::new(ActivationController::new(
        &config,
        active_model,
        orchestrator_dyn.clone(),
        registry_dyn.clone(),
        metrics.clone(),
    ));

    // Background tasks share one shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let idle_handle = controller.spawn_idle_loop(shutdown_rx.clone());

    let reconciler = Arc::new(DriftReconciler::new(
        controller.clone(),
        orchestrator_dyn,
        registry_dyn.clone(),
        config.clone(),
    ));
    let drift_handle = reconciler.spawn(shutdown_rx.clone());

    let (profile_tx, profile_rx) = mpsc::channel(16);
    let watch_handle = registry.spawn_watch(profile_tx, shutdown_rx.clone());
    let listener_handle = spawn_profile_listener(controller.clone(), profile_rx, shutdown_rx);

    // Forwarding client. No overall timeout: streamed generations run as
    // long as the backend keeps producing tokens.
    let http_client = reqwest::Client::builder()
        .pool_max_idle_per_host(10)
        .connect_timeout(std::time::Duration::from_secs(10))
        .http1_only()
        .build()
        .context("failed to create HTTP client")?;

    let state = proxy::ProxyState {
        client: http_client,
        controller,
        registry: registry_dyn,
        metrics,
        config: Arc::new(config.clone()),
        started_at: Instant::now(),
    };

    let (server_shutdown_tx, server_shutdown_rx) = oneshot::channel();
    let server_handle = tokio::spawn(proxy::server::start_proxy(
        config,
        state,
        server_shutdown_rx,
    ));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down...");

    // Stop background tasks, then drain the server
    let _ = shutdown_tx.send(true);
    let _ = server_shutdown_tx.send(());

    for handle in [idle_handle, drift_handle, watch_handle, listener_handle] {
        let _ = handle.await;
    }
    match server_handle.await {
        Ok(result) => result?,
        Err(e) => tracing::error!("server task failed: {}", e),
    }

    tracing::info!("shutdown complete");
    Ok(())
}
