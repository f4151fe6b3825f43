// Drift reconciler - keep the live pod in sync with its declared profile
//
// Two triggers share one remedy. The periodic pass compares the live pod's
// spec fingerprint against the active profile's derived fingerprint; the
// watch-driven pass fires when the active profile's custom resource
// changes. Either way the pod is deleted, never recreated in place: demand
// recreates it, which preserves scale-to-zero semantics.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::activation::ActivationController;
use crate::config::Config;
use crate::orchestrator::{spec, Orchestrator};
use crate::registry::ModelRegistry;

pub struct DriftReconciler {
    controller: Arc<ActivationController>,
    orchestrator: Arc<dyn Orchestrator>,
    registry: Arc<dyn ModelRegistry>,
    config: Config,
}

impl DriftReconciler {
    pub fn new(
        controller: Arc<ActivationController>,
        orchestrator: Arc<dyn Orchestrator>,
        registry: Arc<dyn ModelRegistry>,
        config: Config,
    ) -> Self {
        Self {
            controller,
            orchestrator,
            registry,
            config,
        }
    }

    /// One reconcile pass. Failures are reported, not retried; the next
    /// tick re-evaluates.
    pub async fn check_drift(&self) -> anyhow::Result<bool> {
        let Some(view) = self.orchestrator.get_pod().await? else {
            // Nothing running, nothing to drift
            return Ok(false);
        };

        let active = self.controller.active_model().await;
        let profile = self.registry.get(&active).await?;
        let expected = spec::fingerprint(&self.config, &profile);

        if view.fingerprint.as_deref() == Some(expected.as_str()) {
            return Ok(false);
        }

        tracing::info!(
            "pod drifted from profile {:?} (have {:?}, want {:?}), restarting",
            active,
            view.fingerprint,
            expected
        );
        self.controller.restart_pod().await?;
        Ok(true)
    }

    /// Spawn the periodic drift loop
    pub fn spawn(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.drift_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        tracing::debug!("drift reconciler shutting down");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.check_drift().await {
                            tracing::warn!("drift check failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}

/// Spawn the profile-change listener
///
/// Receives profile ids from the registry watch and restarts the pod when
/// the active profile changed. Updates to other profiles are ignored: they
/// take effect when a request switches to them.
pub fn spawn_profile_listener(
    controller: Arc<ActivationController>,
    mut rx: mpsc::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::debug!("profile listener shutting down");
                    return;
                }
                changed = rx.recv() => {
                    let Some(id) = changed else { return };
                    if id != controller.active_model().await {
                        tracing::debug!("ignoring change to inactive profile {:?}", id);
                        continue;
                    }
                    tracing::info!("active profile {:?} changed, restarting pod", id);
                    if let Err(e) = controller.restart_pod().await {
                        tracing::warn!("restart after profile change failed: {}", e);
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::orchestrator::fake::FakeOrchestrator;
    use crate::registry::profile::test_profile;
    use crate::registry::StaticRegistry;

    fn fixture(
        orchestrator: Arc<FakeOrchestrator>,
    ) -> (DriftReconciler, Arc<ActivationController>, Config) {
        let config = Config::default();
        let registry = Arc::new(StaticRegistry::new(vec![test_profile(
            "model-a",
            "org/model-a",
        )]));
        let controller = Arc::new(ActivationController::new(
            &config,
            "model-a".to_string(),
            orchestrator.clone(),
            registry.clone(),
            Arc::new(Metrics::new()),
        ));
        let reconciler = DriftReconciler::new(
            controller.clone(),
            orchestrator,
            registry,
            config.clone(),
        );
        (reconciler, controller, config)
    }

    #[tokio::test]
    async fn test_no_pod_no_drift() {
        let orchestrator = Arc::new(FakeOrchestrator::new());
        let (reconciler, _, _) = fixture(orchestrator.clone());
        assert!(!reconciler.check_drift().await.unwrap());
        assert_eq!(orchestrator.delete_count(), 0);
    }

    #[tokio::test]
    async fn test_matching_fingerprint_keeps_pod() {
        let orchestrator = Arc::new(FakeOrchestrator::new());
        let (reconciler, _, config) = fixture(orchestrator.clone());

        let expected = spec::fingerprint(&config, &test_profile("model-a", "org/model-a"));
        orchestrator.seed_pod("model-a", &expected);

        assert!(!reconciler.check_drift().await.unwrap());
        assert!(orchestrator.pod_exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_drifted_pod_is_restarted() {
        let orchestrator = Arc::new(FakeOrchestrator::new());
        let (reconciler, _, _) = fixture(orchestrator.clone());
        orchestrator.seed_pod("model-a", "stale-fingerprint");

        assert!(reconciler.check_drift().await.unwrap());
        // Deleted, not recreated: demand recreates
        assert!(!orchestrator.pod_exists().await.unwrap());
        assert_eq!(orchestrator.create_count(), 0);
    }

    #[tokio::test]
    async fn test_profile_listener_restarts_on_active_change() {
        let orchestrator = Arc::new(FakeOrchestrator::new());
        let (_, controller, _) = fixture(orchestrator.clone());
        orchestrator.seed_pod("model-a", "fp");

        let (tx, rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_profile_listener(controller, rx, shutdown_rx);

        // Inactive profile change: ignored
        tx.send("model-z".to_string()).await.unwrap();
        // Active profile change: pod deleted
        tx.send("model-a".to_string()).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(!orchestrator.pod_exists().await.unwrap());
        assert_eq!(orchestrator.delete_count(), 1);
    }
}
