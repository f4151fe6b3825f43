// Activation controller - the start/stop state machine for the backend pod
//
// The backend is always 0 or 1 pods. The controller turns a cold backend
// into a ready one under concurrent request arrival (coalescing every
// caller in a cold window onto a single create), tears the pod down after
// idle, and handles model profile switches by deleting the pod and letting
// the next request recreate it under the new profile.
//
// Locking protocol: one RwLock guards the runtime state; a Notify plays
// the condition-variable role for scale-up coalescing. The starter's
// long orchestrator calls (create, readiness poll) run with the lock
// released, guarded by the is_scaling_up flag; structural teardown
// (idle scale-down, model switch) holds the write lock across its whole
// decide-and-act window so it serializes strictly before or after a
// starter, never interleaved with one. Pod creation and the readiness
// poll run inside tokio::spawn so a caller disconnect cannot cancel a
// startup in flight - the spawned task keeps running and every
// coalesced waiter adopts its outcome.

pub mod reconciler;

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify, RwLock};

use crate::config::Config;
use crate::error::ActivationError;
use crate::metrics::{BackendState, Metrics};
use crate::orchestrator::Orchestrator;
use crate::registry::ModelRegistry;

/// Process-singleton runtime state
#[derive(Debug)]
struct RuntimeState {
    /// Profile the controller is currently driving
    active_model_id: String,

    /// Bumped on every proxied request; the idle checker reads it
    last_activity: Instant,

    /// A starter is between taking the role and broadcasting its outcome
    is_scaling_up: bool,

    /// Outcome of the most recent scale-up, adopted by coalesced waiters
    last_scale_outcome: Option<Result<(), ActivationError>>,
}

/// Snapshot for /proxy/stats
#[derive(Debug, Clone, serde::Serialize)]
pub struct StateSnapshot {
    pub active_model: String,
    pub pod_exists: bool,
    pub pod_ready: bool,
    pub scaling_up: bool,
    pub idle_seconds: u64,
}

pub struct ActivationController {
    state: RwLock<RuntimeState>,
    scale_done: Notify,
    orchestrator: Arc<dyn Orchestrator>,
    registry: Arc<dyn ModelRegistry>,
    metrics: Arc<Metrics>,
    startup_timeout: Duration,
    readiness_poll_interval: Duration,
    idle_timeout: Duration,
    idle_check_interval: Duration,
}

impl ActivationController {
    pub fn new(
        config: &Config,
        active_model_id: String,
        orchestrator: Arc<dyn Orchestrator>,
        registry: Arc<dyn ModelRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            state: RwLock::new(RuntimeState {
                active_model_id,
                last_activity: Instant::now(),
                is_scaling_up: false,
                last_scale_outcome: None,
            }),
            scale_done: Notify::new(),
            orchestrator,
            registry,
            metrics,
            startup_timeout: config.startup_timeout,
            readiness_poll_interval: config.readiness_poll_interval,
            idle_timeout: config.idle_timeout,
            idle_check_interval: config.idle_check_interval,
        }
    }

    /// Profile id the controller is currently driving
    pub async fn active_model(&self) -> String {
        self.state.read().await.active_model_id.clone()
    }

    /// Bump the activity timestamp. Never blocks structural transitions.
    pub async fn update_activity(&self) {
        self.state.write().await.last_activity = Instant::now();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        self.metrics.touch_activity(now);
    }

    /// Return once the backend pod exists and reports ready
    ///
    /// Coalescing: for any set of concurrent callers in a cold window,
    /// exactly one issues the orchestrator create; every other caller
    /// waits and adopts the starter's outcome.
    pub async fn ensure_ready(&self) -> Result<(), ActivationError> {
        loop {
            {
                // Enable the waiter while still holding the read lock: the
                // starter cannot broadcast until it takes the write lock,
                // so the wakeup cannot be lost.
                let notified = self.scale_done.notified();
                tokio::pin!(notified);
                let state = self.state.read().await;
                if state.is_scaling_up {
                    notified.as_mut().enable();
                    drop(state);
                    notified.await;
                    let state = self.state.read().await;
                    match state.last_scale_outcome.clone() {
                        Some(outcome) => return outcome,
                        // A new cycle already started; re-evaluate.
                        None => continue,
                    }
                }
            }

            // No starter in flight. A live pod only needs the readiness wait.
            if self.orchestrator.pod_exists().await? {
                return self.wait_ready_detached().await;
            }

            // Cold: try to take the starter role.
            {
                let mut state = self.state.write().await;
                if state.is_scaling_up {
                    // Lost the race; loop back and wait on the notify.
                    continue;
                }
                state.is_scaling_up = true;
                state.last_scale_outcome = None;
            }

            self.metrics.set_backend_state(BackendState::Starting);
            let started = Instant::now();
            let outcome = self.run_scale_up().await;

            {
                let mut state = self.state.write().await;
                state.is_scaling_up = false;
                state.last_scale_outcome = Some(outcome.clone());
            }
            self.scale_done.notify_waiters();

            match &outcome {
                Ok(()) => {
                    self.metrics.set_backend_state(BackendState::Running);
                    self.metrics.record_scale_up("success", started.elapsed());
                }
                Err(e) => {
                    self.metrics.set_backend_state(BackendState::Stopped);
                    let label = match e {
                        ActivationError::StartupTimeout(_) => "timeout",
                        ActivationError::Orchestrator(_) => "error",
                    };
                    self.metrics.record_scale_up(label, started.elapsed());
                }
            }
            return outcome;
        }
    }

    /// Starter body: create the pod for the active profile and wait for
    /// readiness, detached from the caller's lifetime.
    async fn run_scale_up(&self) -> Result<(), ActivationError> {
        let orchestrator = self.orchestrator.clone();
        let registry = self.registry.clone();
        let active = self.active_model().await;
        let timeout = self.startup_timeout;
        let poll = self.readiness_poll_interval;

        let handle = tokio::spawn(async move {
            // The cold check ran before the starter role was taken; a
            // completed scale-up may have slipped in between.
            if orchestrator.pod_exists().await? {
                return wait_for_ready(orchestrator.as_ref(), timeout, poll).await;
            }

            let profile = registry.get(&active).await.map_err(|e| {
                ActivationError::Orchestrator(format!("profile {:?} unavailable: {}", active, e))
            })?;

            orchestrator.create_pod(&profile).await?;
            wait_for_ready(orchestrator.as_ref(), timeout, poll).await
        });

        handle
            .await
            .map_err(|e| ActivationError::Orchestrator(format!("scale-up task failed: {}", e)))?
    }

    /// Wait for an existing pod's readiness on a detached deadline
    async fn wait_ready_detached(&self) -> Result<(), ActivationError> {
        let orchestrator = self.orchestrator.clone();
        let timeout = self.startup_timeout;
        let poll = self.readiness_poll_interval;

        let handle = tokio::spawn(async move {
            wait_for_ready(orchestrator.as_ref(), timeout, poll).await
        });

        handle
            .await
            .map_err(|e| ActivationError::Orchestrator(format!("readiness task failed: {}", e)))?
    }

    /// Delete the backend pod. Idempotent if already absent.
    pub async fn stop(&self) -> Result<(), ActivationError> {
        self.metrics.set_backend_state(BackendState::Stopping);
        self.orchestrator.delete_pod().await?;
        self.metrics.set_backend_state(BackendState::Stopped);
        Ok(())
    }

    /// Switch the active profile
    ///
    /// No-op when `id` is already active. Otherwise the current pod is
    /// deleted and the new id recorded; creation is left to the next
    /// `ensure_ready`.
    ///
    /// A switch is serialized against an in-flight starter: it either
    /// runs before the starter takes the role (the start observes the new
    /// id) or waits for the starter's outcome and tears down the pod it
    /// produced. The write lock is held across the teardown-and-set
    /// window so neither a starter nor the idle checker can interleave.
    pub async fn switch_model(&self, id: &str) -> Result<(), ActivationError> {
        loop {
            let notified = self.scale_done.notified();
            tokio::pin!(notified);

            let mut state = self.state.write().await;
            if state.active_model_id == id {
                return Ok(());
            }
            if state.is_scaling_up {
                // Serialize after the starter's critical section
                notified.as_mut().enable();
                drop(state);
                notified.await;
                continue;
            }

            self.orchestrator.delete_pod().await?;
            let from = std::mem::replace(&mut state.active_model_id, id.to_string());
            drop(state);

            self.metrics.record_model_switch(&from, id);
            self.metrics.set_backend_state(BackendState::Stopped);

            // Persist so a proxy restart resumes with the same profile
            if let Err(e) = self.orchestrator.write_active_model(id).await {
                tracing::warn!("failed to persist active model {:?}: {}", id, e);
            }
            return Ok(());
        }
    }

    /// Delete the pod if present; the next `ensure_ready` recreates it
    pub async fn restart_pod(&self) -> Result<(), ActivationError> {
        if self.orchestrator.pod_exists().await? {
            tracing::info!("restarting backend pod");
            self.metrics.record_scale_down("restart");
            self.stop().await?;
        }
        Ok(())
    }

    /// One pass of the idle checker
    ///
    /// The write lock is held across the whole decide-and-act window:
    /// a starter takes its role under the same lock, so an in-flight
    /// scale-up is refused here and a new one cannot begin while the
    /// idle teardown is underway.
    pub async fn idle_tick(&self) {
        let state = self.state.write().await;
        // A scale-up in flight is activity by definition
        if state.is_scaling_up {
            return;
        }
        let idle_for = state.last_activity.elapsed();
        if idle_for <= self.idle_timeout {
            return;
        }

        match self.orchestrator.pod_exists().await {
            Ok(true) => {
                tracing::info!(
                    "idle for {}s (limit {}s), scaling down",
                    idle_for.as_secs(),
                    self.idle_timeout.as_secs()
                );
                self.metrics.record_scale_down("idle");
                if let Err(e) = self.stop().await {
                    // Not retried here; the next tick re-evaluates
                    tracing::error!("idle scale-down failed: {}", e);
                }
            }
            Ok(false) => {}
            Err(e) => tracing::warn!("idle check could not read pod state: {}", e),
        }
    }

    /// Spawn the periodic idle checker
    pub fn spawn_idle_loop(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(controller.idle_check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        tracing::debug!("idle checker shutting down");
                        return;
                    }
                    _ = ticker.tick() => controller.idle_tick().await,
                }
            }
        })
    }

    /// Point-in-time state for /proxy/stats
    pub async fn snapshot(&self) -> StateSnapshot {
        let (active_model, scaling_up, idle_seconds) = {
            let state = self.state.read().await;
            (
                state.active_model_id.clone(),
                state.is_scaling_up,
                state.last_activity.elapsed().as_secs(),
            )
        };
        let pod = self.orchestrator.get_pod().await.ok().flatten();
        StateSnapshot {
            active_model,
            pod_exists: pod.is_some(),
            pod_ready: pod.map(|p| p.ready).unwrap_or(false),
            scaling_up,
            idle_seconds,
        }
    }
}

/// Poll the orchestrator until the pod reports ready
///
/// Transient read errors are ignored and retried; a pod that disappears
/// mid-wait fails fast (a concurrent switch or stop removed it); the
/// deadline produces `StartupTimeout`.
async fn wait_for_ready(
    orchestrator: &dyn Orchestrator,
    timeout: Duration,
    poll: Duration,
) -> Result<(), ActivationError> {
    let start = Instant::now();
    let mut seen_pod = false;
    loop {
        match orchestrator.get_pod().await {
            Ok(Some(view)) => {
                seen_pod = true;
                if view.ready {
                    return Ok(());
                }
                tracing::debug!("waiting for readiness, phase={}", view.phase);
            }
            Ok(None) if seen_pod => {
                return Err(ActivationError::Orchestrator(
                    "pod disappeared during startup".to_string(),
                ));
            }
            Ok(None) => {}
            Err(e) => tracing::debug!("transient readiness read error: {}", e),
        }

        if start.elapsed() >= timeout {
            return Err(ActivationError::StartupTimeout(timeout.as_secs()));
        }
        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::fake::FakeOrchestrator;
    use crate::registry::profile::test_profile;
    use crate::registry::StaticRegistry;

    fn test_config() -> Config {
        Config {
            startup_timeout: Duration::from_millis(500),
            readiness_poll_interval: Duration::from_millis(10),
            idle_timeout: Duration::from_millis(100),
            idle_check_interval: Duration::from_millis(20),
            ..Config::default()
        }
    }

    fn controller_with(
        orchestrator: Arc<FakeOrchestrator>,
        active: &str,
    ) -> Arc<ActivationController> {
        let registry = Arc::new(StaticRegistry::new(vec![
            test_profile("model-a", "org/model-a"),
            test_profile("model-b", "org/model-b"),
        ]));
        Arc::new(ActivationController::new(
            &test_config(),
            active.to_string(),
            orchestrator,
            registry,
            Arc::new(Metrics::new()),
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cold_start_coalesces_to_one_create() {
        let orchestrator = Arc::new(
            FakeOrchestrator::new().with_ready_after(Duration::from_millis(50)),
        );
        let controller = controller_with(orchestrator.clone(), "model-a");

        let mut handles = Vec::new();
        for _ in 0..5 {
            let c = controller.clone();
            handles.push(tokio::spawn(async move { c.ensure_ready().await }));
        }
        for handle in handles {
            handle.await.unwrap().expect("ensure_ready should succeed");
        }

        assert_eq!(orchestrator.create_count(), 1, "exactly one create");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_startup_timeout_shared_by_waiters() {
        let orchestrator = Arc::new(FakeOrchestrator::new().never_ready());
        let controller = controller_with(orchestrator.clone(), "model-a");

        let c1 = controller.clone();
        let c2 = controller.clone();
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { c1.ensure_ready().await }),
            tokio::spawn(async move { c2.ensure_ready().await }),
        );

        for r in [r1.unwrap(), r2.unwrap()] {
            match r {
                Err(ActivationError::StartupTimeout(_)) => {}
                other => panic!("expected StartupTimeout, got {:?}", other),
            }
        }
        assert_eq!(orchestrator.create_count(), 1);
    }

    #[tokio::test]
    async fn test_ensure_ready_on_existing_pod_skips_create() {
        let orchestrator = Arc::new(FakeOrchestrator::new());
        orchestrator.seed_pod("model-a", "fp");
        let controller = controller_with(orchestrator.clone(), "model-a");

        controller.ensure_ready().await.unwrap();
        assert_eq!(orchestrator.create_count(), 0);
    }

    #[tokio::test]
    async fn test_switch_model_is_idempotent() {
        let orchestrator = Arc::new(FakeOrchestrator::new());
        orchestrator.seed_pod("model-a", "fp");
        let controller = controller_with(orchestrator.clone(), "model-a");

        controller.switch_model("model-a").await.unwrap();
        controller.switch_model("model-a").await.unwrap();
        // Same-model switches never touch the pod
        assert_eq!(orchestrator.delete_count(), 0);
        assert_eq!(controller.active_model().await, "model-a");
    }

    #[tokio::test]
    async fn test_switch_model_tears_down_and_records() {
        let orchestrator = Arc::new(FakeOrchestrator::new());
        orchestrator.seed_pod("model-a", "fp");
        let controller = controller_with(orchestrator.clone(), "model-a");

        controller.switch_model("model-b").await.unwrap();
        assert_eq!(orchestrator.delete_count(), 1);
        assert_eq!(controller.active_model().await, "model-b");
        assert_eq!(
            orchestrator.read_active_model().await.unwrap(),
            Some("model-b".to_string())
        );
        assert!(!orchestrator.pod_exists().await.unwrap());

        // Next ensure_ready creates under the new profile
        controller.ensure_ready().await.unwrap();
        assert_eq!(orchestrator.create_count(), 1);
    }

    #[tokio::test]
    async fn test_idle_tick_stops_idle_pod() {
        let orchestrator = Arc::new(FakeOrchestrator::new());
        orchestrator.seed_pod("model-a", "fp");
        let controller = controller_with(orchestrator.clone(), "model-a");

        // Not idle yet
        controller.idle_tick().await;
        assert!(orchestrator.pod_exists().await.unwrap());

        tokio::time::sleep(Duration::from_millis(150)).await;
        controller.idle_tick().await;
        assert!(!orchestrator.pod_exists().await.unwrap());
        assert_eq!(orchestrator.delete_count(), 1);
    }

    #[tokio::test]
    async fn test_activity_resets_idle_clock() {
        let orchestrator = Arc::new(FakeOrchestrator::new());
        orchestrator.seed_pod("model-a", "fp");
        let controller = controller_with(orchestrator.clone(), "model-a");

        tokio::time::sleep(Duration::from_millis(150)).await;
        controller.update_activity().await;
        controller.idle_tick().await;
        assert!(
            orchestrator.pod_exists().await.unwrap(),
            "fresh activity must prevent scale-down"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_idle_tick_refuses_during_scale_up() {
        let orchestrator = Arc::new(
            FakeOrchestrator::new().with_ready_after(Duration::from_millis(200)),
        );
        let controller = controller_with(orchestrator.clone(), "model-a");

        // Let the idle clock lapse before the starter begins
        tokio::time::sleep(Duration::from_millis(150)).await;

        let starter = {
            let c = controller.clone();
            tokio::spawn(async move { c.ensure_ready().await })
        };
        // Starter is mid-readiness-wait with the pod freshly created
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(orchestrator.pod_exists().await.unwrap());

        controller.idle_tick().await;
        assert!(
            orchestrator.pod_exists().await.unwrap(),
            "idle checker must not delete a pod mid-startup"
        );
        assert_eq!(orchestrator.delete_count(), 0);

        starter
            .await
            .unwrap()
            .expect("startup must complete undisturbed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_switch_model_waits_for_inflight_starter() {
        let orchestrator = Arc::new(
            FakeOrchestrator::new().with_ready_after(Duration::from_millis(150)),
        );
        let controller = controller_with(orchestrator.clone(), "model-a");

        let starter = {
            let c = controller.clone();
            tokio::spawn(async move { c.ensure_ready().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Runs while the starter holds is_scaling_up; must serialize
        // after it, not tear down the pod mid-startup
        controller.switch_model("model-b").await.unwrap();

        starter
            .await
            .unwrap()
            .expect("starter outcome must not be disturbed by the switch");

        assert_eq!(controller.active_model().await, "model-b");
        assert!(!orchestrator.pod_exists().await.unwrap());
        assert_eq!(orchestrator.delete_count(), 1);
        assert_eq!(orchestrator.create_count(), 1);
    }

    #[tokio::test]
    async fn test_restart_pod_noop_when_absent() {
        let orchestrator = Arc::new(FakeOrchestrator::new());
        let controller = controller_with(orchestrator.clone(), "model-a");
        controller.restart_pod().await.unwrap();
        assert_eq!(orchestrator.delete_count(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_reflects_state() {
        let orchestrator = Arc::new(FakeOrchestrator::new());
        orchestrator.seed_pod("model-a", "fp");
        let controller = controller_with(orchestrator.clone(), "model-a");

        let snap = controller.snapshot().await;
        assert_eq!(snap.active_model, "model-a");
        assert!(snap.pod_exists);
        assert!(snap.pod_ready);
        assert!(!snap.scaling_up);
    }
}
