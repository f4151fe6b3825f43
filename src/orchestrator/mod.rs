// Orchestrator adapter - pod lifecycle and configmap state
//
// Everything the activation controller needs from the cluster sits behind
// the `Orchestrator` trait: create/delete/get of the single backend pod
// and read/update of the state configmap that persists the active model id
// across proxy restarts. The kube-backed implementation drives a real
// cluster; tests use an in-memory fake.

pub mod spec;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use std::collections::BTreeMap;

use crate::config::Config;
use crate::error::ActivationError;
use crate::registry::ModelProfile;

/// ConfigMap key holding the active model id
const ACTIVE_MODEL_KEY: &str = "activeModel";

/// What the controller needs to know about the live pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodView {
    /// Ready condition is True
    pub ready: bool,

    /// Pod phase, e.g. "Pending", "Running"
    pub phase: String,

    /// Profile fingerprint annotation, if the pod carries one
    pub fingerprint: Option<String>,
}

/// Cluster operations used by the activation controller and reconciler
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Create the backend pod from a profile. Fails if it already exists.
    async fn create_pod(&self, profile: &ModelProfile) -> Result<(), ActivationError>;

    /// Delete the backend pod. Idempotent: absent pod is success.
    async fn delete_pod(&self) -> Result<(), ActivationError>;

    /// Fetch the backend pod, `None` when absent
    async fn get_pod(&self) -> Result<Option<PodView>, ActivationError>;

    /// Whether the backend pod exists at all
    async fn pod_exists(&self) -> Result<bool, ActivationError> {
        Ok(self.get_pod().await?.is_some())
    }

    /// Read the persisted active model id from the configmap
    async fn read_active_model(&self) -> Result<Option<String>, ActivationError>;

    /// Persist the active model id to the configmap
    async fn write_active_model(&self, id: &str) -> Result<(), ActivationError>;
}

// ============================================================================
// Kubernetes implementation
// ============================================================================

pub struct KubeOrchestrator {
    pods: Api<Pod>,
    configmaps: Api<ConfigMap>,
    config: Config,
}

impl KubeOrchestrator {
    pub fn new(client: Client, config: Config) -> Self {
        Self {
            pods: Api::namespaced(client.clone(), &config.namespace),
            configmaps: Api::namespaced(client, &config.namespace),
            config,
        }
    }

    /// Create the state configmap if it does not exist yet
    ///
    /// Called once at startup so later reads and patches have a target.
    pub async fn ensure_configmap(&self) -> Result<(), ActivationError> {
        match self.configmaps.get_opt(&self.config.configmap_name).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => {
                let mut data = BTreeMap::new();
                data.insert(ACTIVE_MODEL_KEY.to_string(), self.config.model_id.clone());
                let cm = ConfigMap {
                    metadata: kube::api::ObjectMeta {
                        name: Some(self.config.configmap_name.clone()),
                        namespace: Some(self.config.namespace.clone()),
                        ..Default::default()
                    },
                    data: Some(data),
                    ..Default::default()
                };
                self.configmaps
                    .create(&PostParams::default(), &cm)
                    .await
                    .map(|_| ())
                    .map_err(|e| ActivationError::Orchestrator(e.to_string()))
            }
            Err(e) => Err(ActivationError::Orchestrator(e.to_string())),
        }
    }
}

/// A 404 from the API server means "absent", not "failed"
fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == 404)
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn create_pod(&self, profile: &ModelProfile) -> Result<(), ActivationError> {
        let pod = spec::build_pod(&self.config, profile);
        tracing::info!(
            "creating pod {}/{} for profile {:?}",
            self.config.namespace,
            self.config.pod_name,
            profile.id()
        );
        self.pods
            .create(&PostParams::default(), &pod)
            .await
            .map(|_| ())
            .map_err(|e| ActivationError::Orchestrator(e.to_string()))
    }

    async fn delete_pod(&self) -> Result<(), ActivationError> {
        match self
            .pods
            .delete(&self.config.pod_name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                tracing::info!(
                    "deleted pod {}/{}",
                    self.config.namespace,
                    self.config.pod_name
                );
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(ActivationError::Orchestrator(e.to_string())),
        }
    }

    async fn get_pod(&self) -> Result<Option<PodView>, ActivationError> {
        let pod = self
            .pods
            .get_opt(&self.config.pod_name)
            .await
            .map_err(|e| ActivationError::Orchestrator(e.to_string()))?;

        Ok(pod.map(|pod| {
            let status = pod.status.unwrap_or_default();
            let ready = status
                .conditions
                .unwrap_or_default()
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True");
            let phase = status.phase.unwrap_or_else(|| "Unknown".to_string());
            let fingerprint = pod
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(spec::FINGERPRINT_ANNOTATION))
                .cloned();
            PodView {
                ready,
                phase,
                fingerprint,
            }
        }))
    }

    async fn read_active_model(&self) -> Result<Option<String>, ActivationError> {
        let cm = self
            .configmaps
            .get_opt(&self.config.configmap_name)
            .await
            .map_err(|e| ActivationError::Orchestrator(e.to_string()))?;

        Ok(cm
            .and_then(|cm| cm.data)
            .and_then(|data| data.get(ACTIVE_MODEL_KEY).cloned())
            .filter(|id| !id.is_empty()))
    }

    async fn write_active_model(&self, id: &str) -> Result<(), ActivationError> {
        let patch = json!({ "data": { ACTIVE_MODEL_KEY: id } });
        self.configmaps
            .patch(
                &self.config.configmap_name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
            .map(|_| ())
            .map_err(|e| ActivationError::Orchestrator(e.to_string()))
    }
}

// ============================================================================
// In-memory fake (tests)
// ============================================================================

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// In-memory orchestrator with scripted readiness behavior
    pub struct FakeOrchestrator {
        /// (profile id, fingerprint) of the current pod, if any
        pod: Mutex<Option<(String, String)>>,
        /// Persisted active model id
        active_model: Mutex<Option<String>>,
        /// How long after create_pod the pod reports ready
        pub ready_after: Duration,
        /// Instant of the last create, for readiness simulation
        created_at: Mutex<Option<std::time::Instant>>,
        /// Never report ready (startup timeout scenarios)
        pub never_ready: bool,
        pub creates: AtomicUsize,
        pub deletes: AtomicUsize,
    }

    impl FakeOrchestrator {
        pub fn new() -> Self {
            Self {
                pod: Mutex::new(None),
                active_model: Mutex::new(None),
                ready_after: Duration::from_millis(0),
                created_at: Mutex::new(None),
                never_ready: false,
                creates: AtomicUsize::new(0),
                deletes: AtomicUsize::new(0),
            }
        }

        pub fn with_ready_after(mut self, d: Duration) -> Self {
            self.ready_after = d;
            self
        }

        pub fn never_ready(mut self) -> Self {
            self.never_ready = true;
            self
        }

        pub fn create_count(&self) -> usize {
            self.creates.load(Ordering::SeqCst)
        }

        pub fn delete_count(&self) -> usize {
            self.deletes.load(Ordering::SeqCst)
        }

        /// Place a pod directly (running-pod preconditions)
        pub fn seed_pod(&self, profile_id: &str, fingerprint: &str) {
            *self.pod.lock().unwrap() =
                Some((profile_id.to_string(), fingerprint.to_string()));
            *self.created_at.lock().unwrap() = Some(std::time::Instant::now());
        }
    }

    #[async_trait]
    impl Orchestrator for FakeOrchestrator {
        async fn create_pod(&self, profile: &ModelProfile) -> Result<(), ActivationError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            let mut pod = self.pod.lock().unwrap();
            if pod.is_some() {
                return Err(ActivationError::Orchestrator("pod already exists".into()));
            }
            *pod = Some((profile.id(), format!("fp-{}", profile.id())));
            *self.created_at.lock().unwrap() = Some(std::time::Instant::now());
            Ok(())
        }

        async fn delete_pod(&self) -> Result<(), ActivationError> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            *self.pod.lock().unwrap() = None;
            Ok(())
        }

        async fn get_pod(&self) -> Result<Option<PodView>, ActivationError> {
            let pod = self.pod.lock().unwrap();
            Ok(pod.as_ref().map(|(_, fp)| {
                let ready = !self.never_ready
                    && self
                        .created_at
                        .lock()
                        .unwrap()
                        .map(|t| t.elapsed() >= self.ready_after)
                        .unwrap_or(false);
                PodView {
                    ready,
                    phase: if ready { "Running" } else { "Pending" }.to_string(),
                    fingerprint: Some(fp.clone()),
                }
            }))
        }

        async fn read_active_model(&self) -> Result<Option<String>, ActivationError> {
            Ok(self.active_model.lock().unwrap().clone())
        }

        async fn write_active_model(&self, id: &str) -> Result<(), ActivationError> {
            *self.active_model.lock().unwrap() = Some(id.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeOrchestrator;
    use super::*;
    use crate::registry::profile::test_profile;

    #[tokio::test]
    async fn test_fake_pod_lifecycle() {
        let orch = FakeOrchestrator::new();
        assert!(!orch.pod_exists().await.unwrap());

        let profile = test_profile("m", "org/model");
        orch.create_pod(&profile).await.unwrap();
        assert!(orch.pod_exists().await.unwrap());
        assert!(orch.get_pod().await.unwrap().unwrap().ready);

        // Double create is an orchestrator error
        assert!(orch.create_pod(&profile).await.is_err());

        // Delete is idempotent
        orch.delete_pod().await.unwrap();
        orch.delete_pod().await.unwrap();
        assert!(!orch.pod_exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_fake_active_model_roundtrip() {
        let orch = FakeOrchestrator::new();
        assert_eq!(orch.read_active_model().await.unwrap(), None);
        orch.write_active_model("qwen-32b").await.unwrap();
        assert_eq!(
            orch.read_active_model().await.unwrap(),
            Some("qwen-32b".to_string())
        );
    }
}
