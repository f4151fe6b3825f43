// Model registry - read and watch model profiles
//
// Profiles live as `ModelProfile` custom resources in the proxy's
// namespace. The registry exposes get/list behind a trait so the request
// path and the activation controller can run against an in-memory store in
// tests, and a watch that reports profile changes over a channel.

pub mod profile;

pub use profile::{ModelProfile, ModelProfileSpec};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kube::api::{Api, ListParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use thiserror::Error;
use tokio::sync::{mpsc, watch as tokio_watch};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("model profile {0:?} not found")]
    NotFound(String),

    #[error("registry read failed: {0}")]
    Api(String),
}

/// Read access to the profile set
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// Fetch one profile by id
    async fn get(&self, id: &str) -> Result<ModelProfile, RegistryError>;

    /// List all profiles in the namespace
    async fn list(&self) -> Result<Vec<ModelProfile>, RegistryError>;

    /// Whether a profile exists
    async fn contains(&self, id: &str) -> Result<bool, RegistryError> {
        match self.get(id).await {
            Ok(_) => Ok(true),
            Err(RegistryError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// Kubernetes-backed registry
// ============================================================================

/// Registry backed by the cluster's custom resources
#[derive(Clone)]
pub struct KubeModelRegistry {
    api: Api<ModelProfile>,
}

impl KubeModelRegistry {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }

    /// Spawn the profile watch task
    ///
    /// Applied events (create/update) send the profile id on `tx`. Watch
    /// errors are logged and the stream resumes; the task exits on
    /// shutdown. Deletions are ignored: a deleted profile only matters the
    /// next time a request asks for it, and the registry read will fail
    /// then with a clear error.
    pub fn spawn_watch(
        &self,
        tx: mpsc::Sender<String>,
        mut shutdown: tokio_watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let api = self.api.clone();
        tokio::spawn(async move {
            let mut stream = watcher(api, watcher::Config::default())
                .applied_objects()
                .boxed();

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        tracing::debug!("profile watch shutting down");
                        return;
                    }
                    next = stream.try_next() => {
                        match next {
                            Ok(Some(profile)) => {
                                let id = profile.id();
                                tracing::info!("model profile {:?} changed", id);
                                if tx.send(id).await.is_err() {
                                    // Receiver gone; nothing left to notify
                                    return;
                                }
                            }
                            Ok(None) => {
                                tracing::warn!("profile watch stream ended");
                                return;
                            }
                            Err(e) => {
                                // watcher() restarts internally; this only
                                // surfaces the transient error for logs
                                tracing::warn!("profile watch error: {}", e);
                            }
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl ModelRegistry for KubeModelRegistry {
    async fn get(&self, id: &str) -> Result<ModelProfile, RegistryError> {
        match self.api.get_opt(id).await {
            Ok(Some(profile)) => Ok(profile),
            Ok(None) => Err(RegistryError::NotFound(id.to_string())),
            Err(e) => Err(RegistryError::Api(e.to_string())),
        }
    }

    async fn list(&self) -> Result<Vec<ModelProfile>, RegistryError> {
        self.api
            .list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|e| RegistryError::Api(e.to_string()))
    }
}

// ============================================================================
// In-memory registry (tests)
// ============================================================================

/// Fixed profile set for tests
#[cfg(test)]
pub struct StaticRegistry {
    profiles: Vec<ModelProfile>,
}

#[cfg(test)]
impl StaticRegistry {
    pub fn new(profiles: Vec<ModelProfile>) -> Self {
        Self { profiles }
    }
}

#[cfg(test)]
#[async_trait]
impl ModelRegistry for StaticRegistry {
    async fn get(&self, id: &str) -> Result<ModelProfile, RegistryError> {
        self.profiles
            .iter()
            .find(|p| p.id() == id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    async fn list(&self) -> Result<Vec<ModelProfile>, RegistryError> {
        Ok(self.profiles.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::profile::test_profile;
    use super::*;

    #[tokio::test]
    async fn test_static_registry_lookup() {
        let registry = StaticRegistry::new(vec![
            test_profile("a", "org/model-a"),
            test_profile("b", "org/model-b"),
        ]);

        assert!(registry.contains("a").await.unwrap());
        assert!(!registry.contains("z").await.unwrap());
        assert_eq!(registry.get("b").await.unwrap().spec.model_name, "org/model-b");
        assert_eq!(registry.list().await.unwrap().len(), 2);

        match registry.get("z").await {
            Err(RegistryError::NotFound(id)) => assert_eq!(id, "z"),
            other => panic!("expected NotFound, got {:?}", other.map(|p| p.id())),
        }
    }
}
