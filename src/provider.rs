//! Cloud provider capability.
//!
//! The reconciler only talks to the cloud through [`CloudProvider`]. The
//! production binding lives in [`crate::aws`]; tests use the in-memory double
//! in [`memory`].

#[cfg(test)]
pub mod memory;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use crate::error::ProviderError;
use crate::model::{ImageRef, ObservedResource, ResourceKind, ResourceSpec, ResourceState};

/// Which resources a query may return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelScope {
    /// Resources whose cluster label equals the given name exactly.
    Cluster(String),
    /// Any resource carrying a cluster label.
    AnyCluster,
}

impl LabelScope {
    pub fn cluster(name: &str) -> Self {
        Self::Cluster(name.to_string())
    }

    pub fn matches(&self, spec: &ResourceSpec) -> bool {
        match self {
            Self::Cluster(name) => spec.cluster() == Some(name.as_str()),
            Self::AnyCluster => spec.cluster().is_some_and(|c| !c.is_empty()),
        }
    }
}

/// Remote resource store reached through the provider API.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// List resources in `scope`, restricted to `kinds` when not empty.
    async fn list(
        &self,
        scope: &LabelScope,
        kinds: &[ResourceKind],
    ) -> Result<Vec<ObservedResource>, ProviderError>;

    /// Create a resource. References in the spec are resolved by name within
    /// the spec's cluster.
    async fn create(&self, spec: &ResourceSpec) -> Result<ObservedResource, ProviderError>;

    /// Apply mutable drift to an existing resource.
    async fn update(
        &self,
        current: &ObservedResource,
        desired: &ResourceSpec,
    ) -> Result<ObservedResource, ProviderError>;

    /// Delete a resource by provider id.
    async fn delete(&self, resource: &ObservedResource) -> Result<(), ProviderError>;

    /// Re-read one resource. `None` when it no longer exists.
    async fn refresh(
        &self,
        resource: &ObservedResource,
    ) -> Result<Option<ObservedResource>, ProviderError>;

    /// Set or clear a `kshape-status-<key>` annotation.
    async fn set_status_label(
        &self,
        resource: &ObservedResource,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), ProviderError>;

    /// Start or stop an instance.
    async fn set_power(&self, resource: &ObservedResource, running: bool)
    -> Result<(), ProviderError>;

    /// Resolve an image lookup key to the newest matching image id.
    async fn resolve_image(&self, image: &ImageRef) -> Result<Option<String>, ProviderError>;

    /// Account the credentials belong to.
    async fn account_id(&self) -> Result<String, ProviderError>;

    /// Whether two live objects of `kind` may share a name.
    fn allows_duplicate_names(&self, kind: ResourceKind) -> bool {
        !kind.has_unique_provider_name()
    }
}

/// Object storage for credentials backups.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>)
    -> Result<(), ProviderError>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, ProviderError>;

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, ProviderError>;
}

/// Poll until the resource reports [`ResourceState::Available`].
pub async fn wait_until_available(
    provider: &dyn CloudProvider,
    resource: &ObservedResource,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<ObservedResource, ProviderError> {
    let start = Instant::now();
    let mut current = resource.clone();

    loop {
        match current.state {
            ResourceState::Available => return Ok(current),
            ResourceState::Failed => {
                return Err(ProviderError::fatal(
                    "provider::wait",
                    format!("{} entered failed state", current.reference()),
                ));
            }
            _ => {}
        }

        if start.elapsed() >= timeout {
            return Err(ProviderError::timeout(
                "provider::wait",
                format!(
                    "{} still {} after {}s",
                    current.reference(),
                    current.state,
                    timeout.as_secs()
                ),
            ));
        }

        debug!(
            resource = %current.reference(),
            state = %current.state,
            "Waiting for resource to become available"
        );
        tokio::time::sleep(poll_interval).await;

        current = provider.refresh(&current).await?.ok_or_else(|| {
            ProviderError::not_found(
                "provider::wait",
                format!("{} disappeared while waiting", resource.reference()),
            )
        })?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BucketConfig, ResourceConfig};
    use memory::MemoryProvider;

    fn bucket(cluster: &str) -> ResourceSpec {
        ResourceSpec::new(
            ResourceKind::Bucket,
            format!("kshape-{cluster}-123456789012"),
            cluster,
            "state",
            ResourceConfig::Bucket(BucketConfig { versioning: true }),
        )
    }

    #[test]
    fn test_scope_matches_exact_cluster() {
        let scope = LabelScope::cluster("demo");
        assert!(scope.matches(&bucket("demo")));
        assert!(!scope.matches(&bucket("demo2")));
        assert!(LabelScope::AnyCluster.matches(&bucket("other")));
    }

    #[test]
    fn test_any_cluster_requires_label() {
        let mut spec = bucket("demo");
        spec.labels.clear();
        assert!(!LabelScope::AnyCluster.matches(&spec));
    }

    #[tokio::test]
    async fn test_wait_until_available_polls() {
        let provider = MemoryProvider::new();
        let mut created = provider.create(&bucket("demo")).await.unwrap();
        provider.set_state(&created.id, ResourceState::Pending);
        created.state = ResourceState::Pending;
        provider.become_available_after(&created.id, 2);

        let ready = wait_until_available(
            &provider,
            &created,
            Duration::from_secs(5),
            Duration::from_millis(1),
        )
        .await
        .unwrap();
        assert_eq!(ready.state, ResourceState::Available);
    }

    #[tokio::test]
    async fn test_wait_until_available_times_out() {
        let provider = MemoryProvider::new();
        let mut created = provider.create(&bucket("demo")).await.unwrap();
        provider.set_state(&created.id, ResourceState::Pending);
        created.state = ResourceState::Pending;

        let err = wait_until_available(
            &provider,
            &created,
            Duration::from_millis(5),
            Duration::from_millis(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout { .. }));
    }
}
