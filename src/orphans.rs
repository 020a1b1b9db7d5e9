//! Orphan detection: labeled resources no configuration accounts for.
//!
//! With a configuration loaded, orphans are the cluster's snapshot minus the
//! compiled resources (plus leftover duplicate copies). Without one, every
//! labeled resource of the cluster is a candidate orphan and is reported as
//! untracked.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use tracing::{info, warn};

use crate::compiler::compile;
use crate::config::Config;
use crate::error::KshapeError;
use crate::model::{ObservedResource, ResourceKind, ResourceRef, ResourceSpec};
use crate::provider::CloudProvider;
use crate::reader::{self, RemoteSnapshot, partition_duplicates};
use crate::reconcile::{ReconcileOptions, ReconcileReport, Reconciler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanMode {
    /// Compared against the cluster's compiled configuration.
    Tracked,
    /// No configuration known for the cluster.
    Untracked,
}

impl fmt::Display for OrphanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tracked => write!(f, "tracked"),
            Self::Untracked => write!(f, "untracked"),
        }
    }
}

/// Orphans of one cluster.
#[derive(Debug, Clone)]
pub struct OrphanGroup {
    pub cluster: String,
    pub mode: OrphanMode,
    pub resources: Vec<ObservedResource>,
}

impl OrphanGroup {
    fn from_resources(
        cluster: &str,
        desired: Option<&[ResourceSpec]>,
        observed: Vec<ObservedResource>,
    ) -> Self {
        let Some(desired) = desired else {
            return Self {
                cluster: cluster.to_string(),
                mode: OrphanMode::Untracked,
                resources: observed,
            };
        };

        let wanted: HashSet<ResourceRef> = desired.iter().map(ResourceSpec::reference).collect();
        let specs: Vec<&ResourceSpec> = desired.iter().collect();
        let (primary, mut resources) = partition_duplicates(observed, &specs);
        resources.extend(
            primary
                .into_iter()
                .filter(|r| !wanted.contains(&r.reference())),
        );
        resources.sort_by(|a, b| (a.kind(), a.name()).cmp(&(b.kind(), b.name())));
        Self {
            cluster: cluster.to_string(),
            mode: OrphanMode::Tracked,
            resources,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn by_kind(&self) -> BTreeMap<ResourceKind, Vec<&ObservedResource>> {
        let mut groups: BTreeMap<ResourceKind, Vec<&ObservedResource>> = BTreeMap::new();
        for r in &self.resources {
            groups.entry(r.kind()).or_default().push(r);
        }
        groups
    }
}

/// Orphans of one cluster. `desired` is `None` when no configuration is known.
pub async fn detect(
    provider: &dyn CloudProvider,
    cluster: &str,
    desired: Option<&[ResourceSpec]>,
) -> Result<OrphanGroup, KshapeError> {
    let snapshot = reader::read(provider, cluster, &[]).await?;
    let group = OrphanGroup::from_resources(cluster, desired, snapshot.into_vec());
    info!(
        cluster = %cluster,
        mode = %group.mode,
        orphans = group.resources.len(),
        "Orphan detection finished"
    );
    Ok(group)
}

/// Compiled configuration per cluster for a project-wide sweep. A missing or
/// invalid configuration yields an empty map, so every cluster is untracked.
pub fn known_clusters(cfg: &Config) -> BTreeMap<String, Vec<ResourceSpec>> {
    match compile(cfg) {
        Ok(desired) => BTreeMap::from([(cfg.cluster_name.clone(), desired)]),
        Err(e) => {
            warn!(
                error = %e,
                "No usable configuration, every labeled resource is untracked"
            );
            BTreeMap::new()
        }
    }
}

/// Orphans of every labeled cluster. `known` maps cluster names to their
/// compiled configuration.
pub async fn detect_all(
    provider: &dyn CloudProvider,
    known: &BTreeMap<String, Vec<ResourceSpec>>,
) -> Result<Vec<OrphanGroup>, KshapeError> {
    let snapshot: RemoteSnapshot = reader::read_all(provider, &[]).await?;
    let groups: Vec<OrphanGroup> = snapshot
        .by_cluster()
        .into_iter()
        .map(|(cluster, observed)| {
            let desired = known.get(&cluster).map(Vec::as_slice);
            OrphanGroup::from_resources(&cluster, desired, observed)
        })
        .filter(|g| !g.is_empty())
        .collect();
    info!(
        clusters = groups.len(),
        orphans = groups.iter().map(|g| g.resources.len()).sum::<usize>(),
        "Orphan detection finished for every cluster"
    );
    Ok(groups)
}

/// Delete exactly the resources of `group`, label-checked by the reconciler.
pub async fn clean(
    provider: &dyn CloudProvider,
    group: OrphanGroup,
    options: ReconcileOptions,
    approve: bool,
) -> ReconcileReport {
    let reconciler = Reconciler::new(provider, &group.cluster, options);
    reconciler.delete_resources(group.resources, approve).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FirewallRuleConfig, ResourceConfig};
    use crate::provider::memory::MemoryProvider;
    use crate::reconcile::{Approval, everything};
    use crate::testing::{config_for, test_config};

    fn firewall(name: &str, cluster: &str) -> ResourceSpec {
        ResourceSpec::new(
            ResourceKind::FirewallRule,
            name,
            cluster,
            "debug",
            ResourceConfig::FirewallRule(FirewallRuleConfig {
                network: format!("{cluster}-network"),
                description: "left over from debugging".to_string(),
                ingress: Vec::new(),
            }),
        )
    }

    async fn provisioned(provider: &MemoryProvider, cfg: &crate::config::Config) -> Vec<ResourceSpec> {
        let desired = compile(cfg).unwrap();
        let report = Reconciler::new(provider, &cfg.cluster_name, ReconcileOptions::fast(4))
            .reconcile(&desired, &ResourceKind::ORDERED, &everything, &Approval::Granted)
            .await;
        assert!(report.is_converged());
        desired
    }

    #[tokio::test]
    async fn test_unlisted_resource_is_reported_and_cleaned() {
        let cfg = test_config();
        let provider = MemoryProvider::new();
        let desired = provisioned(&provider, &cfg).await;
        provider.insert(firewall("demo-debug", "demo"));
        let before = provider.resources().len();

        let group = detect(&provider, "demo", Some(&desired)).await.unwrap();
        assert_eq!(group.mode, OrphanMode::Tracked);
        let names: Vec<&str> = group.resources.iter().map(ObservedResource::name).collect();
        assert_eq!(names, vec!["demo-debug"]);
        assert_eq!(group.by_kind().len(), 1);

        provider.clear_log();
        let report = clean(&provider, group, ReconcileOptions::fast(4), true).await;
        assert!(report.is_converged());
        assert_eq!(provider.log().len(), 1);
        assert_eq!(
            provider.logged("delete", ResourceKind::FirewallRule),
            vec!["demo-debug"]
        );
        assert_eq!(provider.resources().len(), before - 1);
    }

    #[tokio::test]
    async fn test_duplicate_copy_is_an_orphan() {
        let cfg = test_config();
        let provider = MemoryProvider::new();
        let desired = provisioned(&provider, &cfg).await;
        let subnet = desired
            .iter()
            .find(|s| s.kind == ResourceKind::Subnet)
            .unwrap()
            .clone();
        let copy = provider.insert(subnet);

        let group = detect(&provider, "demo", Some(&desired)).await.unwrap();
        assert_eq!(group.resources.len(), 1);
        assert_eq!(group.resources[0].id, copy.id);
    }

    #[tokio::test]
    async fn test_without_config_everything_is_untracked() {
        let provider = MemoryProvider::new();
        provisioned(&provider, &config_for("old")).await;
        let total = provider.resources().len();

        let group = detect(&provider, "old", None).await.unwrap();
        assert_eq!(group.mode, OrphanMode::Untracked);
        assert_eq!(group.resources.len(), total);
    }

    #[tokio::test]
    async fn test_detect_all_groups_by_cluster() {
        let provider = MemoryProvider::new();
        let desired = provisioned(&provider, &test_config()).await;
        provisioned(&provider, &config_for("old")).await;
        provider.insert(firewall("demo-debug", "demo"));

        let known = BTreeMap::from([("demo".to_string(), desired)]);
        let groups = detect_all(&provider, &known).await.unwrap();
        assert_eq!(groups.len(), 2);
        let demo = groups.iter().find(|g| g.cluster == "demo").unwrap();
        assert_eq!(demo.mode, OrphanMode::Tracked);
        assert_eq!(demo.resources.len(), 1);
        let old = groups.iter().find(|g| g.cluster == "old").unwrap();
        assert_eq!(old.mode, OrphanMode::Untracked);
    }

    #[tokio::test]
    async fn test_sweep_without_config_reports_every_cluster_untracked() {
        let provider = MemoryProvider::new();
        provisioned(&provider, &config_for("a")).await;
        provisioned(&provider, &config_for("b")).await;
        let total = provider.resources().len();

        let known = known_clusters(&Config::default());
        assert!(known.is_empty());

        let groups = detect_all(&provider, &known).await.unwrap();
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|g| g.mode == OrphanMode::Untracked));
        assert_eq!(
            groups.iter().map(|g| g.resources.len()).sum::<usize>(),
            total
        );
    }

    #[test]
    fn test_valid_config_is_known() {
        let known = known_clusters(&test_config());
        assert_eq!(known.keys().collect::<Vec<_>>(), vec!["demo"]);
        assert!(!known["demo"].is_empty());
    }

    #[tokio::test]
    async fn test_clean_never_touches_another_cluster() {
        let provider = MemoryProvider::new();
        let other = provider.insert(firewall("b-debug", "b"));
        let group = OrphanGroup {
            cluster: "a".to_string(),
            mode: OrphanMode::Untracked,
            resources: vec![other],
        };

        let report = clean(&provider, group, ReconcileOptions::fast(4), true).await;
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(
            report.failed[0].error,
            KshapeError::SafetyViolation { .. }
        ));
        assert_eq!(provider.resources().len(), 1);
    }
}
