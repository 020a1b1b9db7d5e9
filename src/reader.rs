//! Remote state reader.
//!
//! Builds a fresh [`RemoteSnapshot`] from the provider on every call. Results
//! are filtered by the exact cluster label again after the provider query, so
//! a loose provider-side filter can never widen the scope.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::error::KshapeError;
use crate::model::{ObservedResource, ResourceKind, ResourceRef, ResourceSpec, ResourceState};
use crate::provider::{CloudProvider, LabelScope};

/// Resources discovered by one label query.
#[derive(Debug, Clone, Default)]
pub struct RemoteSnapshot {
    resources: Vec<ObservedResource>,
}

impl RemoteSnapshot {
    pub const fn new(resources: Vec<ObservedResource>) -> Self {
        Self { resources }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObservedResource> {
        self.resources.iter()
    }

    pub fn into_vec(self) -> Vec<ObservedResource> {
        self.resources
    }

    pub const fn len(&self) -> usize {
        self.resources.len()
    }

    pub const fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn of_kind(&self, kind: ResourceKind) -> Vec<ObservedResource> {
        self.resources
            .iter()
            .filter(|r| r.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn find(&self, kind: ResourceKind, name: &str) -> Option<&ObservedResource> {
        self.resources
            .iter()
            .find(|r| r.kind() == kind && r.name() == name)
    }

    pub fn count_by_kind(&self) -> BTreeMap<ResourceKind, usize> {
        let mut counts = BTreeMap::new();
        for r in &self.resources {
            *counts.entry(r.kind()).or_insert(0) += 1;
        }
        counts
    }

    /// Group resources by their cluster label.
    pub fn by_cluster(&self) -> BTreeMap<String, Vec<ObservedResource>> {
        let mut groups: BTreeMap<String, Vec<ObservedResource>> = BTreeMap::new();
        for r in &self.resources {
            if let Some(cluster) = r.spec.cluster() {
                groups.entry(cluster.to_string()).or_default().push(r.clone());
            }
        }
        groups
    }
}

/// Split resources sharing a kind and name into one primary copy and extras.
///
/// The primary is an available copy matching its entry in `desired`, then any
/// available copy, then the first one. Extras are leftovers from an
/// interrupted replacement.
pub fn partition_duplicates(
    resources: Vec<ObservedResource>,
    desired: &[&ResourceSpec],
) -> (Vec<ObservedResource>, Vec<ObservedResource>) {
    let mut groups: BTreeMap<ResourceRef, Vec<ObservedResource>> = BTreeMap::new();
    let mut order = Vec::new();
    for r in resources {
        let key = r.reference();
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(r);
    }

    let mut primary = Vec::new();
    let mut extras = Vec::new();
    for key in order {
        let Some(mut copies) = groups.remove(&key) else {
            continue;
        };
        let spec = desired.iter().find(|d| d.reference() == key);
        let pick = copies
            .iter()
            .enumerate()
            .min_by_key(|(i, r)| {
                let drifted = spec.is_none_or(|s| !s.drift(&r.spec).is_empty());
                (r.state != ResourceState::Available, drifted, *i)
            })
            .map_or(0, |(i, _)| i);
        primary.push(copies.remove(pick));
        extras.extend(copies);
    }
    (primary, extras)
}

/// Read every resource labeled for `cluster`, restricted to `kinds` when not empty.
pub async fn read(
    provider: &dyn CloudProvider,
    cluster: &str,
    kinds: &[ResourceKind],
) -> Result<RemoteSnapshot, KshapeError> {
    let scope = LabelScope::cluster(cluster);
    let listed = provider
        .list(&scope, kinds)
        .await
        .map_err(|e| KshapeError::provider(e, None))?;

    let total = listed.len();
    let resources: Vec<ObservedResource> = listed
        .into_iter()
        .filter(|r| {
            let keep = r.belongs_to(cluster) && (kinds.is_empty() || kinds.contains(&r.kind()));
            if !keep {
                warn!(
                    cluster = %cluster,
                    resource = %r.reference(),
                    label = ?r.spec.cluster(),
                    "Dropping resource outside the requested scope"
                );
            }
            keep
        })
        .collect();

    debug!(
        cluster = %cluster,
        kinds = ?kinds,
        listed = total,
        kept = resources.len(),
        "Remote snapshot read"
    );
    Ok(RemoteSnapshot::new(resources))
}

/// Read every resource carrying any cluster label.
pub async fn read_all(
    provider: &dyn CloudProvider,
    kinds: &[ResourceKind],
) -> Result<RemoteSnapshot, KshapeError> {
    let listed = provider
        .list(&LabelScope::AnyCluster, kinds)
        .await
        .map_err(|e| KshapeError::provider(e, None))?;
    Ok(RemoteSnapshot::new(
        listed
            .into_iter()
            .filter(|r| LabelScope::AnyCluster.matches(&r.spec))
            .collect(),
    ))
}
