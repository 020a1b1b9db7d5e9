//! Pure diff of desired against observed resources for one kind.

use std::cmp::Reverse;
use std::fmt;

use crate::error::KshapeError;
use crate::model::{ObservedResource, ResourceKind, ResourceRef, ResourceSpec, ResourceState};
use crate::reader::partition_duplicates;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Create,
    Update,
    Replace,
    Delete,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
        })
    }
}

/// Why an action was emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionReason {
    Missing,
    Drifted(Vec<&'static str>),
    Failed,
    Excess,
    Duplicate,
}

impl fmt::Display for ActionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("missing"),
            Self::Drifted(fields) => write!(f, "drifted: {}", fields.join(", ")),
            Self::Failed => f.write_str("in failed state"),
            Self::Excess => f.write_str("not declared"),
            Self::Duplicate => f.write_str("duplicate copy"),
        }
    }
}

/// One create, update, replace or delete for a specific resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileAction {
    pub kind: ActionKind,
    pub resource: ResourceRef,
    pub reason: ActionReason,
    pub desired: Option<ResourceSpec>,
    pub actual: Option<ObservedResource>,
}

impl ReconcileAction {
    /// Replace and delete remove a live object.
    pub const fn is_destructive(&self) -> bool {
        matches!(self.kind, ActionKind::Replace | ActionKind::Delete)
    }

    /// Resources this action must wait for.
    pub fn depends_on(&self) -> Vec<ResourceRef> {
        self.desired
            .as_ref()
            .or_else(|| self.actual.as_ref().map(|a| &a.spec))
            .map(ResourceSpec::depends_on)
            .unwrap_or_default()
    }
}

impl fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.kind, self.resource, self.reason)
    }
}

/// Actions for one kind. Changes run in the forward pass, deletes in the
/// reverse pass.
#[derive(Debug)]
pub struct KindPlan {
    pub kind: ResourceKind,
    pub changes: Vec<ReconcileAction>,
    pub deletes: Vec<ReconcileAction>,
    /// Set when the kind could not be read or planned.
    pub error: Option<KshapeError>,
    /// Desired resources of this kind, for dependency tracking on failure.
    pub desired: Vec<ResourceRef>,
}

impl KindPlan {
    pub const fn new(kind: ResourceKind, desired: Vec<ResourceRef>) -> Self {
        Self {
            kind,
            changes: Vec::new(),
            deletes: Vec::new(),
            error: None,
            desired,
        }
    }

    /// A kind that could not be planned; its desired resources count as failed.
    pub fn failed(kind: ResourceKind, desired: Vec<ResourceRef>, error: KshapeError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(kind, desired)
        }
    }
}

/// A full reconcile plan, kinds in dependency order.
#[derive(Debug, Default)]
pub struct Plan {
    pub kinds: Vec<KindPlan>,
}

impl Plan {
    pub fn actions(&self) -> impl Iterator<Item = &ReconcileAction> {
        self.kinds
            .iter()
            .flat_map(|k| k.changes.iter().chain(k.deletes.iter()))
    }

    pub fn destructive(&self) -> Vec<&ReconcileAction> {
        self.actions().filter(|a| a.is_destructive()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.actions().next().is_none() && self.kinds.iter().all(|k| k.error.is_none())
    }

    pub fn count(&self, kind: ActionKind) -> usize {
        self.actions().filter(|a| a.kind == kind).count()
    }
}

/// Diff one kind.
///
/// Every observed resource must carry the exact cluster label; anything else
/// is a safety violation and nothing is planned for the kind.
pub fn plan_kind(
    cluster: &str,
    kind: ResourceKind,
    desired: &[&ResourceSpec],
    actual: Vec<ObservedResource>,
) -> Result<KindPlan, KshapeError> {
    if let Some(foreign) = actual.iter().find(|r| !r.belongs_to(cluster)) {
        return Err(KshapeError::safety(
            foreign.reference(),
            format!(
                "resource is labeled {:?}, refusing to manage it as part of cluster {cluster:?}",
                foreign.spec.cluster()
            ),
        ));
    }

    let (primary, extras) = partition_duplicates(actual, desired);
    let mut plan = KindPlan::new(kind, desired.iter().map(|d| d.reference()).collect());

    for spec in desired {
        let existing = primary.iter().find(|a| a.name() == spec.name);
        let Some(existing) = existing else {
            plan.changes.push(ReconcileAction {
                kind: ActionKind::Create,
                resource: spec.reference(),
                reason: ActionReason::Missing,
                desired: Some((*spec).clone()),
                actual: None,
            });
            continue;
        };

        let drift = spec.drift(&existing.spec);
        let (action, reason) = if existing.state == ResourceState::Failed {
            (ActionKind::Replace, ActionReason::Failed)
        } else if drift.requires_replace() {
            (ActionKind::Replace, ActionReason::Drifted(drift.fields()))
        } else if !drift.is_empty() {
            (ActionKind::Update, ActionReason::Drifted(drift.fields()))
        } else {
            continue;
        };
        plan.changes.push(ReconcileAction {
            kind: action,
            resource: spec.reference(),
            reason,
            desired: Some((*spec).clone()),
            actual: Some(existing.clone()),
        });
    }

    for r in primary {
        if !desired.iter().any(|d| d.name == r.name()) {
            plan.deletes.push(delete_action(r, ActionReason::Excess));
        }
    }
    for r in extras {
        plan.deletes.push(delete_action(r, ActionReason::Duplicate));
    }

    sort_deletes(&mut plan.deletes);
    Ok(plan)
}

fn delete_action(actual: ObservedResource, reason: ActionReason) -> ReconcileAction {
    ReconcileAction {
        kind: ActionKind::Delete,
        resource: actual.reference(),
        reason,
        desired: None,
        actual: Some(actual),
    }
}

/// Highest index first; unindexed names after indexed ones, by name.
pub fn sort_deletes(deletes: &mut [ReconcileAction]) {
    deletes.sort_by_key(|a| {
        let index = crate::model::name_index(&a.resource.name);
        (index.is_none(), Reverse(index), a.resource.name.clone())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ImageRef, InstanceConfig, ROLE_WORKER, ResourceConfig, STATUS_LABEL_PREFIX,
    };

    fn worker(cluster: &str, index: u32, machine_type: &str) -> ResourceSpec {
        ResourceSpec::new(
            ResourceKind::Instance,
            format!("{cluster}-worker-default-{index}"),
            cluster,
            ROLE_WORKER,
            ResourceConfig::Instance(InstanceConfig {
                machine_type: machine_type.to_string(),
                disk_gb: 100,
                image: ImageRef {
                    owner: "540036508848".to_string(),
                    name_pattern: "talos-v1.9.5-*".to_string(),
                },
                subnet: format!("{cluster}-nodes"),
                group: None,
                firewall_rules: vec![],
                service_account: None,
                public_ip: false,
                key_name: None,
            }),
        )
    }

    fn observed(spec: ResourceSpec, id: &str) -> ObservedResource {
        ObservedResource::new(id, spec)
    }

    #[test]
    fn test_missing_resource_is_created() {
        let desired = worker("demo", 0, "m6i.large");
        let plan = plan_kind("demo", ResourceKind::Instance, &[&desired], vec![]).unwrap();
        assert_eq!(plan.changes.len(), 1);
        assert_eq!(plan.changes[0].kind, ActionKind::Create);
        assert_eq!(plan.changes[0].reason, ActionReason::Missing);
    }

    #[test]
    fn test_matching_resource_is_noop() {
        let desired = worker("demo", 0, "m6i.large");
        let actual = observed(
            desired
                .clone()
                .with_label(&format!("{STATUS_LABEL_PREFIX}admin-x"), "y"),
            "i-1",
        );
        let plan = plan_kind("demo", ResourceKind::Instance, &[&desired], vec![actual]).unwrap();
        assert!(plan.changes.is_empty());
        assert!(plan.deletes.is_empty());
    }

    #[test]
    fn test_mutable_drift_is_update() {
        let mut desired = worker("demo", 0, "m6i.large");
        if let ResourceConfig::Instance(c) = &mut desired.config {
            c.firewall_rules = vec!["demo-nodes".to_string()];
        }
        let actual = observed(worker("demo", 0, "m6i.large"), "i-1");
        let plan = plan_kind("demo", ResourceKind::Instance, &[&desired], vec![actual]).unwrap();
        assert_eq!(plan.changes[0].kind, ActionKind::Update);
        assert_eq!(
            plan.changes[0].reason,
            ActionReason::Drifted(vec!["firewall_rules"])
        );
    }

    #[test]
    fn test_machine_type_drift_is_replace() {
        let desired = worker("demo", 0, "m6i.xlarge");
        let actual = observed(worker("demo", 0, "m6i.large"), "i-1");
        let plan = plan_kind("demo", ResourceKind::Instance, &[&desired], vec![actual]).unwrap();
        assert_eq!(plan.changes[0].kind, ActionKind::Replace);
        assert_eq!(
            plan.changes[0].reason,
            ActionReason::Drifted(vec!["machine_type"])
        );
    }

    #[test]
    fn test_immutable_drift_is_replace() {
        let desired = worker("demo", 0, "m6i.large");
        let mut old = worker("demo", 0, "m6i.large");
        if let ResourceConfig::Instance(c) = &mut old.config {
            c.disk_gb = 20;
        }
        let plan = plan_kind(
            "demo",
            ResourceKind::Instance,
            &[&desired],
            vec![observed(old, "i-1")],
        )
        .unwrap();
        assert_eq!(plan.changes[0].kind, ActionKind::Replace);
        assert!(plan.changes[0].is_destructive());
    }

    #[test]
    fn test_failed_resource_is_replaced() {
        let desired = worker("demo", 0, "m6i.large");
        let mut actual = observed(desired.clone(), "i-1");
        actual.state = ResourceState::Failed;
        let plan = plan_kind("demo", ResourceKind::Instance, &[&desired], vec![actual]).unwrap();
        assert_eq!(plan.changes[0].kind, ActionKind::Replace);
        assert_eq!(plan.changes[0].reason, ActionReason::Failed);
    }

    #[test]
    fn test_scale_down_deletes_highest_indices_first() {
        let desired: Vec<ResourceSpec> = (0..2).map(|i| worker("demo", i, "m6i.large")).collect();
        let desired_refs: Vec<&ResourceSpec> = desired.iter().collect();
        let actual: Vec<ObservedResource> = (0..5)
            .map(|i| observed(worker("demo", i, "m6i.large"), &format!("i-{i}")))
            .collect();

        let plan = plan_kind("demo", ResourceKind::Instance, &desired_refs, actual).unwrap();
        assert!(plan.changes.is_empty());
        let deleted: Vec<&str> = plan
            .deletes
            .iter()
            .map(|a| a.resource.name.as_str())
            .collect();
        assert_eq!(
            deleted,
            vec![
                "demo-worker-default-4",
                "demo-worker-default-3",
                "demo-worker-default-2"
            ]
        );
    }

    #[test]
    fn test_index_ordering_is_numeric() {
        let actual: Vec<ObservedResource> = [2, 10, 9]
            .iter()
            .map(|i| observed(worker("demo", *i, "m6i.large"), &format!("i-{i}")))
            .collect();
        let plan = plan_kind("demo", ResourceKind::Instance, &[], actual).unwrap();
        let deleted: Vec<&str> = plan
            .deletes
            .iter()
            .map(|a| a.resource.name.as_str())
            .collect();
        assert_eq!(
            deleted,
            vec![
                "demo-worker-default-10",
                "demo-worker-default-9",
                "demo-worker-default-2"
            ]
        );
    }

    #[test]
    fn test_foreign_label_is_safety_violation() {
        let desired = worker("demo", 0, "m6i.large");
        let foreign = observed(worker("other", 0, "m6i.large"), "i-9");
        let err = plan_kind("demo", ResourceKind::Instance, &[&desired], vec![foreign]).unwrap_err();
        assert!(matches!(err, KshapeError::SafetyViolation { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_duplicate_copies_are_deleted() {
        let desired = worker("demo", 0, "m6i.large");
        let a = observed(desired.clone(), "i-1");
        let b = observed(desired.clone(), "i-2");
        let plan = plan_kind("demo", ResourceKind::Instance, &[&desired], vec![a, b]).unwrap();
        assert!(plan.changes.is_empty());
        assert_eq!(plan.deletes.len(), 1);
        assert_eq!(plan.deletes[0].reason, ActionReason::Duplicate);
        assert_eq!(plan.deletes[0].actual.as_ref().unwrap().id, "i-2");
    }

    #[test]
    fn test_matching_copy_wins_over_drifted_leftover() {
        let desired = worker("demo", 0, "m6i.large");
        let mut leftover = worker("demo", 0, "m6i.large");
        if let ResourceConfig::Instance(c) = &mut leftover.config {
            c.disk_gb = 20;
        }
        let old = observed(leftover, "i-old");
        let new = observed(desired.clone(), "i-new");

        let plan = plan_kind("demo", ResourceKind::Instance, &[&desired], vec![old, new]).unwrap();
        assert!(plan.changes.is_empty(), "{:?}", plan.changes);
        assert_eq!(plan.deletes.len(), 1);
        assert_eq!(plan.deletes[0].reason, ActionReason::Duplicate);
        assert_eq!(plan.deletes[0].actual.as_ref().unwrap().id, "i-old");
    }

    #[test]
    fn test_action_display() {
        let desired = worker("demo", 0, "m6i.large");
        let plan = plan_kind("demo", ResourceKind::Instance, &[&desired], vec![]).unwrap();
        assert_eq!(
            plan.changes[0].to_string(),
            "create Instance/demo-worker-default-0 (missing)"
        );
    }
}
