//! Reconciler: converge the provider onto a desired resource set.
//!
//! A pass reads each kind once, plans it with [`plan::plan_kind`], then runs
//! two passes over the plan:
//!
//! 1. **Forward**, kinds in dependency order: creates, updates and replaces.
//!    Actions within a kind run concurrently up to `max_concurrency`.
//! 2. **Reverse**, kinds in reverse dependency order: deletes, highest index
//!    first.
//!
//! A failed action marks its resource as failed; anything that depends on a
//! failed resource is reported as blocked instead of being attempted. In the
//! reverse pass the relation flips: a resource whose delete failed keeps the
//! resources it depends on alive.

pub mod plan;
pub mod report;

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{KshapeError, ProviderError};
use crate::model::{ObservedResource, ResourceKind, ResourceRef, ResourceSpec, ResourceState};
use crate::provider::{CloudProvider, wait_until_available};
use crate::reader;
use crate::retry::{RetryConfig, retry_with_backoff};

pub use plan::{ActionKind, ActionReason, KindPlan, Plan, ReconcileAction, plan_kind};
pub use report::{AppliedAction, FailedAction, ReconcileReport};

/// Restricts a pass to a subset of desired and observed resources.
pub type Selector<'s> = &'s (dyn Fn(&ResourceSpec) -> bool + Send + Sync);

/// Selector that keeps everything.
pub const fn everything(_: &ResourceSpec) -> bool {
    true
}

/// Who decides on replaces and deletes.
pub enum Approval<'a> {
    Granted,
    Denied,
    /// Asked once per pass with every destructive action, only when there is one.
    Ask(&'a (dyn Fn(&[&ReconcileAction]) -> bool + Send + Sync)),
}

impl Approval<'_> {
    fn decide(&self, destructive: &[&ReconcileAction]) -> bool {
        if destructive.is_empty() {
            return true;
        }
        match self {
            Self::Granted => true,
            Self::Denied => false,
            Self::Ask(ask) => ask(destructive),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub retry: RetryConfig,
    pub max_concurrency: usize,
    /// How long a created or updated resource may take to become available.
    pub operation_timeout: Duration,
    pub poll_interval: Duration,
}

impl ReconcileOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            retry: RetryConfig::with_max_attempts(cfg.retry_max_attempts),
            max_concurrency: cfg.max_concurrency.max(1),
            operation_timeout: cfg.operation_timeout(),
            poll_interval: Duration::from_secs(5),
        }
    }

    #[cfg(test)]
    pub fn fast(max_concurrency: usize) -> Self {
        Self {
            retry: RetryConfig::fast(3),
            max_concurrency,
            operation_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(1),
        }
    }
}

pub struct Reconciler<'a> {
    provider: &'a dyn CloudProvider,
    cluster: &'a str,
    options: ReconcileOptions,
}

impl<'a> Reconciler<'a> {
    pub const fn new(
        provider: &'a dyn CloudProvider,
        cluster: &'a str,
        options: ReconcileOptions,
    ) -> Self {
        Self {
            provider,
            cluster,
            options,
        }
    }

    /// Plan and execute in one go.
    pub async fn reconcile(
        &self,
        desired: &[ResourceSpec],
        kinds: &[ResourceKind],
        select: Selector<'_>,
        approval: &Approval<'_>,
    ) -> ReconcileReport {
        let plan = self.plan(desired, kinds, select).await;
        let approved = approval.decide(&plan.destructive());
        if !approved {
            warn!(
                cluster = %self.cluster,
                pending = plan.destructive().len(),
                "Destructive actions not approved, they will be skipped"
            );
        }
        self.execute(plan, approved).await
    }

    /// Read each kind once and diff it against `desired`.
    pub async fn plan(
        &self,
        desired: &[ResourceSpec],
        kinds: &[ResourceKind],
        select: Selector<'_>,
    ) -> Plan {
        let mut plan = Plan::default();

        for kind in ResourceKind::ORDERED
            .into_iter()
            .filter(|k| kinds.contains(k))
        {
            let wanted: Vec<&ResourceSpec> = desired
                .iter()
                .filter(|s| s.kind == kind && select(s))
                .collect();
            let refs: Vec<ResourceRef> = wanted.iter().map(|s| s.reference()).collect();

            let snapshot = retry_with_backoff(
                &self.options.retry,
                "read",
                KshapeError::is_transient,
                || reader::read(self.provider, self.cluster, &[kind]),
            )
            .await;

            let kind_plan = snapshot.and_then(|snapshot| {
                let actual = snapshot
                    .into_vec()
                    .into_iter()
                    .filter(|r| select(&r.spec))
                    .collect();
                plan_kind(self.cluster, kind, &wanted, actual)
            });

            match kind_plan {
                Ok(p) => {
                    debug!(
                        cluster = %self.cluster,
                        kind = %kind,
                        changes = p.changes.len(),
                        deletes = p.deletes.len(),
                        "Planned kind"
                    );
                    plan.kinds.push(p);
                }
                Err(e) => {
                    error!(cluster = %self.cluster, kind = %kind, error = %e, "Failed to plan kind");
                    plan.kinds.push(KindPlan::failed(kind, refs, e));
                }
            }
        }
        plan
    }

    /// Run a plan. Destructive actions run only when `approve_destructive`.
    pub async fn execute(&self, plan: Plan, approve_destructive: bool) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut failed: HashSet<ResourceRef> = HashSet::new();
        let mut deletes = Vec::new();

        for kind_plan in plan.kinds {
            if let Some(error) = kind_plan.error {
                failed.extend(kind_plan.desired);
                report.failed.push(FailedAction {
                    action: None,
                    resource: ResourceRef::new(kind_plan.kind, "*"),
                    error,
                });
                continue;
            }

            let mut runnable = Vec::new();
            for action in kind_plan.changes {
                if action.is_destructive() && !approve_destructive {
                    report.skipped.push(action);
                } else if let Some(dep) = action.depends_on().into_iter().find(|d| failed.contains(d))
                {
                    warn!(
                        resource = %action.resource,
                        dependency = %dep,
                        "Skipping action blocked by a failed dependency"
                    );
                    failed.insert(action.resource.clone());
                    report.blocked.push(action.resource);
                } else {
                    runnable.push(action);
                }
            }

            let results: Vec<_> = stream::iter(runnable)
                .map(|action| self.apply(action))
                .buffer_unordered(self.options.max_concurrency)
                .collect()
                .await;
            for (action, result) in results {
                if result.is_err() {
                    failed.insert(action.resource.clone());
                }
                record(&mut report, action, result);
            }

            deletes.push(kind_plan.deletes);
        }

        deletes.reverse();
        self.run_deletes(deletes, approve_destructive, &mut report)
            .await;
        report
    }

    /// Delete specific observed resources, kinds in reverse dependency order.
    ///
    /// Every resource must carry this reconciler's exact cluster label.
    pub async fn delete_resources(
        &self,
        resources: Vec<ObservedResource>,
        approve: bool,
    ) -> ReconcileReport {
        let mut groups: Vec<Vec<ReconcileAction>> = ResourceKind::ORDERED
            .iter()
            .rev()
            .map(|kind| {
                let mut actions: Vec<ReconcileAction> = resources
                    .iter()
                    .filter(|r| r.kind() == *kind)
                    .map(|r| ReconcileAction {
                        kind: ActionKind::Delete,
                        resource: r.reference(),
                        reason: ActionReason::Excess,
                        desired: None,
                        actual: Some(r.clone()),
                    })
                    .collect();
                plan::sort_deletes(&mut actions);
                actions
            })
            .collect();
        groups.retain(|g| !g.is_empty());

        let mut report = ReconcileReport::default();
        self.run_deletes(groups, approve, &mut report).await;
        report
    }

    async fn run_deletes(
        &self,
        groups: Vec<Vec<ReconcileAction>>,
        approve: bool,
        report: &mut ReconcileReport,
    ) {
        // Resources something undeleted still depends on.
        let mut retained: HashSet<ResourceRef> = HashSet::new();

        for group in groups {
            if !approve {
                report.skipped.extend(group);
                continue;
            }

            let mut runnable = Vec::new();
            for action in group {
                if retained.contains(&action.resource) {
                    warn!(
                        resource = %action.resource,
                        "Keeping resource still used by a resource that could not be deleted"
                    );
                    retained.extend(action.depends_on());
                    report.blocked.push(action.resource);
                } else {
                    runnable.push(action);
                }
            }

            let results: Vec<_> = stream::iter(runnable)
                .map(|action| self.apply(action))
                .buffered(self.options.max_concurrency)
                .collect()
                .await;
            for (action, result) in results {
                if result.is_err() {
                    retained.extend(action.depends_on());
                }
                record(report, action, result);
            }
        }
    }

    async fn apply(
        &self,
        action: ReconcileAction,
    ) -> (ReconcileAction, Result<String, KshapeError>) {
        info!(
            cluster = %self.cluster,
            action = %action.kind,
            resource = %action.resource,
            reason = %action.reason,
            "Applying action"
        );

        let result = match (action.kind, &action.desired, &action.actual) {
            (ActionKind::Create, Some(desired), _) => self.create(desired).await.map(|r| r.id),
            (ActionKind::Update, Some(desired), Some(actual)) => {
                self.update(actual, desired).await.map(|r| r.id)
            }
            (ActionKind::Replace, Some(desired), Some(actual)) => {
                self.replace(desired, actual).await.map(|r| r.id)
            }
            (ActionKind::Delete, _, Some(actual)) => {
                self.delete(actual).await.map(|()| actual.id.clone())
            }
            _ => Err(KshapeError::config(format!("malformed action: {action}"))),
        };
        (action, result)
    }

    async fn create(&self, desired: &ResourceSpec) -> Result<ObservedResource, KshapeError> {
        match self.create_confirmed(desired).await {
            Err(KshapeError::Conflict { .. }) => self.resolve_conflict(desired).await,
            other => other,
        }
    }

    async fn create_confirmed(
        &self,
        desired: &ResourceSpec,
    ) -> Result<ObservedResource, KshapeError> {
        let created = self
            .call("create", || self.provider.create(desired))
            .await
            .map_err(|e| KshapeError::provider(e, Some(desired.reference())))?;
        self.confirm(&created).await
    }

    async fn update(
        &self,
        current: &ObservedResource,
        desired: &ResourceSpec,
    ) -> Result<ObservedResource, KshapeError> {
        let updated = self
            .call("update", || self.provider.update(current, desired))
            .await
            .map_err(|e| KshapeError::provider(e, Some(desired.reference())))?;
        self.confirm(&updated).await
    }

    /// Create-then-delete where names may repeat, delete-then-create otherwise.
    async fn replace(
        &self,
        desired: &ResourceSpec,
        current: &ObservedResource,
    ) -> Result<ObservedResource, KshapeError> {
        if self.provider.allows_duplicate_names(desired.kind) {
            let created = self.create_confirmed(desired).await?;
            self.delete(current).await?;
            Ok(created)
        } else {
            self.delete(current).await?;
            self.create_confirmed(desired).await
        }
    }

    async fn delete(&self, resource: &ObservedResource) -> Result<(), KshapeError> {
        if !resource.belongs_to(self.cluster) {
            return Err(KshapeError::safety(
                resource.reference(),
                format!(
                    "refusing to delete: cluster label is {:?}, expected {:?}",
                    resource.spec.cluster(),
                    self.cluster
                ),
            ));
        }

        match self.call("delete", || self.provider.delete(resource)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(resource = %resource.reference(), "Already deleted");
                Ok(())
            }
            Err(e) => Err(KshapeError::provider(e, Some(resource.reference()))),
        }
    }

    /// A create hit an existing object of the same name. Replace it when it
    /// belongs to this cluster; otherwise the name is taken by someone else.
    async fn resolve_conflict(
        &self,
        desired: &ResourceSpec,
    ) -> Result<ObservedResource, KshapeError> {
        warn!(
            cluster = %self.cluster,
            resource = %desired.reference(),
            "Create conflicted with an existing resource, re-reading"
        );
        let snapshot = reader::read(self.provider, self.cluster, &[desired.kind]).await?;
        match snapshot.find(desired.kind, &desired.name).cloned() {
            Some(existing) => self.replace(desired, &existing).await,
            None => Err(KshapeError::safety(
                desired.reference(),
                format!(
                    "name is taken by a resource outside cluster {:?}",
                    self.cluster
                ),
            )),
        }
    }

    async fn confirm(&self, resource: &ObservedResource) -> Result<ObservedResource, KshapeError> {
        if resource.state == ResourceState::Stopped {
            return Ok(resource.clone());
        }
        wait_until_available(
            self.provider,
            resource,
            self.options.operation_timeout,
            self.options.poll_interval,
        )
        .await
        .map_err(|e| KshapeError::provider(e, Some(resource.reference())))
    }

    async fn call<T, F, Fut>(&self, operation: &str, f: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        retry_with_backoff(&self.options.retry, operation, ProviderError::is_transient, f).await
    }
}

fn record(
    report: &mut ReconcileReport,
    action: ReconcileAction,
    result: Result<String, KshapeError>,
) {
    match result {
        Ok(id) => {
            info!(action = %action.kind, resource = %action.resource, id = %id, "Action applied");
            report.applied.push(AppliedAction {
                action: action.kind,
                resource: action.resource,
                reason: action.reason.to_string(),
                id,
            });
        }
        Err(error) => {
            error!(
                action = %action.kind,
                resource = %action.resource,
                retryable = error.is_retryable(),
                error = %error,
                "Action failed"
            );
            report.failed.push(FailedAction {
                action: Some(action.kind),
                resource: action.resource,
                error,
            });
        }
    }
}
