//! Start and stop cluster instances, and converge the schedule that does it
//! automatically.

use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use crate::error::KshapeError;
use crate::model::{ObservedResource, ROLE_BASTION, ResourceKind, ResourceSpec, ResourceState};
use crate::phases::{Phase, PhaseContext};
use crate::reader;
use crate::reconcile::ReconcileReport;

#[derive(Debug, Default)]
pub struct PowerReport {
    pub changed: Vec<String>,
    pub unchanged: Vec<String>,
    pub failed: Vec<(String, KshapeError)>,
}

/// Start (`running = true`) or stop every cluster node. The bastion is left
/// alone. Per-instance failures are collected in the report.
pub async fn set_running(ctx: &PhaseContext<'_>, running: bool) -> Result<PowerReport, KshapeError> {
    let snapshot = reader::read(ctx.provider, ctx.cluster(), &[ResourceKind::Instance]).await?;
    let (targets, unchanged): (Vec<ObservedResource>, Vec<ObservedResource>) = snapshot
        .into_vec()
        .into_iter()
        .filter(|i| i.spec.role() != Some(ROLE_BASTION))
        .partition(|i| needs_change(i.state, running));

    let verb = if running { "Starting" } else { "Stopping" };
    info!(cluster = %ctx.cluster(), instances = targets.len(), "{verb} instances");

    let results: Vec<(String, Result<(), KshapeError>)> = stream::iter(targets)
        .map(|instance| async move {
            let result = ctx
                .provider
                .set_power(&instance, running)
                .await
                .map_err(|e| KshapeError::provider(e, Some(instance.reference())));
            (instance.spec.name, result)
        })
        .buffer_unordered(ctx.options.max_concurrency)
        .collect()
        .await;

    let mut report = PowerReport {
        unchanged: unchanged.into_iter().map(|i| i.spec.name).collect(),
        ..PowerReport::default()
    };
    for (name, result) in results {
        match result {
            Ok(()) => report.changed.push(name),
            Err(e) => {
                warn!(instance = %name, error = %e, "Power change failed");
                report.failed.push((name, e));
            }
        }
    }
    report.changed.sort();
    report.failed.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(report)
}

const fn needs_change(state: ResourceState, running: bool) -> bool {
    if running {
        matches!(state, ResourceState::Stopped)
    } else {
        matches!(state, ResourceState::Available | ResourceState::Pending)
    }
}

/// Reconcile only the start/stop schedule.
pub async fn update_schedule(ctx: &PhaseContext<'_>) -> Result<ReconcileReport, KshapeError> {
    let select = |spec: &ResourceSpec| spec.kind == ResourceKind::SchedulePolicy;
    ctx.reconciler()
        .reconcile(
            &ctx.desired,
            &[ResourceKind::SchedulePolicy],
            &select,
            &ctx.approval,
        )
        .await
        .into_result(Phase::Infrastructure)
}
