//! Infrastructure phase: the network and firewall rules, placement groups,
//! cluster instances, the API load balancer and the power schedule.

use tracing::info;

use super::{Phase, PhaseContext};
use crate::error::KshapeError;
use crate::reconcile::ReconcileReport;

pub async fn execute(ctx: &PhaseContext<'_>) -> Result<ReconcileReport, KshapeError> {
    let report = ctx.reconcile(Phase::Infrastructure).await?;
    info!(
        cluster = %ctx.cluster(),
        applied = report.applied.len(),
        skipped = report.skipped.len(),
        "Infrastructure phase finished"
    );
    Ok(report)
}
