//! Bastion phase: the jump host and its static address.

use tracing::info;

use super::{Phase, PhaseContext};
use crate::error::KshapeError;
use crate::model::ResourceKind;
use crate::reader;
use crate::reconcile::ReconcileReport;

pub async fn execute(ctx: &PhaseContext<'_>) -> Result<ReconcileReport, KshapeError> {
    let report = ctx.reconcile(Phase::BastionSetup).await?;

    let snapshot = reader::read(ctx.provider, ctx.cluster(), &[ResourceKind::StaticAddress]).await?;
    let address = snapshot
        .find(ResourceKind::StaticAddress, &ctx.naming.bastion())
        .and_then(|a| a.public_ip.clone());
    info!(
        cluster = %ctx.cluster(),
        address = address.as_deref().unwrap_or("unknown"),
        "Bastion ready"
    );
    Ok(report)
}
