//! Resources phase: identities and the state bucket.
//!
//! Before touching anything, checks that the credentials point at the
//! configured account and that every OS image the cluster needs exists.

use std::collections::BTreeSet;

use tracing::{debug, info};

use super::{Phase, PhaseContext};
use crate::error::KshapeError;
use crate::model::{ImageRef, ResourceConfig};
use crate::reconcile::ReconcileReport;

pub async fn execute(ctx: &PhaseContext<'_>) -> Result<ReconcileReport, KshapeError> {
    verify_account(ctx).await?;
    resolve_images(ctx).await?;

    let report = ctx.reconcile(Phase::Resources).await?;
    info!(
        cluster = %ctx.cluster(),
        applied = report.applied.len(),
        skipped = report.skipped.len(),
        "Resources phase finished"
    );
    Ok(report)
}

async fn verify_account(ctx: &PhaseContext<'_>) -> Result<(), KshapeError> {
    let account = ctx
        .provider
        .account_id()
        .await
        .map_err(|e| KshapeError::provider(e, None))?;
    if account != ctx.cfg.project {
        return Err(KshapeError::config(format!(
            "credentials belong to account {account}, but project is {}",
            ctx.cfg.project
        )));
    }
    Ok(())
}

/// Every distinct image referenced by a desired instance.
pub fn required_images(ctx: &PhaseContext<'_>) -> BTreeSet<ImageRef> {
    ctx.desired
        .iter()
        .filter_map(|s| match &s.config {
            ResourceConfig::Instance(c) => Some(c.image.clone()),
            _ => None,
        })
        .collect()
}

async fn resolve_images(ctx: &PhaseContext<'_>) -> Result<(), KshapeError> {
    for image in required_images(ctx) {
        let resolved = ctx
            .provider
            .resolve_image(&image)
            .await
            .map_err(|e| KshapeError::provider(e, None))?;
        match resolved {
            Some(id) => debug!(owner = %image.owner, name = %image.name_pattern, image_id = %id, "Image resolved"),
            None => {
                return Err(KshapeError::config(format!(
                    "no image owned by {} matches {:?}; check os_version and extensions",
                    image.owner, image.name_pattern
                )));
            }
        }
    }
    Ok(())
}
