//! WaitReady phase: poll until every cluster instance and the load balancer
//! report available. Stopped instances are started first.

use std::time::Instant;

use tracing::{info, warn};

use super::{Phase, PhaseContext};
use crate::error::{ErrorContext, KshapeError};
use crate::model::{ObservedResource, ResourceKind, ResourceRef, ResourceState};
use crate::reader::{self, RemoteSnapshot};

const WATCHED: &[ResourceKind] = &[ResourceKind::Instance, ResourceKind::LoadBalancer];

pub async fn execute(ctx: &PhaseContext<'_>) -> Result<(), KshapeError> {
    let expected: Vec<ResourceRef> = ctx
        .owned(Phase::Infrastructure)
        .filter(|s| WATCHED.contains(&s.kind))
        .map(|s| s.reference())
        .collect();
    let timeout = ctx.cfg.wait_ready_timeout();
    let start = Instant::now();

    let started = start_stopped(ctx, &expected).await?;
    if started > 0 {
        info!(cluster = %ctx.cluster(), instances = started, "Started stopped instances");
    }

    loop {
        let pending = match reader::read(ctx.provider, ctx.cluster(), WATCHED).await {
            Ok(snapshot) => not_ready(&expected, &snapshot),
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Readiness poll failed, retrying");
                expected.clone()
            }
            Err(e) => return Err(e),
        };

        if pending.is_empty() {
            info!(
                cluster = %ctx.cluster(),
                resources = expected.len(),
                elapsed_secs = start.elapsed().as_secs(),
                "All resources available"
            );
            return Ok(());
        }

        if start.elapsed() >= timeout {
            let names: Vec<String> = pending.iter().map(ToString::to_string).collect();
            return Err(KshapeError::Timeout {
                context: ErrorContext::resource(pending[0].clone()),
                message: format!(
                    "not available after {}s: {}",
                    timeout.as_secs(),
                    names.join(", ")
                ),
            });
        }

        info!(
            cluster = %ctx.cluster(),
            pending = pending.len(),
            "Waiting for resources to become available"
        );
        tokio::time::sleep(ctx.poll_interval).await;
    }
}

/// Stopped instances never become available on their own.
async fn start_stopped(ctx: &PhaseContext<'_>, expected: &[ResourceRef]) -> Result<usize, KshapeError> {
    let snapshot = reader::read(ctx.provider, ctx.cluster(), &[ResourceKind::Instance]).await?;
    let stopped: Vec<&ObservedResource> = expected
        .iter()
        .filter_map(|r| snapshot.find(r.kind, &r.name))
        .filter(|o| o.state == ResourceState::Stopped)
        .collect();
    for instance in &stopped {
        info!(instance = %instance.name(), id = %instance.id, "Starting stopped instance");
        ctx.provider
            .set_power(instance, true)
            .await
            .map_err(|e| KshapeError::provider(e, Some(instance.reference())))?;
    }
    Ok(stopped.len())
}

/// Expected resources that are missing or not yet available.
fn not_ready(expected: &[ResourceRef], snapshot: &RemoteSnapshot) -> Vec<ResourceRef> {
    expected
        .iter()
        .filter(|r| {
            snapshot
                .find(r.kind, &r.name)
                .is_none_or(|o| o.state != ResourceState::Available)
        })
        .cloned()
        .collect()
}
