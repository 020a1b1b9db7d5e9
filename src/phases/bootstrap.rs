//! BootstrapRegister phase: configure the nodes, bootstrap the cluster and
//! wait until every node has registered as Ready.

use std::time::Instant;

use tracing::{info, warn};

use super::PhaseContext;
use crate::bootstrap::ClusterTopology;
use crate::credentials;
use crate::error::KshapeError;
use crate::model::ResourceKind;
use crate::reader;

pub async fn execute(ctx: &PhaseContext<'_>) -> Result<(), KshapeError> {
    let snapshot = reader::read(
        ctx.provider,
        ctx.cluster(),
        &[ResourceKind::Instance, ResourceKind::LoadBalancer],
    )
    .await?;
    let topology = ClusterTopology::discover(ctx.cfg, &ctx.naming, &ctx.desired, &snapshot)?;
    info!(
        cluster = %topology.cluster,
        endpoint = %topology.endpoint,
        control_planes = topology.control_planes.len(),
        workers = topology.workers.len(),
        "Bootstrapping cluster"
    );

    // Secrets from an earlier run must be reused, or the nodes reject the new config.
    let bucket = ctx.naming.state_bucket();
    let restored = credentials::restore(ctx.store, &bucket, &ctx.credentials, false).await?;
    if !restored.is_empty() {
        info!(files = restored.len(), "Reusing credentials from the state bucket");
    }

    ctx.bootstrapper
        .bootstrap(&topology, &ctx.credentials)
        .await?;
    credentials::backup(ctx.store, &bucket, &ctx.credentials).await?;

    wait_for_nodes(ctx, topology.expected_nodes()).await
}

async fn wait_for_nodes(ctx: &PhaseContext<'_>, expected: usize) -> Result<(), KshapeError> {
    let timeout = ctx.cfg.bootstrap_timeout();
    let start = Instant::now();
    let mut ready = 0;

    loop {
        match ctx.bootstrapper.ready_nodes(&ctx.credentials).await {
            Ok(count) => ready = count,
            Err(e) => warn!(error = %e, "Node readiness check failed, retrying"),
        }

        if ready >= expected {
            info!(
                cluster = %ctx.cluster(),
                nodes = ready,
                elapsed_secs = start.elapsed().as_secs(),
                "All nodes registered and Ready"
            );
            return Ok(());
        }

        if start.elapsed() >= timeout {
            return Err(KshapeError::timeout(format!(
                "{ready} of {expected} nodes Ready after {}s",
                timeout.as_secs()
            )));
        }

        info!(ready = ready, expected = expected, "Waiting for nodes to register");
        tokio::time::sleep(ctx.poll_interval).await;
    }
}
