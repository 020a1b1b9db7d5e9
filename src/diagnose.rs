//! Read-only health checks for `diagnose`.

use std::fmt;

use tracing::debug;

use crate::model::ResourceKind;
use crate::orphans;
use crate::phases::PhaseContext;
use crate::reader;
use crate::reconcile::{ActionKind, everything};
use crate::status::{self, ClusterState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Warn => write!(f, "WARN"),
            Self::Fail => write!(f, "FAIL"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Check {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
}

impl Check {
    fn new(name: &'static str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name,
            status,
            detail: detail.into(),
        }
    }
}

/// Run every check. Failures are reported as checks, never as errors.
pub async fn run(ctx: &PhaseContext<'_>) -> Vec<Check> {
    let mut checks = Vec::new();

    checks.push(match ctx.provider.account_id().await {
        Ok(account) if account == ctx.cfg.project => {
            Check::new("identity", CheckStatus::Pass, format!("account {account}"))
        }
        Ok(account) => Check::new(
            "identity",
            CheckStatus::Fail,
            format!(
                "credentials belong to {account}, configuration targets {}",
                ctx.cfg.project
            ),
        ),
        Err(e) => Check::new("identity", CheckStatus::Fail, e.to_string()),
    });

    checks.push(Check::new(
        "config",
        CheckStatus::Pass,
        format!("{} resources compiled", ctx.desired.len()),
    ));

    match reader::read(ctx.provider, ctx.cluster(), &[]).await {
        Ok(snapshot) => {
            let instances = snapshot.of_kind(ResourceKind::Instance).len();
            checks.push(Check::new(
                "snapshot",
                CheckStatus::Pass,
                format!("{} resources, {instances} instances", snapshot.len()),
            ));
        }
        Err(e) => {
            // Nothing below can succeed without a snapshot.
            checks.push(Check::new("snapshot", CheckStatus::Fail, e.to_string()));
            return checks;
        }
    }

    let plan = ctx
        .reconciler()
        .plan(&ctx.desired, &ResourceKind::ORDERED, &everything)
        .await;
    let planning_errors: Vec<String> = plan
        .kinds
        .iter()
        .filter_map(|k| k.error.as_ref().map(ToString::to_string))
        .collect();
    checks.push(if !planning_errors.is_empty() {
        Check::new("drift", CheckStatus::Fail, planning_errors.join("; "))
    } else if plan.is_empty() {
        Check::new("drift", CheckStatus::Pass, "in sync")
    } else {
        Check::new(
            "drift",
            CheckStatus::Warn,
            format!(
                "{} to create, {} to update, {} to replace, {} to delete",
                plan.count(ActionKind::Create),
                plan.count(ActionKind::Update),
                plan.count(ActionKind::Replace),
                plan.count(ActionKind::Delete)
            ),
        )
    });

    checks.push(
        match orphans::detect(ctx.provider, ctx.cluster(), Some(&ctx.desired)).await {
            Ok(group) if group.is_empty() => Check::new("orphans", CheckStatus::Pass, "none"),
            Ok(group) => Check::new(
                "orphans",
                CheckStatus::Warn,
                group
                    .resources
                    .iter()
                    .map(|r| r.reference().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            Err(e) => Check::new("orphans", CheckStatus::Fail, e.to_string()),
        },
    );

    checks.push(match status::read_marker(ctx.provider, &ctx.naming).await {
        Ok(marker) => {
            let state = marker.state();
            let status = match state {
                ClusterState::Ready => CheckStatus::Pass,
                ClusterState::Failed { .. } => CheckStatus::Fail,
                ClusterState::NotStarted | ClusterState::InProgress { .. } => CheckStatus::Warn,
            };
            Check::new("phase", status, state.to_string())
        }
        Err(e) => Check::new("phase", CheckStatus::Fail, e.to_string()),
    });

    debug!(checks = checks.len(), "Diagnostics finished");
    checks
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::orchestrator::{Orchestrator, RunMode};
    use crate::provider::memory::MemoryProvider;
    use crate::reconcile::ReconcileOptions;
    use crate::testing::{FakeBootstrapper, test_config};

    fn status_of(checks: &[Check], name: &str) -> CheckStatus {
        checks.iter().find(|c| c.name == name).unwrap().status
    }

    #[tokio::test]
    async fn test_fresh_cluster_reports_pending_creates() {
        let cfg = test_config();
        let provider = MemoryProvider::new();
        let bootstrapper = FakeBootstrapper::ready_after(0);
        let tmp = tempfile::tempdir().unwrap();
        let ctx = PhaseContext::new(&cfg, &provider, &provider, &bootstrapper, tmp.path())
            .unwrap()
            .with_options(ReconcileOptions::fast(4));

        let checks = run(&ctx).await;
        assert_eq!(status_of(&checks, "identity"), CheckStatus::Pass);
        assert_eq!(status_of(&checks, "drift"), CheckStatus::Warn);
        assert_eq!(status_of(&checks, "orphans"), CheckStatus::Pass);
        assert_eq!(status_of(&checks, "phase"), CheckStatus::Warn);
        assert!(provider.log().is_empty());
    }

    #[tokio::test]
    async fn test_ready_cluster_passes_everything() {
        let cfg = test_config();
        let provider = MemoryProvider::new();
        let bootstrapper = FakeBootstrapper::ready_after(0);
        let tmp = tempfile::tempdir().unwrap();
        let ctx = PhaseContext::new(&cfg, &provider, &provider, &bootstrapper, tmp.path())
            .unwrap()
            .with_options(ReconcileOptions::fast(4))
            .with_poll_interval(Duration::from_millis(1));
        let orch = Orchestrator::new(ctx);
        orch.run(RunMode::Resume).await.unwrap();

        let checks = run(orch.context()).await;
        assert!(
            checks.iter().all(|c| c.status == CheckStatus::Pass),
            "{checks:?}"
        );
    }

    #[tokio::test]
    async fn test_wrong_account_fails_identity() {
        let mut cfg = test_config();
        cfg.project = "999999999999".to_string();
        let provider = MemoryProvider::new();
        let bootstrapper = FakeBootstrapper::ready_after(0);
        let tmp = tempfile::tempdir().unwrap();
        let ctx = PhaseContext::new(&cfg, &provider, &provider, &bootstrapper, tmp.path())
            .unwrap()
            .with_options(ReconcileOptions::fast(4));

        let checks = run(&ctx).await;
        assert_eq!(status_of(&checks, "identity"), CheckStatus::Fail);
    }
}
