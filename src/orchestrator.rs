//! Phase orchestrator: runs phases strictly forward and keeps the marker of
//! the last completed phase, so a failed run resumes where it stopped.

use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::error::KshapeError;
use crate::model::ResourceKind;
use crate::notify::{self, SlackNotifier};
use crate::phases::{self, Phase, PhaseContext};
use crate::reconcile::{ReconcileReport, everything};
use crate::status::{self, ClusterState, PhaseMarker};

/// Which phases a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// From the first incomplete phase to the end.
    Resume,
    /// Every phase, converging drift left behind by earlier runs.
    All,
    /// One phase, regardless of the marker.
    Single(Phase),
}

#[derive(Debug)]
pub struct RunOutcome {
    pub ran: Vec<Phase>,
    pub state: ClusterState,
    /// Reports of the phases that reconcile resources, in run order.
    pub reports: Vec<(Phase, ReconcileReport)>,
}

impl RunOutcome {
    /// False when any phase left a resource out of sync, declined deletes
    /// included.
    pub fn is_converged(&self) -> bool {
        self.reports.iter().all(|(_, r)| r.is_converged())
    }
}

pub struct Orchestrator<'a> {
    ctx: PhaseContext<'a>,
    notifier: Option<SlackNotifier>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(ctx: PhaseContext<'a>) -> Self {
        let notifier = ctx.cfg.slack_webhook_url.as_ref().map(SlackNotifier::new);
        Self { ctx, notifier }
    }

    pub const fn context(&self) -> &PhaseContext<'a> {
        &self.ctx
    }

    pub async fn marker(&self) -> Result<PhaseMarker, KshapeError> {
        status::read_marker(self.ctx.provider, &self.ctx.naming).await
    }

    fn phases_for(mode: RunMode, marker: &PhaseMarker) -> Vec<Phase> {
        match mode {
            RunMode::Resume => marker.next().map(Phase::from_here).unwrap_or_default(),
            RunMode::All => Phase::ALL.to_vec(),
            RunMode::Single(phase) => vec![phase],
        }
    }

    pub async fn run(&self, mode: RunMode) -> Result<RunOutcome, KshapeError> {
        let mut marker = self.marker().await?;
        let phases = Self::phases_for(mode, &marker);
        if phases.is_empty() {
            info!(cluster = %self.ctx.cluster(), "Cluster is already Ready, nothing to do");
            return Ok(RunOutcome {
                ran: Vec::new(),
                state: marker.state(),
                reports: Vec::new(),
            });
        }

        info!(
            cluster = %self.ctx.cluster(),
            mode = ?mode,
            from = %phases[0],
            completed = ?marker.completed,
            "Starting provisioning run"
        );
        let start = Instant::now();
        let mut ran = Vec::new();
        let mut reports = Vec::new();

        for phase in phases {
            info!(
                phase = %phase,
                number = phase.number(),
                "Phase {}/{} started",
                phase.number(),
                Phase::ALL.len()
            );
            let phase_start = Instant::now();

            let report = match phases::execute(&self.ctx, phase).await {
                Ok(report) => report,
                Err(e) => {
                    self.fail(phase, &e, start).await;
                    return Err(e);
                }
            };

            let converged = report.as_ref().is_none_or(ReconcileReport::is_converged);
            if !converged {
                warn!(
                    phase = %phase,
                    out_of_sync = report.as_ref().map_or(0, |r| r.out_of_sync().len()),
                    "Phase left resources out of sync, marker unchanged"
                );
            } else if marker.advances_with(phase) {
                status::record_completed(self.ctx.provider, &self.ctx.naming, phase).await?;
                marker.completed = Some(phase);
                marker.failure = None;
            } else {
                debug!(
                    phase = %phase,
                    completed = ?marker.completed,
                    "Phase marker unchanged"
                );
            }
            info!(
                phase = %phase,
                elapsed_secs = phase_start.elapsed().as_secs(),
                "Phase completed"
            );
            ran.push(phase);
            if let Some(report) = report {
                reports.push((phase, report));
            }
        }

        let state = marker.state();
        info!(cluster = %self.ctx.cluster(), state = %state, "Provisioning run finished");
        if let Some(notifier) = &self.notifier {
            let message = notify::build_completed_message(self.ctx.cfg, &ran, start.elapsed());
            notifier.send(self.ctx.cluster(), &message).await;
        }
        Ok(RunOutcome {
            ran,
            state,
            reports,
        })
    }

    async fn fail(&self, phase: Phase, err: &KshapeError, start: Instant) {
        error!(
            phase = %phase,
            retryable = err.is_retryable(),
            error = %err,
            "Phase failed"
        );
        let reason = err.to_string();
        if let Err(e) =
            status::record_failed(self.ctx.provider, &self.ctx.naming, phase, &reason).await
        {
            warn!(error = %e, "Failed to record phase failure");
        }
        if let Some(notifier) = &self.notifier {
            let message = notify::build_failed_message(
                self.ctx.cfg,
                phase,
                &reason,
                err.is_retryable(),
                start.elapsed(),
            );
            notifier.send(self.ctx.cluster(), &message).await;
        }
    }

    /// Delete every resource labeled for the cluster, in reverse dependency
    /// order.
    pub async fn destroy(&self) -> Result<ReconcileReport, KshapeError> {
        // Reset first so a partial destroy resumes `create` from the start.
        status::clear(self.ctx.provider, &self.ctx.naming).await?;

        let report = self
            .ctx
            .reconciler()
            .reconcile(&[], &ResourceKind::ORDERED, &everything, &self.ctx.approval)
            .await;
        info!(
            cluster = %self.ctx.cluster(),
            deleted = report.applied.len(),
            remaining = report.out_of_sync().len(),
            "Destroy finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::provider::memory::{FaultKind, MemoryProvider, Op};
    use crate::reconcile::{Approval, ReconcileOptions};
    use crate::testing::{FakeBootstrapper, config_for, test_config, with_workers};

    fn orchestrator<'a>(
        cfg: &'a crate::config::Config,
        provider: &'a MemoryProvider,
        bootstrapper: &'a FakeBootstrapper,
        dir: &std::path::Path,
    ) -> Orchestrator<'a> {
        let ctx = PhaseContext::new(cfg, provider, provider, bootstrapper, dir)
            .unwrap()
            .with_options(ReconcileOptions::fast(4))
            .with_poll_interval(Duration::from_millis(1));
        Orchestrator::new(ctx)
    }

    #[tokio::test]
    async fn test_create_runs_every_phase_to_ready() {
        let cfg = test_config();
        let provider = MemoryProvider::new();
        let bootstrapper = FakeBootstrapper::ready_after(0);
        let tmp = tempfile::tempdir().unwrap();
        let orch = orchestrator(&cfg, &provider, &bootstrapper, tmp.path());

        let outcome = orch.run(RunMode::Resume).await.unwrap();
        assert_eq!(outcome.ran, Phase::ALL.to_vec());
        assert_eq!(outcome.state, ClusterState::Ready);

        provider.clear_log();
        let again = orch.run(RunMode::Resume).await.unwrap();
        assert!(again.ran.is_empty());
        assert!(provider.log().is_empty());
    }

    #[tokio::test]
    async fn test_failed_infrastructure_resumes_with_missing_instance_only() {
        let cfg = test_config();
        let provider = MemoryProvider::new();
        let bootstrapper = FakeBootstrapper::ready_after(0);
        let tmp = tempfile::tempdir().unwrap();
        let orch = orchestrator(&cfg, &provider, &bootstrapper, tmp.path());

        provider.fail(Op::Create, "demo-cp-2", FaultKind::Fatal, 1);
        let err = orch.run(RunMode::Resume).await.unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Infrastructure));
        assert_eq!(
            provider.names("demo", ResourceKind::Instance),
            vec![
                "demo-cp-0",
                "demo-cp-1",
                "demo-worker-default-0",
                "demo-worker-default-1"
            ]
        );
        let marker = orch.marker().await.unwrap();
        assert_eq!(marker.completed, Some(Phase::Resources));
        assert!(matches!(
            marker.state(),
            ClusterState::Failed {
                phase: Phase::Infrastructure,
                ..
            }
        ));

        provider.clear_log();
        let outcome = orch.run(RunMode::Resume).await.unwrap();
        assert_eq!(outcome.ran[0], Phase::Infrastructure);
        assert!(outcome.ran.contains(&Phase::WaitReady));
        assert_eq!(outcome.state, ClusterState::Ready);
        assert_eq!(
            provider.logged("create", ResourceKind::Instance),
            vec!["demo-cp-2", "demo-bastion"]
        );
        assert!(provider.logged("delete", ResourceKind::Instance).is_empty());
    }

    #[tokio::test]
    async fn test_single_phase_only_advances_by_one() {
        let cfg = test_config();
        let provider = MemoryProvider::new();
        let bootstrapper = FakeBootstrapper::ready_after(0);
        let tmp = tempfile::tempdir().unwrap();
        let orch = orchestrator(&cfg, &provider, &bootstrapper, tmp.path());

        orch.run(RunMode::Single(Phase::Resources)).await.unwrap();
        assert_eq!(
            orch.marker().await.unwrap().completed,
            Some(Phase::Resources)
        );

        // Skipping ahead runs the phase but leaves the marker alone.
        orch.run(RunMode::Single(Phase::BastionSetup)).await.unwrap();
        assert_eq!(
            orch.marker().await.unwrap().completed,
            Some(Phase::Resources)
        );
        assert_eq!(
            provider.names("demo", ResourceKind::Instance),
            vec!["demo-bastion"]
        );
    }

    #[tokio::test]
    async fn test_destroy_removes_only_own_cluster() {
        let cfg_a = config_for("a");
        let cfg_b = config_for("b");
        let provider = MemoryProvider::new();
        let bootstrapper = FakeBootstrapper::ready_after(0);
        let tmp = tempfile::tempdir().unwrap();
        let a = orchestrator(&cfg_a, &provider, &bootstrapper, tmp.path());
        let b = orchestrator(&cfg_b, &provider, &bootstrapper, tmp.path());
        a.run(RunMode::Resume).await.unwrap();
        b.run(RunMode::Resume).await.unwrap();
        let b_before = provider
            .resources()
            .iter()
            .filter(|r| r.belongs_to("b"))
            .count();

        let report = a.destroy().await.unwrap();
        assert!(report.is_converged());
        assert!(provider.resources().iter().all(|r| r.belongs_to("b")));
        assert_eq!(provider.resources().len(), b_before);
        assert_eq!(a.marker().await.unwrap().state(), ClusterState::NotStarted);
    }

    #[tokio::test]
    async fn test_destroy_denied_skips_every_delete() {
        let cfg = test_config();
        let provider = MemoryProvider::new();
        let bootstrapper = FakeBootstrapper::ready_after(0);
        let tmp = tempfile::tempdir().unwrap();
        orchestrator(&cfg, &provider, &bootstrapper, tmp.path())
            .run(RunMode::Resume)
            .await
            .unwrap();
        let before = provider.resources().len();

        let ctx = PhaseContext::new(&cfg, &provider, &provider, &bootstrapper, tmp.path())
            .unwrap()
            .with_options(ReconcileOptions::fast(4))
            .with_approval(Approval::Denied);
        let report = Orchestrator::new(ctx).destroy().await.unwrap();
        assert_eq!(report.skipped.len(), before);
        assert_eq!(provider.resources().len(), before);
    }

    #[tokio::test]
    async fn test_destroy_works_when_config_no_longer_validates() {
        let provider = MemoryProvider::new();
        let bootstrapper = FakeBootstrapper::ready_after(0);
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config();
        orchestrator(&cfg, &provider, &bootstrapper, tmp.path())
            .run(RunMode::All)
            .await
            .unwrap();

        let mut broken = test_config();
        broken.zone = "eu-west-1a".to_string();
        let ctx = PhaseContext::without_desired(
            &broken,
            &provider,
            &provider,
            &bootstrapper,
            tmp.path(),
        )
        .unwrap()
        .with_options(ReconcileOptions::fast(4));
        let report = Orchestrator::new(ctx).destroy().await.unwrap();
        assert!(report.is_converged(), "{report:?}");
        assert!(provider.resources().iter().all(|r| !r.belongs_to("demo")));
    }


    #[tokio::test]
    async fn test_declined_scale_down_is_not_converged() {
        let provider = MemoryProvider::new();
        let bootstrapper = FakeBootstrapper::ready_after(0);
        let tmp = tempfile::tempdir().unwrap();
        let five = with_workers(test_config(), 5);
        orchestrator(&five, &provider, &bootstrapper, tmp.path())
            .run(RunMode::Resume)
            .await
            .unwrap();
        provider.clear_log();

        let two = with_workers(test_config(), 2);
        let ctx = PhaseContext::new(&two, &provider, &provider, &bootstrapper, tmp.path())
            .unwrap()
            .with_options(ReconcileOptions::fast(4))
            .with_approval(Approval::Denied);
        let orch = Orchestrator::new(ctx);
        let outcome = orch
            .run(RunMode::Single(Phase::Infrastructure))
            .await
            .unwrap();

        assert!(!outcome.is_converged());
        let (phase, report) = &outcome.reports[0];
        assert_eq!(*phase, Phase::Infrastructure);
        assert_eq!(report.skipped.len(), 3);
        assert!(provider.logged("delete", ResourceKind::Instance).is_empty());
        let workers = provider
            .names("demo", ResourceKind::Instance)
            .into_iter()
            .filter(|n| n.starts_with("demo-worker-"))
            .count();
        assert_eq!(workers, 5);
    }

    #[tokio::test]
    async fn test_converged_run_reports_each_reconciling_phase() {
        let cfg = test_config();
        let provider = MemoryProvider::new();
        let bootstrapper = FakeBootstrapper::ready_after(0);
        let tmp = tempfile::tempdir().unwrap();
        let outcome = orchestrator(&cfg, &provider, &bootstrapper, tmp.path())
            .run(RunMode::Resume)
            .await
            .unwrap();

        assert!(outcome.is_converged());
        let phases: Vec<Phase> = outcome.reports.iter().map(|(p, _)| *p).collect();
        assert_eq!(
            phases,
            vec![Phase::Resources, Phase::Infrastructure, Phase::BastionSetup]
        );
    }

}
