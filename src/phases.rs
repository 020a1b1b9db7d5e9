//! Provisioning phases.
//!
//! Each phase owns a fixed subset of the desired resources and is idempotent:
//! running it again against a converged cluster does nothing.

pub mod bastion;
pub mod bootstrap;
pub mod infrastructure;
pub mod resources;
pub mod wait_ready;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::bootstrap::NodeBootstrapper;
use crate::compiler::{Naming, compile};
use crate::config::Config;
use crate::credentials::CredentialsDir;
use crate::error::KshapeError;
use crate::model::{ROLE_BASTION, ResourceKind, ResourceSpec};
use crate::provider::{CloudProvider, ObjectStore};
use crate::reconcile::{Approval, ReconcileOptions, ReconcileReport, Reconciler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Resources,
    Infrastructure,
    WaitReady,
    BastionSetup,
    BootstrapRegister,
}

impl Phase {
    pub const ALL: [Self; 5] = [
        Self::Resources,
        Self::Infrastructure,
        Self::WaitReady,
        Self::BastionSetup,
        Self::BootstrapRegister,
    ];

    /// 1-based position, as used by the `phaseN` commands.
    pub const fn number(self) -> u8 {
        match self {
            Self::Resources => 1,
            Self::Infrastructure => 2,
            Self::WaitReady => 3,
            Self::BastionSetup => 4,
            Self::BootstrapRegister => 5,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.number() == n)
    }

    pub fn next(self) -> Option<Self> {
        Self::from_number(self.number() + 1)
    }

    /// This phase and every later one.
    pub fn from_here(self) -> Vec<Self> {
        Self::ALL.into_iter().filter(|p| *p >= self).collect()
    }

    /// Kinds this phase reconciles.
    pub const fn kinds(self) -> &'static [ResourceKind] {
        use ResourceKind as K;
        match self {
            Self::Resources => &[K::ServiceAccount, K::Bucket],
            Self::Infrastructure => &[
                K::Network,
                K::Subnet,
                K::Nat,
                K::Router,
                K::FirewallRule,
                K::InstanceGroup,
                K::Instance,
                K::StaticAddress,
                K::LoadBalancer,
                K::SchedulePolicy,
            ],
            Self::BastionSetup => &[K::Instance, K::StaticAddress],
            Self::WaitReady | Self::BootstrapRegister => &[],
        }
    }

    /// Whether `spec` is reconciled by this phase. Every resource the
    /// compiler emits is owned by exactly one phase.
    pub fn owns(self, spec: &ResourceSpec) -> bool {
        let bastion = spec.role() == Some(ROLE_BASTION);
        let kind_matches = self.kinds().contains(&spec.kind);
        match self {
            Self::Resources => kind_matches,
            Self::Infrastructure => kind_matches && !bastion,
            Self::BastionSetup => kind_matches && bastion,
            Self::WaitReady | Self::BootstrapRegister => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resources => write!(f, "Resources"),
            Self::Infrastructure => write!(f, "Infrastructure"),
            Self::WaitReady => write!(f, "WaitReady"),
            Self::BastionSetup => write!(f, "BastionSetup"),
            Self::BootstrapRegister => write!(f, "BootstrapRegister"),
        }
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown phase: {s}"))
    }
}

/// Everything a phase needs, built once per invocation.
pub struct PhaseContext<'a> {
    pub cfg: &'a Config,
    pub naming: Naming,
    pub desired: Vec<ResourceSpec>,
    pub provider: &'a dyn CloudProvider,
    pub store: &'a dyn ObjectStore,
    pub bootstrapper: &'a dyn NodeBootstrapper,
    pub credentials: CredentialsDir,
    pub options: ReconcileOptions,
    pub approval: Approval<'a>,
    /// Interval between readiness polls.
    pub poll_interval: Duration,
}

impl<'a> PhaseContext<'a> {
    pub fn new(
        cfg: &'a Config,
        provider: &'a dyn CloudProvider,
        store: &'a dyn ObjectStore,
        bootstrapper: &'a dyn NodeBootstrapper,
        output_dir: &Path,
    ) -> Result<Self, KshapeError> {
        let desired = compile(cfg)?;
        Ok(Self::build(cfg, desired, provider, store, bootstrapper, output_dir))
    }

    /// Context for commands that only read or tear down what is labeled for
    /// the cluster. Nothing is compiled; only the names must resolve.
    pub fn without_desired(
        cfg: &'a Config,
        provider: &'a dyn CloudProvider,
        store: &'a dyn ObjectStore,
        bootstrapper: &'a dyn NodeBootstrapper,
        output_dir: &Path,
    ) -> Result<Self, KshapeError> {
        for (field, value) in [("cluster_name", &cfg.cluster_name), ("project", &cfg.project)] {
            if value.trim().is_empty() {
                return Err(KshapeError::config(format!("{field} is required")));
            }
        }
        Ok(Self::build(cfg, Vec::new(), provider, store, bootstrapper, output_dir))
    }

    fn build(
        cfg: &'a Config,
        desired: Vec<ResourceSpec>,
        provider: &'a dyn CloudProvider,
        store: &'a dyn ObjectStore,
        bootstrapper: &'a dyn NodeBootstrapper,
        output_dir: &Path,
    ) -> Self {
        Self {
            cfg,
            naming: Naming::from_config(cfg),
            desired,
            provider,
            store,
            bootstrapper,
            credentials: CredentialsDir::new(output_dir, &cfg.cluster_name),
            options: ReconcileOptions::from_config(cfg),
            approval: Approval::Granted,
            poll_interval: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub fn with_approval(mut self, approval: Approval<'a>) -> Self {
        self.approval = approval;
        self
    }

    #[cfg(test)]
    #[must_use]
    pub fn with_options(mut self, options: ReconcileOptions) -> Self {
        self.options = options;
        self
    }

    #[cfg(test)]
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn cluster(&self) -> &str {
        self.naming.cluster()
    }

    pub fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(self.provider, self.cluster(), self.options.clone())
    }

    /// Desired resources owned by `phase`.
    pub fn owned(&self, phase: Phase) -> impl Iterator<Item = &ResourceSpec> {
        self.desired.iter().filter(move |s| phase.owns(s))
    }

    /// Reconcile the resources owned by `phase`.
    pub async fn reconcile(&self, phase: Phase) -> Result<ReconcileReport, KshapeError> {
        let select = move |spec: &ResourceSpec| phase.owns(spec);
        self.reconciler()
            .reconcile(&self.desired, phase.kinds(), &select, &self.approval)
            .await
            .into_result(phase)
    }
}

/// Run one phase. Phases that reconcile resources return their report.
pub async fn execute(
    ctx: &PhaseContext<'_>,
    phase: Phase,
) -> Result<Option<ReconcileReport>, KshapeError> {
    match phase {
        Phase::Resources => resources::execute(ctx).await.map(Some),
        Phase::Infrastructure => infrastructure::execute(ctx).await.map(Some),
        Phase::WaitReady => wait_ready::execute(ctx).await.map(|()| None),
        Phase::BastionSetup => bastion::execute(ctx).await.map(Some),
        Phase::BootstrapRegister => bootstrap::execute(ctx).await.map(|()| None),
    }
    .map_err(|e| e.in_phase(phase))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::MemoryProvider;
    use crate::testing::{FakeBootstrapper, test_config};

    #[test]
    fn test_phase_numbers_round_trip() {
        for phase in Phase::ALL {
            assert_eq!(Phase::from_number(phase.number()), Some(phase));
        }
        assert_eq!(Phase::from_number(0), None);
        assert_eq!(Phase::from_number(6), None);
        assert_eq!(Phase::BootstrapRegister.next(), None);
        assert_eq!(Phase::Resources.next(), Some(Phase::Infrastructure));
    }

    #[test]
    fn test_phase_from_str() {
        assert_eq!("waitready".parse::<Phase>(), Ok(Phase::WaitReady));
        assert!("deploy".parse::<Phase>().is_err());
    }

    #[test]
    fn test_every_resource_has_exactly_one_owner() {
        for spec in compile(&test_config()).unwrap() {
            let owners: Vec<Phase> = Phase::ALL.into_iter().filter(|p| p.owns(&spec)).collect();
            assert_eq!(owners.len(), 1, "{} owned by {owners:?}", spec.reference());
        }
    }

    #[test]
    fn test_bastion_instance_belongs_to_bastion_setup() {
        let specs = compile(&test_config()).unwrap();
        let bastion = specs
            .iter()
            .find(|s| s.kind == ResourceKind::Instance && s.name == "demo-bastion")
            .unwrap();
        assert!(Phase::BastionSetup.owns(bastion));
        assert!(!Phase::Infrastructure.owns(bastion));
    }

    #[test]
    fn test_network_is_provisioned_with_compute() {
        for spec in compile(&test_config()).unwrap() {
            let phase = Phase::ALL.into_iter().find(|p| p.owns(&spec)).unwrap();
            match spec.kind {
                ResourceKind::ServiceAccount | ResourceKind::Bucket => {
                    assert_eq!(phase, Phase::Resources, "{}", spec.reference());
                }
                ResourceKind::Network
                | ResourceKind::Subnet
                | ResourceKind::Nat
                | ResourceKind::Router
                | ResourceKind::FirewallRule => {
                    assert_eq!(phase, Phase::Infrastructure, "{}", spec.reference());
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_context_without_desired_skips_validation() {
        let provider = MemoryProvider::new();
        let bootstrapper = FakeBootstrapper::ready_after(0);
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = test_config();
        cfg.zone = "eu-west-1a".to_string();
        assert!(PhaseContext::new(&cfg, &provider, &provider, &bootstrapper, tmp.path()).is_err());

        let ctx =
            PhaseContext::without_desired(&cfg, &provider, &provider, &bootstrapper, tmp.path())
                .unwrap();
        assert!(ctx.desired.is_empty());
        assert_eq!(ctx.cluster(), "demo");
    }

    #[test]
    fn test_context_without_desired_still_needs_names() {
        let provider = MemoryProvider::new();
        let bootstrapper = FakeBootstrapper::ready_after(0);
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Config::default();
        let result =
            PhaseContext::without_desired(&cfg, &provider, &provider, &bootstrapper, tmp.path());
        assert!(matches!(result, Err(KshapeError::Configuration(_))));
    }

    #[test]
    fn test_from_here() {
        assert_eq!(
            Phase::WaitReady.from_here(),
            vec![
                Phase::WaitReady,
                Phase::BastionSetup,
                Phase::BootstrapRegister
            ]
        );
    }
}
