//! Shared fixtures for unit tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::bootstrap::{ClusterTopology, NodeBootstrapper};
use crate::config::Config;
use crate::credentials::{CredentialsDir, KUBECONFIG, SECRETS};
use crate::error::KshapeError;
use crate::phases::{self, Phase, PhaseContext};

/// Cluster `demo` in account 123456789012 with three control-plane nodes and
/// one two-node worker pool.
pub fn test_config() -> Config {
    config_for("demo")
}

pub fn config_for(cluster: &str) -> Config {
    Config {
        cluster_name: cluster.to_string(),
        project: "123456789012".to_string(),
        ..Config::default()
    }
}

pub fn with_workers(mut cfg: Config, count: i64) -> Config {
    cfg.worker_pools[0].count = count;
    cfg
}

/// Node bootstrapper that records its input and reports nodes Ready after a
/// number of polls.
#[derive(Default)]
pub struct FakeBootstrapper {
    ready_after: Option<usize>,
    polls: AtomicUsize,
    topology: Mutex<Option<ClusterTopology>>,
    secrets: Mutex<Option<String>>,
}

impl FakeBootstrapper {
    pub fn ready_after(polls: usize) -> Self {
        Self {
            ready_after: Some(polls),
            ..Self::default()
        }
    }

    pub fn never_ready() -> Self {
        Self::default()
    }

    pub fn last_topology(&self) -> Option<ClusterTopology> {
        self.topology.lock().unwrap().clone()
    }

    pub fn ready_polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    /// Contents of the secrets file present when bootstrap ran.
    pub fn secrets_seen(&self) -> Option<String> {
        self.secrets.lock().unwrap().clone()
    }
}

#[async_trait]
impl NodeBootstrapper for FakeBootstrapper {
    async fn bootstrap(
        &self,
        topology: &ClusterTopology,
        dir: &CredentialsDir,
    ) -> Result<(), KshapeError> {
        dir.ensure().await?;
        *self.secrets.lock().unwrap() = std::fs::read_to_string(dir.path(SECRETS)).ok();
        std::fs::write(dir.path(KUBECONFIG), "apiVersion: v1")
            .map_err(|e| KshapeError::io(&dir.path(KUBECONFIG), &e))?;
        *self.topology.lock().unwrap() = Some(topology.clone());
        Ok(())
    }

    async fn ready_nodes(&self, _dir: &CredentialsDir) -> Result<usize, KshapeError> {
        let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        let expected = self
            .last_topology()
            .map_or(0, |t| t.expected_nodes());
        Ok(match self.ready_after {
            Some(after) if polls > after => expected,
            _ => 0,
        })
    }
}

/// Run the phases that create cloud resources.
pub async fn provision(ctx: &PhaseContext<'_>) {
    for phase in [Phase::Resources, Phase::Infrastructure, Phase::BastionSetup] {
        phases::execute(ctx, phase).await.unwrap();
    }
}
