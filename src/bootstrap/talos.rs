//! Talos Linux bootstrap through `talosctl`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use super::{ClusterTopology, NodeAddress, NodeBootstrapper};
use crate::command::{CommandOutput, CommandRunner, SystemRunner, args};
use crate::config::Config;
use crate::credentials::{
    CONTROLPLANE_CONFIG, CredentialsDir, KUBECONFIG, SECRETS, TALOSCONFIG, WORKER_CONFIG,
};
use crate::error::KshapeError;
use crate::k8s;
use crate::retry::{RetryConfig, retry_with_backoff};

const TALOSCTL: &str = "talosctl";

pub struct TalosBootstrapper<R: CommandRunner = SystemRunner> {
    runner: R,
    talos_version: String,
    pod_cidr: String,
    service_cidr: String,
    /// Retry budget while nodes reboot into their applied configuration.
    retry: RetryConfig,
}

impl TalosBootstrapper<SystemRunner> {
    pub fn from_config(cfg: &Config) -> Self {
        Self::with_runner(cfg, SystemRunner)
    }
}

impl<R: CommandRunner> TalosBootstrapper<R> {
    pub fn with_runner(cfg: &Config, runner: R) -> Self {
        Self {
            runner,
            talos_version: cfg.os_version.clone(),
            pod_cidr: cfg.pod_cidr.clone(),
            service_cidr: cfg.service_cidr.clone(),
            retry: RetryConfig {
                max_attempts: 30,
                initial_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(30),
                backoff_multiplier: 1.5,
            },
        }
    }

    #[cfg(test)]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn talosctl(&self, argv: Vec<String>) -> Result<CommandOutput, KshapeError> {
        self.runner.run(TALOSCTL, &argv).await
    }

    /// Run and require success.
    async fn checked(&self, what: &str, argv: Vec<String>) -> Result<CommandOutput, KshapeError> {
        let output = self.talosctl(argv).await?;
        if output.success {
            Ok(output)
        } else {
            Err(KshapeError::bootstrap(format!("{what}: {}", output.message())))
        }
    }

    async fn generate(&self, topology: &ClusterTopology, dir: &CredentialsDir) -> Result<(), KshapeError> {
        let secrets = path_arg(&dir.path(SECRETS));
        if dir.has(SECRETS) {
            debug!(secrets = %secrets, "Reusing existing cluster secrets");
        } else {
            self.checked("generating secrets", args([
                "gen", "secrets", "--output-file", secrets.as_str(),
            ]))
            .await?;
            info!(cluster = %topology.cluster, "Generated cluster secrets");
        }

        if dir.has(CONTROLPLANE_CONFIG) && dir.has(WORKER_CONFIG) && dir.has(TALOSCONFIG) {
            return Ok(());
        }
        let patch = json!([
            {"op": "replace", "path": "/cluster/network/podSubnets", "value": [self.pod_cidr]},
            {"op": "replace", "path": "/cluster/network/serviceSubnets", "value": [self.service_cidr]},
        ]);
        self.checked("generating machine configuration", args([
            "gen",
            "config",
            topology.cluster.as_str(),
            topology.endpoint.as_str(),
            "--with-secrets",
            secrets.as_str(),
            "--talos-version",
            contract_version(&self.talos_version).as_str(),
            "--config-patch",
            patch.to_string().as_str(),
            "--output-dir",
            path_arg(dir.root()).as_str(),
            "--force",
        ]))
        .await?;
        info!(cluster = %topology.cluster, "Generated machine configuration");
        Ok(())
    }

    async fn configure_endpoints(&self, topology: &ClusterTopology, talosconfig: &str) -> Result<(), KshapeError> {
        let mut endpoint = args(["--talosconfig", talosconfig, "config", "endpoint"]);
        endpoint.extend(topology.control_planes.iter().map(|n| n.address.clone()));
        self.checked("setting talosconfig endpoints", endpoint).await?;

        let first = topology.first_control_plane()?;
        self.checked(
            "setting talosconfig node",
            args(["--talosconfig", talosconfig, "config", "node", first.address.as_str()]),
        )
        .await?;
        Ok(())
    }

    /// Push machine configuration to a node still in maintenance mode. Nodes
    /// that already answer on the authenticated API are left alone.
    async fn apply_config(&self, node: &NodeAddress, file: &Path, talosconfig: &str) -> Result<(), KshapeError> {
        let version = self
            .talosctl(args([
                "--talosconfig",
                talosconfig,
                "--nodes",
                node.address.as_str(),
                "version",
                "--short",
            ]))
            .await?;
        if version.success {
            debug!(node = %node.name, "Node already configured");
            return Ok(());
        }

        self.checked(
            &format!("applying configuration to {}", node.name),
            args([
                "apply-config",
                "--insecure",
                "--nodes",
                node.address.as_str(),
                "--file",
                path_arg(file).as_str(),
            ]),
        )
        .await?;
        info!(node = %node.name, address = %node.address, "Machine configuration applied");
        Ok(())
    }

    /// Bootstrap etcd on the first control-plane node. Retried while the node
    /// reboots; an already bootstrapped cluster counts as success.
    async fn bootstrap_etcd(&self, first: &NodeAddress, talosconfig: &str) -> Result<(), KshapeError> {
        retry_with_backoff(&self.retry, "talosctl bootstrap", |_| true, || async move {
            let output = self
                .talosctl(args([
                    "--talosconfig",
                    talosconfig,
                    "--nodes",
                    first.address.as_str(),
                    "--endpoints",
                    first.address.as_str(),
                    "bootstrap",
                ]))
                .await?;
            if output.success || output.message().contains("AlreadyExists") {
                Ok(())
            } else {
                Err(KshapeError::bootstrap(format!("bootstrap: {}", output.message())))
            }
        })
        .await?;
        info!(node = %first.name, "Cluster bootstrapped");
        Ok(())
    }

    async fn fetch_kubeconfig(&self, first: &NodeAddress, talosconfig: &str, dir: &CredentialsDir) -> Result<(), KshapeError> {
        let target = path_arg(&dir.path(KUBECONFIG));
        let target = target.as_str();
        retry_with_backoff(&self.retry, "talosctl kubeconfig", |_| true, || async move {
            self.checked(
                "fetching kubeconfig",
                args([
                    "--talosconfig",
                    talosconfig,
                    "--nodes",
                    first.address.as_str(),
                    "--endpoints",
                    first.address.as_str(),
                    "kubeconfig",
                    target,
                    "--force",
                    "--merge=false",
                ]),
            )
            .await
        })
        .await?;
        info!(kubeconfig = %target, "Kubeconfig written");
        Ok(())
    }
}

#[async_trait]
impl<R: CommandRunner> NodeBootstrapper for TalosBootstrapper<R> {
    async fn bootstrap(&self, topology: &ClusterTopology, dir: &CredentialsDir) -> Result<(), KshapeError> {
        dir.ensure().await?;
        self.generate(topology, dir).await?;

        let talosconfig = path_arg(&dir.path(TALOSCONFIG));
        self.configure_endpoints(topology, &talosconfig).await?;

        let controlplane = dir.path(CONTROLPLANE_CONFIG);
        let worker = dir.path(WORKER_CONFIG);
        for node in &topology.control_planes {
            self.apply_config(node, &controlplane, &talosconfig).await?;
        }
        for node in &topology.workers {
            self.apply_config(node, &worker, &talosconfig).await?;
        }

        let first = topology.first_control_plane()?;
        self.bootstrap_etcd(first, &talosconfig).await?;
        self.fetch_kubeconfig(first, &talosconfig, dir).await
    }

    async fn ready_nodes(&self, dir: &CredentialsDir) -> Result<usize, KshapeError> {
        let client = k8s::build_client(&dir.path(KUBECONFIG)).await?;
        k8s::count_ready_nodes(client).await
    }
}

/// `v1.9.5` → `v1.9`, the form `--talos-version` expects.
fn contract_version(version: &str) -> String {
    let mut parts = version.splitn(3, '.');
    match (parts.next(), parts.next()) {
        (Some(major), Some(minor)) => format!("{major}.{minor}"),
        _ => version.to_string(),
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
