//! Node bootstrap: bring provisioned instances into a working cluster.
//!
//! The bootstrap protocol is opaque to the rest of kshape. Phases only see
//! [`NodeBootstrapper`]; the production implementation drives `talosctl`.

pub mod talos;

pub use talos::TalosBootstrapper;

use async_trait::async_trait;

use crate::compiler::Naming;
use crate::config::Config;
use crate::credentials::CredentialsDir;
use crate::error::{ErrorContext, KshapeError};
use crate::model::{ROLE_CONTROL_PLANE, ResourceKind, ResourceSpec};
use crate::phases::Phase;
use crate::reader::RemoteSnapshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddress {
    pub name: String,
    pub address: String,
}

/// Addresses of every node plus the API endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTopology {
    pub cluster: String,
    /// `https://<host>:<port>` of the Kubernetes API.
    pub endpoint: String,
    pub control_planes: Vec<NodeAddress>,
    pub workers: Vec<NodeAddress>,
}

impl ClusterTopology {
    /// Resolve the desired cluster instances against the live snapshot.
    ///
    /// Every desired node must exist and have a private address.
    pub fn discover(
        cfg: &Config,
        naming: &Naming,
        desired: &[ResourceSpec],
        snapshot: &RemoteSnapshot,
    ) -> Result<Self, KshapeError> {
        let mut control_planes = Vec::new();
        let mut workers = Vec::new();

        for spec in desired.iter().filter(|s| {
            s.kind == ResourceKind::Instance && Phase::Infrastructure.owns(s)
        }) {
            let address = snapshot
                .find(ResourceKind::Instance, &spec.name)
                .and_then(|o| o.private_ip.clone())
                .ok_or_else(|| KshapeError::Bootstrap {
                    context: ErrorContext::resource(spec.reference()),
                    message: "instance has no private address".to_string(),
                })?;
            let node = NodeAddress {
                name: spec.name.clone(),
                address,
            };
            if spec.role() == Some(ROLE_CONTROL_PLANE) {
                control_planes.push(node);
            } else {
                workers.push(node);
            }
        }

        let mut topology = Self {
            cluster: naming.cluster().to_string(),
            endpoint: String::new(),
            control_planes,
            workers,
        };
        let host = match snapshot
            .find(ResourceKind::LoadBalancer, &naming.api_load_balancer())
            .and_then(|lb| lb.dns_name.clone())
        {
            Some(dns) => dns,
            None => topology.first_control_plane()?.address.clone(),
        };
        topology.endpoint = format!("https://{host}:{}", cfg.api_port);
        Ok(topology)
    }

    pub fn expected_nodes(&self) -> usize {
        self.control_planes.len() + self.workers.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeAddress> {
        self.control_planes.iter().chain(self.workers.iter())
    }

    /// The node bootstrap commands are sent to.
    pub fn first_control_plane(&self) -> Result<&NodeAddress, KshapeError> {
        self.control_planes
            .first()
            .ok_or_else(|| KshapeError::bootstrap("cluster has no control-plane instances"))
    }
}

#[async_trait]
pub trait NodeBootstrapper: Send + Sync {
    /// Configure every node and bootstrap the cluster. Credentials are written
    /// into `dir`. Safe to call again on an already bootstrapped cluster.
    async fn bootstrap(
        &self,
        topology: &ClusterTopology,
        dir: &CredentialsDir,
    ) -> Result<(), KshapeError>;

    /// Number of nodes registered and reporting Ready.
    async fn ready_nodes(&self, dir: &CredentialsDir) -> Result<usize, KshapeError>;
}
