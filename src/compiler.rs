//! Desired-state compiler.
//!
//! Turns a resolved [`Config`] into the ordered list of resources that should
//! exist. The output is a pure function of the configuration: the same input
//! always yields the same names, labels and configurations in the same order.

mod validate;

pub use validate::{Ipv4Cidr, validate};

use crate::config::Config;
use crate::error::KshapeError;
use crate::model::{
    BucketConfig, FirewallRuleConfig, ImageRef, IngressRule, InstanceConfig, InstanceGroupConfig,
    LABEL_POOL, LoadBalancerConfig, NatConfig, NetworkConfig, ROLE_API, ROLE_BASTION,
    ROLE_CONTROL_PLANE, ROLE_NETWORK, ROLE_SCHEDULER, ROLE_STATE, ROLE_WORKER, ResourceConfig,
    ResourceKind, ResourceSpec, RouterConfig, SchedulePolicyConfig, ServiceAccountConfig,
    StaticAddressConfig, SubnetConfig,
};

const NODE_POLICIES: &[&str] = &["arn:aws:iam::aws:policy/service-role/AmazonEBSCSIDriverPolicy"];
const BASTION_POLICIES: &[&str] = &["arn:aws:iam::aws:policy/AmazonSSMManagedInstanceCore"];
const SCHEDULER_ACTIONS: &[&str] = &["ec2:StartInstances", "ec2:StopInstances"];

/// Deterministic resource names for one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Naming {
    cluster: String,
    project: String,
}

impl Naming {
    pub fn new(cluster: &str, project: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            project: project.to_string(),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(&cfg.cluster_name, &cfg.project)
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn network(&self) -> String {
        format!("{}-network", self.cluster)
    }

    pub fn public_subnet(&self) -> String {
        format!("{}-public", self.cluster)
    }

    pub fn node_subnet(&self) -> String {
        format!("{}-nodes", self.cluster)
    }

    pub fn nat(&self) -> String {
        format!("{}-nat", self.cluster)
    }

    pub fn node_firewall(&self) -> String {
        format!("{}-nodes", self.cluster)
    }

    pub fn bastion_firewall(&self) -> String {
        format!("{}-bastion", self.cluster)
    }

    pub fn node_account(&self) -> String {
        format!("{}-nodes", self.cluster)
    }

    pub fn bastion_account(&self) -> String {
        format!("{}-bastion", self.cluster)
    }

    pub fn scheduler_account(&self) -> String {
        format!("{}-scheduler", self.cluster)
    }

    /// Bucket names are global, so the account id is part of it.
    pub fn state_bucket(&self) -> String {
        format!("kshape-{}-{}", self.cluster, self.project)
    }

    pub fn control_plane_group(&self) -> String {
        format!("{}-cp", self.cluster)
    }

    pub fn control_plane(&self, index: u32) -> String {
        format!("{}-cp-{index}", self.cluster)
    }

    pub fn worker_group(&self, pool: &str) -> String {
        format!("{}-worker-{pool}", self.cluster)
    }

    pub fn worker(&self, pool: &str, index: u32) -> String {
        format!("{}-worker-{pool}-{index}", self.cluster)
    }

    pub fn bastion(&self) -> String {
        format!("{}-bastion", self.cluster)
    }

    pub fn api_load_balancer(&self) -> String {
        format!("{}-api", self.cluster)
    }

    pub fn schedule(&self) -> String {
        format!("{}-schedule", self.cluster)
    }
}

/// Image lookup key for a node running `os_version` with `extensions`.
pub fn node_image(cfg: &Config, os_version: &str, extensions: &[String]) -> ImageRef {
    let mut name = format!("{}-{os_version}", cfg.image_name_prefix);
    if !extensions.is_empty() {
        let mut short: Vec<&str> = extensions
            .iter()
            .map(|e| e.rsplit('/').next().unwrap_or(e))
            .collect();
        short.sort_unstable();
        name.push('-');
        name.push_str(&short.join("+"));
    }
    name.push_str("-*");
    ImageRef {
        owner: cfg.image_owner.clone(),
        name_pattern: name,
    }
}

/// Compile the configuration into the desired resource list.
pub fn compile(cfg: &Config) -> Result<Vec<ResourceSpec>, KshapeError> {
    validate(cfg)?;

    let n = Naming::from_config(cfg);
    let c = cfg.cluster_name.as_str();
    let mut specs = Vec::new();

    // Network
    specs.push(ResourceSpec::new(
        ResourceKind::Network,
        n.network(),
        c,
        ROLE_NETWORK,
        ResourceConfig::Network(NetworkConfig {
            cidr: cfg.network_cidr.clone(),
        }),
    ));
    specs.push(ResourceSpec::new(
        ResourceKind::Subnet,
        n.public_subnet(),
        c,
        ROLE_NETWORK,
        ResourceConfig::Subnet(SubnetConfig {
            network: n.network(),
            cidr: cfg.public_subnet_cidr.clone(),
            zone: cfg.zone.clone(),
            public: true,
        }),
    ));
    specs.push(ResourceSpec::new(
        ResourceKind::Subnet,
        n.node_subnet(),
        c,
        ROLE_NETWORK,
        ResourceConfig::Subnet(SubnetConfig {
            network: n.network(),
            cidr: cfg.subnet_cidr.clone(),
            zone: cfg.zone.clone(),
            public: !cfg.enable_nat,
        }),
    ));
    if cfg.enable_nat {
        specs.push(ResourceSpec::new(
            ResourceKind::Nat,
            n.nat(),
            c,
            ROLE_NETWORK,
            ResourceConfig::Nat(NatConfig {
                subnet: n.public_subnet(),
            }),
        ));
    }
    specs.push(ResourceSpec::new(
        ResourceKind::Router,
        n.public_subnet(),
        c,
        ROLE_NETWORK,
        ResourceConfig::Router(RouterConfig {
            network: n.network(),
            subnet: n.public_subnet(),
            via_nat: None,
        }),
    ));
    specs.push(ResourceSpec::new(
        ResourceKind::Router,
        n.node_subnet(),
        c,
        ROLE_NETWORK,
        ResourceConfig::Router(RouterConfig {
            network: n.network(),
            subnet: n.node_subnet(),
            via_nat: cfg.enable_nat.then(|| n.nat()),
        }),
    ));

    // Firewall
    let mut node_ingress = vec![IngressRule {
        from_port: 0,
        to_port: u16::MAX,
        sources: vec![cfg.network_cidr.clone()],
    }];
    if cfg.enable_load_balancer {
        node_ingress.push(IngressRule {
            from_port: cfg.api_port,
            to_port: cfg.api_port,
            sources: cfg.bastion_allowed_cidrs.clone(),
        });
    }
    specs.push(ResourceSpec::new(
        ResourceKind::FirewallRule,
        n.node_firewall(),
        c,
        ROLE_NETWORK,
        ResourceConfig::FirewallRule(FirewallRuleConfig {
            network: n.network(),
            description: format!("kshape {c} cluster nodes"),
            ingress: node_ingress,
        }),
    ));
    specs.push(ResourceSpec::new(
        ResourceKind::FirewallRule,
        n.bastion_firewall(),
        c,
        ROLE_BASTION,
        ResourceConfig::FirewallRule(FirewallRuleConfig {
            network: n.network(),
            description: format!("kshape {c} bastion"),
            ingress: vec![IngressRule {
                from_port: 22,
                to_port: 22,
                sources: cfg.bastion_allowed_cidrs.clone(),
            }],
        }),
    ));

    // Identity and state
    specs.push(service_account(
        &n.node_account(),
        c,
        ROLE_CONTROL_PLANE,
        "ec2.amazonaws.com",
        NODE_POLICIES,
        &[],
    ));
    specs.push(service_account(
        &n.bastion_account(),
        c,
        ROLE_BASTION,
        "ec2.amazonaws.com",
        BASTION_POLICIES,
        &[],
    ));
    if cfg.schedule_enabled {
        specs.push(service_account(
            &n.scheduler_account(),
            c,
            ROLE_SCHEDULER,
            "scheduler.amazonaws.com",
            &[],
            SCHEDULER_ACTIONS,
        ));
    }
    specs.push(ResourceSpec::new(
        ResourceKind::Bucket,
        n.state_bucket(),
        c,
        ROLE_STATE,
        ResourceConfig::Bucket(BucketConfig { versioning: true }),
    ));

    // Compute
    let node_public_ip = !cfg.enable_nat;
    let cp_count = count(cfg.control_plane_count);
    specs.push(
        ResourceSpec::new(
            ResourceKind::InstanceGroup,
            n.control_plane_group(),
            c,
            ROLE_CONTROL_PLANE,
            ResourceConfig::InstanceGroup(InstanceGroupConfig {
                strategy: "spread".to_string(),
            }),
        ),
    );
    let cp_image = node_image(cfg, &cfg.os_version, &cfg.extensions);
    let mut node_names = Vec::new();
    for i in 0..cp_count {
        node_names.push(n.control_plane(i));
        specs.push(ResourceSpec::new(
            ResourceKind::Instance,
            n.control_plane(i),
            c,
            ROLE_CONTROL_PLANE,
            ResourceConfig::Instance(InstanceConfig {
                machine_type: cfg.control_plane_machine_type.clone(),
                disk_gb: cfg.control_plane_disk_gb,
                image: cp_image.clone(),
                subnet: n.node_subnet(),
                group: Some(n.control_plane_group()),
                firewall_rules: vec![n.node_firewall()],
                service_account: Some(n.node_account()),
                public_ip: node_public_ip,
                key_name: None,
            }),
        ));
    }

    for pool in &cfg.worker_pools {
        specs.push(
            ResourceSpec::new(
                ResourceKind::InstanceGroup,
                n.worker_group(&pool.name),
                c,
                ROLE_WORKER,
                ResourceConfig::InstanceGroup(InstanceGroupConfig {
                    strategy: "spread".to_string(),
                }),
            )
            .with_label(LABEL_POOL, &pool.name),
        );
        let image = node_image(
            cfg,
            pool.os_version.as_deref().unwrap_or(&cfg.os_version),
            pool.extensions.as_deref().unwrap_or(&cfg.extensions),
        );
        for i in 0..count(pool.count) {
            node_names.push(n.worker(&pool.name, i));
            specs.push(
                ResourceSpec::new(
                    ResourceKind::Instance,
                    n.worker(&pool.name, i),
                    c,
                    ROLE_WORKER,
                    ResourceConfig::Instance(InstanceConfig {
                        machine_type: pool.machine_type.clone(),
                        disk_gb: pool.disk_gb,
                        image: image.clone(),
                        subnet: n.node_subnet(),
                        group: Some(n.worker_group(&pool.name)),
                        firewall_rules: vec![n.node_firewall()],
                        service_account: Some(n.node_account()),
                        public_ip: node_public_ip,
                        key_name: None,
                    }),
                )
                .with_label(LABEL_POOL, &pool.name),
            );
        }
    }

    // Bastion
    specs.push(ResourceSpec::new(
        ResourceKind::Instance,
        n.bastion(),
        c,
        ROLE_BASTION,
        ResourceConfig::Instance(InstanceConfig {
            machine_type: cfg.bastion_machine_type.clone(),
            disk_gb: 8,
            image: ImageRef {
                owner: cfg.bastion_image_owner.clone(),
                name_pattern: cfg.bastion_image_name.clone(),
            },
            subnet: n.public_subnet(),
            group: None,
            firewall_rules: vec![n.bastion_firewall()],
            service_account: Some(n.bastion_account()),
            public_ip: true,
            key_name: cfg.ssh_key_name.clone(),
        }),
    ));
    specs.push(ResourceSpec::new(
        ResourceKind::StaticAddress,
        n.bastion(),
        c,
        ROLE_BASTION,
        ResourceConfig::StaticAddress(StaticAddressConfig {
            instance: Some(n.bastion()),
        }),
    ));

    // API endpoint
    if cfg.enable_load_balancer && cp_count > 0 {
        specs.push(ResourceSpec::new(
            ResourceKind::LoadBalancer,
            n.api_load_balancer(),
            c,
            ROLE_API,
            ResourceConfig::LoadBalancer(LoadBalancerConfig {
                network: n.network(),
                subnet: n.public_subnet(),
                port: cfg.api_port,
                health_check_port: cfg.api_port,
                backends: vec![n.control_plane_group()],
                targets: (0..cp_count).map(|i| n.control_plane(i)).collect(),
            }),
        ));
    }

    if cfg.schedule_enabled {
        specs.push(ResourceSpec::new(
            ResourceKind::SchedulePolicy,
            n.schedule(),
            c,
            ROLE_SCHEDULER,
            ResourceConfig::SchedulePolicy(SchedulePolicyConfig {
                service_account: n.scheduler_account(),
                timezone: cfg.schedule_timezone.clone(),
                start: cfg.schedule_start.clone(),
                stop: cfg.schedule_stop.clone(),
                enabled: true,
                targets: node_names,
            }),
        ));
    }

    // Stable sort keeps declaration order within a kind
    specs.sort_by_key(|s| s.kind.level());
    Ok(specs)
}

fn service_account(
    name: &str,
    cluster: &str,
    role: &str,
    trusted_service: &str,
    policies: &[&str],
    actions: &[&str],
) -> ResourceSpec {
    ResourceSpec::new(
        ResourceKind::ServiceAccount,
        name,
        cluster,
        role,
        ResourceConfig::ServiceAccount(ServiceAccountConfig {
            trusted_service: trusted_service.to_string(),
            managed_policies: policies.iter().map(|p| (*p).to_string()).collect(),
            inline_actions: actions.iter().map(|a| (*a).to_string()).collect(),
        }),
    )
}

/// Counts are validated non-negative before this is called.
fn count(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LABEL_CLUSTER, ResourceRef};
    use crate::testing::test_config;

    fn names(specs: &[ResourceSpec], kind: ResourceKind) -> Vec<&str> {
        specs
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.name.as_str())
            .collect()
    }

    #[test]
    fn test_compile_is_deterministic() {
        let cfg = test_config();
        let a = compile(&cfg).unwrap();
        let b = compile(&cfg).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_instance_names_carry_stable_index() {
        let specs = compile(&test_config()).unwrap();
        assert_eq!(
            names(&specs, ResourceKind::Instance),
            vec![
                "demo-cp-0",
                "demo-cp-1",
                "demo-cp-2",
                "demo-worker-default-0",
                "demo-worker-default-1",
                "demo-bastion",
            ]
        );
    }

    #[test]
    fn test_every_spec_carries_cluster_label() {
        let specs = compile(&test_config()).unwrap();
        assert!(
            specs
                .iter()
                .all(|s| s.labels.get(LABEL_CLUSTER).map(String::as_str) == Some("demo"))
        );
    }

    #[test]
    fn test_output_sorted_by_dependency_level() {
        let specs = compile(&test_config()).unwrap();
        let levels: Vec<usize> = specs.iter().map(|s| s.kind.level()).collect();
        let mut sorted = levels.clone();
        sorted.sort_unstable();
        assert_eq!(levels, sorted);
    }

    #[test]
    fn test_dependencies_point_to_earlier_kinds() {
        let specs = compile(&test_config()).unwrap();
        let known: Vec<ResourceRef> = specs.iter().map(ResourceSpec::reference).collect();
        for spec in &specs {
            for dep in spec.depends_on() {
                assert!(dep.kind.level() < spec.kind.level(), "{spec:?} -> {dep}");
                assert!(known.contains(&dep), "missing dependency {dep}");
            }
        }
    }

    #[test]
    fn test_zero_workers_yields_group_only() {
        let mut cfg = test_config();
        cfg.worker_pools[0].count = 0;
        let specs = compile(&cfg).unwrap();
        assert!(names(&specs, ResourceKind::InstanceGroup).contains(&"demo-worker-default"));
        assert!(
            !names(&specs, ResourceKind::Instance)
                .iter()
                .any(|n| n.starts_with("demo-worker"))
        );
    }

    #[test]
    fn test_nat_disabled_routes_through_gateway() {
        let mut cfg = test_config();
        cfg.enable_nat = false;
        let specs = compile(&cfg).unwrap();
        assert!(names(&specs, ResourceKind::Nat).is_empty());
        let router = specs
            .iter()
            .find(|s| s.kind == ResourceKind::Router && s.name == "demo-nodes")
            .unwrap();
        match &router.config {
            ResourceConfig::Router(r) => assert_eq!(r.via_nat, None),
            other => panic!("unexpected config {other:?}"),
        }
    }

    #[test]
    fn test_schedule_targets_nodes_not_bastion() {
        let mut cfg = test_config();
        cfg.schedule_enabled = true;
        let specs = compile(&cfg).unwrap();
        let schedule = specs
            .iter()
            .find(|s| s.kind == ResourceKind::SchedulePolicy)
            .unwrap();
        match &schedule.config {
            ResourceConfig::SchedulePolicy(p) => {
                assert_eq!(p.targets.len(), 5);
                assert!(!p.targets.contains(&"demo-bastion".to_string()));
            }
            other => panic!("unexpected config {other:?}"),
        }
        assert!(names(&specs, ResourceKind::ServiceAccount).contains(&"demo-scheduler"));
    }

    #[test]
    fn test_load_balancer_targets_control_plane() {
        let specs = compile(&test_config()).unwrap();
        let lb = specs
            .iter()
            .find(|s| s.kind == ResourceKind::LoadBalancer)
            .unwrap();
        match &lb.config {
            ResourceConfig::LoadBalancer(c) => {
                assert_eq!(c.targets, vec!["demo-cp-0", "demo-cp-1", "demo-cp-2"]);
                assert_eq!(c.port, 6443);
            }
            other => panic!("unexpected config {other:?}"),
        }
    }

    #[test]
    fn test_node_image_includes_extensions() {
        let cfg = test_config();
        let image = node_image(
            &cfg,
            "v1.9.5",
            &[
                "siderolabs/util-linux-tools".to_string(),
                "siderolabs/iscsi-tools".to_string(),
            ],
        );
        assert_eq!(image.name_pattern, "talos-v1.9.5-iscsi-tools+util-linux-tools-*");
        assert_eq!(node_image(&cfg, "v1.9.5", &[]).name_pattern, "talos-v1.9.5-*");
    }

    #[test]
    fn test_pool_overrides_os_version() {
        let mut cfg = test_config();
        cfg.worker_pools[0].os_version = Some("v1.10.0".to_string());
        let specs = compile(&cfg).unwrap();
        let worker = specs
            .iter()
            .find(|s| s.name == "demo-worker-default-0")
            .unwrap();
        match &worker.config {
            ResourceConfig::Instance(i) => assert_eq!(i.image.name_pattern, "talos-v1.10.0-*"),
            other => panic!("unexpected config {other:?}"),
        }
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut cfg = test_config();
        cfg.control_plane_count = -1;
        assert!(matches!(
            compile(&cfg),
            Err(KshapeError::Configuration(_))
        ));
    }
}
