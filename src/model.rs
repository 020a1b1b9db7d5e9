//! Resource model shared by the compiler, the providers and the reconciler.
//!
//! Every managed cloud object is described by a [`ResourceSpec`]: a kind, a
//! deterministic name, a label set and a typed configuration. What the cloud
//! reports back is an [`ObservedResource`], which wraps the same spec shape
//! plus provider identity and runtime state.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Label key carrying the owning cluster name. Every managed resource has it.
pub const LABEL_CLUSTER: &str = "cluster";
/// Label key describing the resource's role inside the cluster.
pub const LABEL_ROLE: &str = "role";
/// Label key naming the node pool of an instance or placement group.
pub const LABEL_POOL: &str = "pool";
/// Labels with this prefix are runtime annotations, not declared state.
pub const STATUS_LABEL_PREFIX: &str = "kshape-status-";

pub const ROLE_NETWORK: &str = "network";
pub const ROLE_CONTROL_PLANE: &str = "control-plane";
pub const ROLE_WORKER: &str = "worker";
pub const ROLE_BASTION: &str = "bastion";
pub const ROLE_STATE: &str = "state";
pub const ROLE_SCHEDULER: &str = "scheduler";
pub const ROLE_API: &str = "api";

/// Kinds of cloud objects kshape manages, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Network,
    Subnet,
    Nat,
    Router,
    FirewallRule,
    ServiceAccount,
    Bucket,
    InstanceGroup,
    Instance,
    StaticAddress,
    LoadBalancer,
    SchedulePolicy,
}

impl ResourceKind {
    /// All kinds, dependencies first.
    pub const ORDERED: [Self; 12] = [
        Self::Network,
        Self::Subnet,
        Self::Nat,
        Self::Router,
        Self::FirewallRule,
        Self::ServiceAccount,
        Self::Bucket,
        Self::InstanceGroup,
        Self::Instance,
        Self::StaticAddress,
        Self::LoadBalancer,
        Self::SchedulePolicy,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "Network",
            Self::Subnet => "Subnet",
            Self::Nat => "NAT",
            Self::Router => "Router",
            Self::FirewallRule => "FirewallRule",
            Self::ServiceAccount => "ServiceAccount",
            Self::Bucket => "Bucket",
            Self::InstanceGroup => "InstanceGroup",
            Self::Instance => "Instance",
            Self::StaticAddress => "StaticAddress",
            Self::LoadBalancer => "LoadBalancer",
            Self::SchedulePolicy => "SchedulePolicy",
        }
    }

    /// Position in the dependency order.
    pub fn level(self) -> usize {
        Self::ORDERED
            .iter()
            .position(|k| *k == self)
            .unwrap_or(Self::ORDERED.len())
    }

    /// Whether a name is a unique key for this kind on the provider side.
    ///
    /// When it is not, a replacement can be created next to the old object
    /// before the old one is removed.
    pub const fn has_unique_provider_name(self) -> bool {
        matches!(
            self,
            Self::FirewallRule
                | Self::ServiceAccount
                | Self::Bucket
                | Self::InstanceGroup
                | Self::LoadBalancer
                | Self::SchedulePolicy
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ORDERED
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown resource kind: {s}"))
    }
}

/// Identity of a resource within one cluster: kind plus name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// OS image lookup key. Resolved to a provider image id at create time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageRef {
    pub owner: String,
    pub name_pattern: String,
}

/// TCP ingress rule of a firewall.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IngressRule {
    pub from_port: u16,
    pub to_port: u16,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub cidr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetConfig {
    pub network: String,
    pub cidr: String,
    pub zone: String,
    pub public: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatConfig {
    pub subnet: String,
}

/// Route table with a default route through the internet gateway or a NAT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    pub network: String,
    pub subnet: String,
    pub via_nat: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRuleConfig {
    pub network: String,
    pub description: String,
    pub ingress: Vec<IngressRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccountConfig {
    pub trusted_service: String,
    pub managed_policies: Vec<String>,
    pub inline_actions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub versioning: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceGroupConfig {
    pub strategy: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub machine_type: String,
    pub disk_gb: u32,
    pub image: ImageRef,
    pub subnet: String,
    pub group: Option<String>,
    pub firewall_rules: Vec<String>,
    pub service_account: Option<String>,
    pub public_ip: bool,
    pub key_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticAddressConfig {
    pub instance: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    pub network: String,
    pub subnet: String,
    pub port: u16,
    pub health_check_port: u16,
    pub backends: Vec<String>,
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulePolicyConfig {
    pub service_account: String,
    pub timezone: String,
    pub start: String,
    pub stop: String,
    pub enabled: bool,
    pub targets: Vec<String>,
}

/// Typed per-kind configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceConfig {
    Network(NetworkConfig),
    Subnet(SubnetConfig),
    Nat(NatConfig),
    Router(RouterConfig),
    FirewallRule(FirewallRuleConfig),
    ServiceAccount(ServiceAccountConfig),
    Bucket(BucketConfig),
    InstanceGroup(InstanceGroupConfig),
    Instance(InstanceConfig),
    StaticAddress(StaticAddressConfig),
    LoadBalancer(LoadBalancerConfig),
    SchedulePolicy(SchedulePolicyConfig),
    /// Observed resource whose declared configuration could not be read back.
    Unknown,
}

/// Fields that differ between a desired and an observed configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Drift {
    /// Fields the provider can change on the live object.
    pub mutable: Vec<&'static str>,
    /// Fields that force the object to be replaced.
    pub immutable: Vec<&'static str>,
}

impl Drift {
    pub fn is_empty(&self) -> bool {
        self.mutable.is_empty() && self.immutable.is_empty()
    }

    pub fn requires_replace(&self) -> bool {
        !self.immutable.is_empty()
    }

    fn check<T: PartialEq>(&mut self, field: &'static str, a: &T, b: &T, mutable: bool) {
        if a != b {
            if mutable {
                self.mutable.push(field);
            } else {
                self.immutable.push(field);
            }
        }
    }

    /// Every changed field, immutable first.
    pub fn fields(&self) -> Vec<&'static str> {
        self.immutable
            .iter()
            .chain(self.mutable.iter())
            .copied()
            .collect()
    }
}

const MUTABLE: bool = true;
const IMMUTABLE: bool = false;

impl ResourceConfig {
    /// Structural comparison of a desired configuration against an observed one.
    pub fn diff(&self, actual: &Self) -> Drift {
        let mut d = Drift::default();
        match (self, actual) {
            (Self::Network(a), Self::Network(b)) => {
                d.check("cidr", &a.cidr, &b.cidr, IMMUTABLE);
            }
            (Self::Subnet(a), Self::Subnet(b)) => {
                d.check("network", &a.network, &b.network, IMMUTABLE);
                d.check("cidr", &a.cidr, &b.cidr, IMMUTABLE);
                d.check("zone", &a.zone, &b.zone, IMMUTABLE);
                d.check("public", &a.public, &b.public, MUTABLE);
            }
            (Self::Nat(a), Self::Nat(b)) => {
                d.check("subnet", &a.subnet, &b.subnet, IMMUTABLE);
            }
            (Self::Router(a), Self::Router(b)) => {
                d.check("network", &a.network, &b.network, IMMUTABLE);
                d.check("subnet", &a.subnet, &b.subnet, MUTABLE);
                d.check("via_nat", &a.via_nat, &b.via_nat, MUTABLE);
            }
            (Self::FirewallRule(a), Self::FirewallRule(b)) => {
                d.check("network", &a.network, &b.network, IMMUTABLE);
                d.check("description", &a.description, &b.description, IMMUTABLE);
                d.check(
                    "ingress",
                    &normalized_rules(&a.ingress),
                    &normalized_rules(&b.ingress),
                    MUTABLE,
                );
            }
            (Self::ServiceAccount(a), Self::ServiceAccount(b)) => {
                d.check(
                    "trusted_service",
                    &a.trusted_service,
                    &b.trusted_service,
                    IMMUTABLE,
                );
                d.check(
                    "managed_policies",
                    &sorted(&a.managed_policies),
                    &sorted(&b.managed_policies),
                    MUTABLE,
                );
                d.check(
                    "inline_actions",
                    &sorted(&a.inline_actions),
                    &sorted(&b.inline_actions),
                    MUTABLE,
                );
            }
            (Self::Bucket(a), Self::Bucket(b)) => {
                d.check("versioning", &a.versioning, &b.versioning, MUTABLE);
            }
            (Self::InstanceGroup(a), Self::InstanceGroup(b)) => {
                d.check("strategy", &a.strategy, &b.strategy, IMMUTABLE);
            }
            (Self::Instance(a), Self::Instance(b)) => {
                d.check("machine_type", &a.machine_type, &b.machine_type, IMMUTABLE);
                d.check("disk_gb", &a.disk_gb, &b.disk_gb, IMMUTABLE);
                d.check("image", &a.image, &b.image, IMMUTABLE);
                d.check("subnet", &a.subnet, &b.subnet, IMMUTABLE);
                d.check("group", &a.group, &b.group, IMMUTABLE);
                d.check(
                    "firewall_rules",
                    &sorted(&a.firewall_rules),
                    &sorted(&b.firewall_rules),
                    MUTABLE,
                );
                d.check(
                    "service_account",
                    &a.service_account,
                    &b.service_account,
                    IMMUTABLE,
                );
                d.check("public_ip", &a.public_ip, &b.public_ip, IMMUTABLE);
                d.check("key_name", &a.key_name, &b.key_name, IMMUTABLE);
            }
            (Self::StaticAddress(a), Self::StaticAddress(b)) => {
                d.check("instance", &a.instance, &b.instance, MUTABLE);
            }
            (Self::LoadBalancer(a), Self::LoadBalancer(b)) => {
                d.check("network", &a.network, &b.network, IMMUTABLE);
                d.check("subnet", &a.subnet, &b.subnet, IMMUTABLE);
                d.check("port", &a.port, &b.port, IMMUTABLE);
                d.check(
                    "health_check_port",
                    &a.health_check_port,
                    &b.health_check_port,
                    IMMUTABLE,
                );
                d.check("backends", &sorted(&a.backends), &sorted(&b.backends), MUTABLE);
                d.check("targets", &sorted(&a.targets), &sorted(&b.targets), MUTABLE);
            }
            (Self::SchedulePolicy(a), Self::SchedulePolicy(b)) => {
                d.check(
                    "service_account",
                    &a.service_account,
                    &b.service_account,
                    MUTABLE,
                );
                d.check("timezone", &a.timezone, &b.timezone, MUTABLE);
                d.check("start", &a.start, &b.start, MUTABLE);
                d.check("stop", &a.stop, &b.stop, MUTABLE);
                d.check("enabled", &a.enabled, &b.enabled, MUTABLE);
                d.check("targets", &sorted(&a.targets), &sorted(&b.targets), MUTABLE);
            }
            _ => d.immutable.push("config"),
        }
        d
    }

    /// Names of the resources this configuration points at.
    pub fn references(&self) -> Vec<ResourceRef> {
        use ResourceKind as K;
        match self {
            Self::Network(_)
            | Self::Bucket(_)
            | Self::InstanceGroup(_)
            | Self::ServiceAccount(_)
            | Self::Unknown => Vec::new(),
            Self::Subnet(c) => vec![ResourceRef::new(K::Network, &c.network)],
            Self::Nat(c) => vec![ResourceRef::new(K::Subnet, &c.subnet)],
            Self::Router(c) => {
                let mut refs = vec![
                    ResourceRef::new(K::Network, &c.network),
                    ResourceRef::new(K::Subnet, &c.subnet),
                ];
                if let Some(nat) = &c.via_nat {
                    refs.push(ResourceRef::new(K::Nat, nat));
                }
                refs
            }
            Self::FirewallRule(c) => vec![ResourceRef::new(K::Network, &c.network)],
            Self::Instance(c) => {
                let mut refs = vec![ResourceRef::new(K::Subnet, &c.subnet)];
                refs.extend(c.group.iter().map(|g| ResourceRef::new(K::InstanceGroup, g)));
                refs.extend(
                    c.firewall_rules
                        .iter()
                        .map(|f| ResourceRef::new(K::FirewallRule, f)),
                );
                refs.extend(
                    c.service_account
                        .iter()
                        .map(|s| ResourceRef::new(K::ServiceAccount, s)),
                );
                refs
            }
            Self::StaticAddress(c) => c
                .instance
                .iter()
                .map(|i| ResourceRef::new(K::Instance, i))
                .collect(),
            Self::LoadBalancer(c) => {
                let mut refs = vec![
                    ResourceRef::new(K::Network, &c.network),
                    ResourceRef::new(K::Subnet, &c.subnet),
                ];
                refs.extend(c.backends.iter().map(|b| ResourceRef::new(K::InstanceGroup, b)));
                refs.extend(c.targets.iter().map(|t| ResourceRef::new(K::Instance, t)));
                refs
            }
            Self::SchedulePolicy(c) => {
                let mut refs = vec![ResourceRef::new(K::ServiceAccount, &c.service_account)];
                refs.extend(c.targets.iter().map(|t| ResourceRef::new(K::Instance, t)));
                refs
            }
        }
    }
}

fn sorted(values: &[String]) -> Vec<String> {
    let mut v = values.to_vec();
    v.sort();
    v.dedup();
    v
}

fn normalized_rules(rules: &[IngressRule]) -> Vec<IngressRule> {
    let mut v: Vec<IngressRule> = rules
        .iter()
        .map(|r| IngressRule {
            from_port: r.from_port,
            to_port: r.to_port,
            sources: sorted(&r.sources),
        })
        .collect();
    v.sort();
    v
}

/// A resource that should exist (or, when observed, does exist).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub kind: ResourceKind,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub config: ResourceConfig,
}

impl ResourceSpec {
    pub fn new(
        kind: ResourceKind,
        name: impl Into<String>,
        cluster: &str,
        role: &str,
        config: ResourceConfig,
    ) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_CLUSTER.to_string(), cluster.to_string());
        labels.insert(LABEL_ROLE.to_string(), role.to_string());
        Self {
            kind,
            name: name.into(),
            labels,
            config,
        }
    }

    #[must_use]
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn reference(&self) -> ResourceRef {
        ResourceRef::new(self.kind, &self.name)
    }

    pub fn cluster(&self) -> Option<&str> {
        self.labels.get(LABEL_CLUSTER).map(String::as_str)
    }

    pub fn role(&self) -> Option<&str> {
        self.labels.get(LABEL_ROLE).map(String::as_str)
    }

    pub fn pool(&self) -> Option<&str> {
        self.labels.get(LABEL_POOL).map(String::as_str)
    }

    pub fn depends_on(&self) -> Vec<ResourceRef> {
        self.config.references()
    }

    /// Labels that describe declared state; status annotations are excluded.
    pub fn declared_labels(&self) -> BTreeMap<&str, &str> {
        self.labels
            .iter()
            .filter(|(k, _)| !k.starts_with(STATUS_LABEL_PREFIX))
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }

    /// Trailing numeric index of the name, if any (`demo-worker-default-3` → 3).
    pub fn index(&self) -> Option<u32> {
        name_index(&self.name)
    }

    pub fn drift(&self, actual: &Self) -> Drift {
        let mut drift = self.config.diff(&actual.config);
        if self.declared_labels() != actual.declared_labels() {
            drift.mutable.push("labels");
        }
        drift
    }
}

/// Parse the trailing `-<n>` index of a resource name.
pub fn name_index(name: &str) -> Option<u32> {
    name.rsplit_once('-').and_then(|(_, n)| n.parse().ok())
}

/// Runtime state reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceState {
    Pending,
    Available,
    Stopped,
    Deleting,
    Failed,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Available => "available",
            Self::Stopped => "stopped",
            Self::Deleting => "deleting",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A resource as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedResource {
    /// Provider-side identifier (instance id, ARN, bucket name...).
    pub id: String,
    pub spec: ResourceSpec,
    pub state: ResourceState,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    pub dns_name: Option<String>,
}

impl ObservedResource {
    pub fn new(id: impl Into<String>, spec: ResourceSpec) -> Self {
        Self {
            id: id.into(),
            spec,
            state: ResourceState::Available,
            private_ip: None,
            public_ip: None,
            dns_name: None,
        }
    }

    pub const fn kind(&self) -> ResourceKind {
        self.spec.kind
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn reference(&self) -> ResourceRef {
        self.spec.reference()
    }

    /// True only when the cluster label equals `cluster` exactly.
    pub fn belongs_to(&self, cluster: &str) -> bool {
        self.spec.cluster() == Some(cluster)
    }

    pub fn status_label(&self, key: &str) -> Option<&str> {
        self.spec
            .labels
            .get(&format!("{STATUS_LABEL_PREFIX}{key}"))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(machine_type: &str, disk_gb: u32) -> ResourceSpec {
        ResourceSpec::new(
            ResourceKind::Instance,
            "demo-cp-0",
            "demo",
            ROLE_CONTROL_PLANE,
            ResourceConfig::Instance(InstanceConfig {
                machine_type: machine_type.to_string(),
                disk_gb,
                image: ImageRef {
                    owner: "540036508848".to_string(),
                    name_pattern: "talos-v1.9.5-*".to_string(),
                },
                subnet: "demo-nodes".to_string(),
                group: Some("demo-cp".to_string()),
                firewall_rules: vec!["demo-nodes".to_string()],
                service_account: None,
                public_ip: false,
                key_name: None,
            }),
        )
    }

    #[test]
    fn test_kind_order_is_dependency_order() {
        assert!(ResourceKind::Network.level() < ResourceKind::Subnet.level());
        assert!(ResourceKind::Nat.level() < ResourceKind::Router.level());
        assert!(ResourceKind::InstanceGroup.level() < ResourceKind::Instance.level());
        assert!(ResourceKind::StaticAddress.level() < ResourceKind::LoadBalancer.level());
        assert_eq!(ResourceKind::SchedulePolicy.level(), 11);
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("nat".parse::<ResourceKind>(), Ok(ResourceKind::Nat));
        assert_eq!(
            "instance".parse::<ResourceKind>(),
            Ok(ResourceKind::Instance)
        );
        assert!("volume".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn test_no_drift_for_identical_specs() {
        let a = instance("m6i.large", 50);
        assert!(a.drift(&a.clone()).is_empty());
    }

    #[test]
    fn test_machine_type_is_immutable_drift() {
        let drift = instance("m6i.large", 50).drift(&instance("m6i.xlarge", 50));
        assert_eq!(drift.immutable, vec!["machine_type"]);
        assert!(drift.mutable.is_empty());
        assert!(drift.requires_replace());
    }

    #[test]
    fn test_disk_size_is_immutable_drift() {
        let drift = instance("m6i.large", 50).drift(&instance("m6i.large", 100));
        assert_eq!(drift.immutable, vec!["disk_gb"]);
        assert!(drift.requires_replace());
    }

    #[test]
    fn test_status_labels_do_not_drift() {
        let desired = instance("m6i.large", 50);
        let actual = desired
            .clone()
            .with_label("kshape-status-phase", "Resources");
        assert!(desired.drift(&actual).is_empty());
    }

    #[test]
    fn test_label_change_is_mutable_drift() {
        let desired = instance("m6i.large", 50);
        let actual = desired.clone().with_label(LABEL_POOL, "other");
        assert_eq!(desired.drift(&actual).mutable, vec!["labels"]);
    }

    #[test]
    fn test_unknown_config_forces_replace() {
        let desired = instance("m6i.large", 50);
        let mut actual = desired.clone();
        actual.config = ResourceConfig::Unknown;
        assert_eq!(desired.drift(&actual).immutable, vec!["config"]);
    }

    #[test]
    fn test_list_fields_compare_as_sets() {
        let a = ResourceConfig::LoadBalancer(LoadBalancerConfig {
            network: "n".to_string(),
            subnet: "s".to_string(),
            port: 6443,
            health_check_port: 6443,
            backends: vec!["g".to_string()],
            targets: vec!["a".to_string(), "b".to_string()],
        });
        let mut b = a.clone();
        if let ResourceConfig::LoadBalancer(c) = &mut b {
            c.targets = vec!["b".to_string(), "a".to_string()];
        }
        assert!(a.diff(&b).is_empty());
    }

    #[test]
    fn test_name_index() {
        assert_eq!(name_index("demo-worker-default-3"), Some(3));
        assert_eq!(name_index("demo-cp-10"), Some(10));
        assert_eq!(name_index("demo-bastion"), None);
    }

    #[test]
    fn test_instance_references() {
        let refs = instance("m6i.large", 50).depends_on();
        assert!(refs.contains(&ResourceRef::new(ResourceKind::Subnet, "demo-nodes")));
        assert!(refs.contains(&ResourceRef::new(ResourceKind::InstanceGroup, "demo-cp")));
        assert!(refs.contains(&ResourceRef::new(ResourceKind::FirewallRule, "demo-nodes")));
    }

    #[test]
    fn test_belongs_to_requires_exact_label() {
        let obs = ObservedResource::new("i-1", instance("m6i.large", 50));
        assert!(obs.belongs_to("demo"));
        assert!(!obs.belongs_to("dem"));
        assert!(!obs.belongs_to("demo-2"));
    }
}
