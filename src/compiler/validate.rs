//! Configuration validation. Every failure here is a fatal configuration error.

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::config::Config;
use crate::error::KshapeError;

/// Longest accepted cluster name. Derived names must fit provider limits
/// (load balancer and target group names are capped at 32 characters).
pub const MAX_CLUSTER_NAME_LEN: usize = 20;

/// Address ranges no cluster range may overlap.
const RESERVED_RANGES: &[&str] = &[
    "0.0.0.0/8",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "224.0.0.0/4",
    "240.0.0.0/4",
];

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]([a-z0-9-]*[a-z0-9])?$").expect("static regex"));
static PROJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{12}$").expect("static regex"));
static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^v\d+\.\d+\.\d+$").expect("static regex"));
static EXTENSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9.-]*/[a-z0-9][a-z0-9.-]*$").expect("static regex")
});
static MACHINE_TYPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9-]*\.[a-z0-9]+$").expect("static regex"));

/// An IPv4 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    network: u32,
    prefix: u8,
}

impl Ipv4Cidr {
    const fn mask(self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        }
    }

    pub const fn first(self) -> u32 {
        self.network
    }

    pub const fn last(self) -> u32 {
        self.network | !self.mask()
    }

    pub const fn overlaps(self, other: Self) -> bool {
        self.first() <= other.last() && other.first() <= self.last()
    }

    pub const fn contains(self, other: Self) -> bool {
        self.first() <= other.first() && other.last() <= self.last()
    }
}

impl FromStr for Ipv4Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("{s:?} is not in CIDR notation"))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|e| format!("{s:?} has an invalid address: {e}"))?;
        let prefix: u8 = prefix
            .parse()
            .ok()
            .filter(|p| *p <= 32)
            .ok_or_else(|| format!("{s:?} has an invalid prefix length"))?;
        let cidr = Self {
            network: u32::from(addr),
            prefix,
        };
        if cidr.network & !cidr.mask() != 0 {
            return Err(format!("{s:?} has host bits set"));
        }
        Ok(cidr)
    }
}

fn cidr(field: &str, value: &str) -> Result<Ipv4Cidr, KshapeError> {
    value
        .parse()
        .map_err(|e| KshapeError::config(format!("{field}: {e}")))
}

fn check(ok: bool, message: impl FnOnce() -> String) -> Result<(), KshapeError> {
    if ok {
        Ok(())
    } else {
        Err(KshapeError::config(message()))
    }
}

fn validate_os(field: &str, version: &str, extensions: &[String]) -> Result<(), KshapeError> {
    check(VERSION_RE.is_match(version), || {
        format!("{field}: {version:?} is not a version like v1.9.5")
    })?;
    for ext in extensions {
        check(EXTENSION_RE.is_match(ext), || {
            format!("{field}: extension {ext:?} is not in <org>/<name> form")
        })?;
    }
    Ok(())
}

/// Validate the whole configuration.
pub fn validate(cfg: &Config) -> Result<(), KshapeError> {
    let name = &cfg.cluster_name;
    check(!name.is_empty(), || "cluster_name is required".to_string())?;
    check(name.len() <= MAX_CLUSTER_NAME_LEN, || {
        format!("cluster_name {name:?} is longer than {MAX_CLUSTER_NAME_LEN} characters")
    })?;
    check(NAME_RE.is_match(name), || {
        format!("cluster_name {name:?} must be lowercase letters, digits and '-'")
    })?;
    check(PROJECT_RE.is_match(&cfg.project), || {
        format!("project {:?} must be a 12 digit AWS account id", cfg.project)
    })?;
    check(cfg.zone.starts_with(&cfg.region), || {
        format!("zone {} is not in region {}", cfg.zone, cfg.region)
    })?;

    // Counts
    check(cfg.control_plane_count >= 0, || {
        format!(
            "control_plane_count must not be negative (got {})",
            cfg.control_plane_count
        )
    })?;
    let mut pool_names = Vec::new();
    for pool in &cfg.worker_pools {
        check(pool.count >= 0, || {
            format!(
                "worker pool {:?}: count must not be negative (got {})",
                pool.name, pool.count
            )
        })?;
        check(NAME_RE.is_match(&pool.name) && pool.name.len() <= 16, || {
            format!("worker pool name {:?} is invalid", pool.name)
        })?;
        check(!pool_names.contains(&pool.name.as_str()), || {
            format!("worker pool {:?} is declared twice", pool.name)
        })?;
        pool_names.push(pool.name.as_str());
        check(MACHINE_TYPE_RE.is_match(&pool.machine_type), || {
            format!(
                "worker pool {:?}: machine type {:?} is invalid",
                pool.name, pool.machine_type
            )
        })?;
        check(pool.disk_gb > 0, || {
            format!("worker pool {:?}: disk_gb must be positive", pool.name)
        })?;
        validate_os(
            &format!("worker pool {:?}", pool.name),
            pool.os_version.as_deref().unwrap_or(&cfg.os_version),
            pool.extensions.as_deref().unwrap_or(&cfg.extensions),
        )?;
    }

    // Images and machine types
    validate_os("os_version", &cfg.os_version, &cfg.extensions)?;
    for (field, value) in [
        ("control_plane_machine_type", &cfg.control_plane_machine_type),
        ("bastion_machine_type", &cfg.bastion_machine_type),
    ] {
        check(MACHINE_TYPE_RE.is_match(value), || {
            format!("{field}: {value:?} is not a valid machine type")
        })?;
    }
    check(cfg.control_plane_disk_gb > 0, || {
        "control_plane_disk_gb must be positive".to_string()
    })?;

    // Address ranges
    let network = cidr("network_cidr", &cfg.network_cidr)?;
    let public = cidr("public_subnet_cidr", &cfg.public_subnet_cidr)?;
    let nodes = cidr("subnet_cidr", &cfg.subnet_cidr)?;
    let pods = cidr("pod_cidr", &cfg.pod_cidr)?;
    let services = cidr("service_cidr", &cfg.service_cidr)?;

    check(network.contains(public), || {
        "public_subnet_cidr is not inside network_cidr".to_string()
    })?;
    check(network.contains(nodes), || {
        "subnet_cidr is not inside network_cidr".to_string()
    })?;
    check(!public.overlaps(nodes), || {
        "public_subnet_cidr overlaps subnet_cidr".to_string()
    })?;
    for (field, range) in [("pod_cidr", pods), ("service_cidr", services)] {
        check(!range.overlaps(network), || {
            format!("{field} overlaps network_cidr")
        })?;
    }
    check(!pods.overlaps(services), || {
        "pod_cidr overlaps service_cidr".to_string()
    })?;
    for label in RESERVED_RANGES {
        let reserved = cidr("reserved", label)?;
        for (field, range) in [
            ("network_cidr", network),
            ("pod_cidr", pods),
            ("service_cidr", services),
        ] {
            check(!range.overlaps(reserved), || {
                format!("{field} overlaps reserved range {label}")
            })?;
        }
    }
    for allowed in &cfg.bastion_allowed_cidrs {
        cidr("bastion_allowed_cidrs", allowed)?;
    }

    // Runtime
    check(cfg.api_port > 0, || "api_port must be positive".to_string())?;
    check(cfg.max_concurrency > 0, || {
        "max_concurrency must be at least 1".to_string()
    })?;
    check(cfg.retry_max_attempts > 0, || {
        "retry_max_attempts must be at least 1".to_string()
    })?;
    if cfg.schedule_enabled {
        for (field, value) in [
            ("schedule_start", &cfg.schedule_start),
            ("schedule_stop", &cfg.schedule_stop),
        ] {
            check(value.split_whitespace().count() == 6, || {
                format!("{field}: {value:?} must be a six field cron expression")
            })?;
        }
    }

    Ok(())
}
