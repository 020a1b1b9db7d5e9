//! Cluster configuration.
//!
//! A flat set of named variables resolved once per invocation with the
//! precedence environment > config file > built-in default. The resolved
//! [`Config`] is immutable and is the only input of the desired-state
//! compiler.

use std::collections::HashMap;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;
use tracing::debug;

use crate::error::KshapeError;

/// Prefix of every environment variable kshape reads.
pub const ENV_PREFIX: &str = "KSHAPE_";

/// A named pool of homogeneous worker instances.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerPool {
    pub name: String,
    pub count: i64,
    pub machine_type: String,
    pub disk_gb: u32,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub extensions: Option<Vec<String>>,
}

/// Resolved configuration.
#[derive(Debug)]
pub struct Config {
    pub cluster_name: String,
    /// AWS account id the cluster must live in.
    pub project: String,
    pub region: String,
    pub zone: String,

    pub network_cidr: String,
    pub public_subnet_cidr: String,
    pub subnet_cidr: String,
    pub pod_cidr: String,
    pub service_cidr: String,

    pub os_version: String,
    pub extensions: Vec<String>,
    pub image_owner: String,
    pub image_name_prefix: String,

    pub control_plane_count: i64,
    pub control_plane_machine_type: String,
    pub control_plane_disk_gb: u32,
    pub worker_pools: Vec<WorkerPool>,

    pub bastion_machine_type: String,
    pub bastion_image_owner: String,
    pub bastion_image_name: String,
    pub bastion_allowed_cidrs: Vec<String>,
    pub ssh_key_name: Option<String>,
    pub ssh_user: String,

    pub enable_nat: bool,
    pub enable_load_balancer: bool,
    pub api_port: u16,
    pub talos_port: u16,

    pub schedule_enabled: bool,
    pub schedule_start: String,
    pub schedule_stop: String,
    pub schedule_timezone: String,

    pub wait_ready_timeout_secs: u64,
    pub operation_timeout_secs: u64,
    pub bootstrap_timeout_secs: u64,
    pub retry_max_attempts: u32,
    pub max_concurrency: usize,

    pub traefik_version: String,
    pub traefik_namespace: String,
    pub storage_class: String,

    pub slack_webhook_url: Option<SecretString>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            project: String::new(),
            region: "us-east-1".to_string(),
            zone: "us-east-1a".to_string(),
            network_cidr: "10.0.0.0/16".to_string(),
            public_subnet_cidr: "10.0.0.0/24".to_string(),
            subnet_cidr: "10.0.16.0/20".to_string(),
            pod_cidr: "10.244.0.0/16".to_string(),
            service_cidr: "10.96.0.0/12".to_string(),
            os_version: "v1.9.5".to_string(),
            extensions: Vec::new(),
            image_owner: "540036508848".to_string(),
            image_name_prefix: "talos".to_string(),
            control_plane_count: 3,
            control_plane_machine_type: "m6i.large".to_string(),
            control_plane_disk_gb: 50,
            worker_pools: vec![WorkerPool {
                name: "default".to_string(),
                count: 2,
                machine_type: "m6i.xlarge".to_string(),
                disk_gb: 100,
                os_version: None,
                extensions: None,
            }],
            bastion_machine_type: "t3.micro".to_string(),
            bastion_image_owner: "amazon".to_string(),
            bastion_image_name: "al2023-ami-2023.*-x86_64".to_string(),
            bastion_allowed_cidrs: vec!["0.0.0.0/0".to_string()],
            ssh_key_name: None,
            ssh_user: "ec2-user".to_string(),
            enable_nat: true,
            enable_load_balancer: true,
            api_port: 6443,
            talos_port: 50000,
            schedule_enabled: false,
            schedule_start: "0 8 ? * MON-FRI *".to_string(),
            schedule_stop: "0 20 ? * MON-FRI *".to_string(),
            schedule_timezone: "UTC".to_string(),
            wait_ready_timeout_secs: 600,
            operation_timeout_secs: 300,
            bootstrap_timeout_secs: 900,
            retry_max_attempts: 5,
            max_concurrency: 4,
            traefik_version: "34.4.1".to_string(),
            traefik_namespace: "traefik".to_string(),
            storage_class: "gp3".to_string(),
            slack_webhook_url: None,
        }
    }
}

/// On-disk YAML layout. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    cluster_name: Option<String>,
    project: Option<String>,
    region: Option<String>,
    zone: Option<String>,
    network_cidr: Option<String>,
    public_subnet_cidr: Option<String>,
    subnet_cidr: Option<String>,
    pod_cidr: Option<String>,
    service_cidr: Option<String>,
    os_version: Option<String>,
    extensions: Option<Vec<String>>,
    image_owner: Option<String>,
    image_name_prefix: Option<String>,
    control_plane_count: Option<i64>,
    control_plane_machine_type: Option<String>,
    control_plane_disk_gb: Option<u32>,
    worker_pools: Option<Vec<WorkerPool>>,
    bastion_machine_type: Option<String>,
    bastion_image_owner: Option<String>,
    bastion_image_name: Option<String>,
    bastion_allowed_cidrs: Option<Vec<String>>,
    ssh_key_name: Option<String>,
    ssh_user: Option<String>,
    enable_nat: Option<bool>,
    enable_load_balancer: Option<bool>,
    api_port: Option<u16>,
    talos_port: Option<u16>,
    schedule_enabled: Option<bool>,
    schedule_start: Option<String>,
    schedule_stop: Option<String>,
    schedule_timezone: Option<String>,
    wait_ready_timeout_secs: Option<u64>,
    operation_timeout_secs: Option<u64>,
    bootstrap_timeout_secs: Option<u64>,
    retry_max_attempts: Option<u32>,
    max_concurrency: Option<usize>,
    traefik_version: Option<String>,
    traefik_namespace: Option<String>,
    storage_class: Option<String>,
    slack_webhook_url: Option<String>,
}

impl ConfigFile {
    /// Parse a YAML config file.
    pub fn from_path(path: &Path) -> Result<Self, KshapeError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            KshapeError::config(format!("failed to read {}: {e}", path.display()))
        })?;
        serde_yaml::from_str(&content)
            .map_err(|e| KshapeError::config(format!("failed to parse {}: {e}", path.display())))
    }
}

macro_rules! overlay {
    ($target:expr, $file:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(v) = $file.$field {
                $target.$field = v;
            }
        )+
    };
}

impl Config {
    /// Resolve configuration from an optional file and captured environment.
    pub fn load(path: Option<&Path>, env: &HashMap<String, String>) -> Result<Self, KshapeError> {
        let file = match path {
            Some(p) => {
                debug!(path = %p.display(), "Loading config file");
                ConfigFile::from_path(p)?
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file, env)
    }

    /// Apply the file over defaults, then the environment over both.
    pub fn resolve(file: ConfigFile, env: &HashMap<String, String>) -> Result<Self, KshapeError> {
        let mut cfg = Self::default();

        if let Some(url) = file.slack_webhook_url.filter(|u| !u.is_empty()) {
            cfg.slack_webhook_url = Some(SecretString::from(url));
        }
        if file.ssh_key_name.is_some() {
            cfg.ssh_key_name = file.ssh_key_name;
        }
        overlay!(
            cfg,
            file,
            cluster_name,
            project,
            region,
            zone,
            network_cidr,
            public_subnet_cidr,
            subnet_cidr,
            pod_cidr,
            service_cidr,
            os_version,
            extensions,
            image_owner,
            image_name_prefix,
            control_plane_count,
            control_plane_machine_type,
            control_plane_disk_gb,
            worker_pools,
            bastion_machine_type,
            bastion_image_owner,
            bastion_image_name,
            bastion_allowed_cidrs,
            ssh_user,
            enable_nat,
            enable_load_balancer,
            api_port,
            talos_port,
            schedule_enabled,
            schedule_start,
            schedule_stop,
            schedule_timezone,
            wait_ready_timeout_secs,
            operation_timeout_secs,
            bootstrap_timeout_secs,
            retry_max_attempts,
            max_concurrency,
            traefik_version,
            traefik_namespace,
            storage_class,
        );

        cfg.apply_env(env)?;
        Ok(cfg)
    }

    fn apply_env(&mut self, env: &HashMap<String, String>) -> Result<(), KshapeError> {
        let e = EnvOverrides(env);

        e.parse("cluster_name", &mut self.cluster_name)?;
        e.parse("project", &mut self.project)?;
        e.parse("region", &mut self.region)?;
        e.parse("zone", &mut self.zone)?;
        e.parse("network_cidr", &mut self.network_cidr)?;
        e.parse("public_subnet_cidr", &mut self.public_subnet_cidr)?;
        e.parse("subnet_cidr", &mut self.subnet_cidr)?;
        e.parse("pod_cidr", &mut self.pod_cidr)?;
        e.parse("service_cidr", &mut self.service_cidr)?;
        e.parse("os_version", &mut self.os_version)?;
        e.list("extensions", &mut self.extensions);
        e.parse("image_owner", &mut self.image_owner)?;
        e.parse("image_name_prefix", &mut self.image_name_prefix)?;
        e.parse("control_plane_count", &mut self.control_plane_count)?;
        e.parse("control_plane_machine_type", &mut self.control_plane_machine_type)?;
        e.parse("control_plane_disk_gb", &mut self.control_plane_disk_gb)?;
        e.parse("bastion_machine_type", &mut self.bastion_machine_type)?;
        e.parse("bastion_image_owner", &mut self.bastion_image_owner)?;
        e.parse("bastion_image_name", &mut self.bastion_image_name)?;
        e.list("bastion_allowed_cidrs", &mut self.bastion_allowed_cidrs);
        if let Some(v) = e.get("ssh_key_name") {
            self.ssh_key_name = Some(v.to_string()).filter(|s| !s.is_empty());
        }
        e.parse("ssh_user", &mut self.ssh_user)?;
        e.parse("enable_nat", &mut self.enable_nat)?;
        e.parse("enable_load_balancer", &mut self.enable_load_balancer)?;
        e.parse("api_port", &mut self.api_port)?;
        e.parse("talos_port", &mut self.talos_port)?;
        e.parse("schedule_enabled", &mut self.schedule_enabled)?;
        e.parse("schedule_start", &mut self.schedule_start)?;
        e.parse("schedule_stop", &mut self.schedule_stop)?;
        e.parse("schedule_timezone", &mut self.schedule_timezone)?;
        e.parse("wait_ready_timeout_secs", &mut self.wait_ready_timeout_secs)?;
        e.parse("operation_timeout_secs", &mut self.operation_timeout_secs)?;
        e.parse("bootstrap_timeout_secs", &mut self.bootstrap_timeout_secs)?;
        e.parse("retry_max_attempts", &mut self.retry_max_attempts)?;
        e.parse("max_concurrency", &mut self.max_concurrency)?;
        e.parse("traefik_version", &mut self.traefik_version)?;
        e.parse("traefik_namespace", &mut self.traefik_namespace)?;
        e.parse("storage_class", &mut self.storage_class)?;
        if let Some(url) = e.get("slack_webhook_url") {
            self.slack_webhook_url = Some(url.to_string())
                .filter(|u| !u.is_empty())
                .map(SecretString::from);
        }

        for pool in &mut self.worker_pools {
            let key = format!("worker_{}_count", pool.name.replace('-', "_"));
            e.parse(&key, &mut pool.count)?;
        }

        Ok(())
    }

    pub const fn wait_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_ready_timeout_secs)
    }

    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub const fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_secs)
    }

    /// Log the effective configuration.
    pub fn display(&self) {
        let pools: Vec<String> = self
            .worker_pools
            .iter()
            .map(|p| format!("{}={}x{}", p.name, p.count, p.machine_type))
            .collect();
        tracing::info!(
            cluster = %self.cluster_name,
            project = %self.project,
            region = %self.region,
            zone = %self.zone,
            control_plane = self.control_plane_count,
            worker_pools = %pools.join(","),
            nat = self.enable_nat,
            load_balancer = self.enable_load_balancer,
            schedule = self.schedule_enabled,
            slack = self.slack_webhook_url.is_some(),
            "Configuration resolved"
        );
    }
}

/// Lookup of `KSHAPE_*` variables captured at startup.
struct EnvOverrides<'a>(&'a HashMap<String, String>);

impl EnvOverrides<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(&format!("{ENV_PREFIX}{}", key.to_uppercase()))
            .map(String::as_str)
    }

    fn parse<T>(&self, key: &str, target: &mut T) -> Result<(), KshapeError>
    where
        T: FromStr,
        T::Err: Display,
    {
        if let Some(raw) = self.get(key) {
            *target = raw.trim().parse().map_err(|e| {
                KshapeError::config(format!(
                    "invalid value for {ENV_PREFIX}{}: {raw:?} ({e})",
                    key.to_uppercase()
                ))
            })?;
        }
        Ok(())
    }

    fn list(&self, key: &str, target: &mut Vec<String>) {
        if let Some(raw) = self.get(key) {
            *target = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
    }
}
