//! In-memory provider double with an action log and fault injection.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CloudProvider, LabelScope, ObjectStore};
use crate::error::ProviderError;
use crate::model::{
    ImageRef, ObservedResource, ResourceKind, ResourceSpec, ResourceState, STATUS_LABEL_PREFIX,
};

pub const ACCOUNT_ID: &str = "123456789012";

/// Operation a fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Create,
    Update,
    Delete,
    Power,
}

/// Error returned by an injected fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Transient,
    Fatal,
    Conflict,
}

#[derive(Debug)]
struct Fault {
    op: Op,
    name: String,
    kind: FaultKind,
    remaining: usize,
}

#[derive(Debug, Default)]
struct State {
    resources: Vec<ObservedResource>,
    next_id: u64,
    log: Vec<String>,
    faults: Vec<Fault>,
    pending_refreshes: HashMap<String, usize>,
    objects: BTreeMap<(String, String), Vec<u8>>,
    missing_images: HashSet<String>,
    list_calls: usize,
}

/// Cloud provider backed by a vector. Every mutation is appended to a log.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    state: Mutex<State>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut guard = self.state.lock().unwrap();
        f(&mut guard)
    }

    /// Seed a resource directly, bypassing the log.
    pub fn insert(&self, spec: ResourceSpec) -> ObservedResource {
        self.with(|s| {
            let observed = s.materialize(spec);
            s.resources.push(observed.clone());
            observed
        })
    }

    /// Make the next `times` calls of `op` on `name` fail.
    pub fn fail(&self, op: Op, name: &str, kind: FaultKind, times: usize) {
        self.with(|s| {
            s.faults.push(Fault {
                op,
                name: name.to_string(),
                kind,
                remaining: times,
            });
        });
    }

    pub fn clear_faults(&self) {
        self.with(|s| s.faults.clear());
    }

    pub fn missing_image(&self, name_pattern: &str) {
        self.with(|s| {
            s.missing_images.insert(name_pattern.to_string());
        });
    }

    pub fn set_state(&self, id: &str, state: ResourceState) {
        self.with(|s| {
            if let Some(r) = s.resources.iter_mut().find(|r| r.id == id) {
                r.state = state;
            }
        });
    }

    /// Report the resource as available after `refreshes` refresh calls.
    pub fn become_available_after(&self, id: &str, refreshes: usize) {
        self.with(|s| {
            s.pending_refreshes.insert(id.to_string(), refreshes);
        });
    }

    pub fn log(&self) -> Vec<String> {
        self.with(|s| s.log.clone())
    }

    pub fn clear_log(&self) {
        self.with(|s| s.log.clear());
    }

    pub fn list_calls(&self) -> usize {
        self.with(|s| s.list_calls)
    }

    /// Names touched by `verb` (`create`, `update`, `delete`) for `kind`, in order.
    pub fn logged(&self, verb: &str, kind: ResourceKind) -> Vec<String> {
        let prefix = format!("{verb} {kind} ");
        self.log()
            .iter()
            .filter_map(|l| l.strip_prefix(&prefix))
            .map(|rest| rest.split(' ').next().unwrap_or(rest).to_string())
            .collect()
    }

    pub fn resources(&self) -> Vec<ObservedResource> {
        self.with(|s| s.resources.clone())
    }

    /// Sorted names of live resources of `kind` in `cluster`.
    pub fn names(&self, cluster: &str, kind: ResourceKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .resources()
            .into_iter()
            .filter(|r| r.kind() == kind && r.belongs_to(cluster))
            .map(|r| r.spec.name)
            .collect();
        names.sort();
        names
    }

    pub fn find(&self, kind: ResourceKind, name: &str) -> Option<ObservedResource> {
        self.resources()
            .into_iter()
            .find(|r| r.kind() == kind && r.name() == name)
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.with(|s| {
            s.objects
                .get(&(bucket.to_string(), key.to_string()))
                .cloned()
        })
    }
}

impl State {
    fn materialize(&mut self, spec: ResourceSpec) -> ObservedResource {
        self.next_id += 1;
        let prefix = match spec.kind {
            ResourceKind::Network => "vpc",
            ResourceKind::Subnet => "subnet",
            ResourceKind::Nat => "nat",
            ResourceKind::Router => "rtb",
            ResourceKind::FirewallRule => "sg",
            ResourceKind::ServiceAccount => "role",
            ResourceKind::Bucket => "bucket",
            ResourceKind::InstanceGroup => "pg",
            ResourceKind::Instance => "i",
            ResourceKind::StaticAddress => "eipalloc",
            ResourceKind::LoadBalancer => "lb",
            ResourceKind::SchedulePolicy => "sched",
        };
        let mut observed = ObservedResource::new(format!("{prefix}-{}", self.next_id), spec);
        match observed.kind() {
            ResourceKind::Instance => {
                observed.private_ip = Some(format!("10.0.16.{}", self.next_id % 250));
            }
            ResourceKind::StaticAddress => {
                observed.public_ip = Some(format!("203.0.113.{}", self.next_id % 250));
            }
            ResourceKind::LoadBalancer => {
                observed.dns_name = Some(format!("{}.elb.example.com", observed.name()));
            }
            _ => {}
        }
        observed
    }

    fn take_fault(&mut self, op: Op, name: &str) -> Option<ProviderError> {
        let fault = self
            .faults
            .iter_mut()
            .find(|f| f.op == op && f.name == name && f.remaining > 0)?;
        fault.remaining -= 1;
        let component = "memory";
        let message = format!("injected {op:?} fault for {name}");
        Some(match fault.kind {
            FaultKind::Transient => ProviderError::Transient {
                component: component.to_string(),
                message,
            },
            FaultKind::Fatal => ProviderError::fatal(component, message),
            FaultKind::Conflict => ProviderError::Conflict {
                component: component.to_string(),
                message,
            },
        })
    }
}

#[async_trait]
impl CloudProvider for MemoryProvider {
    async fn list(
        &self,
        scope: &LabelScope,
        kinds: &[ResourceKind],
    ) -> Result<Vec<ObservedResource>, ProviderError> {
        Ok(self.with(|s| {
            s.list_calls += 1;
            s.resources
                .iter()
                .filter(|r| scope.matches(&r.spec))
                .filter(|r| kinds.is_empty() || kinds.contains(&r.kind()))
                .cloned()
                .collect()
        }))
    }

    async fn create(&self, spec: &ResourceSpec) -> Result<ObservedResource, ProviderError> {
        self.with(|s| {
            if let Some(err) = s.take_fault(Op::Create, &spec.name) {
                return Err(err);
            }
            if spec.kind.has_unique_provider_name()
                && s
                    .resources
                    .iter()
                    .any(|r| r.kind() == spec.kind && r.name() == spec.name)
            {
                return Err(ProviderError::Conflict {
                    component: "memory".to_string(),
                    message: format!("{} {} already exists", spec.kind, spec.name),
                });
            }
            let observed = s.materialize(spec.clone());
            s.log
                .push(format!("create {} {} {}", spec.kind, spec.name, observed.id));
            s.resources.push(observed.clone());
            Ok(observed)
        })
    }

    async fn update(
        &self,
        current: &ObservedResource,
        desired: &ResourceSpec,
    ) -> Result<ObservedResource, ProviderError> {
        self.with(|s| {
            if let Some(err) = s.take_fault(Op::Update, &desired.name) {
                return Err(err);
            }
            let r = s
                .resources
                .iter_mut()
                .find(|r| r.id == current.id)
                .ok_or_else(|| ProviderError::not_found("memory", current.id.clone()))?;
            let status: Vec<(String, String)> = r
                .spec
                .labels
                .iter()
                .filter(|(k, _)| k.starts_with(STATUS_LABEL_PREFIX))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            r.spec = desired.clone();
            r.spec.labels.extend(status);
            let updated = r.clone();
            s.log
                .push(format!("update {} {} {}", desired.kind, desired.name, current.id));
            Ok(updated)
        })
    }

    async fn delete(&self, resource: &ObservedResource) -> Result<(), ProviderError> {
        self.with(|s| {
            if let Some(err) = s.take_fault(Op::Delete, resource.name()) {
                return Err(err);
            }
            let pos = s
                .resources
                .iter()
                .position(|r| r.id == resource.id)
                .ok_or_else(|| ProviderError::not_found("memory", resource.id.clone()))?;
            s.resources.remove(pos);
            s.log.push(format!(
                "delete {} {} {}",
                resource.kind(),
                resource.name(),
                resource.id
            ));
            Ok(())
        })
    }

    async fn refresh(
        &self,
        resource: &ObservedResource,
    ) -> Result<Option<ObservedResource>, ProviderError> {
        Ok(self.with(|s| {
            if let Some(left) = s.pending_refreshes.get_mut(&resource.id) {
                if *left <= 1 {
                    s.pending_refreshes.remove(&resource.id);
                    if let Some(r) = s.resources.iter_mut().find(|r| r.id == resource.id) {
                        r.state = ResourceState::Available;
                    }
                } else {
                    *left -= 1;
                }
            }
            s.resources.iter().find(|r| r.id == resource.id).cloned()
        }))
    }

    async fn set_status_label(
        &self,
        resource: &ObservedResource,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), ProviderError> {
        self.with(|s| {
            let r = s
                .resources
                .iter_mut()
                .find(|r| r.id == resource.id)
                .ok_or_else(|| ProviderError::not_found("memory", resource.id.clone()))?;
            let label = format!("{STATUS_LABEL_PREFIX}{key}");
            match value {
                Some(v) => {
                    r.spec.labels.insert(label, v.to_string());
                }
                None => {
                    r.spec.labels.remove(&label);
                }
            }
            Ok(())
        })
    }

    async fn set_power(
        &self,
        resource: &ObservedResource,
        running: bool,
    ) -> Result<(), ProviderError> {
        self.with(|s| {
            if let Some(err) = s.take_fault(Op::Power, resource.name()) {
                return Err(err);
            }
            let r = s
                .resources
                .iter_mut()
                .find(|r| r.id == resource.id)
                .ok_or_else(|| ProviderError::not_found("memory", resource.id.clone()))?;
            r.state = if running {
                ResourceState::Available
            } else {
                ResourceState::Stopped
            };
            let verb = if running { "start" } else { "stop" };
            s.log
                .push(format!("{verb} Instance {} {}", resource.name(), resource.id));
            Ok(())
        })
    }

    async fn resolve_image(&self, image: &ImageRef) -> Result<Option<String>, ProviderError> {
        Ok(self.with(|s| {
            (!s.missing_images.contains(&image.name_pattern))
                .then(|| format!("ami-{}", image.name_pattern.len()))
        }))
    }

    async fn account_id(&self) -> Result<String, ProviderError> {
        Ok(ACCOUNT_ID.to_string())
    }
}

#[async_trait]
impl ObjectStore for MemoryProvider {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
    ) -> Result<(), ProviderError> {
        self.with(|s| {
            s.objects
                .insert((bucket.to_string(), key.to_string()), body);
        });
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, ProviderError> {
        Ok(self.object(bucket, key))
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, ProviderError> {
        Ok(self.with(|s| {
            s.objects
                .keys()
                .filter(|(b, k)| b == bucket && k.starts_with(prefix))
                .map(|(_, k)| k.clone())
                .collect()
        }))
    }
}
