//! AWS binding of [`CloudProvider`] and [`ObjectStore`].
//!
//! One struct holds a client per service; each submodule adds the operations
//! of the kinds that service backs.

mod ec2;
mod elb;
mod iam;
mod s3;
mod scheduler;
pub mod tags;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use futures::future::try_join_all;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::ProviderError;
use crate::model::{
    ImageRef, ObservedResource, ResourceConfig, ResourceKind, ResourceSpec, ResourceState,
};
use crate::provider::{CloudProvider, LabelScope, ObjectStore};
use tags::TagChanges;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct AwsProvider {
    ec2: aws_sdk_ec2::Client,
    elb: aws_sdk_elasticloadbalancingv2::Client,
    iam: aws_sdk_iam::Client,
    s3: aws_sdk_s3::Client,
    scheduler: aws_sdk_scheduler::Client,
    sts: aws_sdk_sts::Client,
    region: String,
    /// Bound on waits for deletions to finish.
    operation_timeout: Duration,
}

impl AwsProvider {
    /// Build clients for the configured region from the default credential
    /// chain.
    pub async fn new(cfg: &Config) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(cfg.region.clone()))
            .load()
            .await;
        info!(region = %cfg.region, "AWS clients initialized");

        Self {
            ec2: aws_sdk_ec2::Client::new(&config),
            elb: aws_sdk_elasticloadbalancingv2::Client::new(&config),
            iam: aws_sdk_iam::Client::new(&config),
            s3: aws_sdk_s3::Client::new(&config),
            scheduler: aws_sdk_scheduler::Client::new(&config),
            sts: aws_sdk_sts::Client::new(&config),
            region: cfg.region.clone(),
            operation_timeout: cfg.operation_timeout(),
        }
    }

    async fn list_kind(
        &self,
        scope: &LabelScope,
        kind: ResourceKind,
    ) -> Result<Vec<ObservedResource>, ProviderError> {
        let mut resources = match kind {
            ResourceKind::Network => self.list_networks(scope).await?,
            ResourceKind::Subnet => self.list_subnets(scope).await?,
            ResourceKind::Nat => self.list_nats(scope).await?,
            ResourceKind::Router => self.list_routers(scope).await?,
            ResourceKind::FirewallRule => self.list_firewall_rules(scope).await?,
            ResourceKind::InstanceGroup => self.list_instance_groups(scope).await?,
            ResourceKind::Instance => self.list_instances(scope).await?,
            ResourceKind::StaticAddress => self.list_static_addresses(scope).await?,
            ResourceKind::LoadBalancer => self.list_load_balancers().await?,
            ResourceKind::Bucket => self.list_buckets().await?,
            ResourceKind::ServiceAccount => self.list_service_accounts(scope).await?,
            ResourceKind::SchedulePolicy => self.list_schedules().await?,
        };
        resources.retain(|r| scope.matches(&r.spec));
        debug!(kind = %kind, count = resources.len(), "Listed resources");
        Ok(resources)
    }

    /// Live object `name` of `kind` in `cluster`, used to resolve references.
    async fn lookup(
        &self,
        cluster: &str,
        kind: ResourceKind,
        name: &str,
    ) -> Result<ObservedResource, ProviderError> {
        let mut found: Vec<ObservedResource> = self
            .list_kind(&LabelScope::cluster(cluster), kind)
            .await?
            .into_iter()
            .filter(|r| r.name() == name)
            .collect();
        // Prefer a healthy copy when a replacement is in flight.
        found.sort_by_key(|r| r.state != ResourceState::Available);
        found.into_iter().next().ok_or_else(|| {
            ProviderError::not_found(module_path!(), format!("{kind}/{name} in cluster {cluster}"))
        })
    }

    async fn lookup_id(
        &self,
        cluster: &str,
        kind: ResourceKind,
        name: &str,
    ) -> Result<String, ProviderError> {
        Ok(self.lookup(cluster, kind, name).await?.id)
    }

    async fn apply_tags(
        &self,
        resource: &ObservedResource,
        changes: &TagChanges,
    ) -> Result<(), ProviderError> {
        if changes.is_empty() {
            return Ok(());
        }
        match resource.kind() {
            ResourceKind::LoadBalancer => self.tag_load_balancer(&resource.id, changes).await,
            ResourceKind::Bucket => self.tag_bucket(&resource.id, changes).await,
            ResourceKind::ServiceAccount => self.tag_role(resource.name(), changes).await,
            ResourceKind::SchedulePolicy => self.tag_schedule(&resource.id, changes).await,
            _ => self.tag_ec2(&resource.id, changes).await,
        }
    }

    /// Poll `done` until it returns true or the operation timeout passes.
    async fn wait_for<F, Fut>(&self, what: &str, mut done: F) -> Result<(), ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, ProviderError>>,
    {
        let start = Instant::now();
        loop {
            if done().await? {
                return Ok(());
            }
            if start.elapsed() >= self.operation_timeout {
                return Err(ProviderError::timeout(
                    module_path!(),
                    format!(
                        "{what} not finished after {}s",
                        self.operation_timeout.as_secs()
                    ),
                ));
            }
            debug!(what = %what, "Waiting");
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

fn mismatch(spec: &ResourceSpec) -> ProviderError {
    ProviderError::fatal(
        module_path!(),
        format!("{} carries a configuration of another kind", spec.reference()),
    )
}

fn build_err(err: aws_smithy_types::error::operation::BuildError) -> ProviderError {
    ProviderError::fatal(module_path!(), err.to_string())
}

fn cluster_of(spec: &ResourceSpec) -> Result<&str, ProviderError> {
    spec.cluster().ok_or_else(|| {
        ProviderError::fatal(
            module_path!(),
            format!("{} has no cluster label", spec.reference()),
        )
    })
}

#[async_trait]
impl CloudProvider for AwsProvider {
    async fn list(
        &self,
        scope: &LabelScope,
        kinds: &[ResourceKind],
    ) -> Result<Vec<ObservedResource>, ProviderError> {
        let kinds: &[ResourceKind] = if kinds.is_empty() {
            &ResourceKind::ORDERED
        } else {
            kinds
        };
        let lists = try_join_all(kinds.iter().map(|k| self.list_kind(scope, *k))).await?;
        Ok(lists.into_iter().flatten().collect())
    }

    async fn create(&self, spec: &ResourceSpec) -> Result<ObservedResource, ProviderError> {
        let cluster = cluster_of(spec)?;
        let tags = tags::encode(spec)?;
        info!(kind = %spec.kind, resource = %spec.name, "Creating resource");
        let id = match spec.kind {
            ResourceKind::Network => self.create_network(spec, &tags).await?,
            ResourceKind::Subnet => self.create_subnet(cluster, spec, &tags).await?,
            ResourceKind::Nat => self.create_nat(cluster, spec, &tags).await?,
            ResourceKind::Router => self.create_router(cluster, spec, &tags).await?,
            ResourceKind::FirewallRule => self.create_firewall_rule(cluster, spec, &tags).await?,
            ResourceKind::InstanceGroup => self.create_instance_group(spec, &tags).await?,
            ResourceKind::Instance => self.create_instance(cluster, spec, &tags).await?,
            ResourceKind::StaticAddress => {
                self.create_static_address(cluster, spec, &tags).await?
            }
            ResourceKind::LoadBalancer => self.create_load_balancer(cluster, spec, &tags).await?,
            ResourceKind::Bucket => self.create_bucket(spec, &tags).await?,
            ResourceKind::ServiceAccount => {
                self.create_service_account(cluster, spec, &tags).await?
            }
            ResourceKind::SchedulePolicy => self.create_schedule(cluster, spec, &tags).await?,
        };

        let placeholder = ObservedResource::new(id.clone(), spec.clone());
        match self.refresh(&placeholder).await? {
            Some(observed) => Ok(observed),
            // Eventually consistent listings may lag behind the create call.
            None => {
                let mut observed = placeholder;
                observed.state = ResourceState::Pending;
                Ok(observed)
            }
        }
    }

    async fn update(
        &self,
        current: &ObservedResource,
        desired: &ResourceSpec,
    ) -> Result<ObservedResource, ProviderError> {
        let cluster = cluster_of(desired)?;
        info!(kind = %desired.kind, resource = %desired.name, "Updating resource");
        match (&current.spec.config, &desired.config) {
            (ResourceConfig::Subnet(_), ResourceConfig::Subnet(d)) => {
                self.update_subnet(current, d).await?;
            }
            (ResourceConfig::Router(c), ResourceConfig::Router(d)) => {
                self.update_router(cluster, current, c, d).await?;
            }
            (
                ResourceConfig::FirewallRule(_),
                ResourceConfig::FirewallRule(d),
            ) => {
                self.update_firewall_rule(current, d).await?;
            }
            (
                ResourceConfig::Instance(c),
                ResourceConfig::Instance(d),
            ) => {
                self.update_instance(cluster, current, c, d).await?;
            }
            (
                ResourceConfig::StaticAddress(_),
                ResourceConfig::StaticAddress(d),
            ) => {
                self.update_static_address(cluster, current, d).await?;
            }
            (
                ResourceConfig::LoadBalancer(c),
                ResourceConfig::LoadBalancer(d),
            ) => {
                self.update_load_balancer(cluster, current, c, d).await?;
            }
            (ResourceConfig::Bucket(_), ResourceConfig::Bucket(d)) => {
                self.update_bucket(&current.id, d).await?;
            }
            (
                ResourceConfig::ServiceAccount(c),
                ResourceConfig::ServiceAccount(d),
            ) => {
                self.update_service_account(current.name(), c, d).await?;
            }
            (
                ResourceConfig::SchedulePolicy(_),
                ResourceConfig::SchedulePolicy(_),
            ) => {
                self.put_schedules(cluster, desired, false).await?;
            }
            _ => {}
        }

        let changes = TagChanges::between(&current.spec, desired)?;
        self.apply_tags(current, &changes).await?;

        self.refresh(current).await?.ok_or_else(|| {
            ProviderError::not_found(
                module_path!(),
                format!("{} disappeared during update", current.reference()),
            )
        })
    }

    async fn delete(&self, resource: &ObservedResource) -> Result<(), ProviderError> {
        info!(kind = %resource.kind(), resource = %resource.name(), id = %resource.id, "Deleting resource");
        match resource.kind() {
            ResourceKind::Network => self.delete_network(&resource.id).await,
            ResourceKind::Subnet => self.delete_subnet(&resource.id).await,
            ResourceKind::Nat => self.delete_nat(&resource.id).await,
            ResourceKind::Router => self.delete_router(&resource.id).await,
            ResourceKind::FirewallRule => self.delete_firewall_rule(&resource.id).await,
            ResourceKind::InstanceGroup => self.delete_instance_group(resource.name()).await,
            ResourceKind::Instance => self.delete_instance(&resource.id).await,
            ResourceKind::StaticAddress => self.delete_static_address(&resource.id).await,
            ResourceKind::LoadBalancer => self.delete_load_balancer(&resource.id).await,
            ResourceKind::Bucket => self.delete_bucket(&resource.id).await,
            ResourceKind::ServiceAccount => self.delete_service_account(resource.name()).await,
            ResourceKind::SchedulePolicy => self.delete_schedule(resource.name()).await,
        }
    }

    async fn refresh(
        &self,
        resource: &ObservedResource,
    ) -> Result<Option<ObservedResource>, ProviderError> {
        let scope = match resource.spec.cluster() {
            Some(cluster) => LabelScope::cluster(cluster),
            None => LabelScope::AnyCluster,
        };
        Ok(self
            .list_kind(&scope, resource.kind())
            .await?
            .into_iter()
            .find(|r| r.id == resource.id))
    }

    async fn set_status_label(
        &self,
        resource: &ObservedResource,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), ProviderError> {
        debug!(resource = %resource.reference(), key = %key, value = ?value, "Setting status tag");
        self.apply_tags(resource, &TagChanges::status(key, value))
            .await
    }

    async fn set_power(
        &self,
        resource: &ObservedResource,
        running: bool,
    ) -> Result<(), ProviderError> {
        self.set_instance_power(&resource.id, running).await
    }

    async fn resolve_image(&self, image: &ImageRef) -> Result<Option<String>, ProviderError> {
        self.find_image(image).await
    }

    async fn account_id(&self) -> Result<String, ProviderError> {
        let resp = self
            .sts
            .get_caller_identity()
            .send()
            .await
            .map_err(|e| ProviderError::aws(module_path!(), e))?;
        resp.account().map(str::to_string).ok_or_else(|| {
            ProviderError::fatal(module_path!(), "caller identity has no account")
        })
    }
}

#[async_trait]
impl ObjectStore for AwsProvider {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
    ) -> Result<(), ProviderError> {
        self.s3_put(bucket, key, body).await
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, ProviderError> {
        self.s3_get(bucket, key).await
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, ProviderError> {
        self.s3_list(bucket, prefix).await
    }
}
