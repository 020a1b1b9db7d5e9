//! Network load balancer in front of the control plane.
//!
//! One load balancer owns one TCP target group (same name) and one listener.

use std::collections::{BTreeSet, HashMap};

use aws_sdk_elasticloadbalancingv2::types::{
    Action, ActionTypeEnum, LoadBalancer, LoadBalancerSchemeEnum, LoadBalancerStateEnum,
    LoadBalancerTypeEnum, ProtocolEnum, Tag, TargetDescription, TargetHealthStateEnum,
    TargetTypeEnum,
};
use tracing::{debug, info};

use super::tags::{self, TAG_NAME, TagChanges, TagMap};
use super::{AwsProvider, build_err, mismatch};
use crate::error::ProviderError;
use crate::model::{
    LABEL_CLUSTER, LoadBalancerConfig, ObservedResource, ResourceConfig, ResourceKind,
    ResourceSpec, ResourceState,
};

/// DescribeTags accepts at most 20 ARNs per call.
const TAG_BATCH: usize = 20;

fn aws_err<E: std::error::Error>(err: E) -> ProviderError {
    ProviderError::aws(module_path!(), err)
}

fn to_tags(tags: &TagMap) -> Result<Vec<Tag>, ProviderError> {
    tags.iter()
        .map(|(k, v)| Tag::builder().key(k).value(v).build().map_err(build_err))
        .collect()
}

fn state_of(lb: &LoadBalancer) -> ResourceState {
    match lb.state().and_then(|s| s.code()) {
        Some(LoadBalancerStateEnum::Active | LoadBalancerStateEnum::ActiveImpaired) => {
            ResourceState::Available
        }
        Some(LoadBalancerStateEnum::Failed) => ResourceState::Failed,
        _ => ResourceState::Pending,
    }
}

impl AwsProvider {
    pub(super) async fn list_load_balancers(&self) -> Result<Vec<ObservedResource>, ProviderError> {
        let resp = self
            .elb
            .describe_load_balancers()
            .send()
            .await
            .map_err(aws_err)?;
        let balancers: Vec<&LoadBalancer> = resp
            .load_balancers()
            .iter()
            .filter(|lb| lb.r#type() == Some(&LoadBalancerTypeEnum::Network))
            .collect();

        let arns: Vec<String> = balancers
            .iter()
            .filter_map(|lb| lb.load_balancer_arn().map(str::to_string))
            .collect();
        let tags_by_arn = self.elb_tags(&arns).await?;

        let mut observed = Vec::new();
        for lb in balancers {
            let Some(arn) = lb.load_balancer_arn() else {
                continue;
            };
            let Some(tags) = tags_by_arn.get(arn) else {
                continue;
            };
            let Some(spec) = tags::decode(ResourceKind::LoadBalancer, tags.clone()) else {
                continue;
            };
            let mut resource = ObservedResource::new(arn, spec);
            resource.state = state_of(lb);
            resource.dns_name = lb.dns_name().map(str::to_string);

            match self.target_group(arn).await? {
                Some(group_arn) => {
                    let ids = self.registered_targets(&group_arn).await?;
                    let names = self.instance_names(ids.into_iter().collect()).await?;
                    if let ResourceConfig::LoadBalancer(c) = &mut resource.spec.config {
                        c.targets = names.into_values().collect();
                        c.targets.sort();
                    }
                }
                // Half-built; rebuild it.
                None => resource.state = ResourceState::Failed,
            }
            observed.push(resource);
        }
        Ok(observed)
    }

    async fn elb_tags(&self, arns: &[String]) -> Result<HashMap<String, TagMap>, ProviderError> {
        let mut by_arn = HashMap::new();
        for batch in arns.chunks(TAG_BATCH) {
            let resp = self
                .elb
                .describe_tags()
                .set_resource_arns(Some(batch.to_vec()))
                .send()
                .await
                .map_err(aws_err)?;
            for description in resp.tag_descriptions() {
                let Some(arn) = description.resource_arn() else {
                    continue;
                };
                let tags: TagMap = description
                    .tags()
                    .iter()
                    .map(|t| {
                        (
                            t.key().to_string(),
                            t.value().unwrap_or_default().to_string(),
                        )
                    })
                    .collect();
                by_arn.insert(arn.to_string(), tags);
            }
        }
        Ok(by_arn)
    }

    /// Target group forwarded to by the load balancer's listener.
    async fn target_group(&self, lb_arn: &str) -> Result<Option<String>, ProviderError> {
        let resp = self
            .elb
            .describe_target_groups()
            .load_balancer_arn(lb_arn)
            .send()
            .await
            .map_err(aws_err)?;
        Ok(resp
            .target_groups()
            .iter()
            .find_map(|g| g.target_group_arn().map(str::to_string)))
    }

    /// Instance ids registered with a target group, draining ones excluded.
    async fn registered_targets(&self, group_arn: &str) -> Result<BTreeSet<String>, ProviderError> {
        let resp = self
            .elb
            .describe_target_health()
            .target_group_arn(group_arn)
            .send()
            .await
            .map_err(aws_err)?;
        Ok(resp
            .target_health_descriptions()
            .iter()
            .filter(|d| {
                d.target_health().and_then(|h| h.state()) != Some(&TargetHealthStateEnum::Draining)
            })
            .filter_map(|d| d.target().map(|t| t.id().to_string()))
            .collect())
    }

    async fn instance_ids(
        &self,
        cluster: &str,
        names: &[String],
    ) -> Result<BTreeSet<String>, ProviderError> {
        let mut ids = BTreeSet::new();
        for name in names {
            ids.insert(
                self.lookup_id(cluster, ResourceKind::Instance, name)
                    .await?,
            );
        }
        Ok(ids)
    }

    async fn register(
        &self,
        group_arn: &str,
        ids: &BTreeSet<String>,
        port: u16,
    ) -> Result<(), ProviderError> {
        if ids.is_empty() {
            return Ok(());
        }
        let targets = ids
            .iter()
            .map(|id| {
                TargetDescription::builder()
                    .id(id)
                    .port(i32::from(port))
                    .build()
                    .map_err(build_err)
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.elb
            .register_targets()
            .target_group_arn(group_arn)
            .set_targets(Some(targets))
            .send()
            .await
            .map_err(aws_err)?;
        Ok(())
    }

    async fn deregister(&self, group_arn: &str, ids: &BTreeSet<String>) -> Result<(), ProviderError> {
        if ids.is_empty() {
            return Ok(());
        }
        let targets = ids
            .iter()
            .map(|id| TargetDescription::builder().id(id).build().map_err(build_err))
            .collect::<Result<Vec<_>, _>>()?;
        self.elb
            .deregister_targets()
            .target_group_arn(group_arn)
            .set_targets(Some(targets))
            .send()
            .await
            .map_err(aws_err)?;
        Ok(())
    }

    pub(super) async fn create_load_balancer(
        &self,
        cluster: &str,
        spec: &ResourceSpec,
        tags: &TagMap,
    ) -> Result<String, ProviderError> {
        let ResourceConfig::LoadBalancer(c) = &spec.config else {
            return Err(mismatch(spec));
        };
        let vpc_id = self
            .lookup_id(cluster, ResourceKind::Network, &c.network)
            .await?;
        let subnet_id = self
            .lookup_id(cluster, ResourceKind::Subnet, &c.subnet)
            .await?;

        let resp = self
            .elb
            .create_load_balancer()
            .name(&spec.name)
            .r#type(LoadBalancerTypeEnum::Network)
            .scheme(LoadBalancerSchemeEnum::InternetFacing)
            .subnets(subnet_id)
            .set_tags(Some(to_tags(tags)?))
            .send()
            .await
            .map_err(aws_err)?;
        let lb_arn = resp
            .load_balancers()
            .first()
            .and_then(|lb| lb.load_balancer_arn())
            .ok_or_else(|| {
                ProviderError::fatal(module_path!(), "CreateLoadBalancer returned no ARN")
            })?
            .to_string();

        // Not a listed resource: name and cluster only.
        let mut group_tags = TagMap::new();
        group_tags.insert(TAG_NAME.to_string(), spec.name.clone());
        group_tags.insert(LABEL_CLUSTER.to_string(), cluster.to_string());
        let resp = self
            .elb
            .create_target_group()
            .name(&spec.name)
            .protocol(ProtocolEnum::Tcp)
            .port(i32::from(c.port))
            .vpc_id(vpc_id)
            .target_type(TargetTypeEnum::Instance)
            .health_check_protocol(ProtocolEnum::Tcp)
            .health_check_port(c.health_check_port.to_string())
            .set_tags(Some(to_tags(&group_tags)?))
            .send()
            .await
            .map_err(aws_err)?;
        let group_arn = resp
            .target_groups()
            .first()
            .and_then(|g| g.target_group_arn())
            .ok_or_else(|| {
                ProviderError::fatal(module_path!(), "CreateTargetGroup returned no ARN")
            })?
            .to_string();

        self.elb
            .create_listener()
            .load_balancer_arn(&lb_arn)
            .protocol(ProtocolEnum::Tcp)
            .port(i32::from(c.port))
            .default_actions(
                Action::builder()
                    .r#type(ActionTypeEnum::Forward)
                    .target_group_arn(&group_arn)
                    .build()
                    .map_err(build_err)?,
            )
            .send()
            .await
            .map_err(aws_err)?;

        let ids = self.instance_ids(cluster, &c.targets).await?;
        self.register(&group_arn, &ids, c.port).await?;
        info!(
            load_balancer = %spec.name,
            port = c.port,
            targets = ids.len(),
            "Created load balancer"
        );
        Ok(lb_arn)
    }

    pub(super) async fn update_load_balancer(
        &self,
        cluster: &str,
        current: &ObservedResource,
        _actual: &LoadBalancerConfig,
        desired: &LoadBalancerConfig,
    ) -> Result<(), ProviderError> {
        let group_arn = self.target_group(&current.id).await?.ok_or_else(|| {
            ProviderError::not_found(
                module_path!(),
                format!("target group of {}", current.reference()),
            )
        })?;
        let have = self.registered_targets(&group_arn).await?;
        let want = self.instance_ids(cluster, &desired.targets).await?;

        let missing: BTreeSet<String> = want.difference(&have).cloned().collect();
        let stale: BTreeSet<String> = have.difference(&want).cloned().collect();
        debug!(
            load_balancer = %current.name(),
            register = missing.len(),
            deregister = stale.len(),
            "Syncing targets"
        );
        self.register(&group_arn, &missing, desired.port).await?;
        self.deregister(&group_arn, &stale).await
    }

    pub(super) async fn delete_load_balancer(&self, lb_arn: &str) -> Result<(), ProviderError> {
        let group_arn = self.target_group(lb_arn).await?;

        self.elb
            .delete_load_balancer()
            .load_balancer_arn(lb_arn)
            .send()
            .await
            .map_err(aws_err)?;

        // The target group stays in use until the load balancer is gone.
        self.wait_for("load balancer deletion", || async move {
            match self
                .elb
                .describe_load_balancers()
                .load_balancer_arns(lb_arn)
                .send()
                .await
                .map_err(aws_err)
            {
                Ok(resp) => Ok(resp.load_balancers().is_empty()),
                Err(e) if e.is_not_found() => Ok(true),
                Err(e) => Err(e),
            }
        })
        .await?;

        if let Some(group_arn) = group_arn {
            self.elb
                .delete_target_group()
                .target_group_arn(group_arn)
                .send()
                .await
                .map_err(aws_err)?;
        }
        Ok(())
    }

    pub(super) async fn tag_load_balancer(
        &self,
        lb_arn: &str,
        changes: &TagChanges,
    ) -> Result<(), ProviderError> {
        if !changes.set.is_empty() {
            self.elb
                .add_tags()
                .resource_arns(lb_arn)
                .set_tags(Some(to_tags(&changes.set)?))
                .send()
                .await
                .map_err(aws_err)?;
        }
        if !changes.remove.is_empty() {
            self.elb
                .remove_tags()
                .resource_arns(lb_arn)
                .set_tag_keys(Some(changes.remove.clone()))
                .send()
                .await
                .map_err(aws_err)?;
        }
        Ok(())
    }
}
