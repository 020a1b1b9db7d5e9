//! Placement groups, instances and elastic IPs.

use std::collections::HashMap;

use aws_sdk_ec2::types::{
    BlockDeviceMapping, DomainType, EbsBlockDevice, Filter, HttpTokensState,
    IamInstanceProfileSpecification, Instance, InstanceMetadataOptionsRequest,
    InstanceNetworkInterfaceSpecification, InstanceStateName, InstanceType, Placement,
    PlacementGroupState, PlacementStrategy, ResourceType, VolumeType,
};
use tracing::{debug, info};

use super::{aws_err, filters, missing_id, observe, tag_map, tag_spec};
use crate::aws::tags::{TAG_NAME, TagMap};
use crate::aws::{AwsProvider, mismatch};
use crate::error::ProviderError;
use crate::model::{
    InstanceConfig, ObservedResource, ResourceConfig, ResourceKind, ResourceSpec, ResourceState,
    StaticAddressConfig,
};
use crate::provider::LabelScope;

/// Instance states a listing reports; terminated instances are gone.
const LIVE_STATES: [&str; 5] = ["pending", "running", "stopping", "stopped", "shutting-down"];

fn instance_state(state: Option<&InstanceStateName>) -> Option<ResourceState> {
    match state? {
        InstanceStateName::Running => Some(ResourceState::Available),
        InstanceStateName::Stopping | InstanceStateName::Stopped => Some(ResourceState::Stopped),
        InstanceStateName::ShuttingDown => Some(ResourceState::Deleting),
        InstanceStateName::Terminated => None,
        _ => Some(ResourceState::Pending),
    }
}

fn root_volume(device: &str, disk_gb: u32) -> BlockDeviceMapping {
    BlockDeviceMapping::builder()
        .device_name(device)
        .ebs(
            EbsBlockDevice::builder()
                .volume_size(i32::try_from(disk_gb).unwrap_or(i32::MAX))
                .volume_type(VolumeType::Gp3)
                .delete_on_termination(true)
                .encrypted(true)
                .build(),
        )
        .build()
}

fn observe_instance(instance: &Instance) -> Option<ObservedResource> {
    let state = instance_state(instance.state().and_then(|s| s.name()))?;
    let mut observed = observe(
        ResourceKind::Instance,
        instance.instance_id(),
        instance.tags(),
    )?;
    if let (ResourceConfig::Instance(c), Some(instance_type)) =
        (&mut observed.spec.config, instance.instance_type())
    {
        c.machine_type = instance_type.as_str().to_string();
    }
    observed.state = state;
    observed.private_ip = instance.private_ip_address().map(str::to_string);
    observed.public_ip = instance.public_ip_address().map(str::to_string);
    observed.dns_name = instance
        .private_dns_name()
        .filter(|n| !n.is_empty())
        .map(str::to_string);
    Some(observed)
}

impl AwsProvider {
    pub(in crate::aws) async fn list_instance_groups(
        &self,
        scope: &LabelScope,
    ) -> Result<Vec<ObservedResource>, ProviderError> {
        let resp = self
            .ec2
            .describe_placement_groups()
            .set_filters(Some(filters(scope, ResourceKind::InstanceGroup)))
            .send()
            .await
            .map_err(aws_err)?;

        Ok(resp
            .placement_groups()
            .iter()
            .filter(|g| g.state() != Some(&PlacementGroupState::Deleted))
            .filter_map(|group| {
                let mut observed =
                    observe(ResourceKind::InstanceGroup, group.group_id(), group.tags())?;
                if let (ResourceConfig::InstanceGroup(c), Some(strategy)) =
                    (&mut observed.spec.config, group.strategy())
                {
                    c.strategy = strategy.as_str().to_string();
                }
                observed.state = match group.state() {
                    Some(PlacementGroupState::Available) => ResourceState::Available,
                    Some(PlacementGroupState::Deleting) => ResourceState::Deleting,
                    _ => ResourceState::Pending,
                };
                Some(observed)
            })
            .collect())
    }

    pub(in crate::aws) async fn create_instance_group(
        &self,
        spec: &ResourceSpec,
        tags: &TagMap,
    ) -> Result<String, ProviderError> {
        let ResourceConfig::InstanceGroup(c) = &spec.config else {
            return Err(mismatch(spec));
        };
        let resp = self
            .ec2
            .create_placement_group()
            .group_name(&spec.name)
            .strategy(PlacementStrategy::from(c.strategy.as_str()))
            .tag_specifications(tag_spec(ResourceType::PlacementGroup, tags))
            .send()
            .await
            .map_err(aws_err)?;
        Ok(resp
            .placement_group()
            .and_then(|g| g.group_id())
            .ok_or_else(|| missing_id("CreatePlacementGroup"))?
            .to_string())
    }

    pub(in crate::aws) async fn delete_instance_group(
        &self,
        name: &str,
    ) -> Result<(), ProviderError> {
        self.ec2
            .delete_placement_group()
            .group_name(name)
            .send()
            .await
            .map_err(aws_err)?;
        Ok(())
    }

    pub(in crate::aws) async fn list_instances(
        &self,
        scope: &LabelScope,
    ) -> Result<Vec<ObservedResource>, ProviderError> {
        let mut filters = filters(scope, ResourceKind::Instance);
        filters.push(
            Filter::builder()
                .name("instance-state-name")
                .set_values(Some(LIVE_STATES.iter().map(|s| (*s).to_string()).collect()))
                .build(),
        );

        let mut observed = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let resp = self
                .ec2
                .describe_instances()
                .set_filters(Some(filters.clone()))
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(aws_err)?;
            observed.extend(
                resp.reservations()
                    .iter()
                    .flat_map(|r| r.instances())
                    .filter_map(observe_instance),
            );
            match resp.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }
        Ok(observed)
    }

    pub(in crate::aws) async fn create_instance(
        &self,
        cluster: &str,
        spec: &ResourceSpec,
        tags: &TagMap,
    ) -> Result<String, ProviderError> {
        let ResourceConfig::Instance(c) = &spec.config else {
            return Err(mismatch(spec));
        };
        let (image_id, root_device) = self
            .find_image_details(&c.image)
            .await?
            .ok_or_else(|| {
                ProviderError::not_found(
                    module_path!(),
                    format!(
                        "no image named {} owned by {}",
                        c.image.name_pattern, c.image.owner
                    ),
                )
            })?;
        let subnet_id = self
            .lookup_id(cluster, ResourceKind::Subnet, &c.subnet)
            .await?;
        let groups = self.security_group_ids(cluster, &c.firewall_rules).await?;

        let mut request = self
            .ec2
            .run_instances()
            .image_id(image_id)
            .instance_type(InstanceType::from(c.machine_type.as_str()))
            .min_count(1)
            .max_count(1)
            .block_device_mappings(root_volume(&root_device, c.disk_gb))
            .network_interfaces(
                InstanceNetworkInterfaceSpecification::builder()
                    .device_index(0)
                    .subnet_id(subnet_id)
                    .associate_public_ip_address(c.public_ip)
                    .set_groups(Some(groups))
                    .delete_on_termination(true)
                    .build(),
            )
            .metadata_options(
                InstanceMetadataOptionsRequest::builder()
                    .http_tokens(HttpTokensState::Required)
                    .build(),
            )
            .tag_specifications(tag_spec(ResourceType::Instance, tags));
        if let Some(group) = &c.group {
            request = request.placement(Placement::builder().group_name(group).build());
        }
        if let Some(account) = &c.service_account {
            request = request.iam_instance_profile(
                IamInstanceProfileSpecification::builder()
                    .name(account)
                    .build(),
            );
        }
        if let Some(key) = &c.key_name {
            request = request.key_name(key);
        }

        let resp = request.send().await.map_err(aws_err)?;
        let instance_id = resp
            .instances()
            .first()
            .and_then(|i| i.instance_id())
            .ok_or_else(|| missing_id("RunInstances"))?
            .to_string();
        info!(
            instance = %spec.name,
            id = %instance_id,
            machine_type = %c.machine_type,
            "Launched instance"
        );
        Ok(instance_id)
    }

    async fn security_group_ids(
        &self,
        cluster: &str,
        names: &[String],
    ) -> Result<Vec<String>, ProviderError> {
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            ids.push(
                self.lookup_id(cluster, ResourceKind::FirewallRule, name)
                    .await?,
            );
        }
        Ok(ids)
    }

    /// Current state of one instance; `None` once it is terminated or unknown.
    async fn instance_state_of(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceStateName>, ProviderError> {
        let resp = match self
            .ec2
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(aws_err)
        {
            Ok(resp) => resp,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(resp
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .find_map(|i| i.state().and_then(|s| s.name()).cloned())
            .filter(|s| *s != InstanceStateName::Terminated))
    }

    /// Security groups are the only instance field changed in place; a new
    /// machine type or disk replaces the instance.
    pub(in crate::aws) async fn update_instance(
        &self,
        cluster: &str,
        current: &ObservedResource,
        actual: &InstanceConfig,
        desired: &InstanceConfig,
    ) -> Result<(), ProviderError> {
        if actual.firewall_rules == desired.firewall_rules {
            return Ok(());
        }
        let groups = self
            .security_group_ids(cluster, &desired.firewall_rules)
            .await?;
        self.ec2
            .modify_instance_attribute()
            .instance_id(&current.id)
            .set_groups(Some(groups))
            .send()
            .await
            .map_err(aws_err)?;
        Ok(())
    }

    pub(in crate::aws) async fn delete_instance(&self, instance_id: &str) -> Result<(), ProviderError> {
        self.ec2
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(aws_err)?;
        // Dependents (security groups, subnets, placement groups) stay in use
        // until termination completes.
        self.wait_for("instance termination", || async move {
            Ok(self.instance_state_of(instance_id).await?.is_none())
        })
        .await
    }

    pub(in crate::aws) async fn set_instance_power(
        &self,
        instance_id: &str,
        running: bool,
    ) -> Result<(), ProviderError> {
        if running {
            self.ec2
                .start_instances()
                .instance_ids(instance_id)
                .send()
                .await
                .map_err(aws_err)?;
        } else {
            self.ec2
                .stop_instances()
                .instance_ids(instance_id)
                .send()
                .await
                .map_err(aws_err)?;
        }
        debug!(instance = %instance_id, running, "Power state requested");
        Ok(())
    }

    /// `Name` tags of the given instance ids.
    pub(in crate::aws) async fn instance_names(
        &self,
        ids: Vec<String>,
    ) -> Result<HashMap<String, String>, ProviderError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let resp = self
            .ec2
            .describe_instances()
            .set_instance_ids(Some(ids))
            .send()
            .await
            .map_err(aws_err)?;
        Ok(resp
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .filter_map(|i| {
                let name = tag_map(i.tags()).remove(TAG_NAME)?;
                Some((i.instance_id()?.to_string(), name))
            })
            .collect())
    }

    pub(in crate::aws) async fn list_static_addresses(
        &self,
        scope: &LabelScope,
    ) -> Result<Vec<ObservedResource>, ProviderError> {
        let resp = self
            .ec2
            .describe_addresses()
            .set_filters(Some(filters(scope, ResourceKind::StaticAddress)))
            .send()
            .await
            .map_err(aws_err)?;

        let attached: Vec<String> = resp
            .addresses()
            .iter()
            .filter_map(|a| a.instance_id().map(str::to_string))
            .collect();
        let names = self.instance_names(attached).await?;

        Ok(resp
            .addresses()
            .iter()
            .filter_map(|address| {
                let mut observed = observe(
                    ResourceKind::StaticAddress,
                    address.allocation_id(),
                    address.tags(),
                )?;
                if let ResourceConfig::StaticAddress(c) = &mut observed.spec.config {
                    c.instance = address
                        .instance_id()
                        .map(|id| names.get(id).cloned().unwrap_or_else(|| id.to_string()));
                }
                observed.public_ip = address.public_ip().map(str::to_string);
                observed.private_ip = address.private_ip_address().map(str::to_string);
                Some(observed)
            })
            .collect())
    }

    pub(in crate::aws) async fn create_static_address(
        &self,
        cluster: &str,
        spec: &ResourceSpec,
        tags: &TagMap,
    ) -> Result<String, ProviderError> {
        let ResourceConfig::StaticAddress(c) = &spec.config else {
            return Err(mismatch(spec));
        };
        let resp = self
            .ec2
            .allocate_address()
            .domain(DomainType::Vpc)
            .tag_specifications(tag_spec(ResourceType::ElasticIp, tags))
            .send()
            .await
            .map_err(aws_err)?;
        let allocation_id = resp
            .allocation_id()
            .ok_or_else(|| missing_id("AllocateAddress"))?
            .to_string();

        if let Err(e) = self.associate(cluster, &allocation_id, c).await {
            // A retry allocates again; do not leave this copy behind.
            self.release_address(&allocation_id).await;
            return Err(e);
        }
        Ok(allocation_id)
    }

    async fn associate(
        &self,
        cluster: &str,
        allocation_id: &str,
        config: &StaticAddressConfig,
    ) -> Result<(), ProviderError> {
        let Some(instance) = &config.instance else {
            return Ok(());
        };
        let instance_id = self
            .lookup_id(cluster, ResourceKind::Instance, instance)
            .await?;
        self.ec2
            .associate_address()
            .allocation_id(allocation_id)
            .instance_id(instance_id)
            .send()
            .await
            .map_err(aws_err)?;
        Ok(())
    }

    async fn disassociate(&self, allocation_id: &str) -> Result<(), ProviderError> {
        let resp = self
            .ec2
            .describe_addresses()
            .allocation_ids(allocation_id)
            .send()
            .await
            .map_err(aws_err)?;
        for association_id in resp.addresses().iter().filter_map(|a| a.association_id()) {
            self.ec2
                .disassociate_address()
                .association_id(association_id)
                .send()
                .await
                .map_err(aws_err)?;
        }
        Ok(())
    }

    pub(in crate::aws) async fn update_static_address(
        &self,
        cluster: &str,
        current: &ObservedResource,
        desired: &StaticAddressConfig,
    ) -> Result<(), ProviderError> {
        self.disassociate(&current.id).await?;
        self.associate(cluster, &current.id, desired).await
    }

    pub(in crate::aws) async fn delete_static_address(
        &self,
        allocation_id: &str,
    ) -> Result<(), ProviderError> {
        self.disassociate(allocation_id).await?;
        self.ec2
            .release_address()
            .allocation_id(allocation_id)
            .send()
            .await
            .map_err(aws_err)?;
        Ok(())
    }
}
