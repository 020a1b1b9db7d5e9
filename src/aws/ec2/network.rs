//! VPCs, subnets, NAT gateways, route tables and security groups.

use std::collections::BTreeSet;

use aws_sdk_ec2::types::{
    AttributeBooleanValue, DomainType, IpPermission, IpRange, NatGatewayState, ResourceType,
    SecurityGroup, SubnetState, VpcState,
};
use tracing::{debug, info, warn};

use super::{aws_err, filters, helper_tags, missing_id, observe, tag_spec};
use crate::aws::tags::TagMap;
use crate::aws::{AwsProvider, mismatch};
use crate::error::ProviderError;
use crate::model::{
    FirewallRuleConfig, IngressRule, ObservedResource, ResourceConfig, ResourceKind,
    ResourceSpec, ResourceState, RouterConfig, SubnetConfig,
};
use crate::provider::LabelScope;

const DEFAULT_ROUTE: &str = "0.0.0.0/0";

/// One TCP port range opened to one source.
type Permission = (u16, u16, String);

fn permissions(rules: &[IngressRule]) -> BTreeSet<Permission> {
    rules
        .iter()
        .flat_map(|r| {
            r.sources
                .iter()
                .map(move |s| (r.from_port, r.to_port, s.clone()))
        })
        .collect()
}

fn ip_permissions(permissions: &BTreeSet<Permission>) -> Vec<IpPermission> {
    permissions
        .iter()
        .map(|(from, to, source)| {
            IpPermission::builder()
                .ip_protocol("tcp")
                .from_port(i32::from(*from))
                .to_port(i32::from(*to))
                .ip_ranges(IpRange::builder().cidr_ip(source).build())
                .build()
        })
        .collect()
}

/// Ingress rules of a security group, grouped by port range. Non-TCP rules
/// and rules without IPv4 sources are ignored.
fn ingress_rules(group: &SecurityGroup) -> Vec<IngressRule> {
    let mut rules: Vec<IngressRule> = Vec::new();
    for p in group.ip_permissions() {
        if p.ip_protocol() != Some("tcp") {
            continue;
        }
        let port = |v: Option<i32>| v.and_then(|v| u16::try_from(v).ok()).unwrap_or(0);
        let (from_port, to_port) = (port(p.from_port()), port(p.to_port()));
        let sources: Vec<String> = p
            .ip_ranges()
            .iter()
            .filter_map(|r| r.cidr_ip().map(str::to_string))
            .collect();
        if sources.is_empty() {
            continue;
        }
        match rules
            .iter_mut()
            .find(|r| r.from_port == from_port && r.to_port == to_port)
        {
            Some(rule) => rule.sources.extend(sources),
            None => rules.push(IngressRule {
                from_port,
                to_port,
                sources,
            }),
        }
    }
    rules
}

impl AwsProvider {
    pub(in crate::aws) async fn list_networks(
        &self,
        scope: &LabelScope,
    ) -> Result<Vec<ObservedResource>, ProviderError> {
        let resp = self
            .ec2
            .describe_vpcs()
            .set_filters(Some(filters(scope, ResourceKind::Network)))
            .send()
            .await
            .map_err(aws_err)?;

        Ok(resp
            .vpcs()
            .iter()
            .filter_map(|vpc| {
                let mut observed = observe(ResourceKind::Network, vpc.vpc_id(), vpc.tags())?;
                if let (ResourceConfig::Network(c), Some(cidr)) =
                    (&mut observed.spec.config, vpc.cidr_block())
                {
                    c.cidr = cidr.to_string();
                }
                if vpc.state() != Some(&VpcState::Available) {
                    observed.state = ResourceState::Pending;
                }
                Some(observed)
            })
            .collect())
    }

    pub(in crate::aws) async fn create_network(
        &self,
        spec: &ResourceSpec,
        tags: &TagMap,
    ) -> Result<String, ProviderError> {
        let ResourceConfig::Network(c) = &spec.config else {
            return Err(mismatch(spec));
        };
        let resp = self
            .ec2
            .create_vpc()
            .cidr_block(&c.cidr)
            .tag_specifications(tag_spec(ResourceType::Vpc, tags))
            .send()
            .await
            .map_err(aws_err)?;
        let vpc_id = resp
            .vpc()
            .and_then(|v| v.vpc_id())
            .ok_or_else(|| missing_id("CreateVpc"))?
            .to_string();

        self.ec2
            .modify_vpc_attribute()
            .vpc_id(&vpc_id)
            .enable_dns_hostnames(AttributeBooleanValue::builder().value(true).build())
            .send()
            .await
            .map_err(aws_err)?;
        self.internet_gateway(&vpc_id, tags).await?;
        Ok(vpc_id)
    }

    /// Internet gateway attached to `vpc_id`, created and attached when missing.
    async fn internet_gateway(&self, vpc_id: &str, tags: &TagMap) -> Result<String, ProviderError> {
        let resp = self
            .ec2
            .describe_internet_gateways()
            .filters(
                aws_sdk_ec2::types::Filter::builder()
                    .name("attachment.vpc-id")
                    .values(vpc_id)
                    .build(),
            )
            .send()
            .await
            .map_err(aws_err)?;
        if let Some(id) = resp
            .internet_gateways()
            .iter()
            .find_map(|g| g.internet_gateway_id())
        {
            return Ok(id.to_string());
        }

        let resp = self
            .ec2
            .create_internet_gateway()
            .tag_specifications(tag_spec(
                ResourceType::InternetGateway,
                &helper_tags(tags, "igw"),
            ))
            .send()
            .await
            .map_err(aws_err)?;
        let igw_id = resp
            .internet_gateway()
            .and_then(|g| g.internet_gateway_id())
            .ok_or_else(|| missing_id("CreateInternetGateway"))?
            .to_string();
        self.ec2
            .attach_internet_gateway()
            .internet_gateway_id(&igw_id)
            .vpc_id(vpc_id)
            .send()
            .await
            .map_err(aws_err)?;
        info!(vpc = %vpc_id, gateway = %igw_id, "Attached internet gateway");
        Ok(igw_id)
    }

    pub(in crate::aws) async fn delete_network(&self, vpc_id: &str) -> Result<(), ProviderError> {
        let resp = self
            .ec2
            .describe_internet_gateways()
            .filters(
                aws_sdk_ec2::types::Filter::builder()
                    .name("attachment.vpc-id")
                    .values(vpc_id)
                    .build(),
            )
            .send()
            .await
            .map_err(aws_err)?;
        for igw_id in resp
            .internet_gateways()
            .iter()
            .filter_map(|g| g.internet_gateway_id())
        {
            self.ec2
                .detach_internet_gateway()
                .internet_gateway_id(igw_id)
                .vpc_id(vpc_id)
                .send()
                .await
                .map_err(aws_err)?;
            self.ec2
                .delete_internet_gateway()
                .internet_gateway_id(igw_id)
                .send()
                .await
                .map_err(aws_err)?;
            debug!(vpc = %vpc_id, gateway = %igw_id, "Deleted internet gateway");
        }

        self.ec2
            .delete_vpc()
            .vpc_id(vpc_id)
            .send()
            .await
            .map_err(aws_err)?;
        Ok(())
    }

    pub(in crate::aws) async fn list_subnets(
        &self,
        scope: &LabelScope,
    ) -> Result<Vec<ObservedResource>, ProviderError> {
        let resp = self
            .ec2
            .describe_subnets()
            .set_filters(Some(filters(scope, ResourceKind::Subnet)))
            .send()
            .await
            .map_err(aws_err)?;

        Ok(resp
            .subnets()
            .iter()
            .filter_map(|subnet| {
                let mut observed =
                    observe(ResourceKind::Subnet, subnet.subnet_id(), subnet.tags())?;
                if let ResourceConfig::Subnet(c) = &mut observed.spec.config {
                    if let Some(cidr) = subnet.cidr_block() {
                        c.cidr = cidr.to_string();
                    }
                    if let Some(zone) = subnet.availability_zone() {
                        c.zone = zone.to_string();
                    }
                    c.public = subnet.map_public_ip_on_launch().unwrap_or(false);
                }
                if subnet.state() != Some(&SubnetState::Available) {
                    observed.state = ResourceState::Pending;
                }
                Some(observed)
            })
            .collect())
    }

    pub(in crate::aws) async fn create_subnet(
        &self,
        cluster: &str,
        spec: &ResourceSpec,
        tags: &TagMap,
    ) -> Result<String, ProviderError> {
        let ResourceConfig::Subnet(c) = &spec.config else {
            return Err(mismatch(spec));
        };
        let vpc_id = self
            .lookup_id(cluster, ResourceKind::Network, &c.network)
            .await?;
        let resp = self
            .ec2
            .create_subnet()
            .vpc_id(vpc_id)
            .cidr_block(&c.cidr)
            .availability_zone(&c.zone)
            .tag_specifications(tag_spec(ResourceType::Subnet, tags))
            .send()
            .await
            .map_err(aws_err)?;
        let subnet_id = resp
            .subnet()
            .and_then(|s| s.subnet_id())
            .ok_or_else(|| missing_id("CreateSubnet"))?
            .to_string();
        if c.public {
            self.set_public_launch(&subnet_id, true).await?;
        }
        Ok(subnet_id)
    }

    async fn set_public_launch(&self, subnet_id: &str, public: bool) -> Result<(), ProviderError> {
        self.ec2
            .modify_subnet_attribute()
            .subnet_id(subnet_id)
            .map_public_ip_on_launch(AttributeBooleanValue::builder().value(public).build())
            .send()
            .await
            .map_err(aws_err)?;
        Ok(())
    }

    pub(in crate::aws) async fn update_subnet(
        &self,
        current: &ObservedResource,
        desired: &SubnetConfig,
    ) -> Result<(), ProviderError> {
        self.set_public_launch(&current.id, desired.public).await
    }

    pub(in crate::aws) async fn delete_subnet(&self, subnet_id: &str) -> Result<(), ProviderError> {
        self.ec2
            .delete_subnet()
            .subnet_id(subnet_id)
            .send()
            .await
            .map_err(aws_err)?;
        Ok(())
    }

    pub(in crate::aws) async fn list_nats(
        &self,
        scope: &LabelScope,
    ) -> Result<Vec<ObservedResource>, ProviderError> {
        let resp = self
            .ec2
            .describe_nat_gateways()
            .set_filter(Some(filters(scope, ResourceKind::Nat)))
            .send()
            .await
            .map_err(aws_err)?;

        Ok(resp
            .nat_gateways()
            .iter()
            .filter(|nat| nat.state() != Some(&NatGatewayState::Deleted))
            .filter_map(|nat| {
                let mut observed = observe(ResourceKind::Nat, nat.nat_gateway_id(), nat.tags())?;
                observed.state = match nat.state() {
                    Some(NatGatewayState::Available) => ResourceState::Available,
                    Some(NatGatewayState::Deleting) => ResourceState::Deleting,
                    Some(NatGatewayState::Failed) => ResourceState::Failed,
                    _ => ResourceState::Pending,
                };
                if let Some(address) = nat.nat_gateway_addresses().first() {
                    observed.public_ip = address.public_ip().map(str::to_string);
                    observed.private_ip = address.private_ip().map(str::to_string);
                }
                Some(observed)
            })
            .collect())
    }

    pub(in crate::aws) async fn create_nat(
        &self,
        cluster: &str,
        spec: &ResourceSpec,
        tags: &TagMap,
    ) -> Result<String, ProviderError> {
        let ResourceConfig::Nat(c) = &spec.config else {
            return Err(mismatch(spec));
        };
        let subnet_id = self
            .lookup_id(cluster, ResourceKind::Subnet, &c.subnet)
            .await?;

        // Not labeled as a StaticAddress; released together with the gateway.
        let address = self
            .ec2
            .allocate_address()
            .domain(DomainType::Vpc)
            .tag_specifications(tag_spec(ResourceType::ElasticIp, &helper_tags(tags, "eip")))
            .send()
            .await
            .map_err(aws_err)?;
        let allocation_id = address
            .allocation_id()
            .ok_or_else(|| missing_id("AllocateAddress"))?
            .to_string();

        let created = self
            .ec2
            .create_nat_gateway()
            .subnet_id(subnet_id)
            .allocation_id(&allocation_id)
            .tag_specifications(tag_spec(ResourceType::Natgateway, tags))
            .send()
            .await
            .map_err(aws_err);
        let resp = match created {
            Ok(resp) => resp,
            Err(e) => {
                self.release_address(&allocation_id).await;
                return Err(e);
            }
        };
        Ok(resp
            .nat_gateway()
            .and_then(|n| n.nat_gateway_id())
            .ok_or_else(|| missing_id("CreateNatGateway"))?
            .to_string())
    }

    /// Best-effort release of an elastic IP.
    pub(super) async fn release_address(&self, allocation_id: &str) {
        if let Err(e) = self
            .ec2
            .release_address()
            .allocation_id(allocation_id)
            .send()
            .await
        {
            warn!(
                allocation = %allocation_id,
                error = %ProviderError::aws(module_path!(), e),
                "Failed to release elastic IP"
            );
        }
    }

    pub(in crate::aws) async fn delete_nat(&self, nat_id: &str) -> Result<(), ProviderError> {
        let resp = self
            .ec2
            .describe_nat_gateways()
            .nat_gateway_ids(nat_id)
            .send()
            .await
            .map_err(aws_err)?;
        let allocations: Vec<String> = resp
            .nat_gateways()
            .iter()
            .flat_map(|n| n.nat_gateway_addresses())
            .filter_map(|a| a.allocation_id().map(str::to_string))
            .collect();

        self.ec2
            .delete_nat_gateway()
            .nat_gateway_id(nat_id)
            .send()
            .await
            .map_err(aws_err)?;

        // The address stays associated until the gateway is fully deleted.
        self.wait_for("NAT gateway deletion", || async move {
            let resp = self
                .ec2
                .describe_nat_gateways()
                .nat_gateway_ids(nat_id)
                .send()
                .await
                .map_err(aws_err)?;
            Ok(resp
                .nat_gateways()
                .iter()
                .all(|n| n.state() == Some(&NatGatewayState::Deleted)))
        })
        .await?;

        for allocation_id in &allocations {
            self.release_address(allocation_id).await;
        }
        Ok(())
    }

    pub(in crate::aws) async fn list_routers(
        &self,
        scope: &LabelScope,
    ) -> Result<Vec<ObservedResource>, ProviderError> {
        let resp = self
            .ec2
            .describe_route_tables()
            .set_filters(Some(filters(scope, ResourceKind::Router)))
            .send()
            .await
            .map_err(aws_err)?;

        Ok(resp
            .route_tables()
            .iter()
            .filter_map(|table| {
                let mut observed =
                    observe(ResourceKind::Router, table.route_table_id(), table.tags())?;
                let has_default = table.routes().iter().any(|r| {
                    r.destination_cidr_block() == Some(DEFAULT_ROUTE)
                        && r.state().map(|s| s.as_str()) != Some("blackhole")
                });
                if !has_default {
                    // A table without a usable default route needs rebuilding.
                    observed.state = ResourceState::Failed;
                }
                Some(observed)
            })
            .collect())
    }

    pub(in crate::aws) async fn create_router(
        &self,
        cluster: &str,
        spec: &ResourceSpec,
        tags: &TagMap,
    ) -> Result<String, ProviderError> {
        let ResourceConfig::Router(c) = &spec.config else {
            return Err(mismatch(spec));
        };
        let vpc_id = self
            .lookup_id(cluster, ResourceKind::Network, &c.network)
            .await?;
        let subnet_id = self
            .lookup_id(cluster, ResourceKind::Subnet, &c.subnet)
            .await?;

        let resp = self
            .ec2
            .create_route_table()
            .vpc_id(&vpc_id)
            .tag_specifications(tag_spec(ResourceType::RouteTable, tags))
            .send()
            .await
            .map_err(aws_err)?;
        let table_id = resp
            .route_table()
            .and_then(|t| t.route_table_id())
            .ok_or_else(|| missing_id("CreateRouteTable"))?
            .to_string();

        self.default_route(cluster, &table_id, &vpc_id, c, tags, false)
            .await?;
        self.ec2
            .associate_route_table()
            .route_table_id(&table_id)
            .subnet_id(subnet_id)
            .send()
            .await
            .map_err(aws_err)?;
        Ok(table_id)
    }

    /// Point the default route of `table_id` at the NAT gateway or the
    /// internet gateway.
    async fn default_route(
        &self,
        cluster: &str,
        table_id: &str,
        vpc_id: &str,
        config: &RouterConfig,
        tags: &TagMap,
        replace: bool,
    ) -> Result<(), ProviderError> {
        let (nat_id, gateway_id) = match &config.via_nat {
            Some(nat) => (
                Some(self.lookup_id(cluster, ResourceKind::Nat, nat).await?),
                None,
            ),
            None => (None, Some(self.internet_gateway(vpc_id, tags).await?)),
        };

        if replace {
            let replaced = self
                .ec2
                .replace_route()
                .route_table_id(table_id)
                .destination_cidr_block(DEFAULT_ROUTE)
                .set_nat_gateway_id(nat_id.clone())
                .set_gateway_id(gateway_id.clone())
                .send()
                .await
                .map_err(aws_err);
            match replaced {
                Ok(_) => return Ok(()),
                Err(e) if e.is_not_found() => {
                    debug!(table = %table_id, "No default route to replace");
                }
                Err(e) => return Err(e),
            }
        }

        self.ec2
            .create_route()
            .route_table_id(table_id)
            .destination_cidr_block(DEFAULT_ROUTE)
            .set_nat_gateway_id(nat_id)
            .set_gateway_id(gateway_id)
            .send()
            .await
            .map_err(aws_err)?;
        Ok(())
    }

    pub(in crate::aws) async fn update_router(
        &self,
        cluster: &str,
        current: &ObservedResource,
        actual: &RouterConfig,
        desired: &RouterConfig,
    ) -> Result<(), ProviderError> {
        if actual.via_nat != desired.via_nat {
            let vpc_id = self
                .lookup_id(cluster, ResourceKind::Network, &desired.network)
                .await?;
            let tags = crate::aws::tags::encode(&current.spec)?;
            self.default_route(cluster, &current.id, &vpc_id, desired, &tags, true)
                .await?;
        }

        if actual.subnet != desired.subnet {
            self.disassociate_route_table(&current.id).await?;
            let subnet_id = self
                .lookup_id(cluster, ResourceKind::Subnet, &desired.subnet)
                .await?;
            self.ec2
                .associate_route_table()
                .route_table_id(&current.id)
                .subnet_id(subnet_id)
                .send()
                .await
                .map_err(aws_err)?;
        }
        Ok(())
    }

    async fn disassociate_route_table(&self, table_id: &str) -> Result<(), ProviderError> {
        let resp = self
            .ec2
            .describe_route_tables()
            .route_table_ids(table_id)
            .send()
            .await
            .map_err(aws_err)?;
        let associations: Vec<String> = resp
            .route_tables()
            .iter()
            .flat_map(|t| t.associations())
            .filter(|a| !a.main().unwrap_or(false))
            .filter_map(|a| a.route_table_association_id().map(str::to_string))
            .collect();
        for association_id in associations {
            self.ec2
                .disassociate_route_table()
                .association_id(association_id)
                .send()
                .await
                .map_err(aws_err)?;
        }
        Ok(())
    }

    pub(in crate::aws) async fn delete_router(&self, table_id: &str) -> Result<(), ProviderError> {
        self.disassociate_route_table(table_id).await?;
        self.ec2
            .delete_route_table()
            .route_table_id(table_id)
            .send()
            .await
            .map_err(aws_err)?;
        Ok(())
    }

    pub(in crate::aws) async fn list_firewall_rules(
        &self,
        scope: &LabelScope,
    ) -> Result<Vec<ObservedResource>, ProviderError> {
        let resp = self
            .ec2
            .describe_security_groups()
            .set_filters(Some(filters(scope, ResourceKind::FirewallRule)))
            .send()
            .await
            .map_err(aws_err)?;

        Ok(resp
            .security_groups()
            .iter()
            .filter_map(|group| {
                let mut observed =
                    observe(ResourceKind::FirewallRule, group.group_id(), group.tags())?;
                if let ResourceConfig::FirewallRule(c) = &mut observed.spec.config {
                    c.ingress = ingress_rules(group);
                    if let Some(description) = group.description() {
                        c.description = description.to_string();
                    }
                }
                Some(observed)
            })
            .collect())
    }

    pub(in crate::aws) async fn create_firewall_rule(
        &self,
        cluster: &str,
        spec: &ResourceSpec,
        tags: &TagMap,
    ) -> Result<String, ProviderError> {
        let ResourceConfig::FirewallRule(c) = &spec.config else {
            return Err(mismatch(spec));
        };
        let vpc_id = self
            .lookup_id(cluster, ResourceKind::Network, &c.network)
            .await?;
        let resp = self
            .ec2
            .create_security_group()
            .group_name(&spec.name)
            .description(&c.description)
            .vpc_id(vpc_id)
            .tag_specifications(tag_spec(ResourceType::SecurityGroup, tags))
            .send()
            .await
            .map_err(aws_err)?;
        let group_id = resp
            .group_id()
            .ok_or_else(|| missing_id("CreateSecurityGroup"))?
            .to_string();

        let wanted = permissions(&c.ingress);
        if !wanted.is_empty() {
            self.ec2
                .authorize_security_group_ingress()
                .group_id(&group_id)
                .set_ip_permissions(Some(ip_permissions(&wanted)))
                .send()
                .await
                .map_err(aws_err)?;
        }
        Ok(group_id)
    }

    /// Revoke what is no longer declared and authorize what is missing, so
    /// unchanged permissions stay in place throughout.
    pub(in crate::aws) async fn update_firewall_rule(
        &self,
        current: &ObservedResource,
        desired: &FirewallRuleConfig,
    ) -> Result<(), ProviderError> {
        let ResourceConfig::FirewallRule(actual) = &current.spec.config else {
            return Err(mismatch(&current.spec));
        };
        let have = permissions(&actual.ingress);
        let want = permissions(&desired.ingress);

        let stale: BTreeSet<Permission> = have.difference(&want).cloned().collect();
        let missing: BTreeSet<Permission> = want.difference(&have).cloned().collect();
        debug!(
            group = %current.id,
            revoke = stale.len(),
            authorize = missing.len(),
            "Syncing ingress"
        );

        if !stale.is_empty() {
            self.ec2
                .revoke_security_group_ingress()
                .group_id(&current.id)
                .set_ip_permissions(Some(ip_permissions(&stale)))
                .send()
                .await
                .map_err(aws_err)?;
        }
        if !missing.is_empty() {
            self.ec2
                .authorize_security_group_ingress()
                .group_id(&current.id)
                .set_ip_permissions(Some(ip_permissions(&missing)))
                .send()
                .await
                .map_err(aws_err)?;
        }
        Ok(())
    }

    pub(in crate::aws) async fn delete_firewall_rule(
        &self,
        group_id: &str,
    ) -> Result<(), ProviderError> {
        self.ec2
            .delete_security_group()
            .group_id(group_id)
            .send()
            .await
            .map_err(aws_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(from: u16, to: u16, sources: &[&str]) -> IngressRule {
        IngressRule {
            from_port: from,
            to_port: to,
            sources: sources.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn test_permissions_flatten_sources() {
        let p = permissions(&[
            rule(6443, 6443, &["10.0.0.0/8", "192.168.0.0/16"]),
            rule(50000, 50001, &["10.0.0.0/16"]),
        ]);
        assert_eq!(p.len(), 3);
        assert!(p.contains(&(6443, 6443, "192.168.0.0/16".to_string())));
    }

    #[test]
    fn test_ingress_rules_group_by_port_range() {
        let group = SecurityGroup::builder()
            .ip_permissions(
                IpPermission::builder()
                    .ip_protocol("tcp")
                    .from_port(6443)
                    .to_port(6443)
                    .ip_ranges(IpRange::builder().cidr_ip("10.0.0.0/8").build())
                    .build(),
            )
            .ip_permissions(
                IpPermission::builder()
                    .ip_protocol("tcp")
                    .from_port(6443)
                    .to_port(6443)
                    .ip_ranges(IpRange::builder().cidr_ip("192.168.0.0/16").build())
                    .build(),
            )
            .ip_permissions(
                IpPermission::builder()
                    .ip_protocol("-1")
                    .ip_ranges(IpRange::builder().cidr_ip("0.0.0.0/0").build())
                    .build(),
            )
            .build();

        let rules = ingress_rules(&group);
        assert_eq!(
            rules,
            vec![rule(6443, 6443, &["10.0.0.0/8", "192.168.0.0/16"])]
        );
    }

    #[test]
    fn test_ip_permissions_are_tcp() {
        let p = ip_permissions(&permissions(&[rule(0, 65535, &["10.0.0.0/16"])]));
        assert_eq!(p.len(), 1);
        assert_eq!(p[0].ip_protocol(), Some("tcp"));
        assert_eq!(p[0].from_port(), Some(0));
        assert_eq!(p[0].to_port(), Some(65535));
    }
}
