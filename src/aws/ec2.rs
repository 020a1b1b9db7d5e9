//! EC2-backed kinds: network plumbing, firewalls and compute.

mod compute;
mod network;

use aws_sdk_ec2::types::{Filter, ResourceType, Tag, TagSpecification};
use tracing::debug;

use super::AwsProvider;
use super::tags::{self, TAG_KIND, TAG_NAME, TagChanges, TagMap};
use crate::error::ProviderError;
use crate::model::{ImageRef, LABEL_CLUSTER, ObservedResource, ResourceKind};
use crate::provider::LabelScope;

/// Describe filters selecting one kind within `scope`.
fn filters(scope: &LabelScope, kind: ResourceKind) -> Vec<Filter> {
    let owner = match scope {
        LabelScope::Cluster(name) => Filter::builder()
            .name(format!("tag:{LABEL_CLUSTER}"))
            .values(name)
            .build(),
        LabelScope::AnyCluster => Filter::builder().name("tag-key").values(LABEL_CLUSTER).build(),
    };
    vec![
        Filter::builder()
            .name(format!("tag:{TAG_KIND}"))
            .values(kind.as_str())
            .build(),
        owner,
    ]
}

fn tag_map(tags: &[Tag]) -> TagMap {
    tags.iter()
        .filter_map(|t| {
            Some((
                t.key()?.to_string(),
                t.value().unwrap_or_default().to_string(),
            ))
        })
        .collect()
}

fn to_tags(tags: &TagMap) -> Vec<Tag> {
    tags.iter()
        .map(|(k, v)| Tag::builder().key(k).value(v).build())
        .collect()
}

fn tag_spec(resource_type: ResourceType, tags: &TagMap) -> TagSpecification {
    TagSpecification::builder()
        .resource_type(resource_type)
        .set_tags(Some(to_tags(tags)))
        .build()
}

/// Name and cluster only, for helper objects that are not resources
/// themselves (internet gateways, NAT addresses).
fn helper_tags(tags: &TagMap, suffix: &str) -> TagMap {
    let mut helper = TagMap::new();
    if let Some(name) = tags.get(TAG_NAME) {
        helper.insert(TAG_NAME.to_string(), format!("{name}-{suffix}"));
    }
    if let Some(cluster) = tags.get(LABEL_CLUSTER) {
        helper.insert(LABEL_CLUSTER.to_string(), cluster.clone());
    }
    helper
}

fn observe(kind: ResourceKind, id: Option<&str>, tags: &[Tag]) -> Option<ObservedResource> {
    let spec = tags::decode(kind, tag_map(tags))?;
    Some(ObservedResource::new(id?, spec))
}

fn aws_err<E: std::error::Error>(err: E) -> ProviderError {
    ProviderError::aws(module_path!(), err)
}

fn missing_id(operation: &str) -> ProviderError {
    ProviderError::fatal(module_path!(), format!("{operation} returned no id"))
}

impl AwsProvider {
    pub(super) async fn tag_ec2(&self, id: &str, changes: &TagChanges) -> Result<(), ProviderError> {
        if !changes.set.is_empty() {
            self.ec2
                .create_tags()
                .resources(id)
                .set_tags(Some(to_tags(&changes.set)))
                .send()
                .await
                .map_err(aws_err)?;
        }
        if !changes.remove.is_empty() {
            self.ec2
                .delete_tags()
                .resources(id)
                .set_tags(Some(
                    changes
                        .remove
                        .iter()
                        .map(|k| Tag::builder().key(k).build())
                        .collect(),
                ))
                .send()
                .await
                .map_err(aws_err)?;
        }
        Ok(())
    }

    /// Newest available image matching `image`, with its root device name.
    pub(super) async fn find_image_details(
        &self,
        image: &ImageRef,
    ) -> Result<Option<(String, String)>, ProviderError> {
        let resp = self
            .ec2
            .describe_images()
            .owners(&image.owner)
            .filters(
                Filter::builder()
                    .name("name")
                    .values(&image.name_pattern)
                    .build(),
            )
            .filters(Filter::builder().name("state").values("available").build())
            .send()
            .await
            .map_err(aws_err)?;

        let newest = resp
            .images()
            .iter()
            .filter(|i| i.image_id().is_some())
            .max_by(|a, b| a.creation_date().cmp(&b.creation_date()));
        debug!(
            owner = %image.owner,
            pattern = %image.name_pattern,
            candidates = resp.images().len(),
            found = newest.is_some(),
            "Image lookup"
        );
        Ok(newest.map(|i| {
            (
                i.image_id().unwrap_or_default().to_string(),
                i.root_device_name().unwrap_or("/dev/xvda").to_string(),
            )
        }))
    }

    pub(super) async fn find_image(
        &self,
        image: &ImageRef,
    ) -> Result<Option<String>, ProviderError> {
        Ok(self.find_image_details(image).await?.map(|(id, _)| id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_select_kind_and_cluster() {
        let f = filters(&LabelScope::cluster("demo"), ResourceKind::Subnet);
        assert_eq!(f[0].name(), Some("tag:kshape-kind"));
        assert_eq!(f[0].values(), ["Subnet".to_string()]);
        assert_eq!(f[1].name(), Some("tag:cluster"));
        assert_eq!(f[1].values(), ["demo".to_string()]);
    }

    #[test]
    fn test_any_cluster_filters_on_tag_key() {
        let f = filters(&LabelScope::AnyCluster, ResourceKind::Instance);
        assert_eq!(f[1].name(), Some("tag-key"));
        assert_eq!(f[1].values(), ["cluster".to_string()]);
    }

    #[test]
    fn test_tag_map_skips_keyless_tags() {
        let tags = vec![
            Tag::builder().key("Name").value("demo").build(),
            Tag::builder().value("orphan").build(),
            Tag::builder().key("empty").build(),
        ];
        let map = tag_map(&tags);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("empty").map(String::as_str), Some(""));
    }

    #[test]
    fn test_helper_tags_carry_only_name_and_cluster() {
        let tags = TagMap::from([
            (TAG_NAME.to_string(), "demo".to_string()),
            (LABEL_CLUSTER.to_string(), "demo".to_string()),
            (TAG_KIND.to_string(), "Network".to_string()),
        ]);
        let helper = helper_tags(&tags, "igw");
        assert_eq!(helper.get(TAG_NAME).map(String::as_str), Some("demo-igw"));
        assert!(!helper.contains_key(TAG_KIND));
    }

    #[test]
    fn test_observe_requires_id() {
        let spec = crate::model::ResourceSpec::new(
            ResourceKind::Network,
            "demo",
            "demo",
            "network",
            crate::model::ResourceConfig::Network(crate::model::NetworkConfig {
                cidr: "10.0.0.0/16".to_string(),
            }),
        );
        let tags = to_tags(&tags::encode(&spec).unwrap());
        assert!(observe(ResourceKind::Network, None, &tags).is_none());
        let observed = observe(ResourceKind::Network, Some("vpc-1"), &tags).unwrap();
        assert_eq!(observed.id, "vpc-1");
        assert_eq!(observed.spec, spec);
    }
}
