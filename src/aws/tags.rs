//! Resource labels stored as AWS tags.
//!
//! Every label becomes a tag. The declared configuration is serialized to
//! JSON, base64 encoded and split across `kshape-spec-<n>` tags so it fits the
//! tag value limit and the character set every service accepts.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::warn;

use crate::error::ProviderError;
use crate::model::{
    LABEL_CLUSTER, ResourceConfig, ResourceKind, ResourceSpec, STATUS_LABEL_PREFIX,
};

pub const TAG_NAME: &str = "Name";
pub const TAG_KIND: &str = "kshape-kind";
pub const TAG_SPEC_PREFIX: &str = "kshape-spec-";

/// AWS tag value limit.
const CHUNK_LEN: usize = 256;
/// AWS allows 50 user tags per resource.
const MAX_TAGS: usize = 50;

pub type TagMap = BTreeMap<String, String>;

/// Tags describing `spec`.
pub fn encode(spec: &ResourceSpec) -> Result<TagMap, ProviderError> {
    let mut tags: TagMap = spec.labels.clone();
    tags.insert(TAG_NAME.to_string(), spec.name.clone());
    tags.insert(TAG_KIND.to_string(), spec.kind.as_str().to_string());

    let json = serde_json::to_vec(&spec.config).map_err(|e| {
        ProviderError::fatal(
            module_path!(),
            format!("serializing {}: {e}", spec.reference()),
        )
    })?;
    let encoded = STANDARD.encode(json);
    // base64 output is ASCII, so byte chunks are char boundaries.
    for (i, chunk) in encoded.as_bytes().chunks(CHUNK_LEN).enumerate() {
        tags.insert(
            format!("{TAG_SPEC_PREFIX}{i}"),
            String::from_utf8_lossy(chunk).into_owned(),
        );
    }

    if tags.len() > MAX_TAGS {
        return Err(ProviderError::fatal(
            module_path!(),
            format!(
                "{} needs {} tags, AWS allows {MAX_TAGS}",
                spec.reference(),
                tags.len()
            ),
        ));
    }
    Ok(tags)
}

/// Rebuild a spec from tags. `None` when the object is not a kshape resource
/// of `kind`.
pub fn decode(kind: ResourceKind, mut tags: TagMap) -> Option<ResourceSpec> {
    if tags.get(TAG_KIND).map(String::as_str) != Some(kind.as_str()) {
        return None;
    }
    tags.remove(TAG_KIND);
    let name = tags.remove(TAG_NAME)?;
    tags.get(LABEL_CLUSTER)?;

    let mut chunks: Vec<(usize, String)> = Vec::new();
    tags.retain(|k, v| {
        k.strip_prefix(TAG_SPEC_PREFIX)
            .and_then(|i| i.parse::<usize>().ok())
            .map_or(!k.starts_with("aws:"), |i| {
                chunks.push((i, std::mem::take(v)));
                false
            })
    });
    chunks.sort_by_key(|(i, _)| *i);
    let encoded: String = chunks.into_iter().map(|(_, v)| v).collect();

    let config = decode_config(&encoded).unwrap_or_else(|| {
        warn!(kind = %kind, resource = %name, "Declared configuration unreadable");
        ResourceConfig::Unknown
    });

    Some(ResourceSpec {
        kind,
        name,
        labels: tags,
        config,
    })
}

fn decode_config(encoded: &str) -> Option<ResourceConfig> {
    let json = STANDARD.decode(encoded).ok()?;
    serde_json::from_slice(&json).ok()
}

/// Tags to write and tags to remove to move an object from `current` to
/// `desired`. Status tags are never removed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TagChanges {
    pub set: TagMap,
    pub remove: Vec<String>,
}

impl TagChanges {
    pub fn between(current: &ResourceSpec, desired: &ResourceSpec) -> Result<Self, ProviderError> {
        let before = encode(current)?;
        let after = encode(desired)?;
        let set = after
            .iter()
            .filter(|(k, v)| before.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let remove = before
            .keys()
            .filter(|k| !after.contains_key(*k) && !k.starts_with(STATUS_LABEL_PREFIX))
            .cloned()
            .collect();
        Ok(Self { set, remove })
    }

    /// Set or clear one status tag.
    pub fn status(key: &str, value: Option<&str>) -> Self {
        let key = format!("{STATUS_LABEL_PREFIX}{key}");
        match value {
            Some(v) => Self {
                set: TagMap::from([(key, v.to_string())]),
                remove: Vec::new(),
            },
            None => Self {
                set: TagMap::new(),
                remove: vec![key],
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }

    /// Apply to a full tag set, for services that replace tags wholesale.
    pub fn apply_to(&self, tags: &mut TagMap) {
        for key in &self.remove {
            tags.remove(key);
        }
        tags.extend(self.set.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        BucketConfig, FirewallRuleConfig, IngressRule, NetworkConfig, ROLE_NETWORK,
    };

    fn network() -> ResourceSpec {
        ResourceSpec::new(
            ResourceKind::Network,
            "demo",
            "demo",
            ROLE_NETWORK,
            ResourceConfig::Network(NetworkConfig {
                cidr: "10.0.0.0/16".to_string(),
            }),
        )
    }

    #[test]
    fn test_encode_then_decode_restores_spec() {
        let spec = network();
        let tags = encode(&spec).unwrap();
        assert_eq!(tags.get(TAG_NAME).map(String::as_str), Some("demo"));
        assert_eq!(tags.get(TAG_KIND).map(String::as_str), Some("Network"));
        assert_eq!(tags.get("cluster").map(String::as_str), Some("demo"));
        assert_eq!(decode(ResourceKind::Network, tags), Some(spec));
    }

    #[test]
    fn test_large_config_spans_chunks() {
        let spec = ResourceSpec::new(
            ResourceKind::FirewallRule,
            "demo-nodes",
            "demo",
            ROLE_NETWORK,
            ResourceConfig::FirewallRule(FirewallRuleConfig {
                network: "demo".to_string(),
                description: "kshape demo cluster nodes".to_string(),
                ingress: (0..20)
                    .map(|i| IngressRule {
                        from_port: 1000 + i,
                        to_port: 1000 + i,
                        sources: vec![format!("10.{i}.0.0/16")],
                    })
                    .collect(),
            }),
        );
        let tags = encode(&spec).unwrap();
        let chunks = tags.keys().filter(|k| k.starts_with(TAG_SPEC_PREFIX)).count();
        assert!(chunks > 1);
        assert!(tags.values().all(|v| v.len() <= CHUNK_LEN));
        assert_eq!(decode(ResourceKind::FirewallRule, tags), Some(spec));
    }

    #[test]
    fn test_decode_rejects_other_kinds_and_unlabeled_objects() {
        let tags = encode(&network()).unwrap();
        assert_eq!(decode(ResourceKind::Subnet, tags.clone()), None);

        let mut unlabeled = tags;
        unlabeled.remove("cluster");
        assert_eq!(decode(ResourceKind::Network, unlabeled), None);
    }

    #[test]
    fn test_corrupt_config_decodes_as_unknown() {
        let mut tags = encode(&network()).unwrap();
        tags.insert(format!("{TAG_SPEC_PREFIX}0"), "not base64!".to_string());
        let spec = decode(ResourceKind::Network, tags).unwrap();
        assert_eq!(spec.config, ResourceConfig::Unknown);
        assert!(spec.labels.keys().all(|k| !k.starts_with(TAG_SPEC_PREFIX)));
    }

    #[test]
    fn test_aws_reserved_tags_are_not_labels() {
        let mut tags = encode(&network()).unwrap();
        tags.insert(
            "aws:cloudformation:stack-name".to_string(),
            "x".to_string(),
        );
        let spec = decode(ResourceKind::Network, tags).unwrap();
        assert_eq!(spec, network());
    }

    #[test]
    fn test_changes_keep_status_tags() {
        let current = network().with_label("kshape-status-phase", "Resources");
        let mut desired = network();
        desired.config = ResourceConfig::Network(NetworkConfig {
            cidr: "10.1.0.0/16".to_string(),
        });

        let changes = TagChanges::between(&current, &desired).unwrap();
        assert!(changes.set.contains_key(&format!("{TAG_SPEC_PREFIX}0")));
        assert!(!changes.remove.contains(&"kshape-status-phase".to_string()));
    }

    #[test]
    fn test_changes_drop_removed_labels() {
        let current = network().with_label("pool", "old");
        let changes = TagChanges::between(&current, &network()).unwrap();
        assert_eq!(changes.remove, vec!["pool".to_string()]);
        assert!(changes.set.is_empty());
    }

    #[test]
    fn test_status_changes_apply_to_full_set() {
        let spec = ResourceSpec::new(
            ResourceKind::Bucket,
            "kshape-demo-123456789012",
            "demo",
            "state",
            ResourceConfig::Bucket(BucketConfig { versioning: true }),
        );
        let mut tags = encode(&spec).unwrap();
        TagChanges::status("phase", Some("Resources")).apply_to(&mut tags);
        assert_eq!(
            tags.get("kshape-status-phase").map(String::as_str),
            Some("Resources")
        );
        TagChanges::status("phase", None).apply_to(&mut tags);
        assert!(!tags.contains_key("kshape-status-phase"));
    }
}
