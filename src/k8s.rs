//! Kubernetes API access through the generated kubeconfig.

use std::path::Path;

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::Api;
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use tracing::debug;

use crate::error::KshapeError;

fn kube_error(context: &str, err: impl std::fmt::Display) -> KshapeError {
    KshapeError::bootstrap(format!("{context}: {err}"))
}

/// Build a client from a kubeconfig file, using its current context.
pub async fn build_client(kubeconfig: &Path) -> Result<kube::Client, KshapeError> {
    debug!(kubeconfig = %kubeconfig.display(), "Building Kubernetes client");
    let raw = Kubeconfig::read_from(kubeconfig)
        .map_err(|e| kube_error(&format!("reading {}", kubeconfig.display()), e))?;
    let config = kube::Config::from_custom_kubeconfig(raw, &KubeConfigOptions::default())
        .await
        .map_err(|e| kube_error("loading kubeconfig", e))?;
    kube::Client::try_from(config).map_err(|e| kube_error("building client", e))
}

/// Whether a node's `Ready` condition is `True`.
pub fn is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

pub async fn count_ready_nodes(client: kube::Client) -> Result<usize, KshapeError> {
    let nodes: Api<Node> = Api::all(client);
    let list = nodes
        .list(&ListParams::default())
        .await
        .map_err(|e| kube_error("listing nodes", e))?;
    Ok(list.items.iter().filter(|n| is_ready(n)).count())
}

/// Name of the storage class annotated as the cluster default, if any.
pub fn default_class(classes: &[StorageClass]) -> Option<String> {
    classes
        .iter()
        .find(|c| {
            c.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get("storageclass.kubernetes.io/is-default-class"))
                .is_some_and(|v| v == "true")
        })
        .and_then(|c| c.metadata.name.clone())
}

pub async fn list_storage_classes(client: kube::Client) -> Result<Vec<StorageClass>, KshapeError> {
    let classes: Api<StorageClass> = Api::all(client);
    let list = classes
        .list(&ListParams::default())
        .await
        .map_err(|e| kube_error("listing storage classes", e))?;
    Ok(list.items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn node(ready: &str) -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: ready.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn class(name: &str, default: bool) -> StorageClass {
        let annotations = default.then(|| {
            BTreeMap::from([(
                "storageclass.kubernetes.io/is-default-class".to_string(),
                "true".to_string(),
            )])
        });
        StorageClass {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations,
                ..Default::default()
            },
            provisioner: "ebs.csi.aws.com".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_is_ready() {
        assert!(is_ready(&node("True")));
        assert!(!is_ready(&node("False")));
        assert!(!is_ready(&Node::default()));
    }

    #[test]
    fn test_default_class() {
        let classes = vec![class("standard", false), class("gp3", true)];
        assert_eq!(default_class(&classes).as_deref(), Some("gp3"));
        assert_eq!(default_class(&classes[..1]), None);
    }
}
