//! Cluster add-ons installed after bootstrap.

use std::path::Path;

use tracing::info;

use crate::command::{CommandRunner, args};
use crate::config::Config;
use crate::error::KshapeError;
use crate::k8s;

const TRAEFIK_REPO: &str = "https://traefik.github.io/charts";

/// `helm` arguments installing or upgrading Traefik to the pinned version.
pub fn traefik_args(cfg: &Config, kubeconfig: &Path) -> Vec<String> {
    let kubeconfig = kubeconfig.to_string_lossy();
    args([
        "upgrade",
        "--install",
        "traefik",
        "traefik",
        "--repo",
        TRAEFIK_REPO,
        "--version",
        cfg.traefik_version.as_str(),
        "--namespace",
        cfg.traefik_namespace.as_str(),
        "--create-namespace",
        "--kubeconfig",
        kubeconfig.as_ref(),
        "--wait",
    ])
}

/// Install or upgrade Traefik. Running it again with the same version is a
/// no-op upgrade.
pub async fn update_traefik(
    runner: &dyn CommandRunner,
    cfg: &Config,
    kubeconfig: &Path,
) -> Result<(), KshapeError> {
    if !kubeconfig.is_file() {
        return Err(KshapeError::config(format!(
            "kubeconfig not found at {}, run get-credentials first",
            kubeconfig.display()
        )));
    }
    let output = runner.run("helm", &traefik_args(cfg, kubeconfig)).await?;
    if !output.success {
        return Err(KshapeError::bootstrap(format!(
            "helm upgrade traefik: {}",
            output.message()
        )));
    }
    info!(
        version = %cfg.traefik_version,
        namespace = %cfg.traefik_namespace,
        "Traefik installed"
    );
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageCheck {
    pub class: String,
    pub is_default: bool,
    pub default_class: Option<String>,
}

/// Check that the configured storage class exists in the cluster.
pub async fn verify_storage(cfg: &Config, kubeconfig: &Path) -> Result<StorageCheck, KshapeError> {
    let client = k8s::build_client(kubeconfig).await?;
    let classes = k8s::list_storage_classes(client).await?;
    check_storage(&cfg.storage_class, &classes)
}

fn check_storage(
    wanted: &str,
    classes: &[k8s_openapi::api::storage::v1::StorageClass],
) -> Result<StorageCheck, KshapeError> {
    let default_class = k8s::default_class(classes);
    if !classes
        .iter()
        .any(|c| c.metadata.name.as_deref() == Some(wanted))
    {
        let available: Vec<&str> = classes
            .iter()
            .filter_map(|c| c.metadata.name.as_deref())
            .collect();
        return Err(KshapeError::config(format!(
            "storage class {wanted} not found (available: {})",
            available.join(", ")
        )));
    }
    Ok(StorageCheck {
        class: wanted.to_string(),
        is_default: default_class.as_deref() == Some(wanted),
        default_class,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use crate::command::fake::FakeRunner;
    use crate::testing::test_config;
    use k8s_openapi::api::storage::v1::StorageClass;
    use kube::api::ObjectMeta;

    fn class(name: &str) -> StorageClass {
        StorageClass {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            provisioner: "ebs.csi.aws.com".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_traefik_args_pin_version() {
        let cfg = test_config();
        let argv = traefik_args(&cfg, Path::new("/tmp/demo/kubeconfig")).join(" ");
        assert!(argv.starts_with("upgrade --install traefik traefik"));
        assert!(argv.contains("--version 34.4.1"));
        assert!(argv.contains("--namespace traefik --create-namespace"));
        assert!(argv.contains("--kubeconfig /tmp/demo/kubeconfig"));
    }

    #[tokio::test]
    async fn test_update_traefik_requires_kubeconfig() {
        let cfg = test_config();
        let runner = FakeRunner::new();
        let err = update_traefik(&runner, &cfg, Path::new("/nonexistent/kubeconfig"))
            .await
            .unwrap_err();
        assert!(matches!(err, KshapeError::Configuration(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_update_traefik_reports_helm_failure() {
        let cfg = test_config();
        let tmp = tempfile::tempdir().unwrap();
        let kubeconfig = tmp.path().join("kubeconfig");
        std::fs::write(&kubeconfig, "apiVersion: v1").unwrap();
        let runner = FakeRunner::new();
        runner.respond("upgrade", CommandOutput::failed("UPGRADE FAILED: timed out"), 1);

        let err = update_traefik(&runner, &cfg, &kubeconfig).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        update_traefik(&runner, &cfg, &kubeconfig).await.unwrap();
        assert_eq!(runner.count("helm upgrade --install"), 2);
    }

    #[test]
    fn test_check_storage() {
        let classes = vec![class("gp2"), class("gp3")];
        let check = check_storage("gp3", &classes).unwrap();
        assert!(!check.is_default);
        assert!(check_storage("io2", &classes).is_err());
    }
}
