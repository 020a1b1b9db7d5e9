//! Generated cluster credentials on local disk and their remote backup.
//!
//! Files live under `<output_dir>/<cluster>/`. The backup copy lives in the
//! state bucket under `<cluster>/`, and is the recovery source for
//! `get-credentials`.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::KshapeError;
use crate::provider::ObjectStore;

pub const SECRETS: &str = "secrets.yaml";
pub const TALOSCONFIG: &str = "talosconfig";
pub const KUBECONFIG: &str = "kubeconfig";
pub const CONTROLPLANE_CONFIG: &str = "controlplane.yaml";
pub const WORKER_CONFIG: &str = "worker.yaml";

/// Every file that is backed up, in upload order.
pub const FILES: &[&str] = &[
    SECRETS,
    TALOSCONFIG,
    KUBECONFIG,
    CONTROLPLANE_CONFIG,
    WORKER_CONFIG,
];

#[derive(Debug, Clone)]
pub struct CredentialsDir {
    cluster: String,
    root: PathBuf,
}

impl CredentialsDir {
    pub fn new(output_dir: &Path, cluster: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            root: output_dir.join(cluster),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.root.join(file)
    }

    pub fn has(&self, file: &str) -> bool {
        self.path(file).is_file()
    }

    /// Object key of `file` in the state bucket.
    pub fn remote_key(&self, file: &str) -> String {
        format!("{}/{file}", self.cluster)
    }

    /// Create the directory, readable by the owner only.
    pub async fn ensure(&self) -> Result<(), KshapeError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| KshapeError::io(&self.root, &e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.root, std::fs::Permissions::from_mode(0o700))
                .await
                .map_err(|e| KshapeError::io(&self.root, &e))?;
        }
        Ok(())
    }
}

/// Upload every credential file present locally. Returns the uploaded keys.
pub async fn backup(
    store: &dyn ObjectStore,
    bucket: &str,
    dir: &CredentialsDir,
) -> Result<Vec<String>, KshapeError> {
    let mut uploaded = Vec::new();
    for file in FILES {
        let path = dir.path(file);
        if !path.is_file() {
            debug!(file = %path.display(), "Skipping missing credentials file");
            continue;
        }
        let body = tokio::fs::read(&path)
            .await
            .map_err(|e| KshapeError::io(&path, &e))?;
        let key = dir.remote_key(file);
        store
            .put_object(bucket, &key, body)
            .await
            .map_err(|e| KshapeError::provider(e, None))?;
        uploaded.push(key);
    }
    info!(bucket = %bucket, files = uploaded.len(), "Credentials backed up");
    Ok(uploaded)
}

/// Download backed-up credentials into `dir`.
///
/// Existing local files are kept unless `overwrite` is set. Returns the files
/// written.
pub async fn restore(
    store: &dyn ObjectStore,
    bucket: &str,
    dir: &CredentialsDir,
    overwrite: bool,
) -> Result<Vec<PathBuf>, KshapeError> {
    dir.ensure().await?;
    let mut written = Vec::new();
    for file in FILES {
        let path = dir.path(file);
        if path.is_file() && !overwrite {
            continue;
        }
        let body = store
            .get_object(bucket, &dir.remote_key(file))
            .await
            .map_err(|e| KshapeError::provider(e, None))?;
        let Some(body) = body else {
            continue;
        };
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| KshapeError::io(&path, &e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| KshapeError::io(&path, &e))?;
        }
        written.push(path);
    }
    info!(bucket = %bucket, files = written.len(), "Credentials restored");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::MemoryProvider;

    const BUCKET: &str = "kshape-demo-123456789012";

    #[tokio::test]
    async fn test_backup_uploads_present_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = CredentialsDir::new(tmp.path(), "demo");
        dir.ensure().await.unwrap();
        std::fs::write(dir.path(SECRETS), "cluster: secrets").unwrap();
        std::fs::write(dir.path(KUBECONFIG), "apiVersion: v1").unwrap();

        let store = MemoryProvider::new();
        let keys = backup(&store, BUCKET, &dir).await.unwrap();
        assert_eq!(keys, vec!["demo/secrets.yaml", "demo/kubeconfig"]);
        assert_eq!(
            store.object(BUCKET, "demo/secrets.yaml").unwrap(),
            b"cluster: secrets"
        );
    }

    #[tokio::test]
    async fn test_restore_writes_into_cluster_directory() {
        let store = MemoryProvider::new();
        store
            .put_object(BUCKET, "demo/talosconfig", b"context: demo".to_vec())
            .await
            .unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let dir = CredentialsDir::new(tmp.path(), "demo");
        let written = restore(&store, BUCKET, &dir, false).await.unwrap();

        assert_eq!(written, vec![tmp.path().join("demo").join("talosconfig")]);
        assert_eq!(
            std::fs::read_to_string(dir.path(TALOSCONFIG)).unwrap(),
            "context: demo"
        );
    }

    #[tokio::test]
    async fn test_restore_keeps_local_files_unless_overwrite() {
        let store = MemoryProvider::new();
        store
            .put_object(BUCKET, "demo/secrets.yaml", b"remote".to_vec())
            .await
            .unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let dir = CredentialsDir::new(tmp.path(), "demo");
        dir.ensure().await.unwrap();
        std::fs::write(dir.path(SECRETS), "local").unwrap();

        assert!(restore(&store, BUCKET, &dir, false).await.unwrap().is_empty());
        assert_eq!(std::fs::read_to_string(dir.path(SECRETS)).unwrap(), "local");

        restore(&store, BUCKET, &dir, true).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path(SECRETS)).unwrap(), "remote");
    }
}
