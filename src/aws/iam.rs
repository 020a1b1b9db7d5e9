//! IAM roles and instance profiles backing service accounts.

use std::collections::BTreeSet;

use aws_sdk_iam::types::{Role, Tag};
use serde_json::json;
use tracing::{debug, info};

use super::tags::{self, TagChanges, TagMap};
use super::{AwsProvider, build_err, mismatch};
use crate::error::ProviderError;
use crate::model::{
    ObservedResource, ResourceConfig, ResourceKind, ResourceSpec, ResourceState,
    ServiceAccountConfig,
};
use crate::provider::LabelScope;

const PATH_ROOT: &str = "/kshape/";
const INLINE_POLICY: &str = "kshape-inline";
const EC2_SERVICE: &str = "ec2.amazonaws.com";

fn aws_err<E: std::error::Error>(err: E) -> ProviderError {
    ProviderError::aws(module_path!(), err)
}

fn path_of(scope: &LabelScope) -> String {
    match scope {
        LabelScope::Cluster(name) => format!("{PATH_ROOT}{name}/"),
        LabelScope::AnyCluster => PATH_ROOT.to_string(),
    }
}

fn to_tags(tags: &TagMap) -> Result<Vec<Tag>, ProviderError> {
    tags.iter()
        .map(|(k, v)| Tag::builder().key(k).value(v).build().map_err(build_err))
        .collect()
}

fn trust_policy(service: &str) -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": service },
            "Action": "sts:AssumeRole",
        }],
    })
    .to_string()
}

fn inline_policy(actions: &[String]) -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Action": actions,
            "Resource": "*",
        }],
    })
    .to_string()
}

/// Treat "not found" as done; used on the delete path.
fn ignore_missing(result: Result<(), ProviderError>) -> Result<(), ProviderError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

impl AwsProvider {
    pub(super) async fn list_service_accounts(
        &self,
        scope: &LabelScope,
    ) -> Result<Vec<ObservedResource>, ProviderError> {
        let mut roles: Vec<Role> = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let resp = self
                .iam
                .list_roles()
                .path_prefix(path_of(scope))
                .set_marker(marker.take())
                .send()
                .await
                .map_err(aws_err)?;
            roles.extend(resp.roles().iter().cloned());
            if resp.is_truncated() {
                marker = resp.marker().map(str::to_string);
            } else {
                break;
            }
        }

        let mut observed = Vec::new();
        for role in &roles {
            let name = role.role_name();
            let resp = self
                .iam
                .list_role_tags()
                .role_name(name)
                .send()
                .await
                .map_err(aws_err)?;
            let tags: TagMap = resp
                .tags()
                .iter()
                .map(|t| (t.key().to_string(), t.value().to_string()))
                .collect();
            let Some(spec) = tags::decode(ResourceKind::ServiceAccount, tags) else {
                continue;
            };
            let mut resource = ObservedResource::new(role.arn(), spec);

            let attached = self.attached_policies(name).await?;
            let needs_profile = match &mut resource.spec.config {
                ResourceConfig::ServiceAccount(c) => {
                    c.managed_policies = attached.into_iter().collect();
                    c.trusted_service == EC2_SERVICE
                }
                _ => false,
            };
            if needs_profile && !self.has_instance_profile(name).await? {
                // Instances cannot use the role without it.
                resource.state = ResourceState::Failed;
            }
            observed.push(resource);
        }
        Ok(observed)
    }

    async fn attached_policies(&self, role: &str) -> Result<BTreeSet<String>, ProviderError> {
        let resp = self
            .iam
            .list_attached_role_policies()
            .role_name(role)
            .send()
            .await
            .map_err(aws_err)?;
        Ok(resp
            .attached_policies()
            .iter()
            .filter_map(|p| p.policy_arn().map(str::to_string))
            .collect())
    }

    /// Whether the instance profile of the same name exists and holds the role.
    async fn has_instance_profile(&self, role: &str) -> Result<bool, ProviderError> {
        match self
            .iam
            .get_instance_profile()
            .instance_profile_name(role)
            .send()
            .await
            .map_err(aws_err)
        {
            Ok(resp) => Ok(resp
                .instance_profile()
                .is_some_and(|p| p.roles().iter().any(|r| r.role_name() == role))),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub(super) async fn create_service_account(
        &self,
        cluster: &str,
        spec: &ResourceSpec,
        tags: &TagMap,
    ) -> Result<String, ProviderError> {
        let ResourceConfig::ServiceAccount(c) = &spec.config else {
            return Err(mismatch(spec));
        };
        let path = path_of(&LabelScope::cluster(cluster));

        let arn = match self
            .iam
            .create_role()
            .role_name(&spec.name)
            .path(&path)
            .assume_role_policy_document(trust_policy(&c.trusted_service))
            .set_tags(Some(to_tags(tags)?))
            .send()
            .await
            .map_err(aws_err)
        {
            Ok(resp) => resp.role().map(|r| r.arn().to_string()),
            Err(e) if e.is_conflict() => {
                // Left behind by an interrupted run: claim it.
                debug!(role = %spec.name, "Role already exists");
                self.iam
                    .tag_role()
                    .role_name(&spec.name)
                    .set_tags(Some(to_tags(tags)?))
                    .send()
                    .await
                    .map_err(aws_err)?;
                let resp = self
                    .iam
                    .get_role()
                    .role_name(&spec.name)
                    .send()
                    .await
                    .map_err(aws_err)?;
                resp.role().map(|r| r.arn().to_string())
            }
            Err(e) => return Err(e),
        }
        .ok_or_else(|| ProviderError::fatal(module_path!(), "CreateRole returned no role"))?;

        for policy in &c.managed_policies {
            self.iam
                .attach_role_policy()
                .role_name(&spec.name)
                .policy_arn(policy)
                .send()
                .await
                .map_err(aws_err)?;
        }
        self.sync_inline_policy(&spec.name, &c.inline_actions)
            .await?;
        if c.trusted_service == EC2_SERVICE {
            self.ensure_instance_profile(&spec.name, &path).await?;
        }
        info!(role = %spec.name, arn = %arn, "Created service account");
        Ok(arn)
    }

    async fn ensure_instance_profile(&self, name: &str, path: &str) -> Result<(), ProviderError> {
        if self.has_instance_profile(name).await? {
            return Ok(());
        }
        match self
            .iam
            .create_instance_profile()
            .instance_profile_name(name)
            .path(path)
            .send()
            .await
            .map_err(aws_err)
        {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {}
            Err(e) => return Err(e),
        }
        self.iam
            .add_role_to_instance_profile()
            .instance_profile_name(name)
            .role_name(name)
            .send()
            .await
            .map_err(aws_err)?;
        Ok(())
    }

    async fn sync_inline_policy(&self, role: &str, actions: &[String]) -> Result<(), ProviderError> {
        if actions.is_empty() {
            return ignore_missing(
                self.iam
                    .delete_role_policy()
                    .role_name(role)
                    .policy_name(INLINE_POLICY)
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(aws_err),
            );
        }
        self.iam
            .put_role_policy()
            .role_name(role)
            .policy_name(INLINE_POLICY)
            .policy_document(inline_policy(actions))
            .send()
            .await
            .map_err(aws_err)?;
        Ok(())
    }

    pub(super) async fn update_service_account(
        &self,
        name: &str,
        actual: &ServiceAccountConfig,
        desired: &ServiceAccountConfig,
    ) -> Result<(), ProviderError> {
        let have: BTreeSet<&String> = actual.managed_policies.iter().collect();
        let want: BTreeSet<&String> = desired.managed_policies.iter().collect();

        for policy in want.difference(&have) {
            self.iam
                .attach_role_policy()
                .role_name(name)
                .policy_arn(*policy)
                .send()
                .await
                .map_err(aws_err)?;
        }
        for policy in have.difference(&want) {
            ignore_missing(
                self.iam
                    .detach_role_policy()
                    .role_name(name)
                    .policy_arn(*policy)
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(aws_err),
            )?;
        }
        self.sync_inline_policy(name, &desired.inline_actions).await
    }

    pub(super) async fn delete_service_account(&self, name: &str) -> Result<(), ProviderError> {
        if self.has_instance_profile(name).await? {
            self.iam
                .remove_role_from_instance_profile()
                .instance_profile_name(name)
                .role_name(name)
                .send()
                .await
                .map_err(aws_err)?;
        }
        ignore_missing(
            self.iam
                .delete_instance_profile()
                .instance_profile_name(name)
                .send()
                .await
                .map(|_| ())
                .map_err(aws_err),
        )?;

        for policy in self.attached_policies(name).await? {
            self.iam
                .detach_role_policy()
                .role_name(name)
                .policy_arn(policy)
                .send()
                .await
                .map_err(aws_err)?;
        }
        let inline = self
            .iam
            .list_role_policies()
            .role_name(name)
            .send()
            .await
            .map_err(aws_err)?;
        for policy in inline.policy_names() {
            self.iam
                .delete_role_policy()
                .role_name(name)
                .policy_name(policy)
                .send()
                .await
                .map_err(aws_err)?;
        }

        self.iam
            .delete_role()
            .role_name(name)
            .send()
            .await
            .map_err(aws_err)?;
        Ok(())
    }

    pub(super) async fn tag_role(&self, name: &str, changes: &TagChanges) -> Result<(), ProviderError> {
        if !changes.set.is_empty() {
            self.iam
                .tag_role()
                .role_name(name)
                .set_tags(Some(to_tags(&changes.set)?))
                .send()
                .await
                .map_err(aws_err)?;
        }
        if !changes.remove.is_empty() {
            self.iam
                .untag_role()
                .role_name(name)
                .set_tag_keys(Some(changes.remove.clone()))
                .send()
                .await
                .map_err(aws_err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_per_cluster() {
        assert_eq!(path_of(&LabelScope::cluster("demo")), "/kshape/demo/");
        assert_eq!(path_of(&LabelScope::AnyCluster), "/kshape/");
    }

    #[test]
    fn test_trust_policy_names_service() {
        let doc: serde_json::Value = serde_json::from_str(&trust_policy(EC2_SERVICE)).unwrap();
        assert_eq!(
            doc["Statement"][0]["Principal"]["Service"],
            "ec2.amazonaws.com"
        );
        assert_eq!(doc["Statement"][0]["Action"], "sts:AssumeRole");
    }

    #[test]
    fn test_inline_policy_lists_actions() {
        let actions = vec![
            "ec2:StartInstances".to_string(),
            "ec2:StopInstances".to_string(),
        ];
        let doc: serde_json::Value = serde_json::from_str(&inline_policy(&actions)).unwrap();
        assert_eq!(doc["Statement"][0]["Action"][1], "ec2:StopInstances");
        assert_eq!(doc["Statement"][0]["Resource"], "*");
    }

    #[test]
    fn test_ignore_missing() {
        assert!(ignore_missing(Err(ProviderError::not_found("iam", "role"))).is_ok());
        assert!(ignore_missing(Err(ProviderError::fatal("iam", "boom"))).is_err());
    }
}
