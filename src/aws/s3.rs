//! State bucket and object storage.

use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, BucketVersioningStatus, CreateBucketConfiguration, Delete,
    ObjectIdentifier, PublicAccessBlockConfiguration, ServerSideEncryption, Tag, Tagging,
    VersioningConfiguration,
};
use tracing::{debug, info};

use super::tags::{self, TagChanges, TagMap};
use super::{AwsProvider, build_err, mismatch};
use crate::error::ProviderError;
use crate::model::{BucketConfig, ObservedResource, ResourceConfig, ResourceKind, ResourceSpec};

/// Every bucket kshape creates starts with this prefix; others are not
/// inspected.
const BUCKET_PREFIX: &str = "kshape-";
/// DeleteObjects accepts at most 1000 keys per call.
const DELETE_BATCH: usize = 1000;

fn aws_err<E: std::error::Error>(err: E) -> ProviderError {
    ProviderError::aws(module_path!(), err)
}

fn tagging(tags: &TagMap) -> Result<Tagging, ProviderError> {
    let tag_set = tags
        .iter()
        .map(|(k, v)| Tag::builder().key(k).value(v).build().map_err(build_err))
        .collect::<Result<Vec<_>, _>>()?;
    Tagging::builder()
        .set_tag_set(Some(tag_set))
        .build()
        .map_err(build_err)
}

/// `us-east-1` is the only region that rejects an explicit location constraint.
fn location(region: &str) -> Option<CreateBucketConfiguration> {
    (region != "us-east-1").then(|| {
        CreateBucketConfiguration::builder()
            .location_constraint(BucketLocationConstraint::from(region))
            .build()
    })
}

fn versioning(enabled: bool) -> VersioningConfiguration {
    let status = if enabled {
        BucketVersioningStatus::Enabled
    } else {
        BucketVersioningStatus::Suspended
    };
    VersioningConfiguration::builder().status(status).build()
}

impl AwsProvider {
    pub(super) async fn list_buckets(&self) -> Result<Vec<ObservedResource>, ProviderError> {
        let resp = self.s3.list_buckets().send().await.map_err(aws_err)?;
        let names: Vec<&str> = resp
            .buckets()
            .iter()
            .filter_map(|b| b.name())
            .filter(|n| n.starts_with(BUCKET_PREFIX))
            .collect();

        let mut observed = Vec::new();
        for name in names {
            let Some(tags) = self.bucket_tags(name).await? else {
                continue;
            };
            let Some(spec) = tags::decode(ResourceKind::Bucket, tags) else {
                continue;
            };
            let mut resource = ObservedResource::new(name, spec);
            let status = self
                .s3
                .get_bucket_versioning()
                .bucket(name)
                .send()
                .await
                .map_err(aws_err)?;
            if let ResourceConfig::Bucket(c) = &mut resource.spec.config {
                c.versioning = status.status() == Some(&BucketVersioningStatus::Enabled);
            }
            observed.push(resource);
        }
        Ok(observed)
    }

    /// Tags of a bucket; `None` when the bucket is untagged, gone or not
    /// readable from this region.
    async fn bucket_tags(&self, name: &str) -> Result<Option<TagMap>, ProviderError> {
        match self.s3.get_bucket_tagging().bucket(name).send().await {
            Ok(resp) => Ok(Some(
                resp.tag_set()
                    .iter()
                    .map(|t| (t.key().to_string(), t.value().to_string()))
                    .collect(),
            )),
            Err(e) => {
                let err = aws_err(e);
                if err.is_transient() {
                    return Err(err);
                }
                debug!(bucket = %name, error = %err, "Skipping bucket");
                Ok(None)
            }
        }
    }

    pub(super) async fn create_bucket(
        &self,
        spec: &ResourceSpec,
        tags: &TagMap,
    ) -> Result<String, ProviderError> {
        let ResourceConfig::Bucket(c) = &spec.config else {
            return Err(mismatch(spec));
        };
        let created = self
            .s3
            .create_bucket()
            .bucket(&spec.name)
            .set_create_bucket_configuration(location(&self.region))
            .send()
            .await
            .map_err(aws_err);
        match created {
            Ok(_) => info!(bucket = %spec.name, region = %self.region, "Created bucket"),
            // Ours from an interrupted run; tagging below fails if it is not.
            Err(e) if e.is_conflict() => debug!(bucket = %spec.name, "Bucket already exists"),
            Err(e) => return Err(e),
        }

        self.s3
            .put_public_access_block()
            .bucket(&spec.name)
            .public_access_block_configuration(
                PublicAccessBlockConfiguration::builder()
                    .block_public_acls(true)
                    .ignore_public_acls(true)
                    .block_public_policy(true)
                    .restrict_public_buckets(true)
                    .build(),
            )
            .send()
            .await
            .map_err(aws_err)?;
        if c.versioning {
            self.update_bucket(&spec.name, c).await?;
        }
        self.s3
            .put_bucket_tagging()
            .bucket(&spec.name)
            .tagging(tagging(tags)?)
            .send()
            .await
            .map_err(aws_err)?;
        Ok(spec.name.clone())
    }

    pub(super) async fn update_bucket(
        &self,
        name: &str,
        desired: &BucketConfig,
    ) -> Result<(), ProviderError> {
        self.s3
            .put_bucket_versioning()
            .bucket(name)
            .versioning_configuration(versioning(desired.versioning))
            .send()
            .await
            .map_err(aws_err)?;
        Ok(())
    }

    /// Delete every object version and delete marker, then the bucket.
    pub(super) async fn delete_bucket(&self, name: &str) -> Result<(), ProviderError> {
        let mut identifiers = Vec::new();
        let mut key_marker: Option<String> = None;
        let mut version_marker: Option<String> = None;
        loop {
            let resp = self
                .s3
                .list_object_versions()
                .bucket(name)
                .set_key_marker(key_marker.take())
                .set_version_id_marker(version_marker.take())
                .send()
                .await
                .map_err(aws_err)?;

            let versions = resp
                .versions()
                .iter()
                .map(|v| (v.key(), v.version_id()));
            let markers = resp
                .delete_markers()
                .iter()
                .map(|m| (m.key(), m.version_id()));
            for (key, version_id) in versions.chain(markers) {
                let Some(key) = key else {
                    continue;
                };
                identifiers.push(
                    ObjectIdentifier::builder()
                        .key(key)
                        .set_version_id(version_id.map(str::to_string))
                        .build()
                        .map_err(build_err)?,
                );
            }

            if resp.is_truncated().unwrap_or(false) {
                key_marker = resp.next_key_marker().map(str::to_string);
                version_marker = resp.next_version_id_marker().map(str::to_string);
            } else {
                break;
            }
        }

        debug!(bucket = %name, objects = identifiers.len(), "Emptying bucket");
        for batch in identifiers.chunks(DELETE_BATCH) {
            self.s3
                .delete_objects()
                .bucket(name)
                .delete(
                    Delete::builder()
                        .set_objects(Some(batch.to_vec()))
                        .quiet(true)
                        .build()
                        .map_err(build_err)?,
                )
                .send()
                .await
                .map_err(aws_err)?;
        }

        self.s3
            .delete_bucket()
            .bucket(name)
            .send()
            .await
            .map_err(aws_err)?;
        Ok(())
    }

    /// S3 replaces the tag set wholesale.
    pub(super) async fn tag_bucket(
        &self,
        name: &str,
        changes: &TagChanges,
    ) -> Result<(), ProviderError> {
        let mut tags = self.bucket_tags(name).await?.unwrap_or_default();
        changes.apply_to(&mut tags);
        self.s3
            .put_bucket_tagging()
            .bucket(name)
            .tagging(tagging(&tags)?)
            .send()
            .await
            .map_err(aws_err)?;
        Ok(())
    }

    pub(super) async fn s3_put(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
    ) -> Result<(), ProviderError> {
        let size = body.len();
        self.s3
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .server_side_encryption(ServerSideEncryption::Aes256)
            .send()
            .await
            .map_err(aws_err)?;
        debug!(bucket = %bucket, key = %key, size_bytes = size, "Uploaded object");
        Ok(())
    }

    pub(super) async fn s3_get(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<Vec<u8>>, ProviderError> {
        let resp = match self
            .s3
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(aws_err)
        {
            Ok(resp) => resp,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let data = resp.body.collect().await.map_err(aws_err)?;
        Ok(Some(data.into_bytes().to_vec()))
    }

    pub(super) async fn s3_list(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<String>, ProviderError> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            let resp = self
                .s3
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(aws_err)?;
            keys.extend(
                resp.contents()
                    .iter()
                    .filter_map(|o| o.key().map(str::to_string)),
            );
            if resp.is_truncated().unwrap_or(false) {
                continuation_token = resp.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }
        Ok(keys)
    }
}
