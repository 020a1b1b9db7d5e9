//! Phase marker stored as status labels on the cluster's state bucket.
//!
//! The bucket is created by the first phase, so a cluster without one has not
//! completed anything yet.

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::compiler::Naming;
use crate::error::KshapeError;
use crate::model::{ObservedResource, ResourceKind};
use crate::phases::Phase;
use crate::provider::CloudProvider;
use crate::reader;

pub const PHASE_KEY: &str = "phase";
pub const FAILED_KEY: &str = "failed";
pub const UPDATED_KEY: &str = "updated";

/// Progress recorded for one cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseMarker {
    /// Last phase that finished successfully.
    pub completed: Option<Phase>,
    /// `(phase, reason)` of the last failure, cleared on the next success.
    pub failure: Option<(Phase, String)>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PhaseMarker {
    pub fn from_labels(bucket: &ObservedResource) -> Self {
        let completed = bucket
            .status_label(PHASE_KEY)
            .and_then(|v| v.parse::<Phase>().ok());
        let failure = bucket.status_label(FAILED_KEY).and_then(parse_failure);
        let updated_at = bucket
            .status_label(UPDATED_KEY)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc));
        Self {
            completed,
            failure,
            updated_at,
        }
    }

    /// First phase that has not completed, `None` when the cluster is ready.
    pub fn next(&self) -> Option<Phase> {
        match self.completed {
            None => Some(Phase::Resources),
            Some(p) => p.next(),
        }
    }

    /// Whether completing `phase` moves the marker forward by exactly one.
    pub fn advances_with(&self, phase: Phase) -> bool {
        self.next() == Some(phase)
    }

    pub fn state(&self) -> ClusterState {
        if let Some((phase, reason)) = &self.failure {
            return ClusterState::Failed {
                phase: *phase,
                reason: reason.clone(),
            };
        }
        match (self.completed, self.next()) {
            (None, _) => ClusterState::NotStarted,
            (Some(_), None) => ClusterState::Ready,
            (Some(_), Some(next)) => ClusterState::InProgress { next },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterState {
    NotStarted,
    InProgress { next: Phase },
    Ready,
    Failed { phase: Phase, reason: String },
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "NotStarted"),
            Self::InProgress { next } => write!(f, "InProgress (next: {next})"),
            Self::Ready => write!(f, "Ready"),
            Self::Failed { phase, reason } => write!(f, "Failed({phase}, {reason})"),
        }
    }
}

fn parse_failure(value: &str) -> Option<(Phase, String)> {
    let (phase, reason) = value.split_once(':')?;
    Some((phase.trim().parse().ok()?, reason.trim().to_string()))
}

async fn state_bucket(
    provider: &dyn CloudProvider,
    naming: &Naming,
) -> Result<Option<ObservedResource>, KshapeError> {
    let snapshot = reader::read(provider, naming.cluster(), &[ResourceKind::Bucket]).await?;
    Ok(snapshot
        .find(ResourceKind::Bucket, &naming.state_bucket())
        .cloned())
}

pub async fn read_marker(
    provider: &dyn CloudProvider,
    naming: &Naming,
) -> Result<PhaseMarker, KshapeError> {
    Ok(state_bucket(provider, naming)
        .await?
        .map(|b| PhaseMarker::from_labels(&b))
        .unwrap_or_default())
}

async fn write_labels(
    provider: &dyn CloudProvider,
    naming: &Naming,
    labels: &[(&str, Option<&str>)],
) -> Result<(), KshapeError> {
    let Some(bucket) = state_bucket(provider, naming).await? else {
        warn!(
            cluster = %naming.cluster(),
            bucket = %naming.state_bucket(),
            "State bucket missing, phase marker not recorded"
        );
        return Ok(());
    };
    let now = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    for (key, value) in labels.iter().copied().chain([(UPDATED_KEY, Some(now.as_str()))]) {
        provider
            .set_status_label(&bucket, key, value)
            .await
            .map_err(|e| KshapeError::provider(e, Some(bucket.reference())))?;
    }
    Ok(())
}

/// Record `phase` as the last completed phase and clear any failure.
pub async fn record_completed(
    provider: &dyn CloudProvider,
    naming: &Naming,
    phase: Phase,
) -> Result<(), KshapeError> {
    debug!(cluster = %naming.cluster(), phase = %phase, "Recording completed phase");
    let name = phase.to_string();
    write_labels(
        provider,
        naming,
        &[(PHASE_KEY, Some(name.as_str())), (FAILED_KEY, None)],
    )
    .await
}

/// Record a failure without moving the completed marker.
pub async fn record_failed(
    provider: &dyn CloudProvider,
    naming: &Naming,
    phase: Phase,
    reason: &str,
) -> Result<(), KshapeError> {
    let value = format!("{phase}: {reason}");
    write_labels(provider, naming, &[(FAILED_KEY, Some(value.as_str()))]).await
}

/// Reset the marker so the next `create` starts from the first phase.
pub async fn clear(provider: &dyn CloudProvider, naming: &Naming) -> Result<(), KshapeError> {
    write_labels(provider, naming, &[(PHASE_KEY, None), (FAILED_KEY, None)]).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BucketConfig, ROLE_STATE, ResourceConfig, ResourceSpec};
    use crate::provider::memory::MemoryProvider;

    fn seed_bucket(provider: &MemoryProvider, naming: &Naming) {
        provider.insert(ResourceSpec::new(
            ResourceKind::Bucket,
            naming.state_bucket(),
            naming.cluster(),
            ROLE_STATE,
            ResourceConfig::Bucket(BucketConfig { versioning: true }),
        ));
    }

    #[test]
    fn test_next_phase() {
        let mut marker = PhaseMarker::default();
        assert_eq!(marker.next(), Some(Phase::Resources));
        assert!(marker.advances_with(Phase::Resources));
        assert!(!marker.advances_with(Phase::WaitReady));

        marker.completed = Some(Phase::WaitReady);
        assert_eq!(marker.next(), Some(Phase::BastionSetup));

        marker.completed = Some(Phase::BootstrapRegister);
        assert_eq!(marker.next(), None);
        assert_eq!(marker.state(), ClusterState::Ready);
    }

    #[test]
    fn test_parse_failure() {
        assert_eq!(
            parse_failure("Infrastructure: [Instance/demo-cp-2] boom: x"),
            Some((
                Phase::Infrastructure,
                "[Instance/demo-cp-2] boom: x".to_string()
            ))
        );
        assert_eq!(parse_failure("nonsense"), None);
    }

    #[tokio::test]
    async fn test_marker_round_trip() {
        let provider = MemoryProvider::new();
        let naming = Naming::new("demo", "123456789012");
        seed_bucket(&provider, &naming);

        record_completed(&provider, &naming, Phase::Resources)
            .await
            .unwrap();
        record_failed(&provider, &naming, Phase::Infrastructure, "quota")
            .await
            .unwrap();

        let marker = read_marker(&provider, &naming).await.unwrap();
        assert_eq!(marker.completed, Some(Phase::Resources));
        assert_eq!(
            marker.state(),
            ClusterState::Failed {
                phase: Phase::Infrastructure,
                reason: "quota".to_string()
            }
        );
        assert!(marker.updated_at.is_some());

        record_completed(&provider, &naming, Phase::Infrastructure)
            .await
            .unwrap();
        let marker = read_marker(&provider, &naming).await.unwrap();
        assert_eq!(marker.failure, None);
        assert_eq!(
            marker.state(),
            ClusterState::InProgress {
                next: Phase::WaitReady
            }
        );

        clear(&provider, &naming).await.unwrap();
        let marker = read_marker(&provider, &naming).await.unwrap();
        assert_eq!(marker.state(), ClusterState::NotStarted);
    }

    #[tokio::test]
    async fn test_missing_bucket_reads_as_not_started() {
        let provider = MemoryProvider::new();
        let naming = Naming::new("demo", "123456789012");
        let marker = read_marker(&provider, &naming).await.unwrap();
        assert_eq!(marker, PhaseMarker::default());
        record_completed(&provider, &naming, Phase::Resources)
            .await
            .unwrap();
        assert!(provider.resources().is_empty());
    }
}
