//! Outcome of one reconcile pass.

use std::collections::BTreeSet;

use crate::error::{ErrorContext, KshapeError};
use crate::model::ResourceRef;
use crate::phases::Phase;

use super::plan::{ActionKind, ReconcileAction};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedAction {
    pub action: ActionKind,
    pub resource: ResourceRef,
    pub reason: String,
    /// Provider id of the resulting object (the deleted one for deletes).
    pub id: String,
}

#[derive(Debug)]
pub struct FailedAction {
    pub action: Option<ActionKind>,
    pub resource: ResourceRef,
    pub error: KshapeError,
}

/// Executed, failed, blocked and skipped actions of one pass.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub applied: Vec<AppliedAction>,
    pub failed: Vec<FailedAction>,
    /// Not attempted because something they depend on failed.
    pub blocked: Vec<ResourceRef>,
    /// Destructive actions that were not approved.
    pub skipped: Vec<ReconcileAction>,
}

impl ReconcileReport {
    pub fn is_converged(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty() && self.skipped.is_empty()
    }

    pub fn count(&self, action: ActionKind) -> usize {
        self.applied.iter().filter(|a| a.action == action).count()
    }

    /// Every resource still out of sync after the pass.
    pub fn out_of_sync(&self) -> BTreeSet<ResourceRef> {
        self.failed
            .iter()
            .map(|f| f.resource.clone())
            .chain(self.blocked.iter().cloned())
            .chain(self.skipped.iter().map(|a| a.resource.clone()))
            .collect()
    }

    pub fn merge(&mut self, other: Self) {
        self.applied.extend(other.applied);
        self.failed.extend(other.failed);
        self.blocked.extend(other.blocked);
        self.skipped.extend(other.skipped);
    }

    /// Turn an unconverged pass into the error of its first failure.
    ///
    /// Skipped deletes alone do not fail the pass.
    pub fn into_result(mut self, phase: Phase) -> Result<Self, KshapeError> {
        if !self.failed.is_empty() {
            let first = self.failed.remove(0);
            let others = self.failed.len() + self.blocked.len();
            if others > 0 {
                tracing::warn!(
                    phase = %phase,
                    additional = others,
                    "More resources remain out of sync"
                );
            }
            return Err(first.error.in_phase(phase));
        }
        if let Some(blocked) = self.blocked.first() {
            return Err(KshapeError::Provider {
                context: ErrorContext {
                    phase: Some(phase),
                    resource: Some(blocked.clone()),
                },
                message: "blocked by a failed dependency".to_string(),
            });
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceKind;

    #[test]
    fn test_empty_report_is_converged() {
        let report = ReconcileReport::default();
        assert!(report.is_converged());
        assert!(report.into_result(Phase::Resources).is_ok());
    }

    #[test]
    fn test_failure_names_phase_and_resource() {
        let resource = ResourceRef::new(ResourceKind::Instance, "demo-cp-2");
        let report = ReconcileReport {
            failed: vec![FailedAction {
                action: Some(ActionKind::Create),
                resource: resource.clone(),
                error: KshapeError::timeout("still pending").in_phase(Phase::Infrastructure),
            }],
            blocked: vec![ResourceRef::new(ResourceKind::StaticAddress, "demo-cp-2")],
            ..ReconcileReport::default()
        };
        assert_eq!(report.out_of_sync().len(), 2);
        let err = report.into_result(Phase::Infrastructure).unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Infrastructure));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_blocked_only_is_an_error() {
        let report = ReconcileReport {
            blocked: vec![ResourceRef::new(ResourceKind::Router, "demo-private")],
            ..ReconcileReport::default()
        };
        let err = report.into_result(Phase::Resources).unwrap_err();
        assert!(err.to_string().contains("Router/demo-private"));
    }
}
