//! Error taxonomy for kshape.
//!
//! [`ProviderError`] is what a cloud binding reports for a single API call.
//! [`KshapeError`] is what the reconciler and the phase orchestrator report:
//! it names the phase and the resource involved and tells the operator
//! whether re-running the command is expected to make progress.

use std::fmt;

use thiserror::Error;

use crate::model::ResourceRef;
use crate::phases::Phase;

/// Errors returned by a single cloud provider call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("[{component}] {message}")]
    Transient { component: String, message: String },

    #[error("[{component}] resource already exists: {message}")]
    Conflict { component: String, message: String },

    #[error("[{component}] not found: {message}")]
    NotFound { component: String, message: String },

    #[error("[{component}] AWS credentials error: {message}")]
    Credentials { component: String, message: String },

    #[error("[{component}] timed out: {message}")]
    Timeout { component: String, message: String },

    #[error("[{component}] {message}")]
    Fatal { component: String, message: String },
}

const CREDENTIAL_PATTERNS: &[&str] = &[
    "no credentials",
    "credentials not found",
    "invalid credentials",
    "expired token",
    "expiredtoken",
    "the security token included in the request is invalid",
    "the security token included in the request is expired",
    "unrecognized client",
    "invalidclienttokenid",
    "signaturedoesnotmatch",
    "access denied",
    "accessdenied",
    "unauthorizedoperation",
    "not authorized",
];

const CONFLICT_PATTERNS: &[&str] = &[
    "already exists",
    "alreadyexists",
    "entityalreadyexists",
    "bucketalreadyownedbyyou",
    "bucketalreadyexists",
    ".duplicate",
    "duplicateloadbalancername",
    "duplicatetargetgroupname",
    "conflictexception",
];

const NOT_FOUND_PATTERNS: &[&str] = &[
    ".notfound",
    "notfound",
    "nosuchentity",
    "nosuchbucket",
    "nosuchkey",
    "does not exist",
    "resourcenotfound",
];

const TRANSIENT_PATTERNS: &[&str] = &[
    "throttl",
    "requestlimitexceeded",
    "limit exceeded",
    "rate exceeded",
    "toomanyrequests",
    "timeout",
    "timed out",
    "dispatch failure",
    "connection",
    "internalerror",
    "internalfailure",
    "serviceunavailable",
    "unavailable",
    "dependencyviolation",
    "resourceinuse",
    ".inuse",
    "incorrectstate",
    "insufficientinstancecapacity",
    "limitexceeded",
    "operationaborted",
];

impl ProviderError {
    /// Classify an AWS SDK error.
    ///
    /// The rendered error chain and the debug form are both inspected so the
    /// service error code is visible even when the display form is generic.
    pub fn aws<E: std::error::Error>(component: &str, err: E) -> Self {
        let display = aws_smithy_types::error::display::DisplayErrorContext(&err).to_string();
        let debug = format!("{err:?}");
        Self::classify(component, &display, &debug)
    }

    /// Classify an error from its display and debug forms.
    pub fn classify(component: &str, display: &str, debug: &str) -> Self {
        let combined = format!("{display} {debug}").to_lowercase();
        let component = component.to_string();
        let message = extract_error_details(debug, display);
        let matches = |patterns: &[&str]| patterns.iter().any(|p| combined.contains(p));

        if matches(CREDENTIAL_PATTERNS) {
            Self::Credentials { component, message }
        } else if matches(CONFLICT_PATTERNS) {
            Self::Conflict { component, message }
        } else if matches(NOT_FOUND_PATTERNS) {
            Self::NotFound { component, message }
        } else if matches(TRANSIENT_PATTERNS) {
            Self::Transient { component, message }
        } else {
            Self::Fatal { component, message }
        }
    }

    pub fn fatal(component: &str, message: impl Into<String>) -> Self {
        Self::Fatal {
            component: component.to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(component: &str, message: impl Into<String>) -> Self {
        Self::NotFound {
            component: component.to_string(),
            message: message.into(),
        }
    }

    pub fn timeout(component: &str, message: impl Into<String>) -> Self {
        Self::Timeout {
            component: component.to_string(),
            message: message.into(),
        }
    }

    /// Returns true if the same call may succeed when retried.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }

    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Extract a single-line message from an AWS SDK error.
fn extract_error_details(debug_str: &str, display_str: &str) -> String {
    // Pattern: message: Some("actual error message")
    if let Some(pos) = debug_str.find("message: Some(\"") {
        let start = pos + "message: Some(\"".len();
        let rest = &debug_str[start..];
        if let Some(end) = rest.find('"') {
            return rest[..end].to_string();
        }
    }

    if !display_str.trim().eq_ignore_ascii_case("service error") {
        return display_str.to_string();
    }

    "AWS API request failed".to_string()
}

/// Where a failure happened: the phase and the resource, when known.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub phase: Option<Phase>,
    pub resource: Option<ResourceRef>,
}

impl ErrorContext {
    pub fn resource(resource: ResourceRef) -> Self {
        Self {
            phase: None,
            resource: Some(resource),
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.phase, &self.resource) {
            (None, None) => Ok(()),
            (Some(p), None) => write!(f, "[{p}] "),
            (None, Some(r)) => write!(f, "[{r}] "),
            (Some(p), Some(r)) => write!(f, "[{p} {r}] "),
        }
    }
}

/// Errors surfaced by reconciliation and phase execution.
#[derive(Error, Debug)]
pub enum KshapeError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{context}transient provider error: {message}")]
    TransientProvider {
        context: ErrorContext,
        message: String,
    },

    #[error("{context}conflict: {message}")]
    Conflict {
        context: ErrorContext,
        message: String,
    },

    #[error("{context}timed out: {message}")]
    Timeout {
        context: ErrorContext,
        message: String,
    },

    #[error("{context}safety violation: {message}")]
    SafetyViolation {
        context: ErrorContext,
        message: String,
    },

    #[error("{context}provider error: {message}")]
    Provider {
        context: ErrorContext,
        message: String,
    },

    #[error("{context}bootstrap failed: {message}")]
    Bootstrap {
        context: ErrorContext,
        message: String,
    },

    #[error("{context}local I/O error: {message}")]
    Io {
        context: ErrorContext,
        message: String,
    },
}

impl KshapeError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn safety(resource: ResourceRef, message: impl Into<String>) -> Self {
        Self::SafetyViolation {
            context: ErrorContext::resource(resource),
            message: message.into(),
        }
    }

    pub fn bootstrap(message: impl Into<String>) -> Self {
        Self::Bootstrap {
            context: ErrorContext::default(),
            message: message.into(),
        }
    }

    pub fn io(path: &std::path::Path, err: &std::io::Error) -> Self {
        Self::Io {
            context: ErrorContext::default(),
            message: format!("{}: {err}", path.display()),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            context: ErrorContext::default(),
            message: message.into(),
        }
    }

    /// Wrap a provider error raised while acting on `resource`.
    pub fn provider(err: ProviderError, resource: Option<ResourceRef>) -> Self {
        let context = ErrorContext {
            phase: None,
            resource,
        };
        let message = err.to_string();
        match err {
            ProviderError::Transient { .. } => Self::TransientProvider { context, message },
            ProviderError::Conflict { .. } => Self::Conflict { context, message },
            ProviderError::Timeout { .. } => Self::Timeout { context, message },
            ProviderError::NotFound { .. }
            | ProviderError::Credentials { .. }
            | ProviderError::Fatal { .. } => Self::Provider { context, message },
        }
    }

    /// Attach the phase, keeping an already recorded one.
    #[must_use]
    pub fn in_phase(mut self, phase: Phase) -> Self {
        if let Some(ctx) = self.context_mut()
            && ctx.phase.is_none()
        {
            ctx.phase = Some(phase);
        }
        self
    }

    pub const fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Configuration(_) => None,
            Self::TransientProvider { context, .. }
            | Self::Conflict { context, .. }
            | Self::Timeout { context, .. }
            | Self::SafetyViolation { context, .. }
            | Self::Provider { context, .. }
            | Self::Bootstrap { context, .. }
            | Self::Io { context, .. } => Some(context),
        }
    }

    const fn context_mut(&mut self) -> Option<&mut ErrorContext> {
        match self {
            Self::Configuration(_) => None,
            Self::TransientProvider { context, .. }
            | Self::Conflict { context, .. }
            | Self::Timeout { context, .. }
            | Self::SafetyViolation { context, .. }
            | Self::Provider { context, .. }
            | Self::Bootstrap { context, .. }
            | Self::Io { context, .. } => Some(context),
        }
    }

    /// Whether running the same command again is expected to make progress.
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Configuration(_) | Self::SafetyViolation { .. })
    }

    /// Whether an immediate in-process retry is worthwhile.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientProvider { .. } | Self::Timeout { .. })
    }

    pub fn phase(&self) -> Option<Phase> {
        self.context().and_then(|c| c.phase)
    }
}
