use serde::Serialize;
use thiserror::Error;

use crate::common::retry::Transient;
use crate::server::dispatch::backend::BackendError;
use crate::store::StoreError;

/// Field-level reason of a rejected request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub field: String,
    pub reason: String,
    #[serde(skip)]
    pub quota: bool,
}

impl Violation {
    pub fn new(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.into(),
            quota: false,
        }
    }

    pub fn quota(field: &str, reason: impl Into<String>) -> Self {
        Self {
            quota: true,
            ..Self::new(field, reason)
        }
    }
}

#[derive(Debug, Error)]
pub enum ChemflowError {
    #[error("Missing or invalid owner identity")]
    Unauthenticated,
    #[error("Request validation failed: {}", format_violations(.0))]
    Validation(Vec<Violation>),
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("Resource not found")]
    NotFound,
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Upstream service unavailable: {0}")]
    Upstream(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("{}: {}", v.field, v.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ChemflowError {
    /// Stable machine-readable name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            ChemflowError::Unauthenticated => "Unauthenticated",
            ChemflowError::Validation(_) => "ValidationError",
            ChemflowError::QuotaExceeded(_) => "QuotaExceeded",
            ChemflowError::NotFound => "NotFound",
            ChemflowError::Conflict(_) => "ConflictError",
            ChemflowError::Upstream(_) => "UpstreamUnavailable",
            ChemflowError::Internal(_) => "InternalError",
        }
    }

    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::Validation(vec![Violation::new(field, reason)])
    }
}

impl Transient for ChemflowError {
    fn is_transient(&self) -> bool {
        matches!(self, ChemflowError::Upstream(_))
    }
}

/// Quota-only rejections are reported as such, anything else is a validation failure.
impl From<Vec<Violation>> for ChemflowError {
    fn from(violations: Vec<Violation>) -> Self {
        if !violations.is_empty() && violations.iter().all(|v| v.quota) {
            Self::QuotaExceeded(format_violations(&violations))
        } else {
            Self::Validation(violations)
        }
    }
}

impl From<StoreError> for ChemflowError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Unavailable(message) => Self::Upstream(message),
            StoreError::VersionConflict(id) => {
                Self::Conflict(format!("{id} was modified concurrently"))
            }
            StoreError::AlreadyExists(id) => Self::Conflict(format!("{id} already exists")),
            StoreError::Missing(_) => Self::NotFound,
        }
    }
}

impl From<BackendError> for ChemflowError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::Unavailable(message) => Self::Upstream(message),
            BackendError::Rejected(message) => {
                Self::Upstream(format!("compute backend rejected the job: {message}"))
            }
            BackendError::JobNotFound(id) => {
                Self::Internal(format!("backend job {id} does not exist"))
            }
        }
    }
}

impl From<simcost::Error> for ChemflowError {
    fn from(error: simcost::Error) -> Self {
        Self::Internal(error.to_string())
    }
}

impl From<anyhow::Error> for ChemflowError {
    fn from(error: anyhow::Error) -> Self {
        Self::Internal(format!("{error:?}"))
    }
}
