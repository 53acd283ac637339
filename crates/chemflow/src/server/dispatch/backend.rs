use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::time::Duration;
use thiserror::Error;

use crate::common::retry::Transient;
use crate::model::JobStatus;

/// Identifier of a job assigned by the compute backend.
pub type BackendJobRef = String;

/// Everything the compute backend needs to run one simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendSubmission {
    /// Stable across retries of the same dispatch; a backend must not create a second job
    /// for a key it has already seen.
    pub idempotency_key: String,
    pub job_name: String,
    pub queue: String,
    pub image: String,
    pub nodes: u32,
    pub vcpus_per_node: u32,
    pub memory_mib_per_node: u64,
    pub timeout: Duration,
    pub expected_runtime: Duration,
    pub environment: Vec<(String, String)>,
}

/// State of a job as reported by the compute backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendJobDescription {
    pub native_status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    /// Completion in percent, when the backend knows it.
    pub progress: Option<f64>,
    pub reason: Option<String>,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend job {0} does not exist")]
    JobNotFound(BackendJobRef),
    #[error("Backend rejected the request: {0}")]
    Rejected(String),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl Transient for BackendError {
    fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handler that talks to an external system executing the simulations.
pub trait ComputeBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// One-way mapping of native status names to job statuses.
    fn status_table(&self) -> &'static [(&'static str, JobStatus)];

    fn submit(&self, submission: BackendSubmission) -> BoxFuture<'_, BackendResult<BackendJobRef>>;

    fn describe<'a>(
        &'a self,
        job_ref: &'a str,
    ) -> BoxFuture<'a, BackendResult<BackendJobDescription>>;

    fn cancel<'a>(&'a self, job_ref: &'a str, reason: &'a str) -> BoxFuture<'a, BackendResult<()>>;

    fn map_native_status(&self, native_status: &str) -> Option<JobStatus> {
        let native_status = native_status.trim();
        self.status_table()
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(native_status))
            .map(|(_, status)| *status)
    }
}
