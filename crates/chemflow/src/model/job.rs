use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use simcost::{CostEstimate, SimulationConfig};
use std::fmt;

use crate::server::dispatch::DispatchRecord;
use crate::server::dispatch::backend::BackendJobRef;
use crate::server::validator::SizingHint;
use crate::{JobId, OwnerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Submitted,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub const ACTIVE: [JobStatus; 3] = [JobStatus::Created, JobStatus::Submitted, JobStatus::Running];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Cancellation can only be requested for jobs known to the compute backend.
    pub fn is_cancelable(self) -> bool {
        matches!(self, JobStatus::Submitted | JobStatus::Running)
    }

    fn stage(self) -> u8 {
        match self {
            JobStatus::Created => 0,
            JobStatus::Submitted => 1,
            JobStatus::Running => 2,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled => 3,
        }
    }

    /// Statuses only move forward and terminal statuses are final.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        !self.is_terminal() && next.stage() > self.stage()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Created => "CREATED",
            JobStatus::Submitted => "SUBMITTED",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationJob {
    pub owner_id: OwnerId,
    pub job_id: JobId,
    pub status: JobStatus,
    pub config: SimulationConfig,
    pub sizing: SizingHint,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: Option<f64>,
    pub estimated_cost: f64,
    pub estimated_runtime_hours: f64,
    pub estimated_storage_gb: f64,
    pub current_cost: Option<f64>,
    pub backend_job_ref: Option<BackendJobRef>,
    pub dispatch: Option<DispatchRecord>,
    pub results_location: Option<String>,
    pub cancel_requested: bool,
    pub status_reason: Option<String>,
    pub status_error_count: u32,
    pub idempotency_key: Option<String>,
    /// Incremented by the store on every successful write.
    pub version: u64,
}

impl SimulationJob {
    pub fn new(
        owner_id: OwnerId,
        job_id: JobId,
        config: SimulationConfig,
        sizing: SizingHint,
        estimate: &CostEstimate,
        created_at: DateTime<Utc>,
        idempotency_key: Option<String>,
    ) -> Self {
        Self {
            owner_id,
            job_id,
            status: JobStatus::Created,
            config,
            sizing,
            created_at,
            started_at: None,
            completed_at: None,
            progress: None,
            estimated_cost: estimate.estimated_cost,
            estimated_runtime_hours: estimate.estimated_runtime_hours,
            estimated_storage_gb: estimate.storage_gb,
            current_cost: None,
            backend_job_ref: None,
            dispatch: None,
            results_location: None,
            cancel_requested: false,
            status_reason: None,
            status_error_count: 0,
            idempotency_key,
            version: 0,
        }
    }

    /// Moves the job into `next` if the status machine allows it.
    /// Returns `false` when the transition was ignored.
    pub fn transition(&mut self, next: JobStatus, at: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(next) {
            if self.status != next {
                log::debug!(
                    "Ignoring transition of job {} from {} to {next}",
                    self.job_id,
                    self.status
                );
            }
            return false;
        }
        match next {
            JobStatus::Running => {
                self.started_at.get_or_insert(at);
            }
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled => {
                self.completed_at = Some(at);
                if next == JobStatus::Succeeded {
                    self.progress = Some(100.0);
                }
            }
            JobStatus::Created | JobStatus::Submitted => {}
        }
        self.status = next;
        self.status_error_count = 0;
        true
    }
}
