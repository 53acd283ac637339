use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, ready};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

use crate::Map;
use crate::model::JobStatus;
use crate::server::dispatch::backend::{
    BackendError, BackendJobDescription, BackendJobRef, BackendResult, BackendSubmission,
    ComputeBackend,
};

const SIMULATED_STATUS_TABLE: &[(&str, JobStatus)] = &[
    ("SUBMITTED", JobStatus::Submitted),
    ("PENDING", JobStatus::Submitted),
    ("RUNNABLE", JobStatus::Submitted),
    ("STARTING", JobStatus::Submitted),
    ("RUNNING", JobStatus::Running),
    ("SUCCEEDED", JobStatus::Succeeded),
    ("FAILED", JobStatus::Failed),
    ("TERMINATED", JobStatus::Canceled),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedConfig {
    /// Time a job spends in the queue before it starts.
    #[serde(with = "crate::common::serde_duration")]
    pub queue_delay: Duration,
    /// How many times faster than the estimate the simulated model runs.
    pub time_scale: f64,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            queue_delay: Duration::from_secs(30),
            time_scale: 60.0,
        }
    }
}

struct SimulatedJob {
    submitted_at: DateTime<Utc>,
    runtime: chrono::Duration,
    timeout: chrono::Duration,
    canceled_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct SimulatedState {
    jobs: Map<BackendJobRef, SimulatedJob>,
    keys: Map<String, BackendJobRef>,
    counter: u64,
}

/// In-process backend whose jobs move through AWS Batch-like states on a timer.
pub struct SimulatedBackend {
    config: SimulatedConfig,
    state: Mutex<SimulatedState>,
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

impl SimulatedBackend {
    pub fn new(config: SimulatedConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SimulatedState::default()),
        }
    }

    fn lock(&self) -> BackendResult<std::sync::MutexGuard<'_, SimulatedState>> {
        self.state
            .lock()
            .map_err(|_| BackendError::Unavailable("simulated backend state is poisoned".into()))
    }

    pub fn submit_at(
        &self,
        submission: BackendSubmission,
        now: DateTime<Utc>,
    ) -> BackendResult<BackendJobRef> {
        let mut state = self.lock()?;
        if let Some(job_ref) = state.keys.get(&submission.idempotency_key) {
            return Ok(job_ref.clone());
        }
        state.counter += 1;
        let job_ref = format!("batch-{:06}", state.counter);
        let scale = if self.config.time_scale > 0.0 {
            self.config.time_scale
        } else {
            1.0
        };
        let runtime = submission.expected_runtime.div_f64(scale);
        let timeout = submission.timeout.div_f64(scale);
        state.jobs.insert(
            job_ref.clone(),
            SimulatedJob {
                submitted_at: now,
                runtime: to_chrono(runtime),
                timeout: to_chrono(timeout),
                canceled_at: None,
            },
        );
        state
            .keys
            .insert(submission.idempotency_key, job_ref.clone());
        log::debug!(
            "Simulated job {job_ref} ({}) will run for {}",
            submission.job_name,
            humantime::format_duration(runtime)
        );
        Ok(job_ref)
    }

    pub fn describe_at(
        &self,
        job_ref: &str,
        now: DateTime<Utc>,
    ) -> BackendResult<BackendJobDescription> {
        let state = self.lock()?;
        let job = state
            .jobs
            .get(job_ref)
            .ok_or_else(|| BackendError::JobNotFound(job_ref.to_string()))?;

        let start = job.submitted_at + to_chrono(self.config.queue_delay);
        let limit = job.runtime.min(job.timeout);
        let end = start + limit;
        let timed_out = job.runtime > job.timeout;

        let description = |status: &str, started: bool, stopped: Option<DateTime<Utc>>| {
            let progress = started.then(|| {
                let elapsed = stopped.unwrap_or(now).min(end) - start;
                if job.runtime <= chrono::Duration::zero() {
                    100.0
                } else {
                    (elapsed.num_milliseconds() as f64 / job.runtime.num_milliseconds() as f64
                        * 100.0)
                        .clamp(0.0, 100.0)
                }
            });
            BackendJobDescription {
                native_status: status.to_string(),
                started_at: started.then_some(start),
                stopped_at: stopped,
                progress,
                reason: None,
            }
        };

        if let Some(canceled_at) = job.canceled_at {
            let started = canceled_at >= start;
            let mut result = description("TERMINATED", started, Some(canceled_at.min(end)));
            result.reason = Some("Job canceled by user".to_string());
            return Ok(result);
        }
        let result = if now < job.submitted_at + to_chrono(self.config.queue_delay / 2) {
            description("SUBMITTED", false, None)
        } else if now < start {
            description("RUNNABLE", false, None)
        } else if now < end {
            description("RUNNING", true, None)
        } else if timed_out {
            let mut result = description("FAILED", true, Some(end));
            result.reason = Some("Job attempt duration exceeded timeout".to_string());
            result
        } else {
            description("SUCCEEDED", true, Some(end))
        };
        Ok(result)
    }

    pub fn cancel_at(&self, job_ref: &str, now: DateTime<Utc>) -> BackendResult<()> {
        let mut state = self.lock()?;
        let job = state
            .jobs
            .get_mut(job_ref)
            .ok_or_else(|| BackendError::JobNotFound(job_ref.to_string()))?;
        job.canceled_at.get_or_insert(now);
        Ok(())
    }
}

impl ComputeBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn status_table(&self) -> &'static [(&'static str, JobStatus)] {
        SIMULATED_STATUS_TABLE
    }

    fn submit(&self, submission: BackendSubmission) -> BoxFuture<'_, BackendResult<BackendJobRef>> {
        ready(self.submit_at(submission, Utc::now())).boxed()
    }

    fn describe<'a>(
        &'a self,
        job_ref: &'a str,
    ) -> BoxFuture<'a, BackendResult<BackendJobDescription>> {
        ready(self.describe_at(job_ref, Utc::now())).boxed()
    }

    fn cancel<'a>(&'a self, job_ref: &'a str, reason: &'a str) -> BoxFuture<'a, BackendResult<()>> {
        log::debug!("Terminating simulated job {job_ref}: {reason}");
        ready(self.cancel_at(job_ref, Utc::now())).boxed()
    }
}
