use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::Result;
use crate::common::retry::RetryPolicy;
use crate::model::{CostLedgerEntry, JobStatus, SimulationJob};
use crate::server::dispatch::Dispatcher;
use crate::server::dispatch::backend::{BackendError, BackendJobDescription};
use crate::server::notify::{EventStreamer, Notification, Notifier};
use crate::server::tracker::CostTracker;
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(with = "crate::common::serde_duration")]
    pub poll_interval: Duration,
    /// Consecutive failed status checks tolerated before a job is considered FAILED.
    pub max_status_errors: u32,
    /// Age after which a job that is still CREATED is dispatched again.
    #[serde(with = "crate::common::serde_duration")]
    pub redispatch_after: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_status_errors: 5,
            redispatch_after: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorReport {
    pub checked_jobs: usize,
    pub transitions: usize,
    pub redispatched: usize,
}

/// What a compare-and-swap update should do with the freshest version of a job.
enum Change {
    Skip,
    Write(Option<CostLedgerEntry>),
}

pub struct StatusMonitor {
    config: MonitorConfig,
    store: Arc<dyn Store>,
    dispatcher: Arc<Dispatcher>,
    tracker: Arc<CostTracker>,
    events: EventStreamer,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
}

impl StatusMonitor {
    pub fn new(
        config: MonitorConfig,
        store: Arc<dyn Store>,
        dispatcher: Arc<Dispatcher>,
        tracker: Arc<CostTracker>,
        events: EventStreamer,
        notifier: Arc<dyn Notifier>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            config,
            store,
            dispatcher,
            tracker,
            events,
            notifier,
            retry,
        }
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<MonitorReport> {
        let mut report = MonitorReport::default();

        let redispatch_after = chrono::Duration::from_std(self.config.redispatch_after)
            .unwrap_or(chrono::Duration::MAX);
        let created = self
            .retry
            .run("Listing created jobs", || {
                self.store.jobs_by_status(JobStatus::Created)
            })
            .await?;
        for job in created {
            if job.created_at + redispatch_after > now {
                continue;
            }
            let job_id = job.job_id.clone();
            match self.dispatcher.dispatch(job).await {
                Ok(job) if job.status != JobStatus::Created => {
                    log::info!("Job {job_id} dispatched again: {}", job.status);
                    report.redispatched += 1;
                }
                Ok(_) => {}
                Err(error) => log::warn!("Dispatch of job {job_id} failed again: {error}"),
            }
        }

        for status in [JobStatus::Submitted, JobStatus::Running] {
            let jobs = self
                .retry
                .run("Listing active jobs", || self.store.jobs_by_status(status))
                .await?;
            for job in jobs {
                report.checked_jobs += 1;
                let job_id = job.job_id.clone();
                match self.reconcile_job(job, now).await {
                    Ok(Some(_)) => report.transitions += 1,
                    Ok(None) => {}
                    Err(error) => log::error!("Cannot reconcile job {job_id}: {error}"),
                }
            }
        }
        log::debug!(
            "Monitor tick: {} jobs checked, {} transitions, {} dispatched again",
            report.checked_jobs,
            report.transitions,
            report.redispatched
        );
        Ok(report)
    }

    /// Brings one job in line with the compute backend.
    /// Returns the new status when the job changed its status.
    pub async fn reconcile_job(
        &self,
        job: SimulationJob,
        now: DateTime<Utc>,
    ) -> Result<Option<JobStatus>> {
        if job.status.is_terminal() {
            return Ok(None);
        }
        let Some(job_ref) = job.backend_job_ref.clone() else {
            return Ok(None);
        };
        let backend = self.dispatcher.backend();

        if job.cancel_requested {
            let result = self
                .retry
                .run("Job cancellation", || {
                    backend.cancel(&job_ref, "Canceled by user")
                })
                .await;
            return match result {
                Ok(()) | Err(BackendError::JobNotFound(_)) => {
                    self.finish(job, JobStatus::Canceled, now, None, Some("Canceled by user"))
                        .await
                }
                Err(error) => self.status_error(job, error.to_string(), now).await,
            };
        }

        let result = self
            .retry
            .run("Job status check", || backend.describe(&job_ref))
            .await;
        match result {
            Ok(description) => match backend.map_native_status(&description.native_status) {
                Some(status) => self.apply(job, status, description, now).await,
                None => {
                    let message = format!("unknown native status {}", description.native_status);
                    self.status_error(job, message, now).await
                }
            },
            Err(BackendError::JobNotFound(_)) => {
                log::warn!(
                    "Job {} is not known to the compute backend anymore",
                    job.job_id
                );
                self.finish(
                    job,
                    JobStatus::Failed,
                    now,
                    None,
                    Some("Job is not known to the compute backend"),
                )
                .await
            }
            Err(error) => self.status_error(job, error.to_string(), now).await,
        }
    }

    async fn apply(
        &self,
        job: SimulationJob,
        status: JobStatus,
        description: BackendJobDescription,
        now: DateTime<Utc>,
    ) -> Result<Option<JobStatus>> {
        if status == job.status {
            if job.progress == description.progress && job.status_error_count == 0 {
                return Ok(None);
            }
            self.update_with(job, |job| {
                if job.status != status {
                    return Ok(Change::Skip);
                }
                job.progress = description.progress.or(job.progress);
                job.status_error_count = 0;
                Ok(Change::Write(None))
            })
            .await?;
            return Ok(None);
        }
        if !job.status.can_transition_to(status) {
            log::debug!(
                "Ignoring status {status} of job {} in status {}",
                job.job_id,
                job.status
            );
            return Ok(None);
        }
        if status.is_terminal() {
            let at = description.stopped_at.unwrap_or(now).min(now);
            return self
                .finish(
                    job,
                    status,
                    at,
                    description.started_at,
                    description.reason.as_deref(),
                )
                .await;
        }

        let from = job.status;
        let started_at = description.started_at.unwrap_or(now).min(now);
        let stored = self
            .update_with(job, |job| {
                if !job.transition(status, started_at) {
                    return Ok(Change::Skip);
                }
                job.progress = description.progress.or(job.progress);
                Ok(Change::Write(None))
            })
            .await?;
        Ok(stored.map(|job| {
            log::info!("Job {} changed status {from} -> {}", job.job_id, job.status);
            self.events
                .on_status_changed(&job.owner_id, &job.job_id, from, job.status);
            job.status
        }))
    }

    /// Moves a job into a terminal status together with its final cost reconciliation,
    /// then sends the completion notification.
    async fn finish(
        &self,
        job: SimulationJob,
        status: JobStatus,
        at: DateTime<Utc>,
        started_at: Option<DateTime<Utc>>,
        reason: Option<&str>,
    ) -> Result<Option<JobStatus>> {
        let from = job.status;
        let stored = self
            .update_with(job, |job| {
                if job.status.is_terminal() {
                    return Ok(Change::Skip);
                }
                if job.started_at.is_none() {
                    job.started_at = started_at.map(|started| started.min(at));
                }
                let reconciliation = self.tracker.reconcile(job, at)?;
                if !job.transition(status, at) {
                    return Ok(Change::Skip);
                }
                job.current_cost = Some(reconciliation.total);
                if let Some(reason) = reason {
                    job.status_reason = Some(reason.to_string());
                }
                Ok(Change::Write(reconciliation.ledger_entry))
            })
            .await?;
        let Some(job) = stored else {
            return Ok(None);
        };

        log::info!(
            "Job {} finished as {}, final cost ${:.2}",
            job.job_id,
            job.status,
            job.current_cost.unwrap_or(0.0)
        );
        self.events
            .on_status_changed(&job.owner_id, &job.job_id, from, job.status);
        let notification = Notification::JobCompleted {
            owner_id: job.owner_id.clone(),
            job_id: job.job_id.clone(),
            status: job.status,
            final_cost: job.current_cost.unwrap_or(0.0),
            results_location: job.results_location.clone(),
        };
        if let Err(error) = self.notifier.notify(notification).await {
            log::error!(
                "Cannot send completion notification of job {}: {error:?}",
                job.job_id
            );
        }
        Ok(Some(job.status))
    }

    async fn status_error(
        &self,
        job: SimulationJob,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<Option<JobStatus>> {
        let count = job.status_error_count + 1;
        if count > self.config.max_status_errors {
            log::warn!(
                "Status of job {} could not be checked {count} times, marking it as failed",
                job.job_id
            );
            let reason = format!("Status check failed {count} times: {message}");
            return self
                .finish(job, JobStatus::Failed, now, None, Some(&reason))
                .await;
        }
        log::debug!(
            "Status check of job {} failed ({count}/{}): {message}",
            job.job_id,
            self.config.max_status_errors
        );
        self.update_with(job, |job| {
            if job.status.is_terminal() {
                return Ok(Change::Skip);
            }
            job.status_error_count += 1;
            Ok(Change::Write(None))
        })
        .await?;
        Ok(None)
    }

    /// Compare-and-swap loop: applies `change` to the freshest version of the job until the
    /// write wins or `change` decides to skip. Returns the stored job when it was written.
    async fn update_with<F>(&self, job: SimulationJob, mut change: F) -> Result<Option<SimulationJob>>
    where
        F: FnMut(&mut SimulationJob) -> Result<Change>,
    {
        let mut current = job;
        loop {
            let mut updated = current.clone();
            let ledger_entry = match change(&mut updated)? {
                Change::Skip => return Ok(None),
                Change::Write(ledger_entry) => ledger_entry,
            };
            let result = self
                .retry
                .run("Job update", || {
                    self.store.update_job(updated.clone(), ledger_entry.clone())
                })
                .await;
            match result {
                Ok(stored) => return Ok(Some(stored)),
                Err(StoreError::VersionConflict(_)) => {
                    let fresh = self
                        .retry
                        .run("Job reload", || self.store.find_job(&current.job_id))
                        .await?;
                    match fresh {
                        Some(fresh) => current = fresh,
                        None => return Ok(None),
                    }
                }
                Err(StoreError::Missing(_)) => return Ok(None),
                Err(error) => return Err(error.into()),
            }
        }
    }
}
