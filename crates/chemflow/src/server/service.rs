use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use simcost::ranker::Baseline;
use simcost::{
    BenchmarkCatalog, ComparisonRow, CostEstimate, CostEstimator, InstanceSize, SimulationType,
    rank,
};
use std::sync::Arc;

use crate::common::ids::new_job_id;
use crate::common::retry::RetryPolicy;
use crate::model::{JobStatus, SimulationJob};
use crate::server::dispatch::Dispatcher;
use crate::server::validator::{SimulationRequest, Validator};
use crate::store::{Store, StoreError};
use crate::{Error, Result};

/// Query of the price-performance comparison.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareQuery {
    pub simulation_type: Option<String>,
    pub resolution: Option<String>,
    pub processor_type: Option<String>,
    pub instance_size: Option<String>,
}

/// Entry point of every user-facing operation on simulation jobs.
pub struct SimulationService {
    validator: Validator,
    estimator: Arc<CostEstimator>,
    catalog: Arc<BenchmarkCatalog>,
    store: Arc<dyn Store>,
    dispatcher: Arc<Dispatcher>,
    retry: RetryPolicy,
}

impl SimulationService {
    pub fn new(
        validator: Validator,
        estimator: Arc<CostEstimator>,
        catalog: Arc<BenchmarkCatalog>,
        store: Arc<dyn Store>,
        dispatcher: Arc<Dispatcher>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            validator,
            estimator,
            catalog,
            store,
            dispatcher,
            retry,
        }
    }

    pub fn catalog(&self) -> &BenchmarkCatalog {
        &self.catalog
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    async fn active_jobs(&self, owner_id: &str) -> Result<usize> {
        let jobs = self
            .retry
            .run("Listing jobs", || self.store.jobs_by_owner(owner_id))
            .await?;
        Ok(jobs
            .iter()
            .filter(|job| JobStatus::ACTIVE.contains(&job.status))
            .count())
    }

    async fn by_idempotency_key(&self, owner_id: &str, key: &str) -> Result<Option<SimulationJob>> {
        Ok(self
            .retry
            .run("Idempotency lookup", || {
                self.store.find_job_by_idempotency_key(owner_id, key)
            })
            .await?)
    }

    /// Validates, estimates, stores and dispatches a new simulation.
    ///
    /// A request repeating the idempotency key of an earlier one returns the earlier job.
    /// When the compute backend is unreachable the job is still created; it stays CREATED
    /// and the monitor dispatches it later.
    pub async fn submit(
        &self,
        owner_id: &str,
        request: &SimulationRequest,
        idempotency_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<SimulationJob> {
        if let Some(key) = &idempotency_key {
            if let Some(job) = self.by_idempotency_key(owner_id, key).await? {
                log::debug!("Request with key {key} already created job {}", job.job_id);
                return Ok(job);
            }
        }

        let active_jobs = self.active_jobs(owner_id).await?;
        let validated = self.validator.validate(owner_id, request, active_jobs)?;
        let estimate = self
            .estimator
            .estimate_with_catalog(&validated.config, &self.catalog)?;

        let job = SimulationJob::new(
            owner_id.to_string(),
            new_job_id(),
            validated.config,
            validated.sizing,
            &estimate,
            now,
            idempotency_key.clone(),
        );
        let job = match self
            .retry
            .run("Job creation", || self.store.insert_job(job.clone()))
            .await
        {
            Ok(job) => job,
            Err(StoreError::AlreadyExists(id)) => {
                // Another request with the same key won the race
                let existing = match &idempotency_key {
                    Some(key) => self.by_idempotency_key(owner_id, key).await?,
                    None => None,
                };
                return existing.ok_or_else(|| {
                    Error::Conflict(format!("{id} already exists"))
                });
            }
            Err(error) => return Err(error.into()),
        };
        log::info!(
            "Job {} created for {owner_id}: {} {}, estimated ${:.2}",
            job.job_id,
            job.config.simulation_type(),
            job.config.model.resolution_label(),
            job.estimated_cost
        );

        let job_id = job.job_id.clone();
        match self.dispatcher.dispatch(job.clone()).await {
            Ok(job) => Ok(job),
            Err(error) => {
                log::warn!("Job {job_id} could not be dispatched yet: {error}");
                Ok(job)
            }
        }
    }

    pub async fn get(&self, owner_id: &str, job_id: &str) -> Result<SimulationJob> {
        self.retry
            .run("Job lookup", || self.store.get_job(owner_id, job_id))
            .await?
            .ok_or(Error::NotFound)
    }

    pub async fn list(
        &self,
        owner_id: &str,
        status: Option<JobStatus>,
    ) -> Result<Vec<SimulationJob>> {
        let mut jobs = self
            .retry
            .run("Listing jobs", || self.store.jobs_by_owner(owner_id))
            .await?;
        if let Some(status) = status {
            jobs.retain(|job| job.status == status);
        }
        Ok(jobs)
    }

    /// Flags a SUBMITTED or RUNNING job for cancellation. The monitor stops the backend job
    /// on its next tick.
    pub async fn cancel(&self, owner_id: &str, job_id: &str) -> Result<SimulationJob> {
        let mut job = self.get(owner_id, job_id).await?;
        loop {
            if !job.status.is_cancelable() {
                return Err(Error::Conflict(format!(
                    "job {job_id} is {} and cannot be canceled",
                    job.status
                )));
            }
            if job.cancel_requested {
                return Ok(job);
            }
            let mut updated = job.clone();
            updated.cancel_requested = true;
            let result = self
                .retry
                .run("Cancel request", || self.store.update_job(updated.clone(), None))
                .await;
            match result {
                Ok(job) => {
                    log::info!("Cancellation of job {job_id} requested by {owner_id}");
                    return Ok(job);
                }
                Err(StoreError::VersionConflict(_)) => {
                    job = self.get(owner_id, job_id).await?;
                }
                Err(StoreError::Missing(_)) => return Err(Error::NotFound),
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Removes a finished job. Jobs that may still change are kept.
    pub async fn delete(&self, owner_id: &str, job_id: &str) -> Result<()> {
        let job = self.get(owner_id, job_id).await?;
        if !job.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "job {job_id} is {} and cannot be deleted until it finishes",
                job.status
            )));
        }
        let deleted = self
            .retry
            .run("Job removal", || self.store.delete_job(owner_id, job_id))
            .await?;
        if !deleted {
            return Err(Error::NotFound);
        }
        log::info!("Job {job_id} of {owner_id} deleted");
        Ok(())
    }

    /// Estimates a request without creating a job. Quota and resource limits do not apply.
    pub fn estimate(&self, request: &SimulationRequest) -> Result<CostEstimate> {
        let config = self.validator.parse_config(request)?;
        Ok(self.estimator.estimate_with_catalog(&config, &self.catalog)?)
    }

    /// Ranks the benchmarked instances of a model setup by price-performance.
    pub fn compare(&self, query: &CompareQuery) -> Result<Vec<ComparisonRow>> {
        let simulation_type = match query.simulation_type.as_deref() {
            None => SimulationType::GcClassic,
            Some(value) => SimulationType::parse(value).ok_or_else(|| {
                Error::invalid(
                    "simulationType",
                    format!("'{value}' is not one of: {}", SimulationType::labels()),
                )
            })?,
        };
        let resolution = match query.resolution.as_deref().map(str::trim) {
            Some(resolution) if !resolution.is_empty() => resolution,
            _ => return Err(Error::invalid("resolution", "is required")),
        };
        let instance = query.instance_size.as_deref().map(|size| {
            InstanceSize::parse(size)
                .map(|size| size.instance_suffix())
                .unwrap_or(size)
        });

        let entries = self.catalog.entries_for(simulation_type, resolution);
        let baseline = query.processor_type.as_deref().map(|processor| Baseline {
            processor,
            instance: instance.unwrap_or(""),
        });
        Ok(rank(&entries, baseline))
    }
}
