use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use simcost::layout::{ProcessorLayout, gchp_layout};
use simcost::{Architecture, ModelSetup, PriceTable, RateLookup};
use std::sync::Arc;
use std::time::Duration;

use crate::common::retry::RetryPolicy;
use crate::model::{JobStatus, SimulationJob};
use crate::server::dispatch::backend::{
    BackendError, BackendJobRef, BackendSubmission, ComputeBackend,
};
use crate::store::{Store, StoreError};
use crate::{Map, Result};

pub mod backend;
pub mod simulated;
pub mod slurm;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRoute {
    pub architecture: Architecture,
    pub multi_node: bool,
    pub queue: String,
    pub image: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutPolicy {
    pub safety_factor: f64,
    #[serde(with = "crate::common::serde_duration")]
    pub floor: Duration,
    #[serde(with = "crate::common::serde_duration")]
    pub ceiling: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            safety_factor: 1.5,
            floor: Duration::from_secs(3600),
            ceiling: Duration::from_secs(14 * 24 * 3600),
        }
    }
}

impl TimeoutPolicy {
    /// Time limit of a job expected to run for `estimated_runtime_hours`.
    pub fn timeout(&self, estimated_runtime_hours: f64) -> Duration {
        let seconds = estimated_runtime_hours * 3600.0 * self.safety_factor;
        let floor = self.floor.as_secs_f64();
        let ceiling = self.ceiling.as_secs_f64().max(floor);
        let seconds = if seconds.is_nan() {
            floor
        } else {
            seconds.clamp(floor, ceiling)
        };
        Duration::from_secs(seconds.ceil() as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Simulated,
    Slurm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub backend: BackendKind,
    pub queues: Vec<QueueRoute>,
    pub timeout: TimeoutPolicy,
    /// Prefix of the location where the results of every job are stored.
    pub results_root: String,
    pub simulated: simulated::SimulatedConfig,
    pub slurm: slurm::SlurmConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let route = |architecture: Architecture, multi_node: bool| {
            let kind = if multi_node { "multi-node" } else { "single-node" };
            QueueRoute {
                architecture,
                multi_node,
                queue: format!("geoschem-{kind}-{architecture}"),
                image: format!("geoschem:{architecture}"),
            }
        };
        Self {
            backend: BackendKind::default(),
            queues: vec![
                route(Architecture::Arm64, false),
                route(Architecture::Arm64, true),
                route(Architecture::X86_64, false),
                route(Architecture::X86_64, true),
            ],
            timeout: TimeoutPolicy::default(),
            results_root: "results".to_string(),
            simulated: Default::default(),
            slurm: Default::default(),
        }
    }
}

/// Queue and image lookup keyed by `(architecture, multi-node)`.
pub struct QueueTable {
    routes: Map<(Architecture, bool), QueueRoute>,
}

impl QueueTable {
    pub fn new(routes: &[QueueRoute]) -> Self {
        Self {
            routes: routes
                .iter()
                .map(|route| ((route.architecture, route.multi_node), route.clone()))
                .collect(),
        }
    }

    pub fn get(&self, architecture: Architecture, multi_node: bool) -> Option<&QueueRoute> {
        self.routes.get(&(architecture, multi_node))
    }
}

/// Parameters a job was submitted to the compute backend with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRecord {
    pub backend_job_ref: BackendJobRef,
    pub backend: String,
    pub queue: String,
    pub image: String,
    pub timeout_seconds: u64,
    pub nodes: u32,
    pub vcpus_per_node: u32,
    pub memory_mib_per_node: u64,
    pub layout: Option<ProcessorLayout>,
    pub submitted_at: DateTime<Utc>,
}

pub struct Dispatcher {
    config: DispatchConfig,
    queues: QueueTable,
    prices: PriceTable,
    store: Arc<dyn Store>,
    backend: Arc<dyn ComputeBackend>,
    retry: RetryPolicy,
}

/// Everything decided about a job before it is handed to the backend.
struct DispatchPlan {
    submission: BackendSubmission,
    layout: Option<ProcessorLayout>,
}

impl Dispatcher {
    pub fn new(
        config: DispatchConfig,
        prices: PriceTable,
        store: Arc<dyn Store>,
        backend: Arc<dyn ComputeBackend>,
        retry: RetryPolicy,
    ) -> Self {
        let queues = QueueTable::new(&config.queues);
        Self {
            config,
            queues,
            prices,
            store,
            backend,
            retry,
        }
    }

    pub fn backend(&self) -> &Arc<dyn ComputeBackend> {
        &self.backend
    }

    pub fn results_location(&self, job: &SimulationJob) -> String {
        format!(
            "{}/{}/{}/",
            self.config.results_root.trim_end_matches('/'),
            job.owner_id,
            job.job_id
        )
    }

    fn plan(&self, job: &SimulationJob) -> Result<DispatchPlan> {
        let config = &job.config;
        let architecture = self
            .prices
            .processor(&config.processor_type)
            .map(|spec| spec.architecture)
            .ok_or_else(|| {
                crate::Error::Internal(format!(
                    "processor family {} has no architecture",
                    config.processor_type
                ))
            })?;
        let multi_node = config.model.is_multi_node();
        let route = self.queues.get(architecture, multi_node).ok_or_else(|| {
            crate::Error::Internal(format!(
                "no queue configured for {architecture} (multi-node: {multi_node})"
            ))
        })?;

        let layout = match config.model {
            ModelSetup::Gchp { resolution, nodes } => Some(gchp_layout(
                resolution,
                nodes,
                job.sizing.vcpus_per_node,
            )),
            ModelSetup::Classic { .. } => None,
        };

        let timeout = self.config.timeout.timeout(job.estimated_runtime_hours);
        let expected_runtime =
            Duration::from_secs_f64((job.estimated_runtime_hours * 3600.0).max(0.0));

        let mut environment = vec![
            ("CHEMFLOW_JOB_ID".to_string(), job.job_id.clone()),
            ("CHEMFLOW_OWNER_ID".to_string(), job.owner_id.clone()),
            (
                "CHEMFLOW_SIMULATION_TYPE".to_string(),
                config.simulation_type().to_string(),
            ),
            (
                "CHEMFLOW_RESOLUTION".to_string(),
                config.model.resolution_label().to_string(),
            ),
            (
                "CHEMFLOW_CHEMISTRY".to_string(),
                config.chemistry.to_string(),
            ),
            (
                "CHEMFLOW_START_DATE".to_string(),
                config.start_date.to_string(),
            ),
            ("CHEMFLOW_END_DATE".to_string(), config.end_date.to_string()),
            (
                "CHEMFLOW_SPINUP_DAYS".to_string(),
                config.spinup_days.to_string(),
            ),
            (
                "CHEMFLOW_OUTPUT_FREQUENCY".to_string(),
                config.output_frequency.to_string(),
            ),
            (
                "CHEMFLOW_RESULTS_LOCATION".to_string(),
                self.results_location(job),
            ),
        ];
        if let Some(layout) = &layout {
            environment.extend([
                ("CHEMFLOW_TOTAL_CORES".to_string(), layout.total_cores.to_string()),
                ("CHEMFLOW_NX".to_string(), layout.nx.to_string()),
                ("CHEMFLOW_NY".to_string(), layout.ny.to_string()),
                (
                    "CHEMFLOW_VERTICAL_LEVELS".to_string(),
                    layout.vertical_levels.to_string(),
                ),
            ]);
        }

        Ok(DispatchPlan {
            submission: BackendSubmission {
                idempotency_key: job.job_id.clone(),
                job_name: format!("chemflow-{}", job.job_id),
                queue: route.queue.clone(),
                image: route.image.clone(),
                nodes: job.sizing.nodes,
                vcpus_per_node: job.sizing.vcpus_per_node,
                memory_mib_per_node: u64::from(job.sizing.memory_gb_per_node) * 1024,
                timeout,
                expected_runtime,
                environment,
            },
            layout,
        })
    }

    /// Submits a CREATED job to the compute backend and marks it SUBMITTED.
    ///
    /// The job id is the idempotency key of the submission, so dispatching the same job
    /// again never creates a second backend job. A job the backend refuses is FAILED;
    /// when the backend stays unavailable the job is left CREATED for a later attempt.
    pub async fn dispatch(&self, job: SimulationJob) -> Result<SimulationJob> {
        if job.status != JobStatus::Created || job.dispatch.is_some() {
            return Ok(job);
        }
        let plan = self.plan(&job)?;
        let submission = plan.submission;

        let result = self
            .retry
            .run("Job submission", || self.backend.submit(submission.clone()))
            .await;

        let now = Utc::now();
        let mut job = job;
        loop {
            let mut updated = job.clone();
            match &result {
                Ok(job_ref) => {
                    if !updated.transition(JobStatus::Submitted, now) {
                        return Ok(job);
                    }
                    updated.backend_job_ref = Some(job_ref.clone());
                    updated.results_location = Some(self.results_location(&updated));
                    updated.dispatch = Some(DispatchRecord {
                        backend_job_ref: job_ref.clone(),
                        backend: self.backend.name().to_string(),
                        queue: submission.queue.clone(),
                        image: submission.image.clone(),
                        timeout_seconds: submission.timeout.as_secs(),
                        nodes: submission.nodes,
                        vcpus_per_node: submission.vcpus_per_node,
                        memory_mib_per_node: submission.memory_mib_per_node,
                        layout: plan.layout,
                        submitted_at: now,
                    });
                }
                Err(BackendError::Rejected(reason)) => {
                    if !updated.transition(JobStatus::Failed, now) {
                        return Ok(job);
                    }
                    updated.status_reason = Some(format!("Submission rejected: {reason}"));
                }
                Err(error) => {
                    log::warn!("Job {} stays CREATED: {error}", job.job_id);
                    return Err(BackendError::Unavailable(error.to_string()).into());
                }
            }

            match self
                .retry
                .run("Job update", || self.store.update_job(updated.clone(), None))
                .await
            {
                Ok(stored) => {
                    log::info!(
                        "Job {} dispatched to {}: {}",
                        stored.job_id,
                        submission.queue,
                        stored.status
                    );
                    return Ok(stored);
                }
                Err(StoreError::VersionConflict(_)) => {
                    job = self
                        .store
                        .find_job(&job.job_id)
                        .await?
                        .ok_or(crate::Error::NotFound)?;
                    if job.status != JobStatus::Created || job.dispatch.is_some() {
                        return Ok(job);
                    }
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::utils::{ScriptedBackend, create_gchp_job, create_job};
    use crate::store::MemoryStore;

    fn dispatcher(store: Arc<MemoryStore>, backend: Arc<ScriptedBackend>) -> Dispatcher {
        Dispatcher::new(
            DispatchConfig::default(),
            PriceTable::default(),
            store,
            backend,
            RetryPolicy::no_delay(3),
        )
    }

    #[test]
    fn timeout_is_clamped() {
        let policy = TimeoutPolicy::default();
        assert_eq!(policy.timeout(10.0), Duration::from_secs(54_000));
        assert_eq!(policy.timeout(0.1), Duration::from_secs(3600));
        assert_eq!(policy.timeout(1000.0), Duration::from_secs(14 * 24 * 3600));
        assert_eq!(policy.timeout(f64::NAN), Duration::from_secs(3600));
    }

    #[test]
    fn queue_lookup() {
        let table = QueueTable::new(&DispatchConfig::default().queues);
        assert_eq!(
            table.get(Architecture::Arm64, true).unwrap().queue,
            "geoschem-multi-node-arm64"
        );
        assert_eq!(
            table.get(Architecture::X86_64, false).unwrap().image,
            "geoschem:x86_64"
        );
        assert!(QueueTable::new(&[]).get(Architecture::Arm64, false).is_none());
    }

    #[tokio::test]
    async fn dispatch_marks_job_submitted() {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(ScriptedBackend::default());
        let job = store.insert_job(create_job("alice", "job-1")).await.unwrap();

        let job = dispatcher(store.clone(), backend.clone())
            .dispatch(job)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Submitted);
        assert_eq!(job.results_location.as_deref(), Some("results/alice/job-1/"));
        let record = job.dispatch.unwrap();
        assert_eq!(record.queue, "geoschem-single-node-arm64");
        assert_eq!(record.timeout_seconds, 3600 * 21 / 2);
        assert_eq!(record.layout, None);
        assert_eq!(backend.submissions(), vec!["job-1".to_string()]);
    }

    #[tokio::test]
    async fn gchp_job_gets_layout() {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(ScriptedBackend::default());
        let job = store
            .insert_job(create_gchp_job("alice", "job-1"))
            .await
            .unwrap();

        let job = dispatcher(store, backend).dispatch(job).await.unwrap();
        let record = job.dispatch.unwrap();
        assert_eq!(record.queue, "geoschem-multi-node-x86_64");
        assert_eq!(record.nodes, 2);
        let layout = record.layout.unwrap();
        assert_eq!(layout.total_cores, 64);
        assert_eq!(layout.cores_per_face, 10);
    }

    #[tokio::test]
    async fn redispatch_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(ScriptedBackend::default());
        backend.fail_submissions(5);
        let job = store.insert_job(create_job("alice", "job-1")).await.unwrap();
        let dispatcher = dispatcher(store.clone(), backend.clone());

        let error = dispatcher.dispatch(job).await.unwrap_err();
        assert_eq!(error.kind(), "UpstreamUnavailable");
        let job = store.find_job("job-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Created);

        let job = dispatcher.dispatch(job).await.unwrap();
        assert_eq!(job.status, JobStatus::Submitted);
        let again = dispatcher.dispatch(job.clone()).await.unwrap();
        assert_eq!(again, job);
        assert_eq!(backend.created_jobs(), 1);
    }

    #[tokio::test]
    async fn rejected_submission_fails_job() {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(ScriptedBackend::default());
        backend.reject_submissions("invalid queue");
        let job = store.insert_job(create_job("alice", "job-1")).await.unwrap();

        let job = dispatcher(store, backend).dispatch(job).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.status_reason.unwrap().contains("invalid queue"));
        assert!(job.completed_at.is_some());
    }
}
