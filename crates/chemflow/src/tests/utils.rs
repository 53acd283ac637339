use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use derive_builder::Builder;
use futures::FutureExt;
use futures::future::{BoxFuture, ready};
use simcost::{
    BenchmarkCatalog, ChemistryOption, CostEstimator, CubedSphereResolution, EstimatorParameters,
    InstanceSize, LatLonResolution, ModelSetup, OutputFrequency, PriceTable, SimulationConfig,
};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::Map;
use crate::common::config::AppConfig;
use crate::common::retry::RetryPolicy;
use crate::model::{Budget, CostLedgerEntry, JobStatus, SimulationJob};
use crate::server::bootstrap::ServerContext;
use crate::server::budget::BudgetManager;
use crate::server::dispatch::Dispatcher;
use crate::server::dispatch::backend::{
    BackendError, BackendJobDescription, BackendJobRef, BackendResult, BackendSubmission,
    ComputeBackend,
};
use crate::server::monitor::StatusMonitor;
use crate::server::notify::{BudgetAlert, EventStreamer, Notification, Notifier};
use crate::server::service::SimulationService;
use crate::server::tracker::CostTracker;
use crate::server::validator::{SimulationRequest, SizingHint};
use crate::store::{MemoryStore, Store, StoreError, StoreResult};

/// `secs` seconds after the start of March 2024.
pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

pub fn test_estimator() -> Arc<CostEstimator> {
    Arc::new(CostEstimator::new(
        PriceTable::default(),
        EstimatorParameters::default(),
    ))
}

fn job_from_config(owner: &str, id: &str, config: SimulationConfig, sizing: SizingHint) -> SimulationJob {
    let catalog = BenchmarkCatalog::builtin().unwrap();
    let estimate = test_estimator()
        .estimate_with_catalog(&config, &catalog)
        .unwrap();
    SimulationJob::new(
        owner.to_string(),
        id.to_string(),
        config,
        sizing,
        &estimate,
        ts(0),
        None,
    )
}

/// CREATED job: one week of GC_CLASSIC 4x5 on a spot graviton3 medium instance,
/// estimated to run for 7 hours.
pub fn create_job(owner: &str, id: &str) -> SimulationJob {
    let config = SimulationConfig {
        model: ModelSetup::Classic {
            resolution: LatLonResolution::FourByFive,
        },
        chemistry: ChemistryOption::Fullchem,
        start_date: date(2020, 1, 1),
        end_date: date(2020, 1, 8),
        spinup_days: 0,
        processor_type: "graviton3".to_string(),
        instance_size: InstanceSize::Medium,
        use_spot: true,
        output_frequency: OutputFrequency::Daily,
    };
    let sizing = SizingHint {
        nodes: 1,
        vcpus_per_node: 32,
        memory_gb_per_node: 64,
        total_vcpus: 32,
        total_memory_gb: 64,
        required_memory_gb: 8,
    };
    job_from_config(owner, id, config, sizing)
}

/// CREATED job: GCHP C48 on two intel medium nodes.
pub fn create_gchp_job(owner: &str, id: &str) -> SimulationJob {
    let config = SimulationConfig {
        model: ModelSetup::Gchp {
            resolution: CubedSphereResolution::C48,
            nodes: 2,
        },
        chemistry: ChemistryOption::Fullchem,
        start_date: date(2020, 1, 1),
        end_date: date(2020, 1, 31),
        spinup_days: 0,
        processor_type: "intel".to_string(),
        instance_size: InstanceSize::Medium,
        use_spot: false,
        output_frequency: OutputFrequency::Daily,
    };
    let sizing = SizingHint {
        nodes: 2,
        vcpus_per_node: 32,
        memory_gb_per_node: 64,
        total_vcpus: 64,
        total_memory_gb: 128,
        required_memory_gb: 64,
    };
    job_from_config(owner, id, config, sizing)
}

/// Valid GC_CLASSIC request unless changed through the builder.
#[derive(Builder, Clone)]
#[builder(pattern = "owned", build_fn(name = "finish"))]
pub struct Request {
    #[builder(default = "\"GC_CLASSIC\".to_string()", setter(into))]
    simulation_type: String,
    #[builder(default = "\"4x5\".to_string()", setter(into))]
    resolution: String,
    #[builder(default = "\"2020-01-01\".to_string()", setter(into))]
    start_date: String,
    #[builder(default = "\"2020-01-08\".to_string()", setter(into))]
    end_date: String,
    #[builder(default = "\"graviton3\".to_string()", setter(into))]
    processor_type: String,
    #[builder(default = "\"medium\".to_string()", setter(into))]
    instance_size: String,
    #[builder(default = "true")]
    use_spot: bool,
    #[builder(default, setter(into, strip_option))]
    output_frequency: Option<String>,
    #[builder(default, setter(into, strip_option))]
    chemistry_option: Option<String>,
    #[builder(default, setter(into, strip_option))]
    cubedsphere_res: Option<String>,
    #[builder(default, setter(strip_option))]
    nodes: Option<u32>,
    #[builder(default)]
    allow_large_resources: bool,
}

impl RequestBuilder {
    pub fn build(self) -> SimulationRequest {
        let request = self.finish().unwrap();
        SimulationRequest {
            simulation_type: Some(request.simulation_type),
            chemistry_option: request.chemistry_option,
            resolution: Some(request.resolution),
            cubedsphere_res: request.cubedsphere_res,
            start_date: Some(request.start_date),
            end_date: Some(request.end_date),
            spinup_days: None,
            processor_type: Some(request.processor_type),
            instance_size: Some(request.instance_size),
            use_spot: Some(request.use_spot),
            output_frequency: request.output_frequency,
            nodes: request.nodes,
            allow_large_resources: Some(request.allow_large_resources),
        }
    }
}

const SCRIPTED_STATUS_TABLE: &[(&str, JobStatus)] = &[
    ("SUBMITTED", JobStatus::Submitted),
    ("PENDING", JobStatus::Submitted),
    ("RUNNABLE", JobStatus::Submitted),
    ("STARTING", JobStatus::Submitted),
    ("RUNNING", JobStatus::Running),
    ("SUCCEEDED", JobStatus::Succeeded),
    ("FAILED", JobStatus::Failed),
    ("CANCELLED", JobStatus::Canceled),
];

#[derive(Default)]
struct ScriptedState {
    jobs: Map<BackendJobRef, BackendJobDescription>,
    keys: Map<String, BackendJobRef>,
    submissions: Vec<String>,
    canceled: Vec<BackendJobRef>,
    failing_submissions: usize,
    rejection: Option<String>,
    fail_describe: bool,
    created: usize,
}

/// Compute backend whose answers are set by the test.
#[derive(Default)]
pub struct ScriptedBackend {
    state: Mutex<ScriptedState>,
}

impl ScriptedBackend {
    /// Idempotency keys of the accepted submissions.
    pub fn submissions(&self) -> Vec<String> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn created_jobs(&self) -> usize {
        self.state.lock().unwrap().created
    }

    pub fn canceled(&self) -> Vec<BackendJobRef> {
        self.state.lock().unwrap().canceled.clone()
    }

    /// The next `count` submissions fail as unavailable.
    pub fn fail_submissions(&self, count: usize) {
        self.state.lock().unwrap().failing_submissions = count;
    }

    pub fn reject_submissions(&self, reason: &str) {
        self.state.lock().unwrap().rejection = Some(reason.to_string());
    }

    pub fn fail_describe(&self, fail: bool) {
        self.state.lock().unwrap().fail_describe = fail;
    }

    pub fn set_status(
        &self,
        job_ref: &str,
        native_status: &str,
        started_at: Option<DateTime<Utc>>,
        stopped_at: Option<DateTime<Utc>>,
        progress: Option<f64>,
    ) {
        self.state.lock().unwrap().jobs.insert(
            job_ref.to_string(),
            BackendJobDescription {
                native_status: native_status.to_string(),
                started_at,
                stopped_at,
                progress,
                reason: None,
            },
        );
    }

    /// The backend stops knowing the job.
    pub fn forget(&self, job_ref: &str) {
        self.state.lock().unwrap().jobs.remove(job_ref);
    }
}

impl ComputeBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn status_table(&self) -> &'static [(&'static str, JobStatus)] {
        SCRIPTED_STATUS_TABLE
    }

    fn submit(&self, submission: BackendSubmission) -> BoxFuture<'_, BackendResult<BackendJobRef>> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let result = if let Some(reason) = &state.rejection {
            Err(BackendError::Rejected(reason.clone()))
        } else if state.failing_submissions > 0 {
            state.failing_submissions -= 1;
            Err(BackendError::Unavailable("injected failure".to_string()))
        } else {
            let key = submission.idempotency_key;
            let job_ref = match state.keys.get(&key) {
                Some(job_ref) => job_ref.clone(),
                None => {
                    state.created += 1;
                    let job_ref = format!("scripted-{}", state.created);
                    state.keys.insert(key.clone(), job_ref.clone());
                    state.jobs.insert(
                        job_ref.clone(),
                        BackendJobDescription {
                            native_status: "SUBMITTED".to_string(),
                            started_at: None,
                            stopped_at: None,
                            progress: None,
                            reason: None,
                        },
                    );
                    job_ref
                }
            };
            state.submissions.push(key);
            Ok(job_ref)
        };
        ready(result).boxed()
    }

    fn describe<'a>(
        &'a self,
        job_ref: &'a str,
    ) -> BoxFuture<'a, BackendResult<BackendJobDescription>> {
        async move {
            tokio::task::yield_now().await;
            let state = self.state.lock().unwrap();
            if state.fail_describe {
                return Err(BackendError::Unavailable("injected failure".to_string()));
            }
            state
                .jobs
                .get(job_ref)
                .cloned()
                .ok_or_else(|| BackendError::JobNotFound(job_ref.to_string()))
        }
        .boxed()
    }

    fn cancel<'a>(&'a self, job_ref: &'a str, _reason: &'a str) -> BoxFuture<'a, BackendResult<()>> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let result = match state.jobs.get_mut(job_ref) {
            Some(job) => {
                job.native_status = "CANCELLED".to_string();
                state.canceled.push(job_ref.to_string());
                Ok(())
            }
            None => Err(BackendError::JobNotFound(job_ref.to_string())),
        };
        ready(result).boxed()
    }
}

fn unavailable<T: Send + 'static>() -> BoxFuture<'static, StoreResult<T>> {
    ready(Err(StoreError::Unavailable("injected failure".to_string()))).boxed()
}

/// Memory store that can be switched into failing every call, fail a number of writes, or
/// yield to other tasks before every write.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    unavailable: AtomicBool,
    failing_writes: AtomicUsize,
    yield_on_write: AtomicBool,
}

impl FlakyStore {
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The next `count` job or budget updates fail as unavailable.
    pub fn fail_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Lets concurrently polled tasks read the same version before any of them writes.
    pub fn yield_on_write(&self, enabled: bool) {
        self.yield_on_write.store(enabled, Ordering::SeqCst);
    }

    fn is_down(&self) -> bool {
        self.unavailable.load(Ordering::SeqCst)
    }

    fn write_fails(&self) -> bool {
        self.is_down()
            || self
                .failing_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1))
                .is_ok()
    }

    fn write<'a, T, F>(&'a self, write: F) -> BoxFuture<'a, StoreResult<T>>
    where
        T: Send + 'a,
        F: FnOnce() -> BoxFuture<'a, StoreResult<T>> + Send + 'a,
    {
        if !self.yield_on_write.load(Ordering::SeqCst) {
            return write();
        }
        async move {
            tokio::task::yield_now().await;
            write().await
        }
        .boxed()
    }

    pub fn ledger(&self) -> Vec<CostLedgerEntry> {
        self.inner.ledger()
    }
}

impl Store for FlakyStore {
    fn insert_job(&self, job: SimulationJob) -> BoxFuture<'_, StoreResult<SimulationJob>> {
        if self.is_down() {
            return unavailable();
        }
        self.inner.insert_job(job)
    }

    fn get_job<'a>(
        &'a self,
        owner_id: &'a str,
        job_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<SimulationJob>>> {
        if self.is_down() {
            return unavailable();
        }
        self.inner.get_job(owner_id, job_id)
    }

    fn find_job<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, StoreResult<Option<SimulationJob>>> {
        if self.is_down() {
            return unavailable();
        }
        self.inner.find_job(job_id)
    }

    fn find_job_by_idempotency_key<'a>(
        &'a self,
        owner_id: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<SimulationJob>>> {
        if self.is_down() {
            return unavailable();
        }
        self.inner.find_job_by_idempotency_key(owner_id, key)
    }

    fn update_job(
        &self,
        job: SimulationJob,
        ledger_entry: Option<CostLedgerEntry>,
    ) -> BoxFuture<'_, StoreResult<SimulationJob>> {
        if self.write_fails() {
            return unavailable();
        }
        self.write(move || self.inner.update_job(job, ledger_entry))
    }

    fn delete_job<'a>(&'a self, owner_id: &'a str, job_id: &'a str) -> BoxFuture<'a, StoreResult<bool>> {
        if self.is_down() {
            return unavailable();
        }
        self.inner.delete_job(owner_id, job_id)
    }

    fn jobs_by_status(&self, status: JobStatus) -> BoxFuture<'_, StoreResult<Vec<SimulationJob>>> {
        if self.is_down() {
            return unavailable();
        }
        self.inner.jobs_by_status(status)
    }

    fn jobs_by_owner<'a>(&'a self, owner_id: &'a str) -> BoxFuture<'a, StoreResult<Vec<SimulationJob>>> {
        if self.is_down() {
            return unavailable();
        }
        self.inner.jobs_by_owner(owner_id)
    }

    fn ledger_entries<'a>(
        &'a self,
        owner_id: &'a str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> BoxFuture<'a, StoreResult<Vec<CostLedgerEntry>>> {
        if self.is_down() {
            return unavailable();
        }
        self.inner.ledger_entries(owner_id, from, to)
    }

    fn insert_budget(&self, budget: Budget) -> BoxFuture<'_, StoreResult<Budget>> {
        if self.is_down() {
            return unavailable();
        }
        self.inner.insert_budget(budget)
    }

    fn get_budget<'a>(
        &'a self,
        owner_id: &'a str,
        budget_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<Budget>>> {
        if self.is_down() {
            return unavailable();
        }
        self.inner.get_budget(owner_id, budget_id)
    }

    fn update_budget(&self, budget: Budget) -> BoxFuture<'_, StoreResult<Budget>> {
        if self.write_fails() {
            return unavailable();
        }
        self.write(move || self.inner.update_budget(budget))
    }

    fn delete_budget<'a>(
        &'a self,
        owner_id: &'a str,
        budget_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<bool>> {
        if self.is_down() {
            return unavailable();
        }
        self.inner.delete_budget(owner_id, budget_id)
    }

    fn budgets_by_owner<'a>(&'a self, owner_id: &'a str) -> BoxFuture<'a, StoreResult<Vec<Budget>>> {
        if self.is_down() {
            return unavailable();
        }
        self.inner.budgets_by_owner(owner_id)
    }

    fn all_budgets(&self) -> BoxFuture<'_, StoreResult<Vec<Budget>>> {
        if self.is_down() {
            return unavailable();
        }
        self.inner.all_budgets()
    }
}

/// Notifier that keeps everything it was asked to deliver.
#[derive(Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn completed(&self) -> Vec<(String, JobStatus)> {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .filter_map(|notification| match notification {
                Notification::JobCompleted { job_id, status, .. } => {
                    Some((job_id.clone(), *status))
                }
                Notification::BudgetAlert(_) => None,
            })
            .collect()
    }

    pub fn alerts(&self) -> Vec<BudgetAlert> {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .filter_map(|notification| match notification {
                Notification::BudgetAlert(alert) => Some(alert.clone()),
                Notification::JobCompleted { .. } => None,
            })
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) -> BoxFuture<'_, anyhow::Result<()>> {
        self.notifications.lock().unwrap().push(notification);
        ready(Ok(())).boxed()
    }
}

/// Fully wired service on top of test doubles.
pub struct TestContext {
    pub server: Arc<ServerContext>,
    pub store: Arc<FlakyStore>,
    pub backend: Arc<ScriptedBackend>,
    pub notifier: Arc<RecordingNotifier>,
    pub events: EventStreamer,
    pub dispatcher: Arc<Dispatcher>,
    pub tracker: Arc<CostTracker>,
    pub monitor: Arc<StatusMonitor>,
    pub budgets: Arc<BudgetManager>,
    pub service: Arc<SimulationService>,
}

pub fn test_context() -> TestContext {
    test_context_with(|_| {})
}

pub fn test_context_with(configure: impl FnOnce(&mut AppConfig)) -> TestContext {
    let mut config = AppConfig::default();
    config.retry = RetryPolicy::no_delay(3);
    configure(&mut config);

    let store = Arc::new(FlakyStore::default());
    let backend = Arc::new(ScriptedBackend::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let server = Arc::new(
        ServerContext::new(
            config,
            BenchmarkCatalog::builtin().unwrap(),
            store.clone(),
            backend.clone(),
            notifier.clone(),
        )
        .unwrap(),
    );
    TestContext {
        store,
        backend,
        notifier,
        events: server.events.clone(),
        dispatcher: server.dispatcher.clone(),
        tracker: server.tracker.clone(),
        monitor: server.monitor.clone(),
        budgets: server.budgets.clone(),
        service: server.service.clone(),
        server,
    }
}
