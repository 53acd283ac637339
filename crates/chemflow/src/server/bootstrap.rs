use anyhow::Context;
use simcost::{BenchmarkCatalog, CostEstimator};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use crate::api::create_router;
use crate::common::config::AppConfig;
use crate::server::budget::BudgetManager;
use crate::server::dispatch::backend::ComputeBackend;
use crate::server::dispatch::simulated::SimulatedBackend;
use crate::server::dispatch::slurm::SlurmBackend;
use crate::server::dispatch::{BackendKind, DispatchConfig, Dispatcher};
use crate::server::monitor::StatusMonitor;
use crate::server::notify::{EventStreamer, LogNotifier, Notifier};
use crate::server::process::background_process;
use crate::server::service::SimulationService;
use crate::server::tracker::CostTracker;
use crate::server::validator::Validator;
use crate::store::{MemoryStore, Store};

/// All components of a running service, wired to a shared store, backend and event stream.
pub struct ServerContext {
    pub config: AppConfig,
    pub store: Arc<dyn Store>,
    pub events: EventStreamer,
    pub dispatcher: Arc<Dispatcher>,
    pub tracker: Arc<CostTracker>,
    pub monitor: Arc<StatusMonitor>,
    pub budgets: Arc<BudgetManager>,
    pub service: Arc<SimulationService>,
}

impl ServerContext {
    pub fn new(
        config: AppConfig,
        catalog: BenchmarkCatalog,
        store: Arc<dyn Store>,
        backend: Arc<dyn ComputeBackend>,
        notifier: Arc<dyn Notifier>,
    ) -> anyhow::Result<Self> {
        let prices = config.price_table()?;
        let events = EventStreamer::new(config.server.event_capacity);
        let retry = config.retry.clone();

        let estimator = Arc::new(CostEstimator::new(
            prices.clone(),
            config.estimator.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            config.dispatch.clone(),
            prices.clone(),
            store.clone(),
            backend,
            retry.clone(),
        ));
        let tracker = Arc::new(CostTracker::new(
            store.clone(),
            estimator.clone(),
            events.clone(),
            retry.clone(),
        ));
        let monitor = Arc::new(StatusMonitor::new(
            config.monitor.clone(),
            store.clone(),
            dispatcher.clone(),
            tracker.clone(),
            events.clone(),
            notifier.clone(),
            retry.clone(),
        ));
        let budgets = Arc::new(BudgetManager::new(
            config.budget.clone(),
            store.clone(),
            events.clone(),
            notifier,
            retry.clone(),
        ));
        let service = Arc::new(SimulationService::new(
            Validator::new(config.validator.clone(), prices),
            estimator,
            Arc::new(catalog),
            store.clone(),
            dispatcher.clone(),
            retry,
        ));

        Ok(Self {
            config,
            store,
            events,
            dispatcher,
            tracker,
            monitor,
            budgets,
            service,
        })
    }
}

pub fn create_backend(config: &DispatchConfig) -> Arc<dyn ComputeBackend> {
    match config.backend {
        BackendKind::Simulated => Arc::new(SimulatedBackend::new(config.simulated.clone())),
        BackendKind::Slurm => Arc::new(SlurmBackend::new(config.slurm.clone())),
    }
}

/// Context for commands that only estimate and validate, without a running backend.
pub fn offline_context(config: AppConfig) -> anyhow::Result<ServerContext> {
    let catalog = config.benchmark_catalog()?;
    let backend = Arc::new(SimulatedBackend::new(config.dispatch.simulated.clone()));
    ServerContext::new(
        config,
        catalog,
        Arc::new(MemoryStore::new()),
        backend,
        Arc::new(LogNotifier),
    )
}

/// Starts the HTTP API and the background process and runs them until Ctrl-C.
pub async fn run_server(config: AppConfig) -> anyhow::Result<()> {
    let catalog = config.benchmark_catalog()?;
    log::info!("Loaded {} benchmark entries", catalog.len());
    let backend = create_backend(&config.dispatch);
    log::info!("Using the {} compute backend", backend.name());
    let bind = config.server.bind;

    let ctx = Arc::new(ServerContext::new(
        config,
        catalog,
        Arc::new(MemoryStore::new()),
        backend,
        Arc::new(LogNotifier),
    )?);

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Cannot bind to {bind}"))?;
    log::info!("Listening on {bind}");

    let stop = Arc::new(Notify::new());
    let process = tokio::spawn(background_process(ctx.clone(), stop.clone()));

    let shutdown = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            log::error!("Cannot listen for Ctrl-C: {error}");
        }
        log::info!("Received SIGINT, attempting to stop");
    };
    let result = axum::serve(listener, create_router(ctx))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error");

    log::debug!("Shutting down background process");
    stop.notify_one();
    if let Err(error) = process.await {
        log::error!("Background process crashed: {error}");
    }
    log::info!("Server stopped");
    result
}
