use chrono::NaiveDate;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::common::retry::Transient;
use crate::model::{Budget, CostLedgerEntry, JobStatus, SimulationJob};

pub mod memory;

pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Item {0} already exists")]
    AlreadyExists(String),
    #[error("Item {0} was modified concurrently")]
    VersionConflict(String),
    #[error("Item {0} does not exist")]
    Missing(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistent state of the service.
///
/// Every write of a job or a budget is a compare-and-swap: the written item carries the
/// version it was read with, the store rejects it with [`StoreError::VersionConflict`]
/// when the stored version differs, and otherwise stores it with an incremented version.
pub trait Store: Send + Sync {
    fn insert_job(&self, job: SimulationJob) -> BoxFuture<'_, StoreResult<SimulationJob>>;

    fn get_job<'a>(
        &'a self,
        owner_id: &'a str,
        job_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<SimulationJob>>>;

    /// Looks up a job regardless of its owner. Used by the background components.
    fn find_job<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, StoreResult<Option<SimulationJob>>>;

    fn find_job_by_idempotency_key<'a>(
        &'a self,
        owner_id: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<SimulationJob>>>;

    /// Compare-and-swap write of a job. The optional ledger entry is appended atomically
    /// with the job, so a cost delta is recorded exactly when the matching job write wins.
    fn update_job(
        &self,
        job: SimulationJob,
        ledger_entry: Option<CostLedgerEntry>,
    ) -> BoxFuture<'_, StoreResult<SimulationJob>>;

    fn delete_job<'a>(&'a self, owner_id: &'a str, job_id: &'a str)
    -> BoxFuture<'a, StoreResult<bool>>;

    fn jobs_by_status(&self, status: JobStatus) -> BoxFuture<'_, StoreResult<Vec<SimulationJob>>>;

    fn jobs_by_owner<'a>(&'a self, owner_id: &'a str)
    -> BoxFuture<'a, StoreResult<Vec<SimulationJob>>>;

    /// Ledger entries of the owner whose accounting period lies within `[from, to]`.
    fn ledger_entries<'a>(
        &'a self,
        owner_id: &'a str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> BoxFuture<'a, StoreResult<Vec<CostLedgerEntry>>>;

    fn insert_budget(&self, budget: Budget) -> BoxFuture<'_, StoreResult<Budget>>;

    fn get_budget<'a>(
        &'a self,
        owner_id: &'a str,
        budget_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<Budget>>>;

    /// Compare-and-swap write of a budget.
    fn update_budget(&self, budget: Budget) -> BoxFuture<'_, StoreResult<Budget>>;

    fn delete_budget<'a>(
        &'a self,
        owner_id: &'a str,
        budget_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<bool>>;

    fn budgets_by_owner<'a>(&'a self, owner_id: &'a str)
    -> BoxFuture<'a, StoreResult<Vec<Budget>>>;

    fn all_budgets(&self) -> BoxFuture<'_, StoreResult<Vec<Budget>>>;
}
