use chrono::NaiveDate;
use futures::FutureExt;
use futures::future::{BoxFuture, ready};
use itertools::Itertools;
use std::sync::{Mutex, MutexGuard};

use crate::model::{Budget, CostLedgerEntry, JobStatus, SimulationJob};
use crate::store::{Store, StoreError, StoreResult};
use crate::{BudgetId, JobId, Map, OwnerId};

#[derive(Default)]
struct MemoryState {
    jobs: Map<JobId, SimulationJob>,
    idempotency_keys: Map<(OwnerId, String), JobId>,
    ledger: Vec<CostLedgerEntry>,
    budgets: Map<BudgetId, Budget>,
}

/// Store keeping everything in process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> StoreResult<T>) -> StoreResult<T> {
        let mut guard: MutexGuard<MemoryState> = self
            .state
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock is poisoned".to_string()))?;
        f(&mut guard)
    }

    fn run<T: Send + 'static>(
        &self,
        f: impl FnOnce(&mut MemoryState) -> StoreResult<T>,
    ) -> BoxFuture<'_, StoreResult<T>> {
        ready(self.with_state(f)).boxed()
    }

    /// All ledger entries, in the order they were appended.
    pub fn ledger(&self) -> Vec<CostLedgerEntry> {
        self.with_state(|state| Ok(state.ledger.clone()))
            .unwrap_or_default()
    }
}

fn sorted_jobs<'a>(jobs: impl Iterator<Item = &'a SimulationJob>) -> Vec<SimulationJob> {
    jobs.sorted_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.job_id.cmp(&b.job_id))
    })
    .cloned()
    .collect()
}

impl Store for MemoryStore {
    fn insert_job(&self, mut job: SimulationJob) -> BoxFuture<'_, StoreResult<SimulationJob>> {
        self.run(move |state| {
            if state.jobs.contains_key(&job.job_id) {
                return Err(StoreError::AlreadyExists(job.job_id));
            }
            if let Some(key) = &job.idempotency_key {
                let index_key = (job.owner_id.clone(), key.clone());
                if state.idempotency_keys.contains_key(&index_key) {
                    return Err(StoreError::AlreadyExists(format!(
                        "idempotency key {key}"
                    )));
                }
                state.idempotency_keys.insert(index_key, job.job_id.clone());
            }
            job.version = 1;
            state.jobs.insert(job.job_id.clone(), job.clone());
            Ok(job)
        })
    }

    fn get_job<'a>(
        &'a self,
        owner_id: &'a str,
        job_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<SimulationJob>>> {
        self.run(move |state| {
            Ok(state
                .jobs
                .get(job_id)
                .filter(|job| job.owner_id == owner_id)
                .cloned())
        })
    }

    fn find_job<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, StoreResult<Option<SimulationJob>>> {
        self.run(move |state| Ok(state.jobs.get(job_id).cloned()))
    }

    fn find_job_by_idempotency_key<'a>(
        &'a self,
        owner_id: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<SimulationJob>>> {
        self.run(move |state| {
            Ok(state
                .idempotency_keys
                .get(&(owner_id.to_string(), key.to_string()))
                .and_then(|job_id| state.jobs.get(job_id))
                .cloned())
        })
    }

    fn update_job(
        &self,
        mut job: SimulationJob,
        ledger_entry: Option<CostLedgerEntry>,
    ) -> BoxFuture<'_, StoreResult<SimulationJob>> {
        self.run(move |state| {
            let stored = state
                .jobs
                .get_mut(&job.job_id)
                .ok_or_else(|| StoreError::Missing(job.job_id.clone()))?;
            if stored.version != job.version {
                return Err(StoreError::VersionConflict(job.job_id));
            }
            job.version += 1;
            *stored = job.clone();
            if let Some(entry) = ledger_entry {
                state.ledger.push(entry);
            }
            Ok(job)
        })
    }

    fn delete_job<'a>(
        &'a self,
        owner_id: &'a str,
        job_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<bool>> {
        self.run(move |state| {
            if !state
                .jobs
                .get(job_id)
                .is_some_and(|job| job.owner_id == owner_id)
            {
                return Ok(false);
            }
            if let Some(job) = state.jobs.remove(job_id) {
                if let Some(key) = job.idempotency_key {
                    state.idempotency_keys.remove(&(job.owner_id, key));
                }
            }
            Ok(true)
        })
    }

    fn jobs_by_status(&self, status: JobStatus) -> BoxFuture<'_, StoreResult<Vec<SimulationJob>>> {
        self.run(move |state| Ok(sorted_jobs(state.jobs.values().filter(|j| j.status == status))))
    }

    fn jobs_by_owner<'a>(
        &'a self,
        owner_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Vec<SimulationJob>>> {
        self.run(move |state| {
            Ok(sorted_jobs(
                state.jobs.values().filter(|j| j.owner_id == owner_id),
            ))
        })
    }

    fn ledger_entries<'a>(
        &'a self,
        owner_id: &'a str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> BoxFuture<'a, StoreResult<Vec<CostLedgerEntry>>> {
        self.run(move |state| {
            Ok(state
                .ledger
                .iter()
                .filter(|e| e.owner_id == owner_id && e.time_period >= from && e.time_period <= to)
                .cloned()
                .collect())
        })
    }

    fn insert_budget(&self, mut budget: Budget) -> BoxFuture<'_, StoreResult<Budget>> {
        self.run(move |state| {
            if state.budgets.contains_key(&budget.budget_id) {
                return Err(StoreError::AlreadyExists(budget.budget_id));
            }
            budget.version = 1;
            state.budgets.insert(budget.budget_id.clone(), budget.clone());
            Ok(budget)
        })
    }

    fn get_budget<'a>(
        &'a self,
        owner_id: &'a str,
        budget_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<Budget>>> {
        self.run(move |state| {
            Ok(state
                .budgets
                .get(budget_id)
                .filter(|b| b.owner_id == owner_id)
                .cloned())
        })
    }

    fn update_budget(&self, mut budget: Budget) -> BoxFuture<'_, StoreResult<Budget>> {
        self.run(move |state| {
            let stored = state
                .budgets
                .get_mut(&budget.budget_id)
                .ok_or_else(|| StoreError::Missing(budget.budget_id.clone()))?;
            if stored.version != budget.version {
                return Err(StoreError::VersionConflict(budget.budget_id));
            }
            budget.version += 1;
            *stored = budget.clone();
            Ok(budget)
        })
    }

    fn delete_budget<'a>(
        &'a self,
        owner_id: &'a str,
        budget_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<bool>> {
        self.run(move |state| {
            if !state
                .budgets
                .get(budget_id)
                .is_some_and(|b| b.owner_id == owner_id)
            {
                return Ok(false);
            }
            Ok(state.budgets.remove(budget_id).is_some())
        })
    }

    fn budgets_by_owner<'a>(
        &'a self,
        owner_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Vec<Budget>>> {
        self.run(move |state| {
            Ok(state
                .budgets
                .values()
                .filter(|b| b.owner_id == owner_id)
                .sorted_by(|a, b| a.created_at.cmp(&b.created_at))
                .cloned()
                .collect())
        })
    }

    fn all_budgets(&self) -> BoxFuture<'_, StoreResult<Vec<Budget>>> {
        self.run(|state| Ok(state.budgets.values().cloned().collect()))
    }
}
