use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use simcost::{CostEstimator, round_cents};
use std::sync::Arc;
use std::time::Duration;

use crate::Result;
use crate::common::retry::RetryPolicy;
use crate::model::{CostLedgerEntry, JobStatus, SimulationJob};
use crate::server::notify::EventStreamer;
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    #[serde(with = "crate::common::serde_duration")]
    pub interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// New accounted cost of a job together with the ledger delta that records it.
#[derive(Debug, Clone, PartialEq)]
pub struct CostReconciliation {
    pub total: f64,
    pub ledger_entry: Option<CostLedgerEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerReport {
    pub active_jobs: usize,
    pub updated_jobs: usize,
    pub total_current_cost: f64,
}

pub struct CostTracker {
    store: Arc<dyn Store>,
    estimator: Arc<CostEstimator>,
    events: EventStreamer,
    retry: RetryPolicy,
}

impl CostTracker {
    pub fn new(
        store: Arc<dyn Store>,
        estimator: Arc<CostEstimator>,
        events: EventStreamer,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            estimator,
            events,
            retry,
        }
    }

    /// Computes the cost `job` has accrued at `at`.
    ///
    /// The result never goes below the already accounted cost; the difference, if any,
    /// becomes the ledger entry. A job that never started costs nothing.
    pub fn reconcile(&self, job: &SimulationJob, at: DateTime<Utc>) -> Result<CostReconciliation> {
        let previous = job.current_cost.unwrap_or(0.0);
        let Some(started_at) = job.started_at else {
            return Ok(CostReconciliation {
                total: previous,
                ledger_entry: None,
            });
        };
        let elapsed_hours = (at - started_at).num_milliseconds().max(0) as f64 / 3_600_000.0;
        let accrued =
            self.estimator
                .accrued_cost(&job.config, job.estimated_storage_gb, elapsed_hours)?;
        let total = round_cents(accrued.total).max(previous);
        let delta = round_cents(total - previous);
        let ledger_entry = (delta > 0.0).then(|| {
            CostLedgerEntry::new(job.owner_id.clone(), job.job_id.clone(), at, delta)
        });
        Ok(CostReconciliation {
            total,
            ledger_entry,
        })
    }

    /// Persists the cost of a running job. Returns `None` when the job was changed by
    /// someone else in the meantime; the next tick picks it up again.
    pub async fn update_job_cost(
        &self,
        job: SimulationJob,
        now: DateTime<Utc>,
    ) -> Result<Option<SimulationJob>> {
        if job.status != JobStatus::Running {
            return Ok(None);
        }
        let reconciliation = self.reconcile(&job, now)?;
        if job.current_cost == Some(reconciliation.total) {
            return Ok(Some(job));
        }
        let mut updated = job;
        updated.current_cost = Some(reconciliation.total);
        match self
            .retry
            .run("Cost update", || {
                self.store
                    .update_job(updated.clone(), reconciliation.ledger_entry.clone())
            })
            .await
        {
            Ok(stored) => {
                self.events
                    .on_cost_updated(&stored.owner_id, &stored.job_id, reconciliation.total);
                Ok(Some(stored))
            }
            Err(StoreError::VersionConflict(id)) | Err(StoreError::Missing(id)) => {
                log::debug!("Cost of job {id} changed concurrently, skipping");
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TrackerReport> {
        let jobs = self
            .retry
            .run("Listing running jobs", || {
                self.store.jobs_by_status(JobStatus::Running)
            })
            .await?;

        let mut report = TrackerReport {
            active_jobs: jobs.len(),
            ..Default::default()
        };
        for job in jobs {
            let job_id = job.job_id.clone();
            let previous = job.current_cost;
            match self.update_job_cost(job, now).await {
                Ok(Some(job)) => {
                    if job.current_cost != previous {
                        report.updated_jobs += 1;
                    }
                    report.total_current_cost += job.current_cost.unwrap_or(0.0);
                }
                Ok(None) => {}
                Err(error) => log::error!("Cannot update cost of job {job_id}: {error}"),
            }
        }
        report.total_current_cost = round_cents(report.total_current_cost);
        log::debug!(
            "Cost tick: {} running jobs, {} updated, ${:.2} accrued",
            report.active_jobs,
            report.updated_jobs,
            report.total_current_cost
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::tests::utils::{create_job, test_estimator, ts};

    fn tracker(store: Arc<MemoryStore>) -> CostTracker {
        CostTracker::new(
            store,
            test_estimator(),
            EventStreamer::default(),
            RetryPolicy::no_delay(1),
        )
    }

    fn running_job(id: &str) -> SimulationJob {
        let mut job = create_job("alice", id);
        job.status = JobStatus::Running;
        job.started_at = Some(ts(0));
        job
    }

    #[tokio::test]
    async fn empty_tick() {
        let store = Arc::new(MemoryStore::new());
        let report = tracker(store).tick(ts(0)).await.unwrap();
        assert_eq!(report, TrackerReport::default());
    }

    #[test]
    fn cost_of_running_job() {
        let store = Arc::new(MemoryStore::new());
        let job = running_job("job-1");
        // spot graviton3 medium: 1.224 * 0.3 per hour, 2 hours
        let reconciliation = tracker(store).reconcile(&job, ts(7200)).unwrap();
        let storage = job.estimated_storage_gb;
        let expected = 1.224 * 0.3 * 2.0 + storage * 0.023 / 30.0 * 2.0 / 24.0 + storage * 0.09;
        assert_eq!(reconciliation.total, round_cents(expected));
        assert_eq!(
            reconciliation.ledger_entry.unwrap().cost,
            round_cents(expected)
        );
    }

    #[test]
    fn not_started_job_costs_nothing() {
        let store = Arc::new(MemoryStore::new());
        let job = create_job("alice", "job-1");
        let reconciliation = tracker(store).reconcile(&job, ts(7200)).unwrap();
        assert_eq!(reconciliation.total, 0.0);
        assert!(reconciliation.ledger_entry.is_none());
    }

    #[tokio::test]
    async fn cost_is_monotonic_across_ticks() {
        let store = Arc::new(MemoryStore::new());
        store.insert_job(running_job("job-1")).await.unwrap();
        let tracker = tracker(store.clone());

        let mut last = 0.0;
        for secs in [3600, 7200, 3600, 10800] {
            tracker.tick(ts(secs)).await.unwrap();
            let job = store.find_job("job-1").await.unwrap().unwrap();
            let cost = job.current_cost.unwrap();
            assert!(cost >= last);
            last = cost;
        }
        let ledger_total: f64 = store.ledger().iter().map(|e| e.cost).sum();
        assert!((round_cents(ledger_total) - last).abs() < 1e-9);
    }

    #[tokio::test]
    async fn tick_reports_running_jobs() {
        let store = Arc::new(MemoryStore::new());
        store.insert_job(running_job("job-1")).await.unwrap();
        store.insert_job(running_job("job-2")).await.unwrap();
        store.insert_job(create_job("alice", "job-3")).await.unwrap();

        let report = tracker(store.clone()).tick(ts(3600)).await.unwrap();
        assert_eq!(report.active_jobs, 2);
        assert_eq!(report.updated_jobs, 2);
        assert!(report.total_current_cost > 0.0);

        let report = tracker(store).tick(ts(3600)).await.unwrap();
        assert_eq!(report.updated_jobs, 0);
    }

    #[tokio::test]
    async fn stale_job_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let job = store.insert_job(running_job("job-1")).await.unwrap();
        let tracker = tracker(store.clone());
        let mut newer = job.clone();
        newer.progress = Some(50.0);
        store.update_job(newer, None).await.unwrap();

        assert!(tracker.update_job_cost(job, ts(3600)).await.unwrap().is_none());
        assert!(store.ledger().is_empty());
    }
}
