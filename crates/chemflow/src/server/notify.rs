use chrono::serde::ts_milliseconds;
use chrono::{DateTime, NaiveDate, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::JobStatus;
use crate::{BudgetId, JobId, OwnerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    /// Usage crossed the configured alert threshold.
    Threshold,
    /// Usage crossed the whole budget amount.
    Exceeded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetAlert {
    pub owner_id: OwnerId,
    pub budget_id: BudgetId,
    pub budget_name: String,
    pub kind: AlertKind,
    pub threshold: f64,
    pub percent_used: f64,
    pub current_usage: f64,
    pub amount: f64,
    pub period_start: NaiveDate,
}

/// Messages delivered to users through the notification channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notification {
    #[serde(rename_all = "camelCase")]
    JobCompleted {
        owner_id: OwnerId,
        job_id: JobId,
        status: JobStatus,
        final_cost: f64,
        results_location: Option<String>,
    },
    BudgetAlert(BudgetAlert),
}

/// Outbound notification channel (e-mail, chat, queue).
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Notifier that only writes notifications into the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) -> BoxFuture<'_, anyhow::Result<()>> {
        async move {
            match &notification {
                Notification::JobCompleted {
                    owner_id,
                    job_id,
                    status,
                    final_cost,
                    ..
                } => log::info!(
                    "Notification for {owner_id}: job {job_id} finished as {status}, cost ${final_cost:.2}"
                ),
                Notification::BudgetAlert(alert) => log::info!(
                    "Notification for {}: budget '{}' is at {:.1}% ({:?})",
                    alert.owner_id,
                    alert.budget_name,
                    alert.percent_used,
                    alert.kind
                ),
            }
            Ok(())
        }
        .boxed()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        owner_id: OwnerId,
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[serde(rename_all = "camelCase")]
    CostUpdated {
        owner_id: OwnerId,
        job_id: JobId,
        current_cost: f64,
    },
    BudgetAlert(BudgetAlert),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(with = "ts_milliseconds")]
    pub time: DateTime<Utc>,
    pub payload: EventPayload,
}

/// In-process fan-out of job and budget events.
#[derive(Clone)]
pub struct EventStreamer {
    sender: broadcast::Sender<Event>,
}

impl EventStreamer {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn on_status_changed(&self, owner_id: &str, job_id: &str, from: JobStatus, to: JobStatus) {
        self.send_event(EventPayload::StatusChanged {
            owner_id: owner_id.to_string(),
            job_id: job_id.to_string(),
            from,
            to,
        });
    }

    #[inline]
    pub fn on_cost_updated(&self, owner_id: &str, job_id: &str, current_cost: f64) {
        self.send_event(EventPayload::CostUpdated {
            owner_id: owner_id.to_string(),
            job_id: job_id.to_string(),
            current_cost,
        });
    }

    pub fn on_budget_alert(&self, alert: BudgetAlert) {
        self.send_event(EventPayload::BudgetAlert(alert));
    }

    fn send_event(&self, payload: EventPayload) {
        // Sending only fails when nobody listens
        let _ = self.sender.send(Event {
            time: Utc::now(),
            payload,
        });
    }
}

impl Default for EventStreamer {
    fn default() -> Self {
        Self::new(1024)
    }
}
