use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::common::error::Violation;
use crate::common::ids::new_budget_id;
use crate::common::retry::RetryPolicy;
use crate::model::ledger::total_cost;
use crate::model::{AlertState, Budget, BudgetPeriod, BudgetStatus, BudgetUsage};
use crate::model::budget::percent_used;
use crate::server::notify::{AlertKind, BudgetAlert, EventStreamer, Notification, Notifier};
use crate::store::{Store, StoreError};
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    #[serde(with = "crate::common::serde_duration")]
    pub check_interval: Duration,
    /// Alert threshold in percent used when a request does not specify one.
    pub default_alert_threshold: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5 * 60),
            default_alert_threshold: 80.0,
        }
    }
}

/// Body of budget create and update requests. Updates only change the given fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetRequest {
    pub name: Option<String>,
    pub amount: Option<f64>,
    /// `MONTHLY` or `CUSTOM`.
    pub period: Option<String>,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub alert_threshold: Option<f64>,
    pub status: Option<BudgetStatus>,
    pub alert_enabled: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetCheckReport {
    pub checked_budgets: usize,
    pub alerts: usize,
}

fn check_amount(violations: &mut Vec<Violation>, amount: f64) {
    if !amount.is_finite() || amount < 0.0 {
        violations.push(Violation::new("amount", "must be a non-negative number"));
    }
}

fn check_threshold(violations: &mut Vec<Violation>, threshold: f64) {
    if !threshold.is_finite() || threshold <= 0.0 || threshold > 100.0 {
        violations.push(Violation::new(
            "alertThreshold",
            "must be a percentage in (0, 100]",
        ));
    }
}

/// Applies the period fields of `request` on top of `current`.
fn parse_period(
    violations: &mut Vec<Violation>,
    request: &BudgetRequest,
    current: Option<BudgetPeriod>,
) -> Option<BudgetPeriod> {
    let (current_start, current_end) = match current {
        Some(BudgetPeriod::Custom { start, end }) => (Some(start), Some(end)),
        _ => (None, None),
    };
    let kind = match request.period.as_deref().map(str::trim) {
        Some(kind) => kind.to_uppercase(),
        None => match current {
            Some(BudgetPeriod::Custom { .. }) => "CUSTOM".to_string(),
            _ if request.period_start.is_some() || request.period_end.is_some() => {
                "CUSTOM".to_string()
            }
            _ => "MONTHLY".to_string(),
        },
    };
    match kind.as_str() {
        "MONTHLY" => Some(BudgetPeriod::Monthly),
        "CUSTOM" => {
            let start = request.period_start.or(current_start);
            let end = request.period_end.or(current_end);
            match (start, end) {
                (Some(start), Some(end)) if start <= end => Some(BudgetPeriod::Custom { start, end }),
                (Some(_), Some(_)) => {
                    violations.push(Violation::new("periodEnd", "must not be before periodStart"));
                    None
                }
                _ => {
                    violations.push(Violation::new(
                        "period",
                        "a CUSTOM period needs periodStart and periodEnd",
                    ));
                    None
                }
            }
        }
        other => {
            violations.push(Violation::new(
                "period",
                format!("'{other}' is not one of: MONTHLY, CUSTOM"),
            ));
            None
        }
    }
}

/// Percentages crossed when usage moved from `previous` to `current`.
fn crossed_alerts(threshold: f64, previous: f64, current: f64) -> Vec<AlertKind> {
    let crossed = |level: f64| previous < level && level <= current;
    let mut alerts = Vec::new();
    if threshold < 100.0 && crossed(threshold) {
        alerts.push(AlertKind::Threshold);
    }
    if crossed(100.0) {
        alerts.push(AlertKind::Exceeded);
    }
    alerts
}

pub struct BudgetManager {
    config: BudgetConfig,
    store: Arc<dyn Store>,
    events: EventStreamer,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
}

impl BudgetManager {
    pub fn new(
        config: BudgetConfig,
        store: Arc<dyn Store>,
        events: EventStreamer,
        notifier: Arc<dyn Notifier>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            config,
            store,
            events,
            notifier,
            retry,
        }
    }

    pub async fn create(
        &self,
        owner_id: &str,
        request: BudgetRequest,
        now: DateTime<Utc>,
    ) -> Result<(Budget, BudgetUsage)> {
        let mut violations = Vec::new();
        let name = match request.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => Some(name.to_string()),
            _ => {
                violations.push(Violation::new("name", "is required"));
                None
            }
        };
        let amount = request.amount;
        match amount {
            Some(amount) => check_amount(&mut violations, amount),
            None => violations.push(Violation::new("amount", "is required")),
        }
        let threshold = request
            .alert_threshold
            .unwrap_or(self.config.default_alert_threshold);
        check_threshold(&mut violations, threshold);
        let period = parse_period(&mut violations, &request, None);

        let (Some(name), Some(amount), Some(period), true) =
            (name, amount, period, violations.is_empty())
        else {
            return Err(Error::Validation(violations));
        };

        let budget = Budget {
            owner_id: owner_id.to_string(),
            budget_id: new_budget_id(),
            name,
            amount,
            period,
            alert_threshold: threshold,
            status: request.status.unwrap_or(BudgetStatus::Active),
            alert_enabled: request.alert_enabled.unwrap_or(true),
            created_at: now,
            updated_at: now,
            alert_state: AlertState::default(),
            version: 0,
        };
        let budget = self
            .retry
            .run("Budget creation", || self.store.insert_budget(budget.clone()))
            .await?;
        log::info!("Budget {} created for {owner_id}", budget.budget_id);
        let usage = self.usage(&budget, now).await?;
        Ok((budget, usage))
    }

    async fn load(&self, owner_id: &str, budget_id: &str) -> Result<Budget> {
        self.retry
            .run("Budget lookup", || self.store.get_budget(owner_id, budget_id))
            .await?
            .ok_or(Error::NotFound)
    }

    pub async fn get(
        &self,
        owner_id: &str,
        budget_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(Budget, BudgetUsage)> {
        let budget = self.load(owner_id, budget_id).await?;
        let usage = self.usage(&budget, now).await?;
        Ok((budget, usage))
    }

    pub async fn list(
        &self,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Budget, BudgetUsage)>> {
        let budgets = self
            .retry
            .run("Budget listing", || self.store.budgets_by_owner(owner_id))
            .await?;
        let mut result = Vec::with_capacity(budgets.len());
        for budget in budgets {
            let usage = self.usage(&budget, now).await?;
            result.push((budget, usage));
        }
        Ok(result)
    }

    pub async fn update(
        &self,
        owner_id: &str,
        budget_id: &str,
        request: BudgetRequest,
        now: DateTime<Utc>,
    ) -> Result<(Budget, BudgetUsage)> {
        let mut budget = self.load(owner_id, budget_id).await?;
        loop {
            let mut violations = Vec::new();
            let mut updated = budget.clone();
            if let Some(name) = &request.name {
                if name.trim().is_empty() {
                    violations.push(Violation::new("name", "must not be empty"));
                }
                updated.name = name.trim().to_string();
            }
            if let Some(amount) = request.amount {
                check_amount(&mut violations, amount);
                updated.amount = amount;
            }
            if let Some(threshold) = request.alert_threshold {
                check_threshold(&mut violations, threshold);
                updated.alert_threshold = threshold;
            }
            if request.period.is_some()
                || request.period_start.is_some()
                || request.period_end.is_some()
            {
                if let Some(period) = parse_period(&mut violations, &request, Some(budget.period)) {
                    updated.period = period;
                }
            }
            if let Some(status) = request.status {
                updated.status = status;
            }
            if let Some(enabled) = request.alert_enabled {
                updated.alert_enabled = enabled;
            }
            if !violations.is_empty() {
                return Err(Error::Validation(violations));
            }
            updated.updated_at = now;

            let result = self
                .retry
                .run("Budget update", || self.store.update_budget(updated.clone()))
                .await;
            match result {
                Ok(stored) => {
                    let usage = self.usage(&stored, now).await?;
                    return Ok((stored, usage));
                }
                Err(StoreError::VersionConflict(_)) => {
                    budget = self.load(owner_id, budget_id).await?;
                }
                Err(StoreError::Missing(_)) => return Err(Error::NotFound),
                Err(error) => return Err(error.into()),
            }
        }
    }

    pub async fn delete(&self, owner_id: &str, budget_id: &str) -> Result<()> {
        let deleted = self
            .retry
            .run("Budget removal", || self.store.delete_budget(owner_id, budget_id))
            .await?;
        if !deleted {
            return Err(Error::NotFound);
        }
        log::info!("Budget {budget_id} of {owner_id} deleted");
        Ok(())
    }

    /// Spend of the budget owner within the budget period effective at `now`.
    pub async fn usage(&self, budget: &Budget, now: DateTime<Utc>) -> Result<BudgetUsage> {
        let (period_start, period_end) = budget.period.bounds(now);
        let entries = self
            .retry
            .run("Ledger query", || {
                self.store
                    .ledger_entries(&budget.owner_id, period_start, period_end)
            })
            .await?;
        let current_usage = simcost::round_cents(total_cost(&entries));
        Ok(BudgetUsage {
            current_usage,
            percent_used: percent_used(current_usage, budget.amount),
            remaining: simcost::round_cents(budget.amount - current_usage),
            period_start,
            period_end,
        })
    }

    /// Compares the current usage with the last observed one and raises an alert for every
    /// crossed level. The observation is persisted first, so each crossing is reported once
    /// even when several checks run at the same time. A check that loses the write reloads
    /// the budget and compares again.
    pub async fn observe(&self, budget: Budget, now: DateTime<Utc>) -> Result<Vec<BudgetAlert>> {
        let mut budget = budget;
        let (budget, usage, kinds) = loop {
            if budget.status != BudgetStatus::Active {
                return Ok(Vec::new());
            }
            let usage = self.usage(&budget, now).await?;
            let previous = if budget.alert_state.period_start == Some(usage.period_start) {
                budget.alert_state.last_percent
            } else {
                0.0
            };
            let observed = AlertState {
                period_start: Some(usage.period_start),
                last_percent: usage.percent_used,
            };
            if observed == budget.alert_state {
                return Ok(Vec::new());
            }

            let kinds = if budget.alert_enabled {
                crossed_alerts(budget.alert_threshold, previous, usage.percent_used)
            } else {
                Vec::new()
            };
            let mut updated = budget.clone();
            updated.alert_state = observed;
            let result = self
                .retry
                .run("Budget observation", || self.store.update_budget(updated.clone()))
                .await;
            match result {
                Ok(stored) => break (stored, usage, kinds),
                Err(StoreError::VersionConflict(id)) => {
                    log::debug!("Budget {id} changed concurrently, checking it again");
                    let fresh = self
                        .retry
                        .run("Budget reload", || {
                            self.store.get_budget(&budget.owner_id, &budget.budget_id)
                        })
                        .await?;
                    match fresh {
                        Some(fresh) => budget = fresh,
                        None => return Ok(Vec::new()),
                    }
                }
                Err(StoreError::Missing(id)) => {
                    log::debug!("Budget {id} was removed during its check");
                    return Ok(Vec::new());
                }
                Err(error) => return Err(error.into()),
            }
        };

        let alerts: Vec<BudgetAlert> = kinds
            .into_iter()
            .map(|kind| BudgetAlert {
                owner_id: budget.owner_id.clone(),
                budget_id: budget.budget_id.clone(),
                budget_name: budget.name.clone(),
                kind,
                threshold: budget.alert_threshold,
                percent_used: usage.percent_used,
                current_usage: usage.current_usage,
                amount: budget.amount,
                period_start: usage.period_start,
            })
            .collect();
        for alert in &alerts {
            log::info!(
                "Budget {} of {} crossed {:?} at {:.1}%",
                alert.budget_id,
                alert.owner_id,
                alert.kind,
                alert.percent_used
            );
            self.events.on_budget_alert(alert.clone());
            if let Err(error) = self
                .notifier
                .notify(Notification::BudgetAlert(alert.clone()))
                .await
            {
                log::error!(
                    "Cannot deliver alert of budget {}: {error:?}",
                    alert.budget_id
                );
            }
        }
        Ok(alerts)
    }

    pub async fn check_all(&self, now: DateTime<Utc>) -> Result<BudgetCheckReport> {
        let budgets = self
            .retry
            .run("Budget listing", || self.store.all_budgets())
            .await?;
        let mut report = BudgetCheckReport::default();
        for budget in budgets {
            report.checked_budgets += 1;
            let budget_id = budget.budget_id.clone();
            match self.observe(budget, now).await {
                Ok(alerts) => report.alerts += alerts.len(),
                Err(error) => log::error!("Cannot check budget {budget_id}: {error}"),
            }
        }
        log::debug!(
            "Budget check: {} budgets, {} alerts",
            report.checked_budgets,
            report.alerts
        );
        Ok(report)
    }
}
