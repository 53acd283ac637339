use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{BudgetId, OwnerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BudgetPeriod {
    /// The calendar month of the moment of evaluation.
    Monthly,
    Custom { start: NaiveDate, end: NaiveDate },
}

fn first_day_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn last_day_of_month(date: NaiveDate) -> NaiveDate {
    let first = first_day_of_month(date);
    first
        .checked_add_months(chrono::Months::new(1))
        .and_then(|next| next.pred_opt())
        .unwrap_or(date)
}

impl BudgetPeriod {
    /// Inclusive date range the budget accounts for at `now`.
    pub fn bounds(&self, now: DateTime<Utc>) -> (NaiveDate, NaiveDate) {
        match self {
            BudgetPeriod::Monthly => {
                let today = now.date_naive();
                (first_day_of_month(today), last_day_of_month(today))
            }
            BudgetPeriod::Custom { start, end } => (*start, *end),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BudgetStatus {
    Active,
    Inactive,
}

/// Last usage observed for a budget, used to report every threshold crossing once.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertState {
    pub period_start: Option<NaiveDate>,
    pub last_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    pub owner_id: OwnerId,
    pub budget_id: BudgetId,
    pub name: String,
    pub amount: f64,
    pub period: BudgetPeriod,
    pub alert_threshold: f64,
    pub status: BudgetStatus,
    pub alert_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub alert_state: AlertState,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetUsage {
    pub current_usage: f64,
    pub percent_used: f64,
    pub remaining: f64,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

/// Share of `amount` spent, in percent. Budgets without a positive amount are never used up.
pub fn percent_used(usage: f64, amount: f64) -> f64 {
    if amount <= 0.0 || amount.is_nan() {
        return 0.0;
    }
    (usage / amount * 100.0).max(0.0)
}
