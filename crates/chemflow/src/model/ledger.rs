use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::OwnerId;

/// Cost increment attributed to an owner and a resource in one accounting period.
///
/// Entries are only ever appended and each one carries the difference against the
/// previously accounted cost of the resource, so the spend of a period is a plain sum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostLedgerEntry {
    pub owner_id: OwnerId,
    pub resource_id: String,
    pub date: DateTime<Utc>,
    pub cost: f64,
    pub time_period: NaiveDate,
}

impl CostLedgerEntry {
    pub fn new(owner_id: OwnerId, resource_id: String, date: DateTime<Utc>, cost: f64) -> Self {
        Self {
            owner_id,
            resource_id,
            date,
            cost,
            time_period: date.date_naive(),
        }
    }
}

pub fn total_cost<'a>(entries: impl IntoIterator<Item = &'a CostLedgerEntry>) -> f64 {
    entries.into_iter().map(|e| e.cost).sum()
}
