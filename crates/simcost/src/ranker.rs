use crate::catalog::{BenchmarkEntry, contains_ignore_case};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Processor family and instance identifier the comparison is relative to.
#[derive(Debug, Clone, Copy)]
pub struct Baseline<'a> {
    pub processor: &'a str,
    pub instance: &'a str,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonRow {
    pub processor_type: String,
    pub instance_type: String,
    pub throughput_sim_days_per_wall_day: f64,
    pub cost_per_sim_day: f64,
    pub wall_time_hours: f64,
    pub relative_performance: f64,
    pub relative_cost: f64,
    #[serde(rename = "priceperformanceRatio")]
    pub price_performance_ratio: f64,
    pub baseline: bool,
    pub recommended: bool,
}

fn find_baseline(entries: &[&BenchmarkEntry], baseline: Option<Baseline>) -> usize {
    baseline
        .and_then(|b| {
            entries.iter().position(|e| {
                (contains_ignore_case(&e.processor_type, b.processor)
                    || contains_ignore_case(&e.instance_type, b.processor))
                    && contains_ignore_case(&e.instance_type, b.instance)
            })
        })
        .unwrap_or(0)
}

/// Orders benchmark entries by their price-performance ratio relative to a baseline.
///
/// The baseline is the first entry matching the requested processor and instance, or
/// the first entry when nothing matches. Rows are sorted by ascending ratio (ties by
/// processor name and instance type) and only the first row is recommended.
pub fn rank(entries: &[&BenchmarkEntry], baseline: Option<Baseline>) -> Vec<ComparisonRow> {
    if entries.is_empty() {
        return Vec::new();
    }
    let base = entries[find_baseline(entries, baseline)];

    let mut rows: Vec<ComparisonRow> = entries
        .iter()
        .map(|entry| {
            let relative_performance =
                entry.throughput_sim_days_per_wall_day / base.throughput_sim_days_per_wall_day;
            let relative_cost = entry.cost_per_sim_day / base.cost_per_sim_day;
            ComparisonRow {
                processor_type: entry.processor_type.clone(),
                instance_type: entry.instance_type.clone(),
                throughput_sim_days_per_wall_day: entry.throughput_sim_days_per_wall_day,
                cost_per_sim_day: entry.cost_per_sim_day,
                wall_time_hours: entry.wall_time_hours,
                relative_performance,
                relative_cost,
                price_performance_ratio: relative_cost / relative_performance,
                baseline: std::ptr::eq(*entry, base),
                recommended: false,
            }
        })
        .collect();

    rows.sort_by(compare_rows);
    rows[0].recommended = true;
    rows
}

fn compare_rows(a: &ComparisonRow, b: &ComparisonRow) -> Ordering {
    a.price_performance_ratio
        .total_cmp(&b.price_performance_ratio)
        .then_with(|| a.processor_type.cmp(&b.processor_type))
        .then_with(|| a.instance_type.cmp(&b.instance_type))
}

/// The row flagged as the recommendation of a ranking.
pub fn recommended_row(rows: &[ComparisonRow]) -> Option<&ComparisonRow> {
    rows.iter().find(|row| row.recommended)
}
