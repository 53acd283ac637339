use std::hint::black_box;

use chrono::NaiveDate;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use simcost::model::{ChemistryOption, InstanceSize, LatLonResolution, ModelSetup, OutputFrequency};
use simcost::ranker::Baseline;
use simcost::{
    BenchmarkCatalog, BenchmarkEntry, CostEstimator, EstimatorParameters, PriceTable,
    SimulationConfig, SimulationType, rank,
};

fn config(days: i64) -> SimulationConfig {
    let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    SimulationConfig {
        model: ModelSetup::Classic {
            resolution: LatLonResolution::TwoByTwoHalf,
        },
        chemistry: ChemistryOption::Fullchem,
        start_date: start,
        end_date: start + chrono::Duration::days(days),
        spinup_days: 7,
        processor_type: "intel".to_string(),
        instance_size: InstanceSize::Large,
        use_spot: false,
        output_frequency: OutputFrequency::Hourly,
    }
}

fn synthetic_entries(count: usize) -> Vec<BenchmarkEntry> {
    (0..count)
        .map(|i| BenchmarkEntry {
            simulation_type: SimulationType::GcClassic,
            resolution: "2x2.5".to_string(),
            processor_type: format!("family{}", i % 17),
            instance_type: format!("x{i}.8xlarge"),
            throughput_sim_days_per_wall_day: 5.0 + (i % 23) as f64,
            cost_per_sim_day: 1.0 + (i % 13) as f64 * 0.25,
            wall_time_hours: 10.0,
        })
        .collect()
}

fn bench_estimate(c: &mut Criterion) {
    let estimator = CostEstimator::new(PriceTable::default(), EstimatorParameters::default());
    let catalog = BenchmarkCatalog::builtin().unwrap();
    let config = config(365);
    c.bench_function("estimate with builtin catalog", |b| {
        b.iter(|| estimator.estimate_with_catalog(black_box(&config), &catalog))
    });
    c.bench_function("estimate with default model", |b| {
        b.iter(|| estimator.estimate(black_box(&config), None))
    });
}

fn bench_rank(c: &mut Criterion) {
    for count in [10, 1_000, 10_000] {
        let entries = synthetic_entries(count);
        let refs: Vec<_> = entries.iter().collect();
        c.bench_with_input(BenchmarkId::new("rank entries", count), &refs, |b, refs| {
            b.iter(|| {
                rank(
                    black_box(refs),
                    Some(Baseline {
                        processor: "family3",
                        instance: "8xlarge",
                    }),
                )
            })
        });
    }
}

criterion_group!(estimation, bench_estimate, bench_rank);
criterion_main!(estimation);
