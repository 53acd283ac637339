use crate::catalog::{BenchmarkCatalog, BenchmarkEntry};
use crate::error::CostError;
use crate::model::{
    CubedSphereResolution, InstanceSize, LatLonResolution, ModelSetup, OutputFrequency,
    SimulationConfig, SimulationType,
};
use crate::pricing::{PriceTable, RateLookup};
use crate::ranker::{Baseline, rank, recommended_row};
use crate::round_cents;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorParameters {
    pub storage_price_per_gb_month: f64,
    pub storage_retention_months: f64,
    /// Flat price of moving one GB of output out of the cloud.
    pub transfer_price_per_gb: f64,
    /// Share of the total cost above which storage-related tips are given.
    pub storage_tip_share: f64,
    pub segment_days_threshold: u32,
    pub large_instance_cost_threshold: f64,
}

impl Default for EstimatorParameters {
    fn default() -> Self {
        Self {
            storage_price_per_gb_month: 0.023,
            storage_retention_months: 3.0,
            transfer_price_per_gb: 0.09,
            storage_tip_share: 0.2,
            segment_days_threshold: 90,
            large_instance_cost_threshold: 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EstimateBasis {
    Benchmark,
    DefaultModel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TipKind {
    UseSpot,
    CoarserOutput,
    CoarserResolution,
    SegmentRun,
    SmallerInstances,
    CheaperProcessor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavingsTip {
    pub kind: TipKind,
    pub message: String,
    pub estimated_savings: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEstimate {
    pub estimated_cost: f64,
    pub estimated_runtime_hours: f64,
    pub compute_cost: f64,
    pub storage_cost: f64,
    pub throughput_sim_days_per_day: f64,
    #[serde(rename = "storageGB")]
    pub storage_gb: f64,
    pub hourly_rate: f64,
    pub recommended_instance: String,
    pub basis: EstimateBasis,
    pub savings_tips: Vec<SavingsTip>,
}

/// Cost accumulated by a job that has been running for some time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccruedCost {
    pub compute: f64,
    pub storage: f64,
    pub transfer: f64,
    pub total: f64,
}

fn base_storage_gb(simulation_type: SimulationType) -> f64 {
    match simulation_type {
        SimulationType::GcClassic => 2.0,
        SimulationType::Gchp => 5.0,
    }
}

fn resolution_storage_factor(model: &ModelSetup) -> f64 {
    match model {
        ModelSetup::Classic { resolution } => match resolution {
            LatLonResolution::FourByFive => 1.0,
            LatLonResolution::TwoByTwoHalf => 4.0,
            LatLonResolution::HalfByFiveEighths => 16.0,
            LatLonResolution::QuarterByFiveSixteenths => 64.0,
        },
        ModelSetup::Gchp { resolution, .. } => match resolution {
            CubedSphereResolution::C24 => 1.0,
            CubedSphereResolution::C48 => 4.0,
            CubedSphereResolution::C90 => 14.0,
            CubedSphereResolution::C180 => 56.0,
            CubedSphereResolution::C360 => 225.0,
        },
    }
}

fn output_frequency_factor(frequency: OutputFrequency) -> f64 {
    match frequency {
        OutputFrequency::Hourly => 24.0,
        OutputFrequency::ThreeHourly => 8.0,
        OutputFrequency::Daily => 1.0,
        OutputFrequency::Monthly => 0.05,
    }
}

/// Wall-clock hours needed for one simulated day of full chemistry on one medium instance.
fn hours_per_sim_day(model: &ModelSetup) -> f64 {
    match model {
        ModelSetup::Classic { resolution } => match resolution {
            LatLonResolution::FourByFive => 0.15,
            LatLonResolution::TwoByTwoHalf => 0.375,
            LatLonResolution::HalfByFiveEighths => 0.75,
            LatLonResolution::QuarterByFiveSixteenths => 1.5,
        },
        ModelSetup::Gchp { resolution, .. } => match resolution {
            CubedSphereResolution::C24 => 0.2,
            CubedSphereResolution::C48 => 0.5,
            CubedSphereResolution::C90 => 1.2,
            CubedSphereResolution::C180 => 4.0,
            CubedSphereResolution::C360 => 12.0,
        },
    }
}

fn instance_speedup(size: InstanceSize, nodes: u32) -> f64 {
    let per_instance = match size {
        InstanceSize::Small => 0.55,
        InstanceSize::Medium => 1.0,
        InstanceSize::Large => 1.8,
    };
    // Multi-node runs scale sublinearly because of halo exchange.
    per_instance * f64::from(nodes.max(1)).powf(0.9)
}

pub struct CostEstimator<R = PriceTable> {
    rates: R,
    params: EstimatorParameters,
}

impl<R: RateLookup> CostEstimator<R> {
    pub fn new(rates: R, params: EstimatorParameters) -> Self {
        Self { rates, params }
    }

    pub fn rates(&self) -> &R {
        &self.rates
    }

    pub fn parameters(&self) -> &EstimatorParameters {
        &self.params
    }

    fn hourly_rate(&self, config: &SimulationConfig, spot: bool) -> crate::Result<f64> {
        self.rates
            .hourly_rate(&config.processor_type, config.instance_size, spot)
            .ok_or_else(|| CostError::UnknownProcessor(config.processor_type.clone()))
    }

    fn storage_for(&self, config: &SimulationConfig, frequency: OutputFrequency) -> f64 {
        base_storage_gb(config.simulation_type())
            * resolution_storage_factor(&config.model)
            * output_frequency_factor(frequency)
            * (f64::from(config.simulation_days()) / 30.0)
    }

    /// Expected size of the model output in GB.
    pub fn storage_gb(&self, config: &SimulationConfig) -> f64 {
        self.storage_for(config, config.output_frequency)
    }

    fn storage_cost(&self, storage_gb: f64) -> f64 {
        storage_gb * self.params.storage_price_per_gb_month * self.params.storage_retention_months
    }

    /// Estimates the cost of a whole run.
    ///
    /// When a benchmark is given, its measured throughput determines the wall-clock
    /// time, otherwise the built-in per-resolution model is used.
    pub fn estimate(
        &self,
        config: &SimulationConfig,
        benchmark: Option<&BenchmarkEntry>,
    ) -> crate::Result<CostEstimate> {
        let total_sim_days = f64::from(config.total_sim_days());
        let nodes = f64::from(config.nodes());

        let (throughput, basis) = match benchmark {
            Some(entry) => (entry.throughput_sim_days_per_wall_day, EstimateBasis::Benchmark),
            None => {
                let hours = hours_per_sim_day(&config.model) * config.chemistry.runtime_multiplier()
                    / instance_speedup(config.instance_size, config.nodes());
                (24.0 / hours, EstimateBasis::DefaultModel)
            }
        };
        let wall_clock_hours = total_sim_days / throughput * 24.0;

        let hourly_rate = self.hourly_rate(config, config.use_spot)?;
        let compute_cost = hourly_rate * nodes * wall_clock_hours;
        let storage_gb = self.storage_gb(config);
        let storage_cost = self.storage_cost(storage_gb);
        let total_cost = compute_cost + storage_cost;

        let recommended_instance = match benchmark {
            Some(entry) => entry.instance_type.clone(),
            None => self
                .rates
                .processor(&config.processor_type)
                .map(|spec| spec.instance_type(config.instance_size))
                .ok_or_else(|| CostError::UnknownProcessor(config.processor_type.clone()))?,
        };

        let savings_tips = self.savings_tips(config, compute_cost, storage_cost, total_cost)?;

        Ok(CostEstimate {
            estimated_cost: round_cents(total_cost),
            estimated_runtime_hours: round_cents(wall_clock_hours),
            compute_cost: round_cents(compute_cost),
            storage_cost: round_cents(storage_cost),
            throughput_sim_days_per_day: round_cents(throughput),
            storage_gb: round_cents(storage_gb),
            hourly_rate,
            recommended_instance,
            basis,
            savings_tips,
        })
    }

    /// Estimates a run using the best matching benchmark of `catalog`, and recommends
    /// the instance with the best price-performance measured for the same model setup.
    pub fn estimate_with_catalog(
        &self,
        config: &SimulationConfig,
        catalog: &BenchmarkCatalog,
    ) -> crate::Result<CostEstimate> {
        let simulation_type = config.simulation_type();
        let resolution = config.model.resolution_label();
        let suffix = config.instance_size.instance_suffix();
        let benchmark = catalog
            .find(
                simulation_type,
                resolution,
                Some(&config.processor_type),
                Some(suffix),
            )
            .first()
            .copied();
        if benchmark.is_none() {
            log::debug!(
                "No benchmark for {simulation_type} {resolution}, using the default runtime model"
            );
        }
        let mut estimate = self.estimate(config, benchmark)?;

        let candidates = catalog.entries_for(simulation_type, resolution);
        let rows = rank(
            &candidates,
            Some(Baseline {
                processor: &config.processor_type,
                instance: suffix,
            }),
        );
        if let Some(best) = recommended_row(&rows) {
            estimate.recommended_instance = best.instance_type.clone();
        }
        Ok(estimate)
    }

    /// Cost of a job that has been running for `elapsed_hours`.
    pub fn accrued_cost(
        &self,
        config: &SimulationConfig,
        storage_gb: f64,
        elapsed_hours: f64,
    ) -> crate::Result<AccruedCost> {
        let elapsed_hours = elapsed_hours.max(0.0);
        let compute = self.hourly_rate(config, config.use_spot)?
            * f64::from(config.nodes())
            * elapsed_hours;
        let storage =
            storage_gb * self.params.storage_price_per_gb_month / 30.0 * elapsed_hours / 24.0;
        let transfer = storage_gb * self.params.transfer_price_per_gb;
        Ok(AccruedCost {
            compute,
            storage,
            transfer,
            total: compute + storage + transfer,
        })
    }

    fn savings_tips(
        &self,
        config: &SimulationConfig,
        compute_cost: f64,
        storage_cost: f64,
        total_cost: f64,
    ) -> crate::Result<Vec<SavingsTip>> {
        let mut tips = Vec::new();

        if !config.use_spot {
            let spot_rate = self.hourly_rate(config, true)?;
            let on_demand_rate = self.hourly_rate(config, false)?;
            let savings = compute_cost * (1.0 - spot_rate / on_demand_rate);
            tips.push(SavingsTip {
                kind: TipKind::UseSpot,
                message: format!(
                    "Use spot instances to lower the compute cost by {:.0}%",
                    (1.0 - spot_rate / on_demand_rate) * 100.0
                ),
                estimated_savings: Some(round_cents(savings)),
            });
        }

        if storage_cost > self.params.storage_tip_share * total_cost
            && config.output_frequency.is_sub_daily()
        {
            let daily_cost = self.storage_cost(self.storage_for(config, OutputFrequency::Daily));
            tips.push(SavingsTip {
                kind: TipKind::CoarserOutput,
                message: format!(
                    "Storage is {:.0}% of the total cost; write daily instead of {} output",
                    storage_cost / total_cost * 100.0,
                    config.output_frequency
                ),
                estimated_savings: Some(round_cents(storage_cost - daily_cost)),
            });
        }

        if config.model.is_high_resolution() {
            let message = match config.model.coarser_resolution_label() {
                Some(coarser) => format!(
                    "Consider running at {coarser} instead of {} if the finer grid is not required",
                    config.model.resolution_label()
                ),
                None => format!(
                    "{} is one of the most expensive resolutions of the model",
                    config.model.resolution_label()
                ),
            };
            tips.push(SavingsTip {
                kind: TipKind::CoarserResolution,
                message,
                estimated_savings: None,
            });
        }

        let total_days = config.total_sim_days();
        if total_days > self.params.segment_days_threshold {
            tips.push(SavingsTip {
                kind: TipKind::SegmentRun,
                message: format!(
                    "Split the {total_days}-day run into segments of at most {} days restarted from checkpoints",
                    self.params.segment_days_threshold
                ),
                estimated_savings: None,
            });
        }

        if config.instance_size.is_largest()
            && compute_cost > self.params.large_instance_cost_threshold
        {
            tips.push(SavingsTip {
                kind: TipKind::SmallerInstances,
                message: format!(
                    "Compute cost exceeds ${:.0}; several smaller instances may be cheaper than one {} instance",
                    self.params.large_instance_cost_threshold,
                    config.instance_size.instance_suffix()
                ),
                estimated_savings: None,
            });
        }

        if let Some(cheapest) = self.rates.cheapest_processor(config.instance_size) {
            let requested = self.hourly_rate(config, false)?;
            let cheapest_rate = cheapest.hourly_rates.get(config.instance_size);
            if cheapest_rate < requested {
                tips.push(SavingsTip {
                    kind: TipKind::CheaperProcessor,
                    message: format!(
                        "Switch to {} ({}) for a lower hourly rate",
                        cheapest.name,
                        cheapest.instance_type(config.instance_size)
                    ),
                    estimated_savings: Some(round_cents(
                        compute_cost * (1.0 - cheapest_rate / requested),
                    )),
                });
            }
        }

        Ok(tips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChemistryOption;
    use chrono::NaiveDate;

    fn config(model: ModelSetup, days: i64) -> SimulationConfig {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        SimulationConfig {
            model,
            chemistry: ChemistryOption::Fullchem,
            start_date: start,
            end_date: start + chrono::Duration::days(days),
            spinup_days: 0,
            processor_type: "graviton3".to_string(),
            instance_size: InstanceSize::Medium,
            use_spot: true,
            output_frequency: OutputFrequency::Daily,
        }
    }

    fn classic_4x5(days: i64) -> SimulationConfig {
        config(
            ModelSetup::Classic {
                resolution: LatLonResolution::FourByFive,
            },
            days,
        )
    }

    fn benchmark(throughput: f64, cost: f64) -> BenchmarkEntry {
        BenchmarkEntry {
            simulation_type: SimulationType::GcClassic,
            resolution: "4x5".to_string(),
            processor_type: "graviton3".to_string(),
            instance_type: "c7g.8xlarge".to_string(),
            throughput_sim_days_per_wall_day: throughput,
            cost_per_sim_day: cost,
            wall_time_hours: 7.0,
        }
    }

    fn estimator() -> CostEstimator {
        CostEstimator::new(PriceTable::default(), EstimatorParameters::default())
    }

    fn tip_kinds(estimate: &CostEstimate) -> Vec<TipKind> {
        estimate.savings_tips.iter().map(|t| t.kind).collect()
    }

    #[test]
    fn benchmark_estimate_for_one_week() {
        let estimate = estimator()
            .estimate(&classic_4x5(7), Some(&benchmark(24.0, 1.36)))
            .unwrap();
        assert_eq!(estimate.basis, EstimateBasis::Benchmark);
        assert_eq!(estimate.estimated_runtime_hours, 7.0);
        assert_eq!(estimate.compute_cost, 2.57);
        assert_eq!(estimate.storage_gb, 0.47);
        assert_eq!(estimate.storage_cost, 0.03);
        assert_eq!(estimate.estimated_cost, 2.6);
        assert_eq!(estimate.throughput_sim_days_per_day, 24.0);
        assert_eq!(estimate.recommended_instance, "c7g.8xlarge");
        assert!(estimate.savings_tips.is_empty());
    }

    #[test]
    fn estimate_is_pure() {
        let estimator = estimator();
        let mut config = classic_4x5(120);
        config.use_spot = false;
        config.output_frequency = OutputFrequency::Hourly;
        let entry = benchmark(24.0, 1.36);
        assert_eq!(
            estimator.estimate(&config, Some(&entry)).unwrap(),
            estimator.estimate(&config, Some(&entry)).unwrap()
        );
        assert_eq!(
            estimator.estimate(&config, None).unwrap(),
            estimator.estimate(&config, None).unwrap()
        );
    }

    #[test]
    fn default_model_without_benchmark() {
        let _ = env_logger::builder().is_test(true).try_init();
        let estimate = estimator()
            .estimate_with_catalog(&classic_4x5(7), &BenchmarkCatalog::default())
            .unwrap();
        assert_eq!(estimate.basis, EstimateBasis::DefaultModel);
        assert_eq!(estimate.estimated_runtime_hours, 1.05);
        assert_eq!(estimate.throughput_sim_days_per_day, 160.0);
        assert_eq!(estimate.compute_cost, 0.39);
        assert_eq!(estimate.recommended_instance, "c7g.8xlarge");
        assert!(estimate.estimated_cost > 0.0);
        assert!(estimate.hourly_rate > 0.0);
    }

    #[test]
    fn default_model_scales_with_chemistry_and_size() {
        let estimator = estimator();
        let mut config = classic_4x5(10);
        let full = estimator.estimate(&config, None).unwrap();
        config.chemistry = ChemistryOption::Transport;
        let transport = estimator.estimate(&config, None).unwrap();
        assert!(
            (transport.estimated_runtime_hours * 2.0 - full.estimated_runtime_hours).abs() < 0.02
        );
        config.instance_size = InstanceSize::Large;
        let large = estimator.estimate(&config, None).unwrap();
        assert!(large.estimated_runtime_hours < transport.estimated_runtime_hours);
    }

    #[test]
    fn gchp_compute_cost_covers_all_nodes() {
        let mut config = config(
            ModelSetup::Gchp {
                resolution: CubedSphereResolution::C24,
                nodes: 2,
            },
            30,
        );
        config.use_spot = false;
        config.instance_size = InstanceSize::Large;
        let mut entry = benchmark(30.0, 1.96);
        entry.simulation_type = SimulationType::Gchp;
        entry.resolution = "C24".to_string();
        let estimate = estimator().estimate(&config, Some(&entry)).unwrap();
        assert_eq!(estimate.estimated_runtime_hours, 24.0);
        assert_eq!(estimate.compute_cost, 117.5);
        assert_eq!(estimate.storage_gb, 5.0);
    }

    #[test]
    fn all_applicable_tips_are_returned() {
        let mut config = config(
            ModelSetup::Classic {
                resolution: LatLonResolution::QuarterByFiveSixteenths,
            },
            200,
        );
        config.use_spot = false;
        config.processor_type = "intel".to_string();
        config.instance_size = InstanceSize::Large;
        config.output_frequency = OutputFrequency::Hourly;
        let estimate = estimator().estimate(&config, None).unwrap();
        assert_eq!(
            tip_kinds(&estimate),
            vec![
                TipKind::UseSpot,
                TipKind::CoarserOutput,
                TipKind::CoarserResolution,
                TipKind::SegmentRun,
                TipKind::SmallerInstances,
                TipKind::CheaperProcessor,
            ]
        );
        let spot = &estimate.savings_tips[0];
        assert_eq!(
            spot.estimated_savings,
            Some(round_cents(estimate.compute_cost * 0.7))
        );
        assert!(estimate.savings_tips[2].message.contains("0.5x0.625"));
    }

    #[test]
    fn no_cheaper_processor_tip_on_equal_rate() {
        let mut config = classic_4x5(7);
        config.processor_type = "amd".to_string();
        let estimate = estimator().estimate(&config, None).unwrap();
        assert!(!tip_kinds(&estimate).contains(&TipKind::CheaperProcessor));

        config.processor_type = "graviton4".to_string();
        let estimate = estimator().estimate(&config, None).unwrap();
        assert!(tip_kinds(&estimate).contains(&TipKind::CheaperProcessor));
    }

    #[test]
    fn unknown_processor_is_an_error() {
        let mut config = classic_4x5(7);
        config.processor_type = "power9".to_string();
        assert!(matches!(
            estimator().estimate(&config, None),
            Err(CostError::UnknownProcessor(_))
        ));
    }

    #[test]
    fn catalog_recommends_best_price_performance() {
        let catalog = BenchmarkCatalog::builtin().unwrap();
        let estimate = estimator()
            .estimate_with_catalog(&classic_4x5(7), &catalog)
            .unwrap();
        assert_eq!(estimate.basis, EstimateBasis::Benchmark);
        assert_eq!(estimate.throughput_sim_days_per_day, 24.0);
        assert_eq!(estimate.recommended_instance, "c7g.16xlarge");
    }

    #[test]
    fn accrued_cost_components() {
        let cost = estimator()
            .accrued_cost(&classic_4x5(7), 10.0, 2.0)
            .unwrap();
        assert!((cost.compute - 1.224 * 0.3 * 2.0).abs() < 1e-9);
        assert!((cost.storage - 10.0 * 0.023 / 30.0 * 2.0 / 24.0).abs() < 1e-12);
        assert!((cost.transfer - 0.9).abs() < 1e-12);
        assert!((cost.total - (cost.compute + cost.storage + cost.transfer)).abs() < 1e-12);

        let none = estimator()
            .accrued_cost(&classic_4x5(7), 10.0, -1.0)
            .unwrap();
        assert_eq!(none.compute, 0.0);
    }
}
