use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use simcost::{
    ChemistryOption, CubedSphereResolution, InstanceSize, LatLonResolution, ModelSetup,
    OutputFrequency, PriceTable, RateLookup, SimulationConfig, SimulationType,
};

use crate::common::error::Violation;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub max_simulation_days: u32,
    pub max_spinup_days: u32,
    /// Jobs in CREATED, SUBMITTED or RUNNING that a single owner may have at once.
    pub max_concurrent_jobs: usize,
    pub max_total_vcpus: u32,
    pub max_total_memory_gb: u32,
    pub max_gchp_nodes: u32,
    pub default_gchp_nodes: u32,
    pub default_instance_size: InstanceSize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_simulation_days: 366,
            max_spinup_days: 365,
            max_concurrent_jobs: 5,
            max_total_vcpus: 256,
            max_total_memory_gb: 1024,
            max_gchp_nodes: 8,
            default_gchp_nodes: 2,
            default_instance_size: InstanceSize::Medium,
        }
    }
}

/// Simulation request as received from a client.
///
/// Every field is optional so that missing and malformed values are reported together
/// with the other rejection reasons instead of failing deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationRequest {
    pub simulation_type: Option<String>,
    pub chemistry_option: Option<String>,
    pub resolution: Option<String>,
    #[serde(alias = "cubedSphereRes")]
    pub cubedsphere_res: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub spinup_days: Option<u32>,
    pub processor_type: Option<String>,
    pub instance_size: Option<String>,
    pub use_spot: Option<bool>,
    pub output_frequency: Option<String>,
    pub nodes: Option<u32>,
    /// Skips the resource ceiling check.
    pub allow_large_resources: Option<bool>,
}

/// Resources a validated request will occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizingHint {
    pub nodes: u32,
    pub vcpus_per_node: u32,
    pub memory_gb_per_node: u32,
    pub total_vcpus: u32,
    pub total_memory_gb: u32,
    /// Memory the model needs at the requested resolution.
    pub required_memory_gb: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub config: SimulationConfig,
    pub sizing: SizingHint,
}

fn lat_lon_minimum(resolution: LatLonResolution) -> (u32, u32) {
    match resolution {
        LatLonResolution::FourByFive => (8, 8),
        LatLonResolution::TwoByTwoHalf => (16, 16),
        LatLonResolution::HalfByFiveEighths => (32, 48),
        LatLonResolution::QuarterByFiveSixteenths => (64, 96),
    }
}

fn cubed_sphere_minimum(resolution: CubedSphereResolution) -> (u32, u32) {
    match resolution {
        CubedSphereResolution::C24 => (6, 32),
        CubedSphereResolution::C48 => (24, 64),
        CubedSphereResolution::C90 => (96, 192),
        CubedSphereResolution::C180 => (216, 512),
        CubedSphereResolution::C360 => (864, 1536),
    }
}

/// Minimal `(vcpus, memory GB)` the model needs to run at its resolution.
pub fn resolution_minimum(model: &ModelSetup) -> (u32, u32) {
    match model {
        ModelSetup::Classic { resolution } => lat_lon_minimum(*resolution),
        ModelSetup::Gchp { resolution, .. } => cubed_sphere_minimum(*resolution),
    }
}

pub struct Validator {
    config: ValidatorConfig,
    prices: PriceTable,
}

/// Collects violations while parsing the individual fields of a request.
#[derive(Default)]
struct Checker {
    violations: Vec<Violation>,
}

impl Checker {
    fn fail(&mut self, field: &str, reason: impl Into<String>) {
        self.violations.push(Violation::new(field, reason));
    }

    fn required<'a>(&mut self, field: &str, value: &'a Option<String>) -> Option<&'a str> {
        match value.as_deref().map(str::trim) {
            Some(value) if !value.is_empty() => Some(value),
            _ => {
                self.fail(field, "is required");
                None
            }
        }
    }

    fn label<T>(
        &mut self,
        field: &str,
        value: Option<&str>,
        parse: impl Fn(&str) -> Option<T>,
        labels: impl Fn() -> String,
    ) -> Option<T> {
        let value = value?;
        let parsed = parse(value);
        if parsed.is_none() {
            self.fail(field, format!("'{value}' is not one of: {}", labels()));
        }
        parsed
    }

    fn date(&mut self, field: &str, value: &Option<String>) -> Option<NaiveDate> {
        let value = self.required(field, value)?;
        match NaiveDate::parse_from_str(value, DATE_FORMAT) {
            Ok(date) => Some(date),
            Err(_) => {
                self.fail(field, format!("'{value}' is not a date in YYYY-MM-DD format"));
                None
            }
        }
    }
}

impl Validator {
    pub fn new(config: ValidatorConfig, prices: PriceTable) -> Self {
        Self { config, prices }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Parses the request into a simulation configuration, without quota and resource checks.
    pub fn parse_config(
        &self,
        request: &SimulationRequest,
    ) -> Result<SimulationConfig, Vec<Violation>> {
        let mut checker = Checker::default();
        let config = self.parse_with(&mut checker, request);
        match config {
            Some(config) if checker.violations.is_empty() => Ok(config),
            _ => Err(checker.violations),
        }
    }

    fn parse_model(
        &self,
        checker: &mut Checker,
        request: &SimulationRequest,
    ) -> Option<ModelSetup> {
        let simulation_type = checker.required("simulationType", &request.simulation_type);
        let simulation_type = checker.label(
            "simulationType",
            simulation_type,
            SimulationType::parse,
            SimulationType::labels,
        )?;

        match simulation_type {
            SimulationType::GcClassic => {
                if request.nodes.is_some_and(|nodes| nodes != 1) {
                    checker.fail("nodes", "GC_CLASSIC runs on a single node");
                }
                let resolution = checker.required("resolution", &request.resolution);
                let resolution = checker.label(
                    "resolution",
                    resolution,
                    LatLonResolution::parse,
                    LatLonResolution::labels,
                )?;
                Some(ModelSetup::Classic { resolution })
            }
            SimulationType::Gchp => {
                let value = if request.cubedsphere_res.is_some() {
                    &request.cubedsphere_res
                } else {
                    &request.resolution
                };
                let resolution = checker.required("cubedsphereRes", value);
                let resolution = checker.label(
                    "cubedsphereRes",
                    resolution,
                    CubedSphereResolution::parse,
                    CubedSphereResolution::labels,
                );
                let nodes = request.nodes.unwrap_or(self.config.default_gchp_nodes);
                if nodes == 0 || nodes > self.config.max_gchp_nodes {
                    checker.fail(
                        "nodes",
                        format!("must be between 1 and {}", self.config.max_gchp_nodes),
                    );
                    return None;
                }
                Some(ModelSetup::Gchp {
                    resolution: resolution?,
                    nodes,
                })
            }
        }
    }

    fn parse_with(
        &self,
        checker: &mut Checker,
        request: &SimulationRequest,
    ) -> Option<SimulationConfig> {
        let model = self.parse_model(checker, request);

        let chemistry = match request.chemistry_option.as_deref() {
            None => Some(ChemistryOption::default()),
            value => checker.label(
                "chemistryOption",
                value,
                ChemistryOption::parse,
                ChemistryOption::labels,
            ),
        };
        let output_frequency = match request.output_frequency.as_deref() {
            None => Some(OutputFrequency::default()),
            value => checker.label(
                "outputFrequency",
                value,
                OutputFrequency::parse,
                OutputFrequency::labels,
            ),
        };
        let instance_size = match request.instance_size.as_deref() {
            None => Some(self.config.default_instance_size),
            value => checker.label(
                "instanceSize",
                value,
                InstanceSize::parse,
                InstanceSize::labels,
            ),
        };

        let processor_type = checker
            .required("processorType", &request.processor_type)
            .and_then(|name| match self.prices.processor(name) {
                Some(spec) => Some(spec.name.clone()),
                None => {
                    checker.fail(
                        "processorType",
                        format!(
                            "'{name}' is not one of: {}",
                            self.prices.processor_names()
                        ),
                    );
                    None
                }
            });

        let start_date = checker.date("startDate", &request.start_date);
        let end_date = checker.date("endDate", &request.end_date);
        if let (Some(start), Some(end)) = (start_date, end_date) {
            let days = (end - start).num_days();
            if days <= 0 {
                checker.fail("endDate", "must be after startDate");
            } else if days > i64::from(self.config.max_simulation_days) {
                checker.fail(
                    "endDate",
                    format!(
                        "simulation of {days} days exceeds the maximum of {} days",
                        self.config.max_simulation_days
                    ),
                );
            }
        }

        let spinup_days = request.spinup_days.unwrap_or(0);
        if spinup_days > self.config.max_spinup_days {
            checker.fail(
                "spinupDays",
                format!("must be at most {}", self.config.max_spinup_days),
            );
        }

        Some(SimulationConfig {
            model: model?,
            chemistry: chemistry?,
            start_date: start_date?,
            end_date: end_date?,
            spinup_days,
            processor_type: processor_type?,
            instance_size: instance_size?,
            use_spot: request.use_spot.unwrap_or(false),
            output_frequency: output_frequency?,
        })
    }

    pub fn sizing(&self, config: &SimulationConfig) -> SizingHint {
        let nodes = config.nodes();
        let vcpus_per_node = config.instance_size.vcpus();
        let memory_gb_per_node = config.instance_size.memory_gb();
        let (_, required_memory_gb) = resolution_minimum(&config.model);
        SizingHint {
            nodes,
            vcpus_per_node,
            memory_gb_per_node,
            total_vcpus: nodes * vcpus_per_node,
            total_memory_gb: nodes * memory_gb_per_node,
            required_memory_gb,
        }
    }

    /// Checks a request of `owner_id` who currently has `active_jobs` unfinished jobs.
    ///
    /// All checks are evaluated and every failing one is reported.
    pub fn validate(
        &self,
        owner_id: &str,
        request: &SimulationRequest,
        active_jobs: usize,
    ) -> Result<ValidatedRequest, Vec<Violation>> {
        let mut checker = Checker::default();
        let config = self.parse_with(&mut checker, request);

        if active_jobs >= self.config.max_concurrent_jobs {
            checker.violations.push(Violation::quota(
                "quota",
                format!(
                    "owner {owner_id} already has {active_jobs} active jobs, the limit is {}",
                    self.config.max_concurrent_jobs
                ),
            ));
        }

        let sizing = config.as_ref().map(|config| self.sizing(config));
        if let (Some(config), Some(sizing)) = (&config, &sizing) {
            if !request.allow_large_resources.unwrap_or(false) {
                let (min_vcpus, min_memory) = resolution_minimum(&config.model);
                let vcpus = sizing.total_vcpus.max(min_vcpus);
                let memory = sizing.total_memory_gb.max(min_memory);
                if vcpus > self.config.max_total_vcpus {
                    checker.fail(
                        "resources",
                        format!(
                            "{} at {} needs {vcpus} vCPUs, the limit is {}",
                            config.simulation_type(),
                            config.model.resolution_label(),
                            self.config.max_total_vcpus
                        ),
                    );
                }
                if memory > self.config.max_total_memory_gb {
                    checker.fail(
                        "resources",
                        format!(
                            "{} at {} needs {memory} GB of memory, the limit is {} GB",
                            config.simulation_type(),
                            config.model.resolution_label(),
                            self.config.max_total_memory_gb
                        ),
                    );
                }
            }
        }

        match (config, sizing) {
            (Some(config), Some(sizing)) if checker.violations.is_empty() => {
                Ok(ValidatedRequest { config, sizing })
            }
            _ => Err(checker.violations),
        }
    }
}
