use anyhow::Context;
use serde::{Deserialize, Serialize};
use simcost::pricing::PricingConfig;
use simcost::{BenchmarkCatalog, EstimatorParameters, PriceTable};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::common::retry::RetryPolicy;
use crate::server::budget::BudgetConfig;
use crate::server::dispatch::DispatchConfig;
use crate::server::monitor::MonitorConfig;
use crate::server::tracker::TrackerConfig;
use crate::server::validator::ValidatorConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Events kept for slow subscribers of the event stream.
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            event_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkSource {
    /// JSON file with benchmark measurements. The measurements shipped with the binary
    /// are used when not set.
    pub path: Option<PathBuf>,
}

/// Configuration of the whole service, usually read from a TOML file.
/// Every section is optional and falls back to its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub validator: ValidatorConfig,
    pub dispatch: DispatchConfig,
    pub monitor: MonitorConfig,
    pub tracker: TrackerConfig,
    pub budget: BudgetConfig,
    pub retry: RetryPolicy,
    pub pricing: PricingConfig,
    pub estimator: EstimatorParameters,
    pub benchmarks: BenchmarkSource,
}

impl AppConfig {
    pub fn from_toml(data: &str) -> anyhow::Result<Self> {
        toml::from_str(data).context("Cannot parse configuration")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read configuration file {}", path.display()))?;
        let config = Self::from_toml(&data)
            .with_context(|| format!("Invalid configuration file {}", path.display()))?;
        log::debug!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn price_table(&self) -> anyhow::Result<PriceTable> {
        PriceTable::new(self.pricing.clone()).context("Invalid pricing section")
    }

    pub fn benchmark_catalog(&self) -> anyhow::Result<BenchmarkCatalog> {
        match &self.benchmarks.path {
            Some(path) => BenchmarkCatalog::load(path)
                .with_context(|| format!("Cannot load benchmarks from {}", path.display())),
            None => BenchmarkCatalog::builtin().context("Invalid builtin benchmarks"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::dispatch::BackendKind;
    use std::time::Duration;

    #[test]
    fn empty_file_gives_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.validator.max_concurrent_jobs, 5);
        assert_eq!(config.monitor.poll_interval, Duration::from_secs(30));
        assert_eq!(config.dispatch.backend, BackendKind::Simulated);
        assert_eq!(config.dispatch.queues.len(), 4);
        assert!(config.price_table().is_ok());
        assert!(!config.benchmark_catalog().unwrap().is_empty());
    }

    #[test]
    fn parse_sections() {
        let config = AppConfig::from_toml(
            r#"
[server]
bind = "0.0.0.0:9000"

[validator]
max_concurrent_jobs = 2

[dispatch]
backend = "slurm"

[dispatch.slurm]
work_dir = "/scratch/chemflow"

[monitor]
poll_interval = "10s"
max_status_errors = 3

[budget]
check_interval = "1h"

[retry]
delays = ["50ms", "1s"]

[pricing]
spot_multiplier = 0.4
"#,
        )
        .unwrap();
        assert_eq!(config.server.bind.port(), 9000);
        assert_eq!(config.validator.max_concurrent_jobs, 2);
        assert_eq!(config.validator.max_simulation_days, 366);
        assert_eq!(config.dispatch.backend, BackendKind::Slurm);
        assert_eq!(config.dispatch.slurm.work_dir, PathBuf::from("/scratch/chemflow"));
        assert_eq!(config.monitor.poll_interval, Duration::from_secs(10));
        assert_eq!(config.monitor.max_status_errors, 3);
        assert_eq!(config.budget.check_interval, Duration::from_secs(3600));
        assert_eq!(config.retry.max_attempts(), 3);
        assert_eq!(config.price_table().unwrap().spot_multiplier(), 0.4);
    }

    #[test]
    fn missing_file() {
        let error = AppConfig::load(Path::new("/nonexistent/chemflow.toml")).unwrap_err();
        assert!(format!("{error:?}").contains("Cannot read configuration file"));
    }
}
