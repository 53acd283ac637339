use crate::error::CostError;
use crate::model::SimulationType;
use serde::{Deserialize, Serialize};
use std::path::Path;

const BUILTIN_BENCHMARKS: &str = include_str!("../data/benchmarks.json");

/// One measured run of a model configuration on a given instance type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkEntry {
    pub simulation_type: SimulationType,
    pub resolution: String,
    pub processor_type: String,
    pub instance_type: String,
    pub throughput_sim_days_per_wall_day: f64,
    pub cost_per_sim_day: f64,
    pub wall_time_hours: f64,
}

impl BenchmarkEntry {
    fn check(&self, index: usize) -> crate::Result<()> {
        let invalid = |reason: String| CostError::InvalidBenchmark { index, reason };
        if self.resolution.trim().is_empty() {
            return Err(invalid("empty resolution".to_string()));
        }
        if self.throughput_sim_days_per_wall_day.is_nan()
            || self.throughput_sim_days_per_wall_day <= 0.0
        {
            return Err(invalid(format!(
                "throughput must be positive, got {}",
                self.throughput_sim_days_per_wall_day
            )));
        }
        if self.cost_per_sim_day.is_nan() || self.cost_per_sim_day <= 0.0 {
            return Err(invalid(format!(
                "cost per simulated day must be positive, got {}",
                self.cost_per_sim_day
            )));
        }
        Ok(())
    }
}

/// Read-only collection of benchmark measurements.
#[derive(Debug, Clone, Default)]
pub struct BenchmarkCatalog {
    entries: Vec<BenchmarkEntry>,
}

impl BenchmarkCatalog {
    pub fn new(entries: Vec<BenchmarkEntry>) -> crate::Result<Self> {
        for (index, entry) in entries.iter().enumerate() {
            entry.check(index)?;
        }
        Ok(Self { entries })
    }

    pub fn from_json(data: &str) -> crate::Result<Self> {
        let entries: Vec<BenchmarkEntry> = serde_json::from_str(data)?;
        Self::new(entries)
    }

    pub fn load(path: &Path) -> crate::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let catalog = Self::from_json(&data)?;
        log::debug!(
            "Loaded {} benchmark entries from {}",
            catalog.len(),
            path.display()
        );
        Ok(catalog)
    }

    /// Measurements shipped together with the crate.
    pub fn builtin() -> crate::Result<Self> {
        Self::from_json(BUILTIN_BENCHMARKS)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[BenchmarkEntry] {
        &self.entries
    }

    /// All entries measured for the given model and resolution.
    pub fn entries_for(
        &self,
        simulation_type: SimulationType,
        resolution: &str,
    ) -> Vec<&BenchmarkEntry> {
        let resolution = resolution.trim();
        self.entries
            .iter()
            .filter(|e| {
                e.simulation_type == simulation_type
                    && e.resolution.eq_ignore_ascii_case(resolution)
            })
            .collect()
    }

    /// Looks up benchmarks for a configuration.
    ///
    /// Entries are filtered by simulation type and resolution. When a processor family
    /// or instance identifier is given, entries containing it (case-insensitive
    /// substring) are preferred; if nothing contains it, the first entry of the filtered
    /// set is returned instead. An empty result means that there is no measurement
    /// for the model and resolution at all.
    pub fn find(
        &self,
        simulation_type: SimulationType,
        resolution: &str,
        processor: Option<&str>,
        instance: Option<&str>,
    ) -> Vec<&BenchmarkEntry> {
        let candidates = self.entries_for(simulation_type, resolution);
        if candidates.is_empty() || (processor.is_none() && instance.is_none()) {
            return candidates;
        }
        let matching: Vec<&BenchmarkEntry> = candidates
            .iter()
            .copied()
            .filter(|e| {
                processor.is_none_or(|p| {
                    contains_ignore_case(&e.processor_type, p)
                        || contains_ignore_case(&e.instance_type, p)
                }) && instance.is_none_or(|i| contains_ignore_case(&e.instance_type, i))
            })
            .collect();
        if matching.is_empty() {
            vec![candidates[0]]
        } else {
            matching
        }
    }
}

pub fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack
        .to_lowercase()
        .contains(needle.trim().to_lowercase().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn entry(sim: SimulationType, resolution: &str, processor: &str, instance: &str) -> BenchmarkEntry {
        BenchmarkEntry {
            simulation_type: sim,
            resolution: resolution.to_string(),
            processor_type: processor.to_string(),
            instance_type: instance.to_string(),
            throughput_sim_days_per_wall_day: 10.0,
            cost_per_sim_day: 2.0,
            wall_time_hours: 16.8,
        }
    }

    fn catalog() -> BenchmarkCatalog {
        BenchmarkCatalog::new(vec![
            entry(SimulationType::GcClassic, "4x5", "Graviton3", "c7g.8xlarge"),
            entry(SimulationType::GcClassic, "4x5", "Graviton3", "c7g.16xlarge"),
            entry(SimulationType::GcClassic, "4x5", "Intel", "c6i.8xlarge"),
            entry(SimulationType::GcClassic, "2x2.5", "Graviton3", "c7g.8xlarge"),
            entry(SimulationType::Gchp, "C24", "Graviton3", "c7g.16xlarge"),
        ])
        .unwrap()
    }

    #[test]
    fn builtin_catalog_loads() {
        let catalog = BenchmarkCatalog::builtin().unwrap();
        assert!(!catalog.is_empty());
        assert!(
            catalog
                .entries()
                .iter()
                .all(|e| e.throughput_sim_days_per_wall_day > 0.0)
        );
    }

    #[test]
    fn find_filters_by_type_and_resolution() {
        let catalog = catalog();
        assert_eq!(catalog.find(SimulationType::GcClassic, "4x5", None, None).len(), 3);
        assert_eq!(catalog.find(SimulationType::Gchp, "c24", None, None).len(), 1);
        assert!(catalog.find(SimulationType::Gchp, "4x5", None, None).is_empty());
        assert!(
            catalog
                .find(SimulationType::GcClassic, "0.5x0.625", Some("graviton3"), None)
                .is_empty()
        );
    }

    #[test]
    fn find_prefers_substring_matches() {
        let catalog = catalog();
        let found = catalog.find(SimulationType::GcClassic, "4x5", Some("graviton"), None);
        assert_eq!(found.len(), 2);

        let found = catalog.find(
            SimulationType::GcClassic,
            "4x5",
            Some("GRAVITON3"),
            Some("16XLARGE"),
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].instance_type, "c7g.16xlarge");

        let found = catalog.find(SimulationType::GcClassic, "4x5", Some("c6i"), None);
        assert_eq!(found[0].processor_type, "Intel");
    }

    #[test]
    fn find_falls_back_to_first_entry() {
        let catalog = catalog();
        let found = catalog.find(SimulationType::GcClassic, "4x5", Some("amd"), Some("4xlarge"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].instance_type, "c7g.8xlarge");
    }

    #[test]
    fn reject_non_positive_measurements() {
        let mut bad = entry(SimulationType::GcClassic, "4x5", "Intel", "c6i.8xlarge");
        bad.throughput_sim_days_per_wall_day = 0.0;
        let result = BenchmarkCatalog::new(vec![
            entry(SimulationType::GcClassic, "4x5", "Intel", "c6i.8xlarge"),
            bad,
        ]);
        assert!(matches!(
            result,
            Err(CostError::InvalidBenchmark { index: 1, .. })
        ));

        let mut bad = entry(SimulationType::GcClassic, "4x5", "Intel", "c6i.8xlarge");
        bad.cost_per_sim_day = -1.0;
        assert!(BenchmarkCatalog::new(vec![bad]).is_err());
    }

    #[test]
    fn load_from_file() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"simulationType": "GCHP", "resolution": "C48", "processorType": "amd",
                 "instanceType": "c6a.16xlarge", "throughputSimDaysPerWallDay": 11.0,
                 "costPerSimDay": 5.3, "wallTimeHours": 15.3}}]"#
        )
        .unwrap();
        let catalog = BenchmarkCatalog::load(file.path()).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.entries()[0].simulation_type, SimulationType::Gchp);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            BenchmarkCatalog::load(file.path()),
            Err(CostError::DeserializationError(_))
        ));
    }
}
