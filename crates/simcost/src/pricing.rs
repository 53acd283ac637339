use crate::error::CostError;
use crate::model::InstanceSize;
use crate::Set;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    #[serde(rename = "arm64")]
    Arm64,
    #[serde(rename = "x86_64")]
    X86_64,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::Arm64 => f.write_str("arm64"),
            Architecture::X86_64 => f.write_str("x86_64"),
        }
    }
}

/// On-demand hourly price of one instance, per instance size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SizeRates {
    pub small: f64,
    pub medium: f64,
    pub large: f64,
}

impl SizeRates {
    pub fn get(&self, size: InstanceSize) -> f64 {
        match size {
            InstanceSize::Small => self.small,
            InstanceSize::Medium => self.medium,
            InstanceSize::Large => self.large,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorSpec {
    pub name: String,
    pub architecture: Architecture,
    pub instance_family: String,
    pub hourly_rates: SizeRates,
}

impl ProcessorSpec {
    pub fn instance_type(&self, size: InstanceSize) -> String {
        format!("{}.{}", self.instance_family, size.instance_suffix())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Fraction of the on-demand rate paid for spot capacity.
    pub spot_multiplier: f64,
    pub processors: Vec<ProcessorSpec>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        let processor = |name: &str, architecture, family: &str, rates: [f64; 3]| ProcessorSpec {
            name: name.to_string(),
            architecture,
            instance_family: family.to_string(),
            hourly_rates: SizeRates {
                small: rates[0],
                medium: rates[1],
                large: rates[2],
            },
        };
        Self {
            spot_multiplier: 0.3,
            processors: vec![
                processor("graviton3", Architecture::Arm64, "c7g", [0.612, 1.224, 2.448]),
                processor("graviton4", Architecture::Arm64, "c8g", [0.638, 1.276, 2.552]),
                processor("intel", Architecture::X86_64, "c6i", [0.68, 1.36, 2.72]),
                processor("amd", Architecture::X86_64, "c6a", [0.612, 1.224, 2.448]),
            ],
        }
    }
}

/// Source of hourly instance prices used by every cost formula.
pub trait RateLookup {
    fn processor(&self, name: &str) -> Option<&ProcessorSpec>;

    /// Hourly price of one instance, with the spot discount applied when requested.
    fn hourly_rate(&self, processor: &str, size: InstanceSize, spot: bool) -> Option<f64>;

    /// Family with the lowest on-demand price for `size`. Ties are broken by name.
    fn cheapest_processor(&self, size: InstanceSize) -> Option<&ProcessorSpec>;
}

#[derive(Debug, Clone)]
pub struct PriceTable {
    spot_multiplier: f64,
    processors: Vec<ProcessorSpec>,
}

impl PriceTable {
    pub fn new(config: PricingConfig) -> crate::Result<Self> {
        if config.processors.is_empty() {
            return Err(CostError::InvalidPriceTable(
                "no processor families defined".to_string(),
            ));
        }
        if config.spot_multiplier.is_nan()
            || config.spot_multiplier <= 0.0
            || config.spot_multiplier > 1.0
        {
            return Err(CostError::InvalidPriceTable(format!(
                "spot multiplier {} is outside of (0, 1]",
                config.spot_multiplier
            )));
        }
        let mut names = Set::new();
        for spec in &config.processors {
            if !names.insert(spec.name.to_lowercase()) {
                return Err(CostError::InvalidPriceTable(format!(
                    "processor family '{}' is defined twice",
                    spec.name
                )));
            }
            for size in InstanceSize::ALL {
                let rate = spec.hourly_rates.get(*size);
                if rate.is_nan() || rate <= 0.0 {
                    return Err(CostError::InvalidPriceTable(format!(
                        "rate of {} {size} must be positive, got {rate}",
                        spec.name
                    )));
                }
            }
        }
        Ok(Self {
            spot_multiplier: config.spot_multiplier,
            processors: config.processors,
        })
    }

    pub fn spot_multiplier(&self) -> f64 {
        self.spot_multiplier
    }

    pub fn processors(&self) -> impl Iterator<Item = &ProcessorSpec> {
        self.processors.iter()
    }

    pub fn processor_names(&self) -> String {
        self.processors
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        let config = PricingConfig::default();
        Self {
            spot_multiplier: config.spot_multiplier,
            processors: config.processors,
        }
    }
}

impl RateLookup for PriceTable {
    fn processor(&self, name: &str) -> Option<&ProcessorSpec> {
        let name = name.trim();
        self.processors
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    fn hourly_rate(&self, processor: &str, size: InstanceSize, spot: bool) -> Option<f64> {
        let rate = self.processor(processor)?.hourly_rates.get(size);
        Some(if spot {
            rate * self.spot_multiplier
        } else {
            rate
        })
    }

    fn cheapest_processor(&self, size: InstanceSize) -> Option<&ProcessorSpec> {
        self.processors.iter().min_by(|a, b| {
            a.hourly_rates
                .get(size)
                .total_cmp(&b.hourly_rates.get(size))
                .then_with(|| a.name.cmp(&b.name))
        })
    }
}
