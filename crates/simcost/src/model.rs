use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Implements label lookup for the fixed vocabularies used in simulation requests.
/// Variants are listed in their natural order (coarse to fine, small to large).
macro_rules! labeled_enum {
    ($name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }

            /// Case-insensitive lookup by label.
            pub fn parse(value: &str) -> Option<Self> {
                let value = value.trim();
                Self::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str().eq_ignore_ascii_case(value))
            }

            pub fn position(&self) -> usize {
                Self::ALL.iter().position(|v| v == self).unwrap_or_default()
            }

            pub fn labels() -> String {
                Self::ALL.iter().map(|v| v.as_str()).collect::<Vec<_>>().join(", ")
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SimulationType {
    #[serde(rename = "GC_CLASSIC")]
    GcClassic,
    #[serde(rename = "GCHP")]
    Gchp,
}

labeled_enum!(SimulationType {
    GcClassic => "GC_CLASSIC",
    Gchp => "GCHP",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LatLonResolution {
    #[serde(rename = "4x5")]
    FourByFive,
    #[serde(rename = "2x2.5")]
    TwoByTwoHalf,
    #[serde(rename = "0.5x0.625")]
    HalfByFiveEighths,
    #[serde(rename = "0.25x0.3125")]
    QuarterByFiveSixteenths,
}

labeled_enum!(LatLonResolution {
    FourByFive => "4x5",
    TwoByTwoHalf => "2x2.5",
    HalfByFiveEighths => "0.5x0.625",
    QuarterByFiveSixteenths => "0.25x0.3125",
});

impl LatLonResolution {
    pub fn coarser(self) -> Option<Self> {
        self.position().checked_sub(1).map(|i| Self::ALL[i])
    }

    pub fn is_high_resolution(self) -> bool {
        self.position() + 2 >= Self::ALL.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CubedSphereResolution {
    C24,
    C48,
    C90,
    C180,
    C360,
}

labeled_enum!(CubedSphereResolution {
    C24 => "C24",
    C48 => "C48",
    C90 => "C90",
    C180 => "C180",
    C360 => "C360",
});

impl CubedSphereResolution {
    /// Number of grid cells along one edge of a cube face.
    pub fn side_length(self) -> u32 {
        match self {
            CubedSphereResolution::C24 => 24,
            CubedSphereResolution::C48 => 48,
            CubedSphereResolution::C90 => 90,
            CubedSphereResolution::C180 => 180,
            CubedSphereResolution::C360 => 360,
        }
    }

    pub fn vertical_levels(self) -> u32 {
        match self {
            CubedSphereResolution::C180 | CubedSphereResolution::C360 => 72,
            _ => 47,
        }
    }

    pub fn coarser(self) -> Option<Self> {
        self.position().checked_sub(1).map(|i| Self::ALL[i])
    }

    pub fn is_high_resolution(self) -> bool {
        self.position() + 2 >= Self::ALL.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChemistryOption {
    #[default]
    Fullchem,
    Tropchem,
    Aerosol,
    Transport,
    Ch4,
    Co2,
}

labeled_enum!(ChemistryOption {
    Fullchem => "fullchem",
    Tropchem => "tropchem",
    Aerosol => "aerosol",
    Transport => "transport",
    Ch4 => "ch4",
    Co2 => "co2",
});

impl ChemistryOption {
    /// Relative cost of the chemistry mechanism compared to full chemistry.
    pub fn runtime_multiplier(self) -> f64 {
        match self {
            ChemistryOption::Fullchem => 1.0,
            ChemistryOption::Tropchem => 0.8,
            ChemistryOption::Aerosol => 0.7,
            ChemistryOption::Transport => 0.5,
            ChemistryOption::Ch4 | ChemistryOption::Co2 => 0.6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceSize {
    Small,
    Medium,
    Large,
}

labeled_enum!(InstanceSize {
    Small => "small",
    Medium => "medium",
    Large => "large",
});

impl InstanceSize {
    pub fn vcpus(self) -> u32 {
        match self {
            InstanceSize::Small => 16,
            InstanceSize::Medium => 32,
            InstanceSize::Large => 64,
        }
    }

    pub fn memory_gb(self) -> u32 {
        self.vcpus() * 2
    }

    /// Suffix of the instance type name, e.g. `8xlarge` in `c7g.8xlarge`.
    pub fn instance_suffix(self) -> &'static str {
        match self {
            InstanceSize::Small => "4xlarge",
            InstanceSize::Medium => "8xlarge",
            InstanceSize::Large => "16xlarge",
        }
    }

    pub fn is_largest(self) -> bool {
        self.position() + 1 == Self::ALL.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OutputFrequency {
    #[serde(rename = "hourly")]
    Hourly,
    #[serde(rename = "3-hourly")]
    ThreeHourly,
    #[default]
    #[serde(rename = "daily")]
    Daily,
    #[serde(rename = "monthly")]
    Monthly,
}

labeled_enum!(OutputFrequency {
    Hourly => "hourly",
    ThreeHourly => "3-hourly",
    Daily => "daily",
    Monthly => "monthly",
});

impl OutputFrequency {
    pub fn is_sub_daily(self) -> bool {
        matches!(self, OutputFrequency::Hourly | OutputFrequency::ThreeHourly)
    }
}

/// Grid choice of a simulation; each model only accepts its own kind of resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "simulationType")]
pub enum ModelSetup {
    #[serde(rename = "GC_CLASSIC")]
    Classic { resolution: LatLonResolution },
    #[serde(rename = "GCHP")]
    Gchp {
        #[serde(rename = "cubedsphereRes")]
        resolution: CubedSphereResolution,
        nodes: u32,
    },
}

impl ModelSetup {
    pub fn simulation_type(&self) -> SimulationType {
        match self {
            ModelSetup::Classic { .. } => SimulationType::GcClassic,
            ModelSetup::Gchp { .. } => SimulationType::Gchp,
        }
    }

    pub fn resolution_label(&self) -> &'static str {
        match self {
            ModelSetup::Classic { resolution } => resolution.as_str(),
            ModelSetup::Gchp { resolution, .. } => resolution.as_str(),
        }
    }

    pub fn nodes(&self) -> u32 {
        match self {
            ModelSetup::Classic { .. } => 1,
            ModelSetup::Gchp { nodes, .. } => (*nodes).max(1),
        }
    }

    pub fn is_multi_node(&self) -> bool {
        self.nodes() > 1
    }

    pub fn is_high_resolution(&self) -> bool {
        match self {
            ModelSetup::Classic { resolution } => resolution.is_high_resolution(),
            ModelSetup::Gchp { resolution, .. } => resolution.is_high_resolution(),
        }
    }

    pub fn coarser_resolution_label(&self) -> Option<&'static str> {
        match self {
            ModelSetup::Classic { resolution } => resolution.coarser().map(|r| r.as_str()),
            ModelSetup::Gchp { resolution, .. } => resolution.coarser().map(|r| r.as_str()),
        }
    }
}

/// A fully parsed simulation request, shared by estimation, validation and dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationConfig {
    #[serde(flatten)]
    pub model: ModelSetup,
    #[serde(rename = "chemistryOption")]
    pub chemistry: ChemistryOption,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub spinup_days: u32,
    pub processor_type: String,
    pub instance_size: InstanceSize,
    pub use_spot: bool,
    pub output_frequency: OutputFrequency,
}

impl SimulationConfig {
    pub fn simulation_type(&self) -> SimulationType {
        self.model.simulation_type()
    }

    pub fn simulation_days(&self) -> u32 {
        (self.end_date - self.start_date).num_days().max(0) as u32
    }

    pub fn total_sim_days(&self) -> u32 {
        self.simulation_days() + self.spinup_days
    }

    pub fn nodes(&self) -> u32 {
        self.model.nodes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_labels_ignoring_case() {
        assert_eq!(
            SimulationType::parse("gc_classic"),
            Some(SimulationType::GcClassic)
        );
        assert_eq!(
            CubedSphereResolution::parse("c90"),
            Some(CubedSphereResolution::C90)
        );
        assert_eq!(
            OutputFrequency::parse("3-Hourly"),
            Some(OutputFrequency::ThreeHourly)
        );
        assert_eq!(LatLonResolution::parse("1x1"), None);
        assert_eq!(InstanceSize::parse(" large "), Some(InstanceSize::Large));
    }

    #[test]
    fn two_highest_resolutions() {
        let high: Vec<_> = LatLonResolution::ALL
            .iter()
            .filter(|r| r.is_high_resolution())
            .collect();
        assert_eq!(
            high,
            vec![
                &LatLonResolution::HalfByFiveEighths,
                &LatLonResolution::QuarterByFiveSixteenths
            ]
        );
        assert!(CubedSphereResolution::C180.is_high_resolution());
        assert!(!CubedSphereResolution::C90.is_high_resolution());
        assert_eq!(
            CubedSphereResolution::C360.coarser(),
            Some(CubedSphereResolution::C180)
        );
        assert_eq!(LatLonResolution::FourByFive.coarser(), None);
    }

    #[test]
    fn gchp_config_serializes_with_tag() {
        let config = SimulationConfig {
            model: ModelSetup::Gchp {
                resolution: CubedSphereResolution::C48,
                nodes: 2,
            },
            chemistry: ChemistryOption::Fullchem,
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            spinup_days: 3,
            processor_type: "graviton3".to_string(),
            instance_size: InstanceSize::Large,
            use_spot: false,
            output_frequency: OutputFrequency::Daily,
        };
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["simulationType"], "GCHP");
        assert_eq!(value["cubedsphereRes"], "C48");
        assert_eq!(value["nodes"], 2);
        assert_eq!(value["chemistryOption"], "fullchem");
        assert_eq!(config.simulation_days(), 31);
        assert_eq!(config.total_sim_days(), 34);

        let parsed: SimulationConfig = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn classic_runs_on_one_node() {
        let setup = ModelSetup::Classic {
            resolution: LatLonResolution::TwoByTwoHalf,
        };
        assert_eq!(setup.nodes(), 1);
        assert!(!setup.is_multi_node());
        assert_eq!(setup.resolution_label(), "2x2.5");
    }
}
