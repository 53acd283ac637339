pub mod catalog;
pub mod error;
pub mod estimator;
pub mod layout;
pub mod model;
pub mod pricing;
pub mod ranker;

pub use crate::catalog::{BenchmarkCatalog, BenchmarkEntry};
pub use crate::estimator::{CostEstimate, CostEstimator, EstimateBasis, EstimatorParameters};
pub use crate::model::{
    ChemistryOption, CubedSphereResolution, InstanceSize, LatLonResolution, ModelSetup,
    OutputFrequency, SimulationConfig, SimulationType,
};
pub use crate::pricing::{Architecture, PriceTable, RateLookup};
pub use crate::ranker::{ComparisonRow, rank};

pub type Map<K, V> = hashbrown::HashMap<K, V>;
pub type Set<T> = hashbrown::HashSet<T>;

pub type Error = error::CostError;
pub type Result<T> = std::result::Result<T, Error>;

/// Rounds to two decimal places: whole cents for dollar amounts, and the precision
/// reported for hours, throughput and storage sizes.
pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
