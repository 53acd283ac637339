pub mod api;
pub mod common;
pub mod model;
pub mod server;
pub mod store;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::ChemflowError;
pub type Result<T> = std::result::Result<T, Error>;

pub type OwnerId = String;
pub type JobId = String;
pub type BudgetId = String;

// Reexports
pub use simcost;
pub use simcost::{Map, Set};

pub const CHEMFLOW_VERSION: &str = env!("CARGO_PKG_VERSION");
