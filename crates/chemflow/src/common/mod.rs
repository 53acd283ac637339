pub mod config;
pub mod error;
pub mod ids;
pub mod retry;
pub mod serde_duration;
pub mod setup;
