//! `conveyor-core` — configuration and shared error types for the Conveyor
//! job engine.

pub mod config;
pub mod error;

pub use config::{ConveyorConfig, DatabaseConfig, JobsConfig};
pub use error::{CoreError, Result};
