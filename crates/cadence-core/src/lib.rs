//! `cadence-core`: configuration and shared error types for the Cadence
//! job scheduler.

pub mod config;
pub mod error;

pub use config::{CadenceConfig, DatabaseConfig, QueueConfig, SchedulerConfig};
pub use error::{CadenceError, Result};
