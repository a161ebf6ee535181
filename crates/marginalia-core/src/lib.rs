//! Marginalia core crate - entry data model, error taxonomy, configuration.

pub mod config;
pub mod error;
pub mod types;

pub use config::MarginaliaConfig;
pub use error::{MarginaliaError, Result};
pub use types::*;
