//! # Caseflow Core
//!
//! Shared foundation for the Caseflow orchestration server: configuration,
//! the error taxonomy, and the domain types every other crate speaks.

pub mod config;
pub mod error;
pub mod types;

pub use config::CaseflowConfig;
pub use error::{CaseflowError, Result};
