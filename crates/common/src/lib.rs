//! Cutline Common Utilities
//!
//! Shared infrastructure for all Cutline crates:
//! - Error types and result aliases
//! - Tracing/logging initialization
//! - Configuration loading, including the drain/teardown budgets

pub mod config;
pub mod error;
pub mod logging;

pub use config::*;
pub use error::*;
