//! Layerfold Core - Foundational Types
//!
//! Error and configuration types shared by the layerfold runtime and CLI.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{MaterializeConfig, SpecialFilePolicy};
pub use error::{FoldError, Result};

/// Layerfold version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
