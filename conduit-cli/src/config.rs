//! Configuration module
//!
//! Handles CLI configuration such as the orchestrator URL.

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// URL of the orchestrator service
    pub orchestrator_url: String,
}
