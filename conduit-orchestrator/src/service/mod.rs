//! Service Module
//!
//! Business logic layer for the orchestrator.
//! Services work on the shared store and executor and hold the engine rules.

pub mod instance;
pub mod pipeline;
pub mod poller;
pub mod scheduler;
pub mod stage;
pub mod workdir;

// Re-export for convenience
pub use instance as instance_service;
pub use pipeline as pipeline_service;
