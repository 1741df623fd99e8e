//! Data Transfer Objects for the orchestrator API
//!
//! This module contains the request and response bodies exchanged between
//! the orchestrator and its clients (CLI, admin UI). They wrap the domain
//! types with the extra fields a caller needs.

pub mod instance;
pub mod pipeline;
