//! Conduit Core
//!
//! Core types and abstractions for the Conduit pipeline engine.
//!
//! This crate contains:
//! - Domain types: Core business entities (Pipeline, PipelineInstance, JobStatus, etc.)
//! - DTOs: Data transfer objects exchanged with the orchestrator API

pub mod domain;
pub mod dto;
