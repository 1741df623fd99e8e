//! Core domain types
//!
//! This module contains the core domain structures used across Conduit crates.
//! These types represent the fundamental business entities and are shared between
//! the orchestrator (which owns and mutates them) and its clients (which display them).

pub mod instance;
pub mod job;
pub mod pipeline;
