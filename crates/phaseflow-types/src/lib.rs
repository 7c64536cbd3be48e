//! Shared domain types for Phaseflow.
//!
//! This crate contains the core domain types used across the workflow engine:
//! templates, instances and their phases, lifecycle events, configuration and
//! the shared storage error type.
//!
//! Zero infrastructure dependencies -- only serde, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod instance;
pub mod template;
