//! Infrastructure layer for Phaseflow.
//!
//! Contains the filesystem implementation of the `InstanceStore` trait defined
//! in `phaseflow-core`, the `config.toml` loader, data directory layout and
//! workflow template file loading.

pub mod config;
pub mod filesystem;
pub mod storage;
pub mod template;
