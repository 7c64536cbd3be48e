//! Storage trait definitions (ports).
//!
//! The infrastructure layer (phaseflow-infra) implements these traits. The
//! core crate never depends on a specific storage technology.

pub mod instance;
pub mod memory;

pub use instance::{InstanceStore, StorageArea};
pub use memory::MemoryInstanceStore;
