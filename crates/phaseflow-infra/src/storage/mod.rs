//! Instance storage backends.

pub mod filesystem;

pub use filesystem::FsInstanceStore;
