//! Lifecycle event bus.
//!
//! Provides an `EventBus` that distributes `InstanceEvent` messages to all
//! subscribers via a `tokio::sync::broadcast` channel.

pub mod bus;

pub use bus::EventBus;
