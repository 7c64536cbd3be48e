//! Workflow state machine, engine and instance manager for Phaseflow.
//!
//! This crate defines the storage "port" (`InstanceStore`) that the
//! infrastructure layer implements. It depends only on `phaseflow-types`,
//! never on `phaseflow-infra` or any filesystem code.

pub mod action;
pub mod engine;
pub mod event;
pub mod gate;
pub mod instance;
pub mod manager;
pub mod repository;
