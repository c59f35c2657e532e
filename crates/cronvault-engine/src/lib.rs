//! # Cronvault Engine
//!
//! The runtime half of the Cronvault clustered scheduler: register
//! handlers in a [`JobRegistry`], wrap a store in a [`Scheduler`], and
//! `run` it. Scheduling state lives entirely in the shared database, so
//! any number of engine instances can run against the same store.

pub mod engine;
pub mod runner;

pub use cronvault_core::FireResult;
pub use engine::Scheduler;
pub use runner::{JobContext, JobRegistry, JobRunner};
