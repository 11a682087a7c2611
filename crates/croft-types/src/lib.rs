//! # croft-types
//!
//! Core types shared across the Croft task-farming system: task and batch
//! primitives, worker state records, farm configuration, error types, and the
//! executor collaborator trait that workers run payloads through.

pub mod config;
pub mod errors;
pub mod executor;
pub mod task;
pub mod worker;

pub use config::*;
pub use errors::*;
pub use executor::*;
pub use task::*;
pub use worker::*;
