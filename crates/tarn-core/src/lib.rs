//! # tarn-core
//!
//! Core types, traits, and abstractions for the tarn lake engine.
//!
//! This crate provides the foundational data structures, the job state-machine
//! rules, and the trait definitions that other tarn crates depend on.

pub mod defaults;
pub mod error;
pub mod jobs;
pub mod lineage;
pub mod logging;
pub mod models;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, ErrorKind, JobError, Result};
pub use jobs::{can_transition, derive_parent_status, is_terminal, Transition};
pub use models::*;
pub use traits::*;
pub use uuid_utils::{is_v7, new_v7};
