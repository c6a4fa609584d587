//! dlsched-core: Core types and configuration for dlsched
//!
//! This crate provides the fundamental types shared by the dlsched crates:
//! - Node, pod and binding descriptions exchanged with the orchestrator
//! - Learning task phases and persisted task states
//! - Configuration types
//! - Error handling

pub mod config;
pub mod error;
pub mod gpu;
pub mod model;

pub use config::*;
pub use error::*;
pub use gpu::*;
pub use model::*;
