//! dlsched-api: REST API server for dlsched
//!
//! This crate provides the REST API for interacting with the scheduler:
//! - Learning task submission, completion and resubmission
//! - Node inventory
//! - System status

pub mod rest;

pub use rest::create_router;
