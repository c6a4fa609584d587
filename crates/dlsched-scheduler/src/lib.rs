//! dlsched-scheduler: GPU-aware scheduler for distributed learning tasks
//!
//! This crate provides the scheduling control loop and the state it owns:
//! - Node inventory and GPU accounting
//! - Round-robin, GPU-aware placement of a task's pods
//! - The shared learning task registry
//! - Traits for the orchestrator client and task state store

pub mod node_registry;
pub mod placement;
pub mod scheduler;
pub mod task;
pub mod traits;

pub use node_registry::{NodeRegistry, NodeState};
pub use placement::{GpuRoundRobin, PlacementOutcome, PlacementStrategy, PodPlacement};
pub use scheduler::{ClusterSnapshot, Scheduler, SchedulerHandle};
pub use task::{LearningTask, TaskCommand, TaskDriver, TaskHandle, TaskRegistry, TaskSummary};
pub use traits::{InMemoryStateStore, OrchestrationClient, TaskRecord, TaskStateStore};
