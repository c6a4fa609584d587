//! Node, Pod, Binding and learning task type definitions

use serde::{Deserialize, Serialize};

/// Pod label carrying the owning learning task's name
pub const TASK_LABEL: &str = "learning-task";

/// Pod label carrying the pod's role within its learning task
pub const ROLE_LABEL: &str = "type";

/// A cluster node as reported by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node name
    pub name: String,
    /// Allocatable GPUs; `None` when the node advertises no GPU resource
    pub gpu_capacity: Option<u32>,
    /// Whether the node reports a `Ready=True` condition
    pub ready: bool,
}

impl NodeInfo {
    /// Create a ready node with the given GPU capacity
    pub fn new(name: impl Into<String>, gpu_capacity: Option<u32>) -> Self {
        Self {
            name: name.into(),
            gpu_capacity,
            ready: true,
        }
    }
}

/// Node change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Added(NodeInfo),
    Updated(NodeInfo),
    Deleted(NodeInfo),
}

impl NodeEvent {
    /// The node the event refers to
    pub fn node(&self) -> &NodeInfo {
        match self {
            NodeEvent::Added(n) | NodeEvent::Updated(n) | NodeEvent::Deleted(n) => n,
        }
    }
}

/// Role of a pod within a learning task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PodRole {
    /// Parameter server (`type=PS`)
    ParameterServer,
    /// Worker (`type=worker`)
    Worker,
    /// Missing or unrecognised role label
    Other,
}

impl PodRole {
    /// Parse the value of the role label
    pub fn from_label(value: Option<&str>) -> Self {
        match value {
            Some("PS") => PodRole::ParameterServer,
            Some("worker") => PodRole::Worker,
            _ => PodRole::Other,
        }
    }
}

impl std::fmt::Display for PodRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PodRole::ParameterServer => write!(f, "PS"),
            PodRole::Worker => write!(f, "worker"),
            PodRole::Other => write!(f, "other"),
        }
    }
}

/// A pod waiting to be scheduled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodInfo {
    /// Pod name
    pub name: String,
    /// Pod UID
    pub uid: String,
    /// Namespace the pod lives in
    pub namespace: String,
    /// Owning learning task, from the `learning-task` label
    pub task: Option<String>,
    /// Role within the task, from the `type` label
    pub role: PodRole,
    /// GPUs requested across all containers
    pub gpu_request: u32,
}

/// Assignment of one pod to one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// Namespace of the pod
    pub namespace: String,
    /// Pod name
    pub pod_name: String,
    /// Pod UID
    pub pod_uid: String,
    /// Target node
    pub node_name: String,
}

/// Learning task submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique task name, matched against the pods' `learning-task` label
    pub name: String,
    /// Number of parameter-server pods
    pub parameter_servers: u32,
    /// Number of worker pods
    pub workers: u32,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, parameter_servers: u32, workers: u32) -> Self {
        Self {
            name: name.into(),
            parameter_servers,
            workers,
        }
    }
}

/// Scheduling phase of a learning task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPhase {
    /// Waiting for its pods to arrive
    Collecting,
    /// All pods arrived; queued for placement or pending on GPU shortage
    Ready,
    /// Bindings committed
    Running,
    /// Finished and resources released
    Completed,
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPhase::Collecting => write!(f, "Collecting"),
            TaskPhase::Ready => write!(f, "Ready"),
            TaskPhase::Running => write!(f, "Running"),
            TaskPhase::Completed => write!(f, "Completed"),
        }
    }
}

/// Task state as recorded in the external task state store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskRecordState {
    NotCompleted,
    Completed,
    Stopped,
}

impl std::fmt::Display for TaskRecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskRecordState::NotCompleted => write!(f, "not-completed"),
            TaskRecordState::Completed => write!(f, "completed"),
            TaskRecordState::Stopped => write!(f, "stopped"),
        }
    }
}
