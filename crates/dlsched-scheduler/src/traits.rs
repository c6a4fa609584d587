//! Collaborator traits consumed by the scheduling loop

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dlsched_core::{Binding, DlschedResult, NodeInfo, PodInfo, TaskRecordState};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Cluster orchestrator as seen by the scheduler
#[async_trait]
pub trait OrchestrationClient: Send + Sync {
    /// Nodes that currently report themselves ready
    async fn list_ready_nodes(&self) -> DlschedResult<Vec<NodeInfo>>;

    /// Wait up to `interval` and return pods observed since the last call
    async fn poll_pod_batch(&self, interval: Duration) -> DlschedResult<Vec<PodInfo>>;

    /// Commit a batch of pod-to-node bindings, in order.
    ///
    /// Stops at the first failure and reports it as
    /// [`DlschedError::Binding`](dlsched_core::DlschedError::Binding) with the
    /// number of bindings that did commit.
    async fn submit_bindings(&self, namespace: &str, bindings: &[Binding]) -> DlschedResult<()>;

    /// Client name
    fn name(&self) -> &'static str;
}

/// External record of learning task states
#[async_trait]
pub trait TaskStateStore: Send + Sync {
    /// Record a state transition for `task`
    async fn update_state(
        &self,
        task: &str,
        state: TaskRecordState,
        message: &str,
    ) -> DlschedResult<()>;
}

/// Stored task state
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub state: TaskRecordState,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

/// Task state store kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    records: RwLock<HashMap<String, TaskRecord>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last recorded state of a task
    pub async fn get(&self, task: &str) -> Option<TaskRecord> {
        self.records.read().await.get(task).cloned()
    }
}

#[async_trait]
impl TaskStateStore for InMemoryStateStore {
    async fn update_state(
        &self,
        task: &str,
        state: TaskRecordState,
        message: &str,
    ) -> DlschedResult<()> {
        debug!(task = %task, state = %state, "Recording task state");
        self.records.write().await.insert(
            task.to_string(),
            TaskRecord {
                state,
                message: message.to_string(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }
}
