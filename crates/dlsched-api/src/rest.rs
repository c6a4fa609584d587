//! REST API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use dlsched_core::{DlschedError, TaskRecordState, TaskSpec};
use dlsched_scheduler::{
    ClusterSnapshot, NodeState, SchedulerHandle, TaskRegistry, TaskStateStore, TaskSummary,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
pub struct AppState {
    pub tasks: TaskRegistry,
    pub scheduler: SchedulerHandle,
    pub store: Arc<dyn TaskStateStore>,
}

/// Create the API router
pub fn create_router(
    tasks: TaskRegistry,
    scheduler: SchedulerHandle,
    store: Arc<dyn TaskStateStore>,
) -> Router {
    let state = Arc::new(AppState {
        tasks,
        scheduler,
        store,
    });

    Router::new()
        .route("/api/v1/tasks", post(create_task).get(list_tasks))
        .route("/api/v1/tasks/:name", get(get_task).delete(delete_task))
        .route("/api/v1/tasks/:name/complete", post(complete_task))
        .route("/api/v1/tasks/:name/resubmit", post(resubmit_task))
        .route("/api/v1/nodes", get(get_nodes))
        .route("/api/v1/status", get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(e: DlschedError) -> (StatusCode, String) {
    let status = match e {
        DlschedError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        DlschedError::TaskExists(_) | DlschedError::InvalidTaskState(_) => StatusCode::CONFLICT,
        DlschedError::ChannelClosed(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

/// Request to create a learning task
#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    /// Task name, matched against the pods' task label
    pub name: String,
    /// Number of parameter-server pods
    #[serde(default)]
    pub parameter_servers: u32,
    /// Number of worker pods
    #[serde(default)]
    pub workers: u32,
}

/// Register a learning task
async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<TaskSummary>), (StatusCode, String)> {
    if req.name.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "task name is empty".to_string()));
    }
    if req.parameter_servers == 0 && req.workers == 0 {
        return Err((
            StatusCode::BAD_REQUEST,
            "task needs at least one pod".to_string(),
        ));
    }

    info!(
        task = %req.name,
        parameter_servers = req.parameter_servers,
        workers = req.workers,
        "Creating learning task"
    );

    let spec = TaskSpec::new(req.name, req.parameter_servers, req.workers);
    let name = spec.name.clone();
    let driver = state.tasks.register(spec).await.map_err(error_response)?;
    driver.spawn_acknowledging();

    let handle = state
        .tasks
        .get(&name)
        .await
        .ok_or_else(|| error_response(DlschedError::TaskNotFound(name)))?;

    Ok((StatusCode::CREATED, Json(handle.summary().await)))
}

/// List all learning tasks
async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Vec<TaskSummary>> {
    Json(state.tasks.list().await)
}

/// Get a specific learning task
async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<TaskSummary>, (StatusCode, String)> {
    let handle = state
        .tasks
        .get(&name)
        .await
        .ok_or_else(|| error_response(DlschedError::TaskNotFound(name)))?;
    Ok(Json(handle.summary().await))
}

/// Delete a learning task that is not running
async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    info!(task = %name, "Deleting learning task");
    state.scheduler.remove(&name).await.map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Mark a running task finished and release its GPUs
async fn complete_task(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let handle = state
        .tasks
        .get(&name)
        .await
        .ok_or_else(|| error_response(DlschedError::TaskNotFound(name.clone())))?;

    let (phase, running, restarting) = {
        let task = handle.lock().await;
        (task.phase, task.running(), task.restarting)
    };
    if !running {
        return Err(error_response(DlschedError::InvalidTaskState(format!(
            "task {} is {}, not Running",
            name, phase
        ))));
    }
    if restarting {
        return Err(error_response(DlschedError::InvalidTaskState(format!(
            "task {} is restarting after an eviction",
            name
        ))));
    }

    info!(task = %name, "Completing learning task");
    state
        .store
        .update_state(&name, TaskRecordState::Completed, "")
        .await
        .map_err(error_response)?;
    state.scheduler.complete(&name).await.map_err(error_response)?;

    Ok(StatusCode::ACCEPTED)
}

/// Retry placement of a ready task
async fn resubmit_task(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .scheduler
        .resubmit(&name)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::ACCEPTED)
}

/// Node inventory in round-robin order
async fn get_nodes(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<NodeState>>, (StatusCode, String)> {
    let snapshot = state.scheduler.snapshot().await.map_err(error_response)?;
    Ok(Json(snapshot.nodes))
}

/// System status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub tasks: usize,
    #[serde(flatten)]
    pub cluster: ClusterSnapshot,
}

/// Get system status
async fn get_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatusResponse>, (StatusCode, String)> {
    let cluster = state.scheduler.snapshot().await.map_err(error_response)?;

    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        tasks: state.tasks.len().await,
        cluster,
    }))
}
