//! Learning tasks and the shared task registry
//!
//! Tasks are registered by whoever submits them and shared with the
//! scheduling loop. Each task sits behind its own mutex; the registry map has
//! a separate lock that is only held for lookups and inserts.

use dlsched_core::{DlschedError, DlschedResult, PodInfo, PodRole, TaskPhase, TaskSpec};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::placement::PodPlacement;

/// Scheduler-visible state of a learning task
#[derive(Debug, Clone)]
pub struct LearningTask {
    /// Unique task name
    pub name: String,
    /// Expected parameter-server pods
    pub required_ps: u32,
    /// Expected worker pods
    pub required_workers: u32,
    /// Pods collected so far, in arrival order
    pub pods: Vec<PodInfo>,
    /// Parameter-server pods collected so far
    pub ready_ps: u32,
    /// Worker pods collected so far
    pub ready_workers: u32,
    /// Current scheduling phase
    pub phase: TaskPhase,
    /// Set while an eviction restart is in progress
    pub restarting: bool,
    /// Pods that arrived while restarting, re-admitted once collection resumes
    pub deferred: Vec<PodInfo>,
    /// GPUs reserved per pod name
    pub gpus_by_pod: HashMap<String, u32>,
    /// Assigned node per pod name
    pub pod_to_node: HashMap<String, String>,
}

impl LearningTask {
    /// Create a task that is collecting pods
    pub fn new(spec: &TaskSpec) -> Self {
        Self {
            name: spec.name.clone(),
            required_ps: spec.parameter_servers,
            required_workers: spec.workers,
            pods: Vec::new(),
            ready_ps: 0,
            ready_workers: 0,
            phase: TaskPhase::Collecting,
            restarting: false,
            deferred: Vec::new(),
            gpus_by_pod: HashMap::new(),
            pod_to_node: HashMap::new(),
        }
    }

    /// Whether bindings have been committed for the task
    pub fn running(&self) -> bool {
        self.phase == TaskPhase::Running
    }

    /// Whether every expected pod has arrived
    pub fn is_complete_set(&self) -> bool {
        self.ready_ps == self.required_ps && self.ready_workers == self.required_workers
    }

    /// Record an arrived pod.
    ///
    /// Returns `true` when this pod completes the set and the task became
    /// ready. Only valid while collecting.
    pub fn admit(&mut self, pod: PodInfo) -> bool {
        match pod.role {
            PodRole::ParameterServer => self.ready_ps += 1,
            PodRole::Worker => self.ready_workers += 1,
            PodRole::Other => {
                debug!(task = %self.name, pod = %pod.name, "Pod has no known role, not counted");
            }
        }
        self.pods.push(pod);

        if self.is_complete_set() {
            self.phase = TaskPhase::Ready;
            true
        } else {
            false
        }
    }

    /// Pods that do not hold a committed binding yet
    pub fn unbound_pods(&self) -> Vec<PodInfo> {
        self.pods
            .iter()
            .filter(|p| !self.pod_to_node.contains_key(&p.name))
            .cloned()
            .collect()
    }

    /// Keep the reservations of bindings that committed, without changing phase
    pub fn record_bound(&mut self, placements: &[PodPlacement]) {
        for p in placements {
            self.gpus_by_pod.insert(p.pod_name.clone(), p.gpus);
            self.pod_to_node.insert(p.pod_name.clone(), p.node.clone());
        }
    }

    /// Store a committed placement and mark the task running
    pub fn record_placement(&mut self, placements: &[PodPlacement]) {
        self.record_bound(placements);
        self.phase = TaskPhase::Running;
    }

    /// Take the recorded reservations as `(node, gpus)` pairs, leaving none
    pub fn take_reservations(&mut self) -> Vec<(String, u32)> {
        let gpus_by_pod = std::mem::take(&mut self.gpus_by_pod);
        std::mem::take(&mut self.pod_to_node)
            .into_iter()
            .map(|(pod, node)| {
                let gpus = gpus_by_pod.get(&pod).copied().unwrap_or(0);
                (node, gpus)
            })
            .collect()
    }

    /// Forget collected pods so the task can be collected again
    pub fn reset_collection(&mut self) {
        self.pods.clear();
        self.ready_ps = 0;
        self.ready_workers = 0;
        self.phase = TaskPhase::Collecting;
    }
}

/// Commands sent from the scheduler to a task's runtime
#[derive(Debug)]
pub enum TaskCommand {
    /// Stop execution and acknowledge on the enclosed sender
    Stop(oneshot::Sender<()>),
    /// Start execution again (re-create pods for collection)
    Run,
}

/// Shared reference to a registered task
#[derive(Debug, Clone)]
pub struct TaskHandle {
    name: Arc<str>,
    state: Arc<Mutex<LearningTask>>,
    commands: mpsc::Sender<TaskCommand>,
}

impl TaskHandle {
    /// Task name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock the task state
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, LearningTask> {
        self.state.lock().await
    }

    /// Ask the task runtime to stop and wait for its acknowledgement
    pub async fn stop(&self) -> DlschedResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(TaskCommand::Stop(ack_tx))
            .await
            .map_err(|_| DlschedError::ChannelClosed(format!("task {} runtime", self.name)))?;
        ack_rx
            .await
            .map_err(|_| DlschedError::ChannelClosed(format!("task {} stop ack", self.name)))
    }

    /// Ask the task runtime to run again
    pub async fn run(&self) -> DlschedResult<()> {
        self.commands
            .send(TaskCommand::Run)
            .await
            .map_err(|_| DlschedError::ChannelClosed(format!("task {} runtime", self.name)))
    }

    /// Point-in-time summary of the task
    pub async fn summary(&self) -> TaskSummary {
        TaskSummary::from(&*self.lock().await)
    }
}

/// Runtime side of a task's command channel
#[derive(Debug)]
pub struct TaskDriver {
    name: String,
    commands: mpsc::Receiver<TaskCommand>,
}

impl TaskDriver {
    /// Task name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next command from the scheduler
    pub async fn next(&mut self) -> Option<TaskCommand> {
        self.commands.recv().await
    }

    /// Drive the task with a runtime that has nothing to tear down.
    ///
    /// Stops are acknowledged immediately; pods are expected to be
    /// re-created by their owning controller.
    pub fn spawn_acknowledging(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(command) = self.next().await {
                match command {
                    TaskCommand::Stop(ack) => {
                        info!(task = %self.name, "Stop requested");
                        let _ = ack.send(());
                    }
                    TaskCommand::Run => {
                        info!(task = %self.name, "Run requested, waiting for pods");
                    }
                }
            }
            debug!(task = %self.name, "Task driver finished");
        })
    }
}

/// Summary of a task for status views
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub name: String,
    pub phase: TaskPhase,
    pub required_ps: u32,
    pub required_workers: u32,
    pub ready_ps: u32,
    pub ready_workers: u32,
    pub restarting: bool,
    pub placements: HashMap<String, String>,
    pub gpus: u32,
}

impl From<&LearningTask> for TaskSummary {
    fn from(task: &LearningTask) -> Self {
        Self {
            name: task.name.clone(),
            phase: task.phase,
            required_ps: task.required_ps,
            required_workers: task.required_workers,
            ready_ps: task.ready_ps,
            ready_workers: task.ready_workers,
            restarting: task.restarting,
            placements: task.pod_to_node.clone(),
            gpus: task.gpus_by_pod.values().sum(),
        }
    }
}

type TasksMap = HashMap<String, TaskHandle>;

/// Registry of learning tasks, shared between the scheduler and submitters
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<RwLock<TasksMap>>,
}

impl TaskRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task, returning the runtime end of its command channel
    pub async fn register(&self, spec: TaskSpec) -> DlschedResult<TaskDriver> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&spec.name) {
            return Err(DlschedError::TaskExists(spec.name));
        }

        let (commands_tx, commands_rx) = mpsc::channel(4);
        let handle = TaskHandle {
            name: Arc::from(spec.name.as_str()),
            state: Arc::new(Mutex::new(LearningTask::new(&spec))),
            commands: commands_tx,
        };
        tasks.insert(spec.name.clone(), handle);

        info!(
            task = %spec.name,
            parameter_servers = spec.parameter_servers,
            workers = spec.workers,
            "Learning task registered"
        );

        Ok(TaskDriver {
            name: spec.name,
            commands: commands_rx,
        })
    }

    /// Look up a task by name
    pub async fn get(&self, name: &str) -> Option<TaskHandle> {
        self.tasks.read().await.get(name).cloned()
    }

    /// Remove a task that is not running
    pub(crate) async fn remove(&self, name: &str) -> DlschedResult<()> {
        let handle = self
            .get(name)
            .await
            .ok_or_else(|| DlschedError::TaskNotFound(name.to_string()))?;

        if handle.lock().await.running() {
            warn!(task = %name, "Refusing to remove running task");
            return Err(DlschedError::InvalidTaskState(format!(
                "task {} is running",
                name
            )));
        }

        self.tasks.write().await.remove(name);
        info!(task = %name, "Learning task removed");
        Ok(())
    }

    /// Summaries of all tasks
    pub async fn list(&self) -> Vec<TaskSummary> {
        let handles: Vec<TaskHandle> = self.tasks.read().await.values().cloned().collect();

        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            summaries.push(handle.summary().await);
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Number of registered tasks
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}
