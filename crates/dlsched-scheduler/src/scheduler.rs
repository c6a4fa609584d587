//! Main scheduling loop
//!
//! A single `select!` loop owns the node inventory, the round-robin cursor
//! and the pending queue. Everything that must feed back into the loop's own
//! inputs (ready tasks, pending retries, re-sent pods) is sent from a spawned
//! task so the loop never blocks on itself.

use dlsched_core::{
    Binding, DlschedError, DlschedResult, NodeEvent, PodInfo, SchedulerConfig, TaskPhase,
    TaskRecordState,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::node_registry::{NodeRegistry, NodeState};
use crate::placement::{GpuRoundRobin, PlacementOutcome, PlacementStrategy, PodPlacement};
use crate::task::{TaskHandle, TaskRegistry};
use crate::traits::{OrchestrationClient, TaskStateStore};

/// Point-in-time view of the scheduler's own state
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSnapshot {
    /// Nodes in round-robin order
    pub nodes: Vec<NodeState>,
    /// Round-robin cursor
    pub cursor: usize,
    /// Tasks waiting for GPUs, in retry order
    pub pending: Vec<String>,
}

type RemoveRequest = (String, oneshot::Sender<DlschedResult<()>>);

/// Cloneable handle for talking to a running scheduler
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tasks: TaskRegistry,
    ready_tx: mpsc::Sender<TaskHandle>,
    completion_tx: mpsc::Sender<String>,
    remove_tx: mpsc::Sender<RemoveRequest>,
    snapshot_tx: mpsc::Sender<oneshot::Sender<ClusterSnapshot>>,
}

impl SchedulerHandle {
    /// Signal that a task finished, releasing its GPUs
    pub async fn complete(&self, task: &str) -> DlschedResult<()> {
        self.completion_tx
            .send(task.to_string())
            .await
            .map_err(|_| DlschedError::ChannelClosed("completion".to_string()))
    }

    /// Push a ready but unplaced task back onto the placement path
    pub async fn resubmit(&self, task: &str) -> DlschedResult<()> {
        let handle = self
            .tasks
            .get(task)
            .await
            .ok_or_else(|| DlschedError::TaskNotFound(task.to_string()))?;

        let phase = handle.lock().await.phase;
        if phase != TaskPhase::Ready {
            return Err(DlschedError::InvalidTaskState(format!(
                "task {} is {}, not Ready",
                task, phase
            )));
        }

        info!(task = %task, "Resubmitting learning task");
        self.ready_tx
            .send(handle)
            .await
            .map_err(|_| DlschedError::ChannelClosed("ready".to_string()))
    }

    /// Remove a task that is not running.
    ///
    /// Handled by the loop, so it never overlaps a placement of the task.
    pub async fn remove(&self, task: &str) -> DlschedResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.remove_tx
            .send((task.to_string(), reply_tx))
            .await
            .map_err(|_| DlschedError::ChannelClosed("remove".to_string()))?;
        reply_rx
            .await
            .map_err(|_| DlschedError::ChannelClosed("remove reply".to_string()))?
    }

    /// Current node inventory, cursor and pending queue
    pub async fn snapshot(&self) -> DlschedResult<ClusterSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.snapshot_tx
            .send(reply_tx)
            .await
            .map_err(|_| DlschedError::ChannelClosed("snapshot".to_string()))?;
        reply_rx
            .await
            .map_err(|_| DlschedError::ChannelClosed("snapshot reply".to_string()))
    }
}

/// Scheduler for learning tasks
pub struct Scheduler {
    config: SchedulerConfig,
    client: Arc<dyn OrchestrationClient>,
    store: Arc<dyn TaskStateStore>,
    tasks: TaskRegistry,
    placement_strategy: Arc<dyn PlacementStrategy>,
    nodes: NodeRegistry,
    /// Tasks deferred on GPU shortage
    pending: Vec<TaskHandle>,
    pod_tx: mpsc::Sender<PodInfo>,
    pod_rx: mpsc::Receiver<PodInfo>,
    ready_tx: mpsc::Sender<TaskHandle>,
    ready_rx: mpsc::Receiver<TaskHandle>,
    completion_tx: mpsc::Sender<String>,
    completion_rx: mpsc::Receiver<String>,
    remove_tx: mpsc::Sender<RemoveRequest>,
    remove_rx: mpsc::Receiver<RemoveRequest>,
    snapshot_tx: mpsc::Sender<oneshot::Sender<ClusterSnapshot>>,
    snapshot_rx: mpsc::Receiver<oneshot::Sender<ClusterSnapshot>>,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(
        config: SchedulerConfig,
        client: Arc<dyn OrchestrationClient>,
        tasks: TaskRegistry,
        store: Arc<dyn TaskStateStore>,
    ) -> Self {
        let capacity = config.channel_capacity.max(1);
        let (pod_tx, pod_rx) = mpsc::channel(capacity);
        let (ready_tx, ready_rx) = mpsc::channel(capacity);
        let (completion_tx, completion_rx) = mpsc::channel(capacity);
        let (remove_tx, remove_rx) = mpsc::channel(capacity);
        let (snapshot_tx, snapshot_rx) = mpsc::channel(capacity);

        info!(
            namespace = %config.namespace,
            scheduler_name = %config.scheduler_name,
            client = client.name(),
            "Scheduler initialized"
        );

        Self {
            config,
            client,
            store,
            tasks,
            placement_strategy: Arc::new(GpuRoundRobin),
            nodes: NodeRegistry::new(),
            pending: Vec::new(),
            pod_tx,
            pod_rx,
            ready_tx,
            ready_rx,
            completion_tx,
            completion_rx,
            remove_tx,
            remove_rx,
            snapshot_tx,
            snapshot_rx,
        }
    }

    /// Replace the placement strategy
    pub fn with_placement_strategy(mut self, strategy: Arc<dyn PlacementStrategy>) -> Self {
        self.placement_strategy = strategy;
        self
    }

    /// Handle for completion signals, resubmission, removal and snapshots
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            tasks: self.tasks.clone(),
            ready_tx: self.ready_tx.clone(),
            completion_tx: self.completion_tx.clone(),
            remove_tx: self.remove_tx.clone(),
            snapshot_tx: self.snapshot_tx.clone(),
        }
    }

    /// Load the initial node inventory.
    ///
    /// A listing failure is reported and the scheduler starts with whatever
    /// node events arrive later.
    pub async fn bootstrap(&mut self) {
        match self.client.list_ready_nodes().await {
            Ok(nodes) => {
                for node in nodes.iter().filter(|n| n.ready) {
                    self.nodes.add_node(node);
                }
                info!(nodes = self.nodes.len(), "Initial node inventory loaded");
            }
            Err(e) => {
                error!(error = %e, "Failed to list nodes, starting with an empty inventory");
            }
        }
    }

    /// Run the scheduling loop.
    ///
    /// Only returns on a fatal accounting error, or once every input has
    /// been closed.
    pub async fn run(mut self, mut node_events: mpsc::Receiver<NodeEvent>) -> DlschedResult<()> {
        let poller = spawn_pod_poller(
            self.client.clone(),
            self.config.pod_batch_interval(),
            self.pod_tx.clone(),
        );

        info!(strategy = self.placement_strategy.name(), "Scheduling loop started");

        let result = loop {
            let step = tokio::select! {
                Some(pod) = self.pod_rx.recv() => self.handle_pod(pod).await,
                Some(task) = self.ready_rx.recv() => self.handle_ready(task).await,
                Some(name) = self.completion_rx.recv() => self.handle_completion(&name).await,
                Some((name, reply)) = self.remove_rx.recv() => {
                    match self.handle_remove(&name).await {
                        Err(e) if e.is_fatal() => {
                            let _ = reply.send(Err(DlschedError::Internal(
                                "scheduler stopped".to_string(),
                            )));
                            Err(e)
                        }
                        outcome => {
                            let _ = reply.send(outcome);
                            Ok(())
                        }
                    }
                }
                Some(event) = node_events.recv() => {
                    self.handle_node_event(event);
                    Ok(())
                }
                Some(reply) = self.snapshot_rx.recv() => {
                    let _ = reply.send(self.snapshot());
                    Ok(())
                }
                else => {
                    info!("All scheduler inputs closed");
                    break Ok(());
                }
            };

            match step {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Scheduling state is inconsistent, stopping");
                    break Err(e);
                }
                Err(e) => warn!(error = %e, "Failed to handle scheduler event"),
            }
        };

        poller.abort();
        result
    }

    /// Admit an arrived pod into its learning task
    async fn handle_pod(&mut self, pod: PodInfo) -> DlschedResult<()> {
        let Some(task_name) = pod.task.clone() else {
            warn!(pod = %pod.name, "Pod has no learning task label, dropping");
            return Ok(());
        };

        let Some(handle) = self.tasks.get(&task_name).await else {
            warn!(pod = %pod.name, task = %task_name, "Unknown learning task, dropping pod");
            return Ok(());
        };

        let mut task = handle.lock().await;
        let phase = task.phase;
        match phase {
            TaskPhase::Running if task.restarting => {
                debug!(
                    task = %task_name,
                    pod = %pod.name,
                    "Restart in progress, holding pod until collection resumes"
                );
                task.deferred.push(pod);
            }
            TaskPhase::Running => {
                info!(
                    task = %task_name,
                    pod = %pod.name,
                    "Learning task is restarted for handling eviction of pod"
                );
                task.restarting = true;
                task.deferred.push(pod);
                let reservations = task.take_reservations();
                drop(task);

                self.release_reservations(&task_name, reservations)?;
                spawn_restart(handle, self.pod_tx.clone(), self.store.clone());
            }
            TaskPhase::Ready => {
                warn!(
                    task = %task_name,
                    pod = %pod.name,
                    "Learning task already has all its pods, dropping pod"
                );
            }
            TaskPhase::Completed => {
                warn!(task = %task_name, pod = %pod.name, "Learning task completed, dropping pod");
            }
            TaskPhase::Collecting => {
                debug!(task = %task_name, pod = %pod.name, role = %pod.role, "Handling newly arrived pod");
                if task.admit(pod) {
                    info!(task = %task_name, "Learning task is ready to be scheduled");
                    drop(task);
                    self.spawn_ready(vec![handle]);
                }
            }
        }

        Ok(())
    }

    /// Place the unbound pods of a ready task and commit the bindings
    async fn handle_ready(&mut self, handle: TaskHandle) -> DlschedResult<()> {
        if self.tasks.get(handle.name()).await.is_none() {
            debug!(task = %handle.name(), "Learning task was removed, skipping");
            return Ok(());
        }

        let pods = {
            let task = handle.lock().await;
            if task.phase != TaskPhase::Ready {
                debug!(task = %task.name, phase = %task.phase, "Task no longer ready, skipping");
                return Ok(());
            }
            task.unbound_pods()
        };

        info!(task = %handle.name(), pods = pods.len(), "Placing pods of learning task");

        let placements = match self.placement_strategy.place(&mut self.nodes, &pods)? {
            PlacementOutcome::Placed(placements) => placements,
            PlacementOutcome::Unplaceable { pod } => {
                info!(
                    task = %handle.name(),
                    pod = %pod,
                    "Pending learning task because of the GPU shortage"
                );
                if !self.pending.iter().any(|p| p.name() == handle.name()) {
                    self.pending.push(handle);
                }
                return Ok(());
            }
        };

        let bindings: Vec<Binding> = placements.iter().map(|p| p.binding()).collect();
        if let Err(e) = self
            .client
            .submit_bindings(&self.config.namespace, &bindings)
            .await
        {
            let committed = match &e {
                DlschedError::Binding { committed, .. } => (*committed).min(placements.len()),
                _ => 0,
            };
            error!(
                task = %handle.name(),
                committed = committed,
                error = %e,
                "Failed to submit bindings"
            );

            let (bound, unbound) = placements.split_at(committed);
            handle.lock().await.record_bound(bound);
            self.release_placements(unbound)?;
            return Ok(());
        }

        for placement in &placements {
            info!(
                task = %handle.name(),
                pod = %placement.pod_name,
                node = %placement.node,
                gpus = placement.gpus,
                "Pod bound to node"
            );
        }

        if self.tasks.get(handle.name()).await.is_none() {
            warn!(task = %handle.name(), "Learning task removed during binding, releasing GPUs");
            let reservations = handle.lock().await.take_reservations();
            self.release_reservations(handle.name(), reservations)?;
            self.release_placements(&placements)?;
            return Ok(());
        }

        handle.lock().await.record_placement(&placements);

        if let Err(e) = self
            .store
            .update_state(handle.name(), TaskRecordState::NotCompleted, "")
            .await
        {
            warn!(task = %handle.name(), error = %e, "Failed to record task state");
        }

        Ok(())
    }

    /// Release a finished task's GPUs and retry every pending task
    async fn handle_completion(&mut self, name: &str) -> DlschedResult<()> {
        let Some(handle) = self.tasks.get(name).await else {
            warn!(task = %name, "Completion for unknown learning task");
            return Ok(());
        };

        let reservations = {
            let mut task = handle.lock().await;
            if task.restarting {
                warn!(task = %name, "Completion during an eviction restart, ignoring");
                return Ok(());
            }
            if !task.running() {
                warn!(task = %name, phase = %task.phase, "Completion for a task that is not running");
            }
            task.phase = TaskPhase::Completed;
            task.take_reservations()
        };

        info!(task = %name, "Learning task completed");
        self.release_reservations(name, reservations)?;

        let retry: Vec<TaskHandle> = std::mem::take(&mut self.pending)
            .into_iter()
            .filter(|p| p.name() != name)
            .collect();
        if !retry.is_empty() {
            debug!(tasks = retry.len(), "Retrying pending learning tasks");
            self.spawn_ready(retry);
        }

        Ok(())
    }

    /// Drop a task that is not running, releasing GPUs held by bound pods
    async fn handle_remove(&mut self, name: &str) -> DlschedResult<()> {
        let handle = self
            .tasks
            .get(name)
            .await
            .ok_or_else(|| DlschedError::TaskNotFound(name.to_string()))?;

        let reservations = {
            let mut task = handle.lock().await;
            if task.running() {
                warn!(task = %name, "Refusing to remove running task");
                return Err(DlschedError::InvalidTaskState(format!(
                    "task {} is running",
                    name
                )));
            }
            task.take_reservations()
        };

        self.tasks.remove(name).await?;
        self.pending.retain(|p| p.name() != name);
        self.release_reservations(name, reservations)
    }

    fn handle_node_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Added(node) => {
                self.nodes.add_node(&node);
            }
            NodeEvent::Updated(node) => self.nodes.update_node(&node),
            NodeEvent::Deleted(node) => {
                self.nodes.remove_node(&node.name);
            }
        }
    }

    fn release_placements(&mut self, placements: &[PodPlacement]) -> DlschedResult<()> {
        for placement in placements.iter().filter(|p| p.gpus > 0) {
            self.nodes.release(&placement.node, placement.gpus)?;
        }
        Ok(())
    }

    fn release_reservations(
        &mut self,
        task: &str,
        reservations: Vec<(String, u32)>,
    ) -> DlschedResult<()> {
        for (node, gpus) in reservations.into_iter().filter(|(_, gpus)| *gpus > 0) {
            match self.nodes.release(&node, gpus) {
                Ok(()) => {}
                Err(DlschedError::UnknownNode(_)) => {
                    warn!(task = %task, node = %node, gpus = gpus, "Node gone, nothing to release");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Feed tasks into the ready channel from outside the loop
    fn spawn_ready(&self, tasks: Vec<TaskHandle>) {
        let ready_tx = self.ready_tx.clone();
        tokio::spawn(async move {
            for task in tasks {
                if ready_tx.send(task).await.is_err() {
                    warn!("Scheduler stopped, dropping ready task");
                    return;
                }
            }
        });
    }

    fn snapshot(&self) -> ClusterSnapshot {
        ClusterSnapshot {
            nodes: self.nodes.snapshot(),
            cursor: self.nodes.cursor(),
            pending: self.pending.iter().map(|p| p.name().to_string()).collect(),
        }
    }
}

/// Stop an evicted task, reset its collection state and feed the pods held
/// during the restart back into the loop
fn spawn_restart(
    handle: TaskHandle,
    pod_tx: mpsc::Sender<PodInfo>,
    store: Arc<dyn TaskStateStore>,
) {
    tokio::spawn(async move {
        if let Err(e) = handle.stop().await {
            warn!(task = %handle.name(), error = %e, "Stop handshake failed");
        }

        if let Err(e) = store
            .update_state(handle.name(), TaskRecordState::Stopped, "evicted")
            .await
        {
            warn!(task = %handle.name(), error = %e, "Failed to record task state");
        }

        let held = {
            let mut task = handle.lock().await;
            task.reset_collection();
            task.restarting = false;
            std::mem::take(&mut task.deferred)
        };

        if let Err(e) = handle.run().await {
            warn!(task = %handle.name(), error = %e, "Failed to run learning task again");
        }

        debug!(task = %handle.name(), pods = held.len(), "Re-admitting pods after restart");
        for pod in held {
            if pod_tx.send(pod).await.is_err() {
                debug!("Scheduling loop gone, dropping held pods");
                return;
            }
        }
    });
}

/// Forward polled pods into the loop one at a time
fn spawn_pod_poller(
    client: Arc<dyn OrchestrationClient>,
    interval: Duration,
    pod_tx: mpsc::Sender<PodInfo>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match client.poll_pod_batch(interval).await {
                Ok(pods) => {
                    for pod in pods {
                        if pod_tx.send(pod).await.is_err() {
                            debug!("Scheduling loop gone, stopping pod poller");
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to poll pods");
                    tokio::time::sleep(interval).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::InMemoryStateStore;
    use async_trait::async_trait;
    use dlsched_core::{NodeInfo, PodRole, TaskSpec};
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{Mutex, Notify};

    struct FakeClient {
        nodes: Vec<NodeInfo>,
        pods: Mutex<mpsc::UnboundedReceiver<PodInfo>>,
        bindings: std::sync::Mutex<Vec<Binding>>,
        /// Index in a batch at which binding starts failing
        fail_from: std::sync::Mutex<Option<usize>>,
        /// Holds binding submission until notified
        hold: std::sync::Mutex<Option<Arc<Notify>>>,
        bind_calls: AtomicUsize,
    }

    impl FakeClient {
        fn bindings(&self) -> Vec<Binding> {
            self.bindings.lock().unwrap().clone()
        }

        fn bound_node(&self, pod: &str) -> Option<String> {
            self.bindings()
                .into_iter()
                .rev()
                .find(|b| b.pod_name == pod)
                .map(|b| b.node_name)
        }
    }

    #[async_trait]
    impl OrchestrationClient for FakeClient {
        async fn list_ready_nodes(&self) -> DlschedResult<Vec<NodeInfo>> {
            Ok(self.nodes.clone())
        }

        async fn poll_pod_batch(&self, interval: Duration) -> DlschedResult<Vec<PodInfo>> {
            let mut pods = self.pods.lock().await;
            match tokio::time::timeout(interval, pods.recv()).await {
                Ok(Some(first)) => {
                    let mut batch = vec![first];
                    while let Ok(pod) = pods.try_recv() {
                        batch.push(pod);
                    }
                    Ok(batch)
                }
                Ok(None) => {
                    drop(pods);
                    tokio::time::sleep(interval).await;
                    Ok(Vec::new())
                }
                Err(_) => Ok(Vec::new()),
            }
        }

        async fn submit_bindings(
            &self,
            _namespace: &str,
            bindings: &[Binding],
        ) -> DlschedResult<()> {
            self.bind_calls.fetch_add(1, Ordering::SeqCst);
            let gate = self.hold.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }

            let fail_from = *self.fail_from.lock().unwrap();
            let mut stored = self.bindings.lock().unwrap();
            for (index, binding) in bindings.iter().enumerate() {
                if fail_from == Some(index) {
                    return Err(DlschedError::Binding {
                        committed: index,
                        message: "binding rejected".to_string(),
                    });
                }
                stored.push(binding.clone());
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    struct Harness {
        handle: SchedulerHandle,
        tasks: TaskRegistry,
        client: Arc<FakeClient>,
        store: Arc<InMemoryStateStore>,
        pods: mpsc::UnboundedSender<PodInfo>,
        node_events: mpsc::Sender<NodeEvent>,
        run: JoinHandle<DlschedResult<()>>,
    }

    impl Harness {
        async fn start(nodes: Vec<NodeInfo>) -> Self {
            Self::start_with(nodes, None).await
        }

        async fn start_with(
            nodes: Vec<NodeInfo>,
            strategy: Option<Arc<dyn PlacementStrategy>>,
        ) -> Self {
            let (pods_tx, pods_rx) = mpsc::unbounded_channel();
            let client = Arc::new(FakeClient {
                nodes,
                pods: Mutex::new(pods_rx),
                bindings: std::sync::Mutex::new(Vec::new()),
                fail_from: std::sync::Mutex::new(None),
                hold: std::sync::Mutex::new(None),
                bind_calls: AtomicUsize::new(0),
            });
            let store = Arc::new(InMemoryStateStore::new());
            let tasks = TaskRegistry::new();

            let mut scheduler = Scheduler::new(
                SchedulerConfig::default(),
                client.clone(),
                tasks.clone(),
                store.clone(),
            );
            if let Some(strategy) = strategy {
                scheduler = scheduler.with_placement_strategy(strategy);
            }
            scheduler.bootstrap().await;

            let handle = scheduler.handle();
            let (node_events, node_rx) = mpsc::channel(16);
            let run = tokio::spawn(scheduler.run(node_rx));

            Self {
                handle,
                tasks,
                client,
                store,
                pods: pods_tx,
                node_events,
                run,
            }
        }

        async fn submit(&self, name: &str, ps: u32, workers: u32) {
            let driver = self
                .tasks
                .register(TaskSpec::new(name, ps, workers))
                .await
                .unwrap();
            driver.spawn_acknowledging();
        }

        fn send_pod(&self, task: &str, name: &str, role: PodRole, gpus: u32) {
            self.pods
                .send(PodInfo {
                    name: name.to_string(),
                    uid: format!("uid-{}", name),
                    namespace: "default".to_string(),
                    task: Some(task.to_string()),
                    role,
                    gpu_request: gpus,
                })
                .unwrap();
        }

        async fn phase(&self, task: &str) -> TaskPhase {
            let handle = self.tasks.get(task).await.unwrap();
            let phase = handle.lock().await.phase;
            phase
        }

        async fn available(&self, node: &str) -> u32 {
            let snapshot = self.handle.snapshot().await.unwrap();
            snapshot
                .nodes
                .into_iter()
                .find(|n| n.name == node)
                .map(|n| n.available_gpus)
                .unwrap()
        }
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..300 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_gpu_pod_and_plain_pod_spread_over_nodes() {
        let h = Harness::start(vec![NodeInfo::new("a", Some(2)), NodeInfo::new("b", Some(0))]).await;
        let hr = &h;
        h.submit("mnist", 0, 2).await;

        h.send_pod("mnist", "w0", PodRole::Worker, 2);
        h.send_pod("mnist", "w1", PodRole::Worker, 0);

        eventually(|| async move { hr.client.bindings().len() == 2 }).await;
        assert_eq!(h.client.bound_node("w0").as_deref(), Some("a"));
        assert_eq!(h.client.bound_node("w1").as_deref(), Some("b"));
        assert_eq!(h.available("a").await, 0);

        eventually(|| async move { hr.phase("mnist").await == TaskPhase::Running }).await;
        let record = h.store.get("mnist").await.unwrap();
        assert_eq!(record.state, TaskRecordState::NotCompleted);
    }

    #[tokio::test]
    async fn test_pending_task_retried_on_completion() {
        let h = Harness::start(vec![NodeInfo::new("a", Some(1))]).await;
        let hr = &h;
        h.submit("first", 0, 1).await;
        h.submit("second", 0, 1).await;

        h.send_pod("first", "first-w0", PodRole::Worker, 1);
        eventually(|| async move { hr.client.bound_node("first-w0").is_some() }).await;

        h.send_pod("second", "second-w0", PodRole::Worker, 1);
        eventually(|| async move {
            hr.handle.snapshot().await.unwrap().pending == vec!["second".to_string()]
        })
        .await;
        assert!(h.client.bound_node("second-w0").is_none());
        assert_eq!(h.available("a").await, 0);

        h.handle.complete("first").await.unwrap();
        eventually(|| async move { hr.client.bound_node("second-w0").is_some() }).await;

        let snapshot = h.handle.snapshot().await.unwrap();
        assert!(snapshot.pending.is_empty());
        assert_eq!(h.available("a").await, 0);
        assert_eq!(h.phase("first").await, TaskPhase::Completed);
        assert_eq!(h.phase("second").await, TaskPhase::Running);
    }

    #[tokio::test]
    async fn test_completion_releases_gpus_once() {
        let h = Harness::start(vec![NodeInfo::new("a", Some(4))]).await;
        let hr = &h;
        h.submit("mnist", 1, 1).await;

        h.send_pod("mnist", "ps-0", PodRole::ParameterServer, 1);
        h.send_pod("mnist", "w-0", PodRole::Worker, 2);
        eventually(|| async move { hr.phase("mnist").await == TaskPhase::Running }).await;
        assert_eq!(h.available("a").await, 1);

        h.handle.complete("mnist").await.unwrap();
        h.handle.complete("mnist").await.unwrap();
        eventually(|| async move { hr.phase("mnist").await == TaskPhase::Completed }).await;
        assert_eq!(h.available("a").await, 4);
    }

    #[tokio::test]
    async fn test_unknown_task_pod_is_dropped() {
        let h = Harness::start(vec![NodeInfo::new("a", Some(1))]).await;
        let hr = &h;
        h.submit("mnist", 0, 1).await;

        h.send_pod("ghost", "ghost-0", PodRole::Worker, 1);
        h.send_pod("mnist", "w0", PodRole::Worker, 1);

        eventually(|| async move { hr.client.bound_node("w0").is_some() }).await;
        assert!(h.client.bound_node("ghost-0").is_none());
        assert!(!h.run.is_finished());
    }

    #[tokio::test]
    async fn test_readiness_needs_exact_counts() {
        let h = Harness::start(vec![NodeInfo::new("a", Some(0))]).await;
        let hr = &h;
        h.submit("mnist", 1, 1).await;

        h.send_pod("mnist", "w0", PodRole::Worker, 0);
        eventually(|| async move {
            let handle = hr.tasks.get("mnist").await.unwrap();
            let ready_workers = handle.lock().await.ready_workers;
            ready_workers == 1
        })
        .await;
        assert_eq!(h.phase("mnist").await, TaskPhase::Collecting);

        h.send_pod("mnist", "ps0", PodRole::ParameterServer, 0);
        eventually(|| async move { hr.client.bindings().len() == 2 }).await;
    }

    #[tokio::test]
    async fn test_extra_pod_does_not_retrigger_readiness() {
        let h = Harness::start(vec![NodeInfo::new("a", Some(1))]).await;
        let hr = &h;
        h.submit("big", 0, 1).await;

        h.send_pod("big", "w0", PodRole::Worker, 2);
        eventually(|| async move {
            hr.handle.snapshot().await.unwrap().pending == vec!["big".to_string()]
        })
        .await;

        h.send_pod("big", "w1", PodRole::Worker, 0);
        h.send_pod("big", "w2", PodRole::Worker, 0);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let task = h.tasks.get("big").await.unwrap();
        let task = task.lock().await;
        assert_eq!(task.pods.len(), 1);
        assert_eq!(task.ready_workers, 1);
        assert_eq!(task.phase, TaskPhase::Ready);
        drop(task);
        assert_eq!(h.handle.snapshot().await.unwrap().pending.len(), 1);
    }

    #[tokio::test]
    async fn test_eviction_restarts_task() {
        let h = Harness::start(vec![NodeInfo::new("a", Some(2))]).await;
        let hr = &h;
        h.submit("mnist", 0, 1).await;

        h.send_pod("mnist", "w0", PodRole::Worker, 2);
        eventually(|| async move { hr.phase("mnist").await == TaskPhase::Running }).await;
        assert_eq!(h.available("a").await, 2 - 2);

        // The recreated pod reveals the eviction and is only delivered once.
        h.send_pod("mnist", "w0-recreated", PodRole::Worker, 2);
        eventually(|| async move { hr.client.bound_node("w0-recreated").is_some() }).await;
        eventually(|| async move { hr.phase("mnist").await == TaskPhase::Running }).await;

        assert_eq!(h.available("a").await, 0);
        let handle = h.tasks.get("mnist").await.unwrap();
        let task = handle.lock().await;
        assert!(!task.restarting);
        assert!(task.deferred.is_empty());
        assert_eq!(task.pods.len(), 1);
        assert_eq!(task.pod_to_node.get("w0-recreated").map(String::as_str), Some("a"));
    }

    #[tokio::test]
    async fn test_eviction_records_stopped_and_recollects() {
        let h = Harness::start(vec![NodeInfo::new("a", Some(2))]).await;
        let hr = &h;
        h.submit("mnist", 0, 2).await;

        h.send_pod("mnist", "w0", PodRole::Worker, 1);
        h.send_pod("mnist", "w1", PodRole::Worker, 1);
        eventually(|| async move { hr.phase("mnist").await == TaskPhase::Running }).await;
        assert_eq!(h.available("a").await, 0);

        h.send_pod("mnist", "w0-recreated", PodRole::Worker, 1);
        eventually(|| async move {
            let stopped = matches!(
                hr.store.get("mnist").await,
                Some(record) if record.state == TaskRecordState::Stopped
            );
            let handle = hr.tasks.get("mnist").await.unwrap();
            let task = handle.lock().await;
            stopped && task.phase == TaskPhase::Collecting && task.pods.len() == 1
        })
        .await;
        assert_eq!(h.available("a").await, 2);

        h.send_pod("mnist", "w1-recreated", PodRole::Worker, 1);
        eventually(|| async move { hr.client.bound_node("w1-recreated").is_some() }).await;
        eventually(|| async move { hr.phase("mnist").await == TaskPhase::Running }).await;
        assert!(h.client.bound_node("w0-recreated").is_some());
        assert_eq!(h.available("a").await, 0);
        let record = h.store.get("mnist").await.unwrap();
        assert_eq!(record.state, TaskRecordState::NotCompleted);
    }

    #[tokio::test]
    async fn test_binding_failure_rolls_back() {
        let h = Harness::start(vec![NodeInfo::new("a", Some(2))]).await;
        let hr = &h;
        *h.client.fail_from.lock().unwrap() = Some(0);
        h.submit("mnist", 0, 1).await;

        h.send_pod("mnist", "w0", PodRole::Worker, 2);
        eventually(|| async move { hr.phase("mnist").await == TaskPhase::Ready }).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(h.available("a").await, 2);
        assert_eq!(h.phase("mnist").await, TaskPhase::Ready);
        assert!(h.store.get("mnist").await.is_none());

        *h.client.fail_from.lock().unwrap() = None;
        h.handle.resubmit("mnist").await.unwrap();
        eventually(|| async move { hr.client.bound_node("w0").is_some() }).await;
        eventually(|| async move { hr.phase("mnist").await == TaskPhase::Running }).await;
        assert_eq!(h.available("a").await, 0);

        assert!(matches!(
            h.handle.resubmit("mnist").await,
            Err(DlschedError::InvalidTaskState(_))
        ));
    }

    #[tokio::test]
    async fn test_node_events() {
        let h = Harness::start(vec![NodeInfo::new("a", Some(4)), NodeInfo::new("b", None)]).await;
        let hr = &h;
        h.submit("mnist", 0, 1).await;

        h.send_pod("mnist", "w0", PodRole::Worker, 3);
        eventually(|| async move { hr.client.bound_node("w0").is_some() }).await;
        assert_eq!(h.handle.snapshot().await.unwrap().cursor, 1);

        h.node_events
            .send(NodeEvent::Updated(NodeInfo::new("a", Some(4))))
            .await
            .unwrap();
        h.node_events
            .send(NodeEvent::Added(NodeInfo::new("c", Some(8))))
            .await
            .unwrap();
        eventually(|| async move { hr.handle.snapshot().await.unwrap().nodes.len() == 3 }).await;
        assert_eq!(h.available("a").await, 1);

        h.node_events
            .send(NodeEvent::Deleted(NodeInfo::new("b", None)))
            .await
            .unwrap();
        eventually(|| async move { hr.handle.snapshot().await.unwrap().nodes.len() == 2 }).await;
        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.cursor, 0);
        let names: Vec<&str> = snapshot.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_removed_pending_task_is_not_placed() {
        let h = Harness::start(vec![NodeInfo::new("a", Some(1))]).await;
        let hr = &h;
        h.submit("first", 0, 1).await;
        h.submit("second", 0, 1).await;

        h.send_pod("first", "first-w0", PodRole::Worker, 1);
        eventually(|| async move { hr.client.bound_node("first-w0").is_some() }).await;
        h.send_pod("second", "second-w0", PodRole::Worker, 1);
        eventually(|| async move {
            hr.handle.snapshot().await.unwrap().pending == vec!["second".to_string()]
        })
        .await;

        h.handle.remove("second").await.unwrap();
        h.handle.complete("first").await.unwrap();
        eventually(|| async move { hr.phase("first").await == TaskPhase::Completed }).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(h.client.bound_node("second-w0").is_none());
        assert_eq!(h.available("a").await, 1);
        assert!(h.handle.snapshot().await.unwrap().pending.is_empty());
    }

    #[tokio::test]
    async fn test_partial_binding_keeps_committed_reservations() {
        let h = Harness::start(vec![NodeInfo::new("a", Some(1)), NodeInfo::new("b", Some(1))]).await;
        let hr = &h;
        *h.client.fail_from.lock().unwrap() = Some(1);
        h.submit("mnist", 0, 2).await;

        h.send_pod("mnist", "w0", PodRole::Worker, 1);
        h.send_pod("mnist", "w1", PodRole::Worker, 1);
        eventually(|| async move { hr.client.bindings().len() == 1 }).await;

        assert_eq!(h.client.bound_node("w0").as_deref(), Some("a"));
        assert_eq!(h.available("a").await, 0);
        assert_eq!(h.available("b").await, 1);
        assert_eq!(h.phase("mnist").await, TaskPhase::Ready);

        *h.client.fail_from.lock().unwrap() = None;
        h.handle.resubmit("mnist").await.unwrap();
        eventually(|| async move { hr.phase("mnist").await == TaskPhase::Running }).await;

        assert_eq!(h.client.bound_node("w1").as_deref(), Some("b"));
        assert_eq!(h.client.bindings().len(), 2);
        assert_eq!(h.available("a").await, 0);
        assert_eq!(h.available("b").await, 0);

        h.handle.complete("mnist").await.unwrap();
        eventually(|| async move { hr.phase("mnist").await == TaskPhase::Completed }).await;
        assert_eq!(h.available("a").await, 1);
        assert_eq!(h.available("b").await, 1);
    }

    #[tokio::test]
    async fn test_remove_waits_for_placement_in_flight() {
        let h = Harness::start(vec![NodeInfo::new("a", Some(2))]).await;
        let hr = &h;
        let gate = Arc::new(Notify::new());
        *h.client.hold.lock().unwrap() = Some(gate.clone());
        h.submit("t", 0, 1).await;

        h.send_pod("t", "w0", PodRole::Worker, 2);
        eventually(|| async move { hr.client.bind_calls.load(Ordering::SeqCst) == 1 }).await;

        let handle = h.handle.clone();
        let removal = tokio::spawn(async move { handle.remove("t").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.notify_one();

        let result = removal.await.unwrap();
        assert!(matches!(result, Err(DlschedError::InvalidTaskState(_))));
        assert_eq!(h.phase("t").await, TaskPhase::Running);
        assert_eq!(h.available("a").await, 0);

        h.handle.complete("t").await.unwrap();
        eventually(|| async move { hr.phase("t").await == TaskPhase::Completed }).await;
        assert_eq!(h.available("a").await, 2);
    }

    #[tokio::test]
    async fn test_task_dropped_from_registry_during_binding_releases_gpus() {
        let h = Harness::start(vec![NodeInfo::new("a", Some(2))]).await;
        let hr = &h;
        let gate = Arc::new(Notify::new());
        *h.client.hold.lock().unwrap() = Some(gate.clone());
        h.submit("t", 0, 1).await;

        h.send_pod("t", "w0", PodRole::Worker, 2);
        eventually(|| async move { hr.client.bind_calls.load(Ordering::SeqCst) == 1 }).await;

        h.tasks.remove("t").await.unwrap();
        gate.notify_one();

        assert_eq!(h.available("a").await, 2);
        assert!(h.tasks.get("t").await.is_none());
    }

    struct CountingRoundRobin {
        attempts: AtomicUsize,
    }

    impl PlacementStrategy for CountingRoundRobin {
        fn place(
            &self,
            nodes: &mut NodeRegistry,
            pods: &[PodInfo],
        ) -> DlschedResult<PlacementOutcome> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            GpuRoundRobin.place(nodes, pods)
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    #[tokio::test]
    async fn test_pending_task_retried_on_every_completion() {
        let strategy = Arc::new(CountingRoundRobin {
            attempts: AtomicUsize::new(0),
        });
        let placement: Arc<dyn PlacementStrategy> = strategy.clone();
        let h = Harness::start_with(vec![NodeInfo::new("a", Some(2))], Some(placement)).await;
        let hr = &h;
        let sr = &strategy;
        let attempts = || sr.attempts.load(Ordering::SeqCst);
        h.submit("first", 0, 1).await;
        h.submit("second", 0, 1).await;
        h.submit("big", 0, 1).await;

        h.send_pod("first", "first-w0", PodRole::Worker, 1);
        h.send_pod("second", "second-w0", PodRole::Worker, 1);
        eventually(|| async move { hr.client.bindings().len() == 2 }).await;
        h.send_pod("big", "big-w0", PodRole::Worker, 2);
        eventually(|| async move {
            hr.handle.snapshot().await.unwrap().pending == vec!["big".to_string()]
        })
        .await;
        assert_eq!(attempts(), 3);

        // One GPU freed is not enough; the task goes back to pending.
        h.handle.complete("first").await.unwrap();
        eventually(|| async move { sr.attempts.load(Ordering::SeqCst) == 4 }).await;
        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.pending, vec!["big".to_string()]);
        assert_eq!(h.available("a").await, 1);
        assert!(h.client.bound_node("big-w0").is_none());

        h.handle.complete("second").await.unwrap();
        eventually(|| async move { hr.client.bound_node("big-w0").is_some() }).await;
        assert_eq!(h.available("a").await, 0);
        assert!(h.handle.snapshot().await.unwrap().pending.is_empty());
        assert_eq!(h.phase("big").await, TaskPhase::Running);
    }

    struct BrokenAccounting;

    impl PlacementStrategy for BrokenAccounting {
        fn place(
            &self,
            _nodes: &mut NodeRegistry,
            _pods: &[PodInfo],
        ) -> DlschedResult<PlacementOutcome> {
            Err(DlschedError::AccountingViolation("negative".to_string()))
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    #[tokio::test]
    async fn test_accounting_violation_stops_loop() {
        let h = Harness::start_with(
            vec![NodeInfo::new("a", Some(1))],
            Some(Arc::new(BrokenAccounting)),
        )
        .await;
        h.submit("mnist", 0, 1).await;
        h.send_pod("mnist", "w0", PodRole::Worker, 1);

        let result = tokio::time::timeout(Duration::from_secs(5), h.run)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(DlschedError::AccountingViolation(_))));
    }
}
