//! Kubernetes-backed orchestration client

use async_trait::async_trait;
use dlsched_core::{Binding, DlschedError, DlschedResult, NodeEvent, NodeInfo, PodInfo, SchedulerConfig};
use dlsched_scheduler::OrchestrationClient;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::convert::{kube_binding, node_info, pod_info};
use crate::node_watcher;

/// Orchestration client talking to a Kubernetes API server
pub struct KubeClient {
    client: Client,
    config: SchedulerConfig,
    batcher: Mutex<PodBatcher>,
}

impl KubeClient {
    /// Connect using `kubeconfig`, or the in-cluster / default config when unset
    pub async fn new(kubeconfig: Option<PathBuf>, config: SchedulerConfig) -> DlschedResult<Self> {
        let client = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(&path).map_err(|e| {
                    DlschedError::Orchestration(format!(
                        "Failed to read kubeconfig file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let kube_config =
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .map_err(|e| {
                            DlschedError::Orchestration(format!(
                                "Failed to create config from kubeconfig {}: {}",
                                path.display(),
                                e
                            ))
                        })?;
                Client::try_from(kube_config).map_err(|e| {
                    DlschedError::Orchestration(format!("Failed to create Kubernetes client: {}", e))
                })?
            }
            None => Client::try_default().await.map_err(|e| {
                DlschedError::Orchestration(format!("Failed to create Kubernetes client: {}", e))
            })?,
        };

        info!(
            namespace = %config.namespace,
            scheduler_name = %config.scheduler_name,
            "Kubernetes client initialized"
        );

        Ok(Self {
            client,
            config,
            batcher: Mutex::new(PodBatcher::default()),
        })
    }

    /// Stream node additions, updates and deletions into `tx`.
    ///
    /// Runs until the receiving side is dropped.
    pub async fn watch_nodes(&self, tx: mpsc::Sender<NodeEvent>) {
        node_watcher::watch_nodes(self.client.clone(), self.config.gpu_resource.clone(), tx).await
    }

    fn pending_pod_params(&self) -> ListParams {
        ListParams::default().fields(&format!(
            "spec.schedulerName={},spec.nodeName=,status.phase=Pending",
            self.config.scheduler_name
        ))
    }
}

#[async_trait]
impl OrchestrationClient for KubeClient {
    async fn list_ready_nodes(&self) -> DlschedResult<Vec<NodeInfo>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api
            .list(&ListParams::default())
            .await
            .map_err(|e| DlschedError::Orchestration(format!("Failed to list nodes: {}", e)))?;

        Ok(nodes
            .items
            .iter()
            .filter_map(|n| node_info(n, &self.config.gpu_resource))
            .filter(|n| n.ready)
            .collect())
    }

    async fn poll_pod_batch(&self, interval: Duration) -> DlschedResult<Vec<PodInfo>> {
        tokio::time::sleep(interval).await;

        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let pods = api
            .list(&self.pending_pod_params())
            .await
            .map_err(|e| DlschedError::Orchestration(format!("Failed to list pods: {}", e)))?;

        let listed: Vec<PodInfo> = pods
            .items
            .iter()
            .filter_map(|p| pod_info(p, &self.config.gpu_resource))
            .collect();

        let fresh = self.batcher.lock().await.fresh(listed);
        if !fresh.is_empty() {
            debug!(count = fresh.len(), "New pods observed");
        }
        Ok(fresh)
    }

    async fn submit_bindings(&self, namespace: &str, bindings: &[Binding]) -> DlschedResult<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        for (committed, binding) in bindings.iter().enumerate() {
            let body = serde_json::to_vec(&kube_binding(binding))?;
            let result = api
                .create_subresource::<serde_json::Value>(
                    "binding",
                    &binding.pod_name,
                    &PostParams::default(),
                    body,
                )
                .await;

            if let Err(e) = result {
                let conflict = matches!(&e, kube::Error::Api(ae) if ae.code == 409);
                if conflict && already_bound(&api, binding).await {
                    debug!(pod = %binding.pod_name, node = %binding.node_name, "Pod already bound to node");
                    continue;
                }

                warn!(pod = %binding.pod_name, node = %binding.node_name, error = %e, "Binding failed");
                return Err(DlschedError::Binding {
                    committed,
                    message: format!(
                        "failed to bind pod {} to {}: {}",
                        binding.pod_name, binding.node_name, e
                    ),
                });
            }
            debug!(pod = %binding.pod_name, node = %binding.node_name, "Pod bound");
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "kubernetes"
    }
}

/// Tracks pod UIDs already handed out so each pending pod is delivered once
#[derive(Debug, Default)]
struct PodBatcher {
    seen: HashSet<String>,
}

impl PodBatcher {
    /// Pods from `listed` not delivered before. Forgets pods that left the listing.
    fn fresh(&mut self, listed: Vec<PodInfo>) -> Vec<PodInfo> {
        let current: HashSet<String> = listed.iter().map(pod_key).collect();
        self.seen.retain(|key| current.contains(key));

        listed
            .into_iter()
            .filter(|p| self.seen.insert(pod_key(p)))
            .collect()
    }
}

/// Whether the pod already runs on the binding's target node
async fn already_bound(api: &Api<Pod>, binding: &Binding) -> bool {
    match api.get(&binding.pod_name).await {
        Ok(pod) => {
            pod.spec.and_then(|spec| spec.node_name).as_deref() == Some(binding.node_name.as_str())
        }
        Err(e) => {
            debug!(pod = %binding.pod_name, error = %e, "Failed to read pod after binding conflict");
            false
        }
    }
}

fn pod_key(pod: &PodInfo) -> String {
    if pod.uid.is_empty() {
        format!("{}/{}", pod.namespace, pod.name)
    } else {
        pod.uid.clone()
    }
}
