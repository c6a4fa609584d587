//! Node watch stream to add/update/delete notifications

use dlsched_core::{NodeEvent, NodeInfo};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::watcher::{self, watcher, Event};
use kube::{Api, Client};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::convert::node_info;

/// Delay before re-establishing a failed watch
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Remembers which nodes were announced so applied objects can be split
/// into adds and updates.
#[derive(Debug, Default)]
pub(crate) struct NodeTracker {
    known: HashSet<String>,
}

impl NodeTracker {
    /// Classify an added or modified node
    pub(crate) fn applied(&mut self, node: NodeInfo) -> NodeEvent {
        if self.known.insert(node.name.clone()) {
            NodeEvent::Added(node)
        } else {
            NodeEvent::Updated(node)
        }
    }

    pub(crate) fn deleted(&mut self, node: NodeInfo) -> NodeEvent {
        self.known.remove(&node.name);
        NodeEvent::Deleted(node)
    }

    /// Reconcile against a full relist
    pub(crate) fn restarted(&mut self, nodes: Vec<NodeInfo>) -> Vec<NodeEvent> {
        let listed: HashSet<String> = nodes.iter().map(|n| n.name.clone()).collect();
        let mut vanished: Vec<String> = self
            .known
            .iter()
            .filter(|name| !listed.contains(*name))
            .cloned()
            .collect();
        vanished.sort();

        let mut events: Vec<NodeEvent> = vanished
            .into_iter()
            .map(|name| self.deleted(NodeInfo::new(name, None)))
            .collect();
        events.extend(nodes.into_iter().map(|node| self.applied(node)));
        events
    }
}

/// Forward node changes into `tx` until the receiver goes away
pub(crate) async fn watch_nodes(client: Client, gpu_resource: String, tx: mpsc::Sender<NodeEvent>) {
    let api: Api<Node> = Api::all(client);
    let mut tracker = NodeTracker::default();

    info!("Starting node watcher");
    loop {
        let mut stream = watcher(api.clone(), watcher::Config::default()).boxed();

        while let Some(event) = stream.next().await {
            let events = match event {
                Ok(Event::Applied(node)) => node_info(&node, &gpu_resource)
                    .map(|n| vec![tracker.applied(n)])
                    .unwrap_or_default(),
                Ok(Event::Deleted(node)) => node_info(&node, &gpu_resource)
                    .map(|n| vec![tracker.deleted(n)])
                    .unwrap_or_default(),
                Ok(Event::Restarted(nodes)) => tracker.restarted(
                    nodes
                        .iter()
                        .filter_map(|n| node_info(n, &gpu_resource))
                        .collect(),
                ),
                Err(e) => {
                    error!(error = %e, "Node watch stream error");
                    break;
                }
            };

            for event in events {
                debug!(node = %event.node().name, "Node event");
                if tx.send(event).await.is_err() {
                    info!("Scheduler gone, stopping node watcher");
                    return;
                }
            }
        }

        warn!("Node watch ended, restarting");
        tokio::time::sleep(WATCH_RETRY_DELAY).await;
    }
}
