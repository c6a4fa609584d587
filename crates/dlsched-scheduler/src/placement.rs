//! Pod placement decisions

use dlsched_core::{Binding, DlschedResult, PodInfo};
use tracing::{debug, warn};

use crate::node_registry::NodeRegistry;

/// Placement decision for one pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodPlacement {
    /// Pod name
    pub pod_name: String,
    /// Pod UID
    pub pod_uid: String,
    /// Namespace of the pod
    pub namespace: String,
    /// Assigned node
    pub node: String,
    /// GPUs reserved on `node` for this pod
    pub gpus: u32,
}

impl PodPlacement {
    /// Binding to submit for this placement
    pub fn binding(&self) -> Binding {
        Binding {
            namespace: self.namespace.clone(),
            pod_name: self.pod_name.clone(),
            pod_uid: self.pod_uid.clone(),
            node_name: self.node.clone(),
        }
    }
}

/// Result of a placement attempt for a whole learning task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementOutcome {
    /// Every pod was placed; GPUs are reserved
    Placed(Vec<PodPlacement>),
    /// `pod` did not fit anywhere; node availability is unchanged
    Unplaceable { pod: String },
}

/// Strategy for placing all pods of a task at once
pub trait PlacementStrategy: Send + Sync {
    /// Place `pods` onto `nodes`, reserving their GPUs.
    ///
    /// An unplaceable outcome must leave GPU availability exactly as it was.
    /// Errors are accounting violations and are fatal to the caller.
    fn place(&self, nodes: &mut NodeRegistry, pods: &[PodInfo]) -> DlschedResult<PlacementOutcome>;

    /// Strategy name
    fn name(&self) -> &'static str;
}

/// GPU-aware round robin over the registry's node order.
///
/// Pods without GPUs take the node under the cursor. Pods with GPUs take the
/// first node at or after the cursor that has enough free GPUs, scanning at
/// most one full cycle. The cursor moves one past every placed pod.
#[derive(Debug, Default, Clone, Copy)]
pub struct GpuRoundRobin;

impl GpuRoundRobin {
    /// Cyclic scan from the cursor for a node with `gpus` free GPUs
    fn find_candidate(nodes: &NodeRegistry, gpus: u32) -> Option<usize> {
        let len = nodes.len();
        let start = nodes.cursor() % len;
        let mut index = start;
        loop {
            if let Some(node) = nodes.at(index) {
                debug!(node = %node.name, available = node.available_gpus, "Allocatable GPUs");
                if node.fits(gpus) {
                    return Some(index);
                }
            }
            index = (index + 1) % len;
            if index == start {
                return None;
            }
        }
    }

    fn rollback(nodes: &mut NodeRegistry, placed: &[PodPlacement]) -> DlschedResult<()> {
        for placement in placed.iter().filter(|p| p.gpus > 0) {
            nodes.release(&placement.node, placement.gpus)?;
        }
        Ok(())
    }
}

impl PlacementStrategy for GpuRoundRobin {
    fn place(&self, nodes: &mut NodeRegistry, pods: &[PodInfo]) -> DlschedResult<PlacementOutcome> {
        let mut placed: Vec<PodPlacement> = Vec::with_capacity(pods.len());

        for pod in pods {
            if nodes.is_empty() {
                warn!(pod = %pod.name, "No nodes known, cannot place pod");
                Self::rollback(nodes, &placed)?;
                return Ok(PlacementOutcome::Unplaceable {
                    pod: pod.name.clone(),
                });
            }

            if pod.gpu_request > 0 {
                match Self::find_candidate(nodes, pod.gpu_request) {
                    Some(index) => nodes.set_cursor(index),
                    None => {
                        debug!(
                            pod = %pod.name,
                            gpus = pod.gpu_request,
                            "No node has enough free GPUs"
                        );
                        Self::rollback(nodes, &placed)?;
                        return Ok(PlacementOutcome::Unplaceable {
                            pod: pod.name.clone(),
                        });
                    }
                }
            }

            let index = nodes.cursor() % nodes.len();
            let node = nodes.names()[index].clone();
            if pod.gpu_request > 0 {
                if let Err(e) = nodes.reserve(&node, pod.gpu_request) {
                    Self::rollback(nodes, &placed)?;
                    return Err(e);
                }
            }

            debug!(pod = %pod.name, node = %node, gpus = pod.gpu_request, "Pod placed");
            placed.push(PodPlacement {
                pod_name: pod.name.clone(),
                pod_uid: pod.uid.clone(),
                namespace: pod.namespace.clone(),
                node,
                gpus: pod.gpu_request,
            });
            nodes.advance_cursor();
        }

        Ok(PlacementOutcome::Placed(placed))
    }

    fn name(&self) -> &'static str {
        "gpu-round-robin"
    }
}
