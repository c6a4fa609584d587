//! Conversions between Kubernetes objects and dlsched types

use dlsched_core::{
    parse_gpu_quantity, total_gpu_request, Binding, NodeInfo, PodInfo, PodRole, ROLE_LABEL,
    TASK_LABEL,
};
use k8s_openapi::api::core::v1::{Binding as KubeBinding, Node, ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::warn;

/// Build a [`NodeInfo`] from a Kubernetes node.
///
/// Returns `None` for nodes without a name.
pub fn node_info(node: &Node, gpu_resource: &str) -> Option<NodeInfo> {
    let name = node.metadata.name.clone()?;
    let status = node.status.as_ref();

    let gpu_capacity = status
        .and_then(|s| s.allocatable.as_ref())
        .and_then(|a| a.get(gpu_resource))
        .and_then(|q| {
            let parsed = parse_gpu_quantity(&q.0);
            if parsed.is_none() {
                warn!(node = %name, quantity = %q.0, "Unparseable GPU allocatable");
            }
            parsed
        });

    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);

    Some(NodeInfo {
        name,
        gpu_capacity,
        ready,
    })
}

/// Build a [`PodInfo`] from a Kubernetes pod.
///
/// Returns `None` for pods without a name.
pub fn pod_info(pod: &Pod, gpu_resource: &str) -> Option<PodInfo> {
    let name = pod.metadata.name.clone()?;
    let labels = pod.metadata.labels.as_ref();

    let gpu_request = pod
        .spec
        .as_ref()
        .map(|spec| {
            total_gpu_request(spec.containers.iter().filter_map(|c| {
                c.resources
                    .as_ref()
                    .and_then(|r| r.requests.as_ref())
                    .and_then(|requests| requests.get(gpu_resource))
                    .map(|q| q.0.as_str())
            }))
        })
        .unwrap_or(0);

    Some(PodInfo {
        name,
        uid: pod.metadata.uid.clone().unwrap_or_default(),
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        task: labels.and_then(|l| l.get(TASK_LABEL)).cloned(),
        role: PodRole::from_label(labels.and_then(|l| l.get(ROLE_LABEL)).map(String::as_str)),
        gpu_request,
    })
}

/// Kubernetes binding object for a placement
pub fn kube_binding(binding: &Binding) -> KubeBinding {
    KubeBinding {
        metadata: ObjectMeta {
            name: Some(binding.pod_name.clone()),
            namespace: Some(binding.namespace.clone()),
            uid: Some(binding.pod_uid.clone()).filter(|uid| !uid.is_empty()),
            ..ObjectMeta::default()
        },
        target: ObjectReference {
            kind: Some("Node".to_string()),
            name: Some(binding.node_name.clone()),
            ..ObjectReference::default()
        },
    }
}
