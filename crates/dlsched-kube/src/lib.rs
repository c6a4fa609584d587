//! dlsched-kube: Kubernetes adapter for the dlsched scheduling loop
//!
//! Lists ready nodes, watches node changes, polls pending pods that name
//! this scheduler and posts pod bindings.

pub mod client;
pub mod convert;
mod node_watcher;

pub use client::KubeClient;
