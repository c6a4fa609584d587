//! Configuration types for dlsched

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::gpu::DEFAULT_GPU_RESOURCE;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Scheduling loop configuration
    pub scheduler: SchedulerConfig,
    /// Kubernetes client configuration
    pub kube: KubeConfig,
    /// API server configuration
    pub api: ApiConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::DlschedError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::DlschedError::Config(format!("Failed to read config file: {}", e))
        })?;
        toml::from_str(&content)
            .map_err(|e| crate::DlschedError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// Scheduling loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Namespace pods are collected from and bound in
    pub namespace: String,
    /// `spec.schedulerName` this scheduler is responsible for
    pub scheduler_name: String,
    /// Interval between pod batch polls, in seconds
    pub pod_batch_interval_secs: u64,
    /// Extended resource name used for GPUs
    pub gpu_resource: String,
    /// Capacity of the scheduler's internal channels
    pub channel_capacity: usize,
}

impl SchedulerConfig {
    /// Pod batch interval as a duration
    pub fn pod_batch_interval(&self) -> Duration {
        Duration::from_secs(self.pod_batch_interval_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            scheduler_name: "dlsched".to_string(),
            pod_batch_interval_secs: 1,
            gpu_resource: DEFAULT_GPU_RESOURCE.to_string(),
            channel_capacity: 128,
        }
    }
}

/// Kubernetes client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeConfig {
    /// Path to a kubeconfig file; in-cluster or `~/.kube/config` when unset
    pub kubeconfig: Option<PathBuf>,
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub address: String,
    /// Port for the REST API server
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9090,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}
