//! GPU resource naming and quantity parsing

/// Extended resource name used for GPUs when none is configured
pub const DEFAULT_GPU_RESOURCE: &str = "alpha.kubernetes.io/nvidia-gpu";

/// Parse a GPU resource quantity as reported by the orchestrator.
///
/// GPUs are whole devices, so only plain non-negative integers are accepted
/// (`"2"`, `" 4 "`). Fractional or suffixed quantities return `None`.
pub fn parse_gpu_quantity(quantity: &str) -> Option<u32> {
    quantity.trim().parse::<u32>().ok()
}

/// Sum per-container GPU requests into the pod's requirement.
///
/// Unparseable entries count as zero.
pub fn total_gpu_request<'a, I>(requests: I) -> u32
where
    I: IntoIterator<Item = &'a str>,
{
    requests
        .into_iter()
        .filter_map(parse_gpu_quantity)
        .fold(0u32, |acc, n| acc.saturating_add(n))
}
