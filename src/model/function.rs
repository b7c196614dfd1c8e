use super::FunctionId;
use serde::{Deserialize, Serialize};

/// A registered function: identity, runtime, limits and policy.
/// Immutable on invoke except via a versioned update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub id: FunctionId,
    pub name: String,
    pub runtime: String,
    pub handler: String,
    pub limits: ResourceLimits,
    /// Content hash of the current source+compiled code. Changing this
    /// evicts pooled instances and invalidates snapshots.
    pub code_hash: String,
    pub capacity_policy: Option<CapacityPolicy>,
    pub autoscale_policy: Option<AutoscalePolicy>,
    pub network_policy: Option<NetworkPolicy>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u32,
    pub timeout_s: u32,
    pub instance_concurrency: u32,
    pub min_replicas: u32,
    pub max_replicas: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AutoscalePolicy {
    pub target_utilization: f64,
    pub scale_up_step: u32,
    pub scale_down_step: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkPolicy {
    pub allow_outbound: bool,
    pub allowed_hosts: Vec<String>,
}

/// Capacity policy configuration for a function's admission behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CapacityPolicy {
    pub enabled: bool,
    pub max_inflight: u32,
    pub max_queue_depth: u32,
    pub max_queue_wait_ms: u64,
    pub retry_after_s: u64,
    pub shed_status_code: ShedStatusCode,
    pub breaker_error_pct: u8,
    pub breaker_window_s: u64,
    pub breaker_open_s: u64,
    pub half_open_probes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ShedStatusCode {
    TooManyRequests = 429,
    ServiceUnavailable = 503,
}

impl Default for CapacityPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_inflight: u32::MAX,
            max_queue_depth: 0,
            max_queue_wait_ms: 0,
            retry_after_s: 1,
            shed_status_code: ShedStatusCode::ServiceUnavailable,
            breaker_error_pct: 100,
            breaker_window_s: 60,
            breaker_open_s: 30,
            half_open_probes: 1,
        }
    }
}
