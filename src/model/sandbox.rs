use super::{FunctionId, InstanceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Idle,
    Busy,
    Unhealthy,
}

/// A pooled sandbox instance (PooledVM), exclusively owned by one
/// function's pool, never shared across functions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PooledVm {
    pub id: InstanceId,
    pub function_id: FunctionId,
    pub state: InstanceState,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub healthy: bool,
    /// Whether this instance was provisioned by restoring a snapshot.
    pub from_snapshot: bool,
}

impl PooledVm {
    pub fn new_cold(function_id: FunctionId, from_snapshot: bool) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::new(),
            function_id,
            state: InstanceState::Idle,
            created_at: now,
            last_used_at: now,
            healthy: true,
            from_snapshot,
        }
    }
}

/// Per-function cached memory+disk image. Existence is tracked per
/// function id; the pool consults this before deciding cold vs. warm-start
/// from snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub function_id: FunctionId,
    pub code_hash: String,
}
