use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuotaDimension {
    Invocations,
    EventPublishes,
    AsyncQueueDepth,
}

/// Per `(tenant_id, dimension)` quota row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TenantQuota {
    pub soft: u64,
    pub hard: u64,
    pub burst: u64,
    pub window_s: u64,
}
