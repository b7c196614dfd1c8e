use super::{AsyncInvocationId, FunctionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AsyncStatus {
    Queued,
    Running,
    Paused,
    Succeeded,
    Dlq,
}

impl AsyncStatus {
    /// Terminal statuses never transition back to non-terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, AsyncStatus::Succeeded | AsyncStatus::Dlq)
    }
}

/// At-least-once queued invocation row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncInvocation {
    pub id: AsyncInvocationId,
    pub function_id: FunctionId,
    pub payload: serde_json::Value,
    pub status: AsyncStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub next_run_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub tenant_id: String,
    pub namespace: String,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub idempotency_key: Option<String>,
}

impl AsyncInvocation {
    /// Whether a lease currently excludes other workers from acquiring
    /// this row (Glossary: "Lease").
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        match self.lease_expires_at {
            Some(exp) => exp > now,
            None => false,
        }
    }

    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        self.status == AsyncStatus::Queued && self.next_run_at <= now && !self.is_leased(now)
    }
}
