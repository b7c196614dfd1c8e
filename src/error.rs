//! Crate-wide caller-visible error taxonomy.

use std::time::Duration;

/// Orthogonal-to-transport error kinds surfaced by the executor to its
/// three callers (sync, async worker, workflow engine). Each caller maps
/// this to its own outcome; see module docs on `executor`, `asyncworker`
/// and `workflow` for how.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("queue is full")]
    QueueFull { retry_after: Duration },

    #[error("inflight limit reached")]
    InflightLimit { retry_after: Duration },

    #[error("timed out waiting in admission queue")]
    QueueWaitTimeout,

    #[error("global sandbox concurrency limit reached")]
    ConcurrencyLimit { retry_after: Duration },

    #[error("circuit breaker open for function")]
    CircuitOpen { retry_after: Duration },

    #[error("invocation timed out")]
    Timeout,

    #[error("backend failed to start a sandbox instance")]
    StartFailed(String),

    #[error("sandbox instance crashed during invocation")]
    InvokeCrash(String),

    #[error("tenant quota exceeded")]
    TenantQuotaExceeded(TenantQuotaDecision),

    #[error("function returned a user error: {0}")]
    PermanentExecution(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Decision payload carried alongside `TenantQuotaExceeded` so callers can
/// build an informative response.
#[derive(Debug, Clone)]
pub struct TenantQuotaDecision {
    pub used: u64,
    pub limit: u64,
    pub window_s: u64,
    pub retry_after_s: u64,
}

impl CoreError {
    pub fn internal<M: std::fmt::Display>(msg: M) -> Self {
        Self::Internal(anyhow::Error::msg(msg.to_string()))
    }

    /// Whether an async worker or workflow engine should retry this error
    /// with backoff rather than treat it as terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::QueueFull { .. }
                | CoreError::InflightLimit { .. }
                | CoreError::QueueWaitTimeout
                | CoreError::Timeout
                | CoreError::StartFailed(_)
                | CoreError::InvokeCrash(_)
        )
    }

    /// `Retry-After` seconds for shed responses, when applicable.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CoreError::QueueFull { retry_after }
            | CoreError::InflightLimit { retry_after }
            | CoreError::ConcurrencyLimit { retry_after }
            | CoreError::CircuitOpen { retry_after } => Some(*retry_after),
            CoreError::TenantQuotaExceeded(d) => Some(Duration::from_secs(d.retry_after_s)),
            _ => None,
        }
    }

    /// Shed status code recommendation (429 vs 503), per capacity policy.
    pub fn shed_status_code(&self) -> Option<u16> {
        match self {
            CoreError::QueueFull { .. }
            | CoreError::InflightLimit { .. }
            | CoreError::ConcurrencyLimit { .. }
            | CoreError::CircuitOpen { .. } => Some(503),
            CoreError::TenantQuotaExceeded(_) => Some(429),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn retryable_errors_match_taxonomy() {
        assert!(CoreError::Timeout.is_retryable());
        assert!(CoreError::StartFailed("boom".into()).is_retryable());
        assert!(!CoreError::BadRequest("bad".into()).is_retryable());
        assert!(!CoreError::PermanentExecution("boom".into()).is_retryable());
    }

    #[test]
    fn shed_errors_carry_retry_after() {
        let e = CoreError::QueueFull {
            retry_after: Duration::from_millis(50),
        };
        assert_eq!(e.retry_after(), Some(Duration::from_millis(50)));
        assert_eq!(e.shed_status_code(), Some(503));
    }
}
