use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no capacity available for function")]
    InflightLimit { retry_after: Duration },

    #[error("admission queue is full")]
    QueueFull { retry_after: Duration },

    #[error("timed out waiting for pool capacity")]
    QueueWaitTimeout,

    #[error("circuit breaker open for function")]
    CircuitOpen { retry_after: Duration },

    #[error("global sandbox concurrency limit reached")]
    ConcurrencyLimit { retry_after: Duration },

    #[error("backend failed to start instance: {0}")]
    StartFailed(String),

    #[error("function not registered")]
    FunctionNotFound,
}

impl From<PoolError> for crate::error::CoreError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::InflightLimit { retry_after } => crate::error::CoreError::InflightLimit { retry_after },
            PoolError::QueueFull { retry_after } => crate::error::CoreError::QueueFull { retry_after },
            PoolError::QueueWaitTimeout => crate::error::CoreError::QueueWaitTimeout,
            PoolError::CircuitOpen { retry_after } => crate::error::CoreError::CircuitOpen { retry_after },
            PoolError::ConcurrencyLimit { retry_after } => crate::error::CoreError::ConcurrencyLimit { retry_after },
            PoolError::StartFailed(msg) => crate::error::CoreError::StartFailed(msg),
            PoolError::FunctionNotFound => crate::error::CoreError::NotFound("function".to_string()),
        }
    }
}
