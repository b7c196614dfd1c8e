//! Synchronous executor. Drives one request through the pool, the
//! backend instance it gets handed, and the log sink — including the
//! single crash-retry that masks a dead warm instance from the caller.

use crate::backend::{BackendError, InvokeContext};
use crate::error::CoreError;
use crate::logsink::{InvocationLog, LogSink};
use crate::model::{Function, TenantScope};
use crate::pool::Pool;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{instrument, warn};
use uuid::Uuid;

pub struct Executor {
    pool: Arc<Pool>,
    log_sink: Arc<LogSink>,
    metrics: Arc<crate::metrics::Metrics>,
}

#[derive(Debug, Clone)]
pub struct InvokeOutcome {
    pub output: serde_json::Value,
    pub cold_start: bool,
    pub duration_ms: u64,
}

impl Executor {
    pub fn new(pool: Arc<Pool>, log_sink: Arc<LogSink>) -> Self {
        Self::new_with_metrics(pool, log_sink, Arc::new(crate::metrics::Metrics::disabled()))
    }

    /// Same as [`Executor::new`], but publishes invocation metrics to
    /// the given collector instead of a throwaway one.
    pub fn new_with_metrics(pool: Arc<Pool>, log_sink: Arc<LogSink>, metrics: Arc<crate::metrics::Metrics>) -> Self {
        Self { pool, log_sink, metrics }
    }

    /// Runs one invocation end to end: admission via the pool, at most
    /// one retry after a backend crash on a stale warm instance, and a
    /// best-effort log row regardless of outcome.
    #[instrument(skip(self, function, payload, tenant), fields(function_id = %function.id))]
    pub async fn invoke(
        &self,
        function: &Function,
        payload: serde_json::Value,
        tenant: Option<TenantScope>,
    ) -> Result<InvokeOutcome, CoreError> {
        let request_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let deadline = started + Duration::from_secs(function.limits.timeout_s as u64);

        let result = self
            .invoke_with_one_retry(function, &payload, &tenant, &request_id, deadline)
            .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        let cold_start = result.as_ref().map(|o| o.cold_start).unwrap_or(false);
        self.metrics
            .invocations_total
            .with_label_values(&[if result.is_ok() { "success" } else { "error" }])
            .inc();
        self.metrics
            .invocation_duration_ms
            .with_label_values(&[if cold_start { "true" } else { "false" }])
            .observe(duration_ms as f64);

        self.log_sink.save(InvocationLog {
            request_id,
            function_id: function.id,
            payload,
            output: result.as_ref().ok().map(|o: &InvokeOutcome| o.output.clone()),
            error: result.as_ref().err().map(|e| e.to_string()),
            duration_ms,
            cold_start,
            created_at: Utc::now(),
        });

        result
    }

    async fn invoke_with_one_retry(
        &self,
        function: &Function,
        payload: &serde_json::Value,
        tenant: &Option<TenantScope>,
        request_id: &str,
        deadline: Instant,
    ) -> Result<InvokeOutcome, CoreError> {
        for attempt in 0..2 {
            let lease = self.pool.acquire(function, deadline).await?;
            let ctx = InvokeContext {
                request_id: request_id.to_string(),
                tenant_scope: tenant.clone(),
                timeout: deadline.saturating_duration_since(Instant::now()),
            };

            let invoked = tokio::time::timeout(ctx.timeout, lease.instance.invoke(payload.clone(), &ctx)).await;

            match invoked {
                Ok(Ok(response)) if response.error.is_some() => {
                    // Handler ran to completion but reported a user error.
                    // The instance itself is healthy, so it goes back to
                    // the pool; only async callers retry this (§7).
                    self.pool.record_outcome(function.id, false).await;
                    self.pool.release(function, lease.vm, lease.instance).await;
                    return Err(CoreError::PermanentExecution(response.error.unwrap()));
                }
                Ok(Ok(response)) => {
                    self.pool.record_outcome(function.id, true).await;
                    self.pool.release(function, lease.vm, lease.instance).await;
                    return Ok(InvokeOutcome {
                        output: response.output,
                        cold_start: lease.cold_start,
                        duration_ms: 0,
                    });
                }
                Ok(Err(BackendError::Crashed(msg))) => {
                    warn!(attempt, "instance crashed, evicting");
                    self.pool.record_outcome(function.id, false).await;
                    self.pool.evict_vm(function.id, lease.instance).await;
                    if attempt == 1 {
                        return Err(CoreError::InvokeCrash(msg));
                    }
                }
                Ok(Err(e)) => {
                    self.pool.record_outcome(function.id, false).await;
                    self.pool.evict_vm(function.id, lease.instance).await;
                    return Err(CoreError::InvokeCrash(e.to_string()));
                }
                Err(_elapsed) => {
                    self.pool.record_outcome(function.id, false).await;
                    self.pool.evict_vm(function.id, lease.instance).await;
                    return Err(CoreError::Timeout);
                }
            }
        }
        unreachable!("loop returns on both iterations")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_backend::MockBackend;
    use crate::model::{FunctionId, ResourceLimits};
    use crate::notifier::ChannelNotifier;
    use crate::pool::PoolConfig;
    use crate::store::InMemoryStore;
    use std::sync::atomic::Ordering;
    use test_r::test;

    fn function() -> Function {
        Function {
            id: FunctionId::new(),
            name: "fn-a".into(),
            runtime: "wasm".into(),
            handler: "handler".into(),
            limits: ResourceLimits {
                memory_mb: 128,
                timeout_s: 5,
                instance_concurrency: 1,
                min_replicas: 0,
                max_replicas: None,
            },
            code_hash: "abc".into(),
            capacity_policy: None,
            autoscale_policy: None,
            network_policy: None,
        }
    }

    #[test]
    async fn successful_invoke_echoes_payload() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(MockBackend::new());
        let notifier = Arc::new(ChannelNotifier::new());
        let pool = Pool::new(store, backend, notifier, PoolConfig::default());
        let log_sink = Arc::new(LogSink::new(
            Arc::new(crate::logsink::NoopSinkBackend),
            crate::logsink::LogSinkConfig::default(),
        ));
        let executor = Executor::new(pool, log_sink);

        let f = function();
        let out = executor
            .invoke(&f, serde_json::json!({"x": 1}), None)
            .await
            .unwrap();
        assert_eq!(out.output, serde_json::json!({"x": 1}));
        assert!(out.cold_start);
    }

    #[test]
    async fn crash_retries_once_then_succeeds_on_fresh_instance() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(MockBackend::new());
        backend.fail_invokes.store(1, Ordering::Relaxed);
        let notifier = Arc::new(ChannelNotifier::new());
        let pool = Pool::new(store, backend.clone(), notifier, PoolConfig::default());
        let log_sink = Arc::new(LogSink::new(
            Arc::new(crate::logsink::NoopSinkBackend),
            crate::logsink::LogSinkConfig::default(),
        ));
        let executor = Executor::new(pool, log_sink);

        let f = function();
        let out = executor.invoke(&f, serde_json::json!({}), None).await.unwrap();
        assert_eq!(out.output, serde_json::json!({}));
        assert_eq!(backend.started_count(), 2);
    }

    #[test]
    async fn user_error_maps_to_permanent_execution_and_releases_instance() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(MockBackend::new());
        backend.fail_with_user_error.store(1, Ordering::Relaxed);
        let notifier = Arc::new(ChannelNotifier::new());
        let pool = Pool::new(store, backend.clone(), notifier, PoolConfig::default());
        let log_sink = Arc::new(LogSink::new(
            Arc::new(crate::logsink::NoopSinkBackend),
            crate::logsink::LogSinkConfig::default(),
        ));
        let executor = Executor::new(pool, log_sink);

        let f = function();
        let err = executor.invoke(&f, serde_json::json!({}), None).await.unwrap_err();
        assert!(matches!(err, CoreError::PermanentExecution(_)));
        assert!(!err.is_retryable());
        // Instance went back to the pool healthy rather than being evicted.
        assert_eq!(backend.started_count(), 1);
    }
}
