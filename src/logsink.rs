//! Durable write of batched invocation logs. Write-path is
//! a non-blocking bounded-buffer batcher; the consumer loop drains into a
//! pluggable sink (postgres-backed, noop, or fan-out multi-sink).

use crate::model::FunctionId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationLog {
    pub request_id: String,
    pub function_id: FunctionId,
    pub payload: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub cold_start: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum LogSinkError {
    #[error("log sink write failed: {0}")]
    WriteFailed(String),
}

/// A durable destination for batches of invocation logs.
#[async_trait]
pub trait LogSinkBackend: Send + Sync {
    async fn save_batch(&self, logs: &[InvocationLog]) -> Result<(), LogSinkError>;
}

/// Drops everything; used in tests and as a safe default.
#[derive(Default)]
pub struct NoopSinkBackend;

#[async_trait]
impl LogSinkBackend for NoopSinkBackend {
    async fn save_batch(&self, _logs: &[InvocationLog]) -> Result<(), LogSinkError> {
        Ok(())
    }
}

/// Bulk-insert sink. The concrete storage driver is out of scope
/// (database schema) — callers provide the insert closure.
pub struct PostgresSinkBackend<F> {
    insert: F,
}

impl<F> PostgresSinkBackend<F>
where
    F: Fn(&[InvocationLog]) -> Result<(), String> + Send + Sync,
{
    pub fn new(insert: F) -> Self {
        Self { insert }
    }
}

#[async_trait]
impl<F> LogSinkBackend for PostgresSinkBackend<F>
where
    F: Fn(&[InvocationLog]) -> Result<(), String> + Send + Sync,
{
    async fn save_batch(&self, logs: &[InvocationLog]) -> Result<(), LogSinkError> {
        (self.insert)(logs).map_err(LogSinkError::WriteFailed)
    }
}

/// Fan-out to several sinks; writes to all, returns the first error
/// encountered (best-effort).
pub struct MultiSinkBackend {
    sinks: Vec<Arc<dyn LogSinkBackend>>,
}

impl MultiSinkBackend {
    pub fn new(sinks: Vec<Arc<dyn LogSinkBackend>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl LogSinkBackend for MultiSinkBackend {
    async fn save_batch(&self, logs: &[InvocationLog]) -> Result<(), LogSinkError> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.save_batch(logs).await {
                warn!("log sink fan-out write failed: {e}");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LogSinkConfig {
    pub batch_size: usize,
    pub buffer_size: usize,
    pub flush_interval: Duration,
    pub flush_timeout: Duration,
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            buffer_size: 10_000,
            flush_interval: Duration::from_secs(1),
            flush_timeout: Duration::from_secs(5),
        }
    }
}

/// Non-blocking producer handle; the consumer loop runs on its own task.
pub struct LogSink {
    tx: mpsc::Sender<InvocationLog>,
    dropped: Arc<std::sync::atomic::AtomicU64>,
    worker: Option<JoinHandle<()>>,
    flush_timeout: Duration,
    flush_tx: mpsc::Sender<tokio::sync::oneshot::Sender<()>>,
}

impl LogSink {
    pub fn new(backend: Arc<dyn LogSinkBackend>, config: LogSinkConfig) -> Self {
        let (tx, mut rx) = mpsc::channel::<InvocationLog>(config.buffer_size);
        let (flush_tx, mut flush_rx) = mpsc::channel::<tokio::sync::oneshot::Sender<()>>(16);
        let dropped = Arc::new(std::sync::atomic::AtomicU64::new(0));

        let worker = tokio::spawn(async move {
            let mut batch = Vec::with_capacity(config.batch_size);
            let mut interval = tokio::time::interval(config.flush_interval);
            loop {
                tokio::select! {
                    maybe_log = rx.recv() => {
                        match maybe_log {
                            Some(log) => {
                                batch.push(log);
                                if batch.len() >= config.batch_size {
                                    flush(&backend, &mut batch).await;
                                }
                            }
                            None => {
                                flush(&backend, &mut batch).await;
                                break;
                            }
                        }
                    }
                    _ = interval.tick() => {
                        flush(&backend, &mut batch).await;
                    }
                    Some(ack) = flush_rx.recv() => {
                        flush(&backend, &mut batch).await;
                        let _ = ack.send(());
                    }
                }
            }
        });

        Self {
            tx,
            dropped,
            worker: Some(worker),
            flush_timeout: config.flush_timeout,
            flush_tx,
        }
    }

    /// Producer-side write. Non-blocking up to `buffer_size`; overflow
    /// drops the log and increments a counter.
    pub fn save(&self, log: InvocationLog) {
        if self.tx.try_send(log).is_err() {
            self.dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Flushes remaining logs with the configured timeout.
    pub async fn close(mut self) {
        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
        if self.flush_tx.send(ack_tx).await.is_ok() {
            let _ = tokio::time::timeout(self.flush_timeout, ack_rx).await;
        }
        drop(self.tx);
        if let Some(worker) = self.worker.take() {
            let _ = tokio::time::timeout(self.flush_timeout, worker).await;
        }
    }
}

async fn flush(backend: &Arc<dyn LogSinkBackend>, batch: &mut Vec<InvocationLog>) {
    if batch.is_empty() {
        return;
    }
    if let Err(e) = backend.save_batch(batch).await {
        error!("log sink flush failed: {e}");
    }
    batch.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct CollectingBackend {
        received: Mutex<Vec<InvocationLog>>,
    }

    #[async_trait]
    impl LogSinkBackend for CollectingBackend {
        async fn save_batch(&self, logs: &[InvocationLog]) -> Result<(), LogSinkError> {
            self.received.lock().await.extend_from_slice(logs);
            Ok(())
        }
    }

    fn sample_log(id: &str) -> InvocationLog {
        InvocationLog {
            request_id: id.to_string(),
            function_id: FunctionId::new(),
            payload: serde_json::json!({}),
            output: None,
            error: None,
            duration_ms: 1,
            cold_start: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    async fn close_flushes_remaining_logs() {
        let backend = Arc::new(CollectingBackend::default());
        let sink = LogSink::new(
            backend.clone(),
            LogSinkConfig {
                batch_size: 100,
                buffer_size: 16,
                flush_interval: Duration::from_secs(60),
                flush_timeout: Duration::from_secs(2),
            },
        );
        sink.save(sample_log("a"));
        sink.save(sample_log("b"));
        sink.close().await;
        assert_eq!(backend.received.lock().await.len(), 2);
    }

    #[test]
    async fn overflow_drops_and_counts() {
        let backend = Arc::new(CollectingBackend::default());
        let sink = LogSink::new(
            backend.clone(),
            LogSinkConfig {
                batch_size: 1,
                buffer_size: 1,
                flush_interval: Duration::from_millis(5),
                flush_timeout: Duration::from_secs(1),
            },
        );
        // fire a burst fast enough that some sends may overflow the
        // buffer; either way, save() must never block.
        for i in 0..50 {
            sink.save(sample_log(&i.to_string()));
        }
        sink.close().await;
    }
}
