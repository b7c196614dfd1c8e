//! In-memory backend used by tests and the demo binary. Stands in for a
//! real microVM/container driver behind the `Backend` trait.

use crate::backend::{Backend, BackendError, BackendInstance, InvokeContext, InvokeResponse};
use crate::model::{Function, InstanceId};
use async_trait::async_trait;
use dashmap::DashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Behavior hook so tests can force starts/invokes to fail without
/// touching the rest of the harness.
pub struct MockBackend {
    pub fail_starts: AtomicU64,
    /// Shared budget of forced invoke failures, consumed across whichever
    /// instance happens to serve the next call.
    pub fail_invokes: Arc<AtomicU64>,
    /// Shared budget of forced user-level errors (handler ran, but
    /// reported failure) — distinct from `fail_invokes`, which forces a
    /// `BackendError::Crashed`.
    pub fail_with_user_error: Arc<AtomicU64>,
    pub start_delay: std::time::Duration,
    started: AtomicU64,
    snapshot_capable: AtomicBool,
    snapshots: DashSet<crate::model::FunctionId>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            fail_starts: AtomicU64::new(0),
            fail_invokes: Arc::new(AtomicU64::new(0)),
            fail_with_user_error: Arc::new(AtomicU64::new(0)),
            start_delay: std::time::Duration::ZERO,
            started: AtomicU64::new(0),
            snapshot_capable: AtomicBool::new(true),
            snapshots: DashSet::new(),
        }
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started_count(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    /// Makes `snapshot_capable()` return false, for backends that skip
    /// snapshot pre/restore entirely (e.g. a plain container driver).
    pub fn without_snapshots(self) -> Self {
        self.snapshot_capable.store(false, Ordering::Relaxed);
        self
    }

    fn take_one(counter: &AtomicU64) -> bool {
        let mut cur = counter.load(Ordering::Relaxed);
        while cur > 0 {
            match counter.compare_exchange(cur, cur - 1, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
        false
    }
}

struct MockInstance {
    id: InstanceId,
    fail_invokes: Arc<AtomicU64>,
    fail_with_user_error: Arc<AtomicU64>,
}

#[async_trait]
impl BackendInstance for MockInstance {
    fn id(&self) -> InstanceId {
        self.id
    }

    async fn invoke(
        &self,
        payload: serde_json::Value,
        _ctx: &InvokeContext,
    ) -> Result<InvokeResponse, BackendError> {
        if MockBackend::take_one(&self.fail_invokes) {
            return Err(BackendError::Crashed("forced failure".to_string()));
        }
        if MockBackend::take_one(&self.fail_with_user_error) {
            return Ok(InvokeResponse {
                output: payload,
                error: Some("forced user error".to_string()),
            });
        }
        Ok(InvokeResponse { output: payload, error: None })
    }

    async fn reload_code(&self, _files: &[(String, Vec<u8>)]) -> Result<(), BackendError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn start_vm(
        &self,
        _function: &Function,
        _code: &[u8],
        _restore_from_snapshot: bool,
    ) -> Result<Box<dyn BackendInstance>, BackendError> {
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        if Self::take_one(&self.fail_starts) {
            return Err(BackendError::StartFailed("forced failure".to_string()));
        }
        self.started.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MockInstance {
            id: InstanceId::new(),
            fail_invokes: self.fail_invokes.clone(),
            fail_with_user_error: self.fail_with_user_error.clone(),
        }))
    }

    fn snapshot_capable(&self) -> bool {
        self.snapshot_capable.load(Ordering::Relaxed)
    }

    fn snapshot_dir(&self, function: &Function) -> Option<std::path::PathBuf> {
        Some(std::path::PathBuf::from(format!("/tmp/snapshots/{}", function.id)))
    }

    async fn snapshot_exists(&self, function: &Function) -> bool {
        self.snapshots.contains(&function.id)
    }

    async fn create_snapshot(
        &self,
        function: &Function,
        _instance: &dyn BackendInstance,
    ) -> Result<(), BackendError> {
        self.snapshots.insert(function.id);
        Ok(())
    }
}
