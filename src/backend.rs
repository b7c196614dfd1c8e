//! Backend driver interface. Polymorphic over one sandbox instance's
//! lifecycle. The pool and executor never reference a
//! concrete backend; only this trait.

use crate::model::{Function, InstanceId};
use async_trait::async_trait;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct InvokeContext {
    pub request_id: String,
    pub tenant_scope: Option<crate::model::TenantScope>,
    pub timeout: std::time::Duration,
}

#[derive(Debug, Clone)]
pub struct InvokeResponse {
    pub output: serde_json::Value,
    /// Set when the function handler ran to completion but reported a
    /// user-level error (as opposed to the instance crashing or timing
    /// out, which surface as `BackendError` instead). The instance stays
    /// healthy and goes back to the pool; the executor maps this to
    /// `CoreError::PermanentExecution`.
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend failed to start instance: {0}")]
    StartFailed(String),
    #[error("instance crashed during invocation: {0}")]
    Crashed(String),
    #[error("invocation exceeded its deadline")]
    Timeout,
    #[error("reload not supported by this backend, caller should evict instead")]
    ReloadUnsupported,
    #[error("backend error: {0}")]
    Other(String),
}

/// One running sandbox instance, as seen by its backend.
#[async_trait]
pub trait BackendInstance: Send + Sync {
    fn id(&self) -> InstanceId;
    async fn invoke(
        &self,
        payload: serde_json::Value,
        ctx: &InvokeContext,
    ) -> Result<InvokeResponse, BackendError>;
    async fn reload_code(&self, files: &[(String, Vec<u8>)]) -> Result<(), BackendError>;
    async fn stop(&self) -> Result<(), BackendError>;

    /// Liveness probe run by the pool right after a cold start, before the
    /// instance is handed to a caller. Backends that have no cheaper probe
    /// than a real invoke can leave this at the default.
    async fn health_check(&self) -> bool {
        true
    }
}

/// Capability set a backend driver exposes: StartVM, StopVM,
/// Invoke, ReloadCode, SnapshotDir. Variants in production are
/// microVM-snapshot-capable, container, wasm, k8s-pod, micro-hypervisor —
/// this crate only depends on the trait.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn start_vm(
        &self,
        function: &Function,
        code: &[u8],
        restore_from_snapshot: bool,
    ) -> Result<Box<dyn BackendInstance>, BackendError>;

    /// Whether this backend participates in snapshot pre/restore.
    fn snapshot_capable(&self) -> bool;

    /// Directory snapshots for a function are persisted under, when
    /// `snapshot_capable()`.
    fn snapshot_dir(&self, function: &Function) -> Option<PathBuf>;

    /// Whether a usable snapshot is already on file for `function`. The
    /// pool consults this (together with `snapshot_capable()`) before
    /// every cold start to decide whether to pass `restore_from_snapshot`.
    async fn snapshot_exists(&self, _function: &Function) -> bool {
        false
    }

    /// Persists `instance`'s current state as the snapshot future cold
    /// starts for `function` restore from. Called by the pool at most
    /// once per function, after the first instance it boots is released
    /// back healthy. No-op for backends that aren't `snapshot_capable()`.
    async fn create_snapshot(
        &self,
        _function: &Function,
        _instance: &dyn BackendInstance,
    ) -> Result<(), BackendError> {
        Ok(())
    }
}
