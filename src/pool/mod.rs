//! Sandbox pool. Owns warm instance lifecycle for every function:
//! acquire/release, idle eviction, health checks, snapshot-aware cold
//! starts, and the circuit breaker + admission gate that the synchronous
//! executor consults before starting work.

mod error;

pub use error::PoolError;

use crate::admission::{self, AdmissionDecision, AdmissionState, CircuitBreaker, ShedReason};
use crate::backend::{Backend, BackendError, BackendInstance};
use crate::model::{CapacityPolicy, Function, FunctionId, InstanceState, PooledVm};
use crate::notifier::Notifier;
use crate::store::Store;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub idle_ttl: Duration,
    pub health_check_interval: Duration,
    pub cleanup_interval: Duration,
    pub prewarm_interval: Duration,
    pub acquire_poll_interval: Duration,
    /// Global cap on `sum_f(idle + inflight)` sandbox instances across
    /// every function. `None` disables the cap.
    pub max_global_vms: Option<u32>,
    /// Bounded concurrency for the background pre-warm loop.
    pub max_prewarm_workers: usize,
    /// Bounded retries for the post-boot health probe, and for retrying
    /// a start from scratch when an instance never turns healthy.
    pub health_probe_retries: u32,
    pub health_probe_backoff: Duration,
    pub max_start_attempts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(600),
            health_check_interval: Duration::from_secs(15),
            cleanup_interval: Duration::from_secs(30),
            prewarm_interval: Duration::from_secs(5),
            acquire_poll_interval: Duration::from_millis(20),
            max_global_vms: None,
            max_prewarm_workers: 4,
            health_probe_retries: 3,
            health_probe_backoff: Duration::from_millis(20),
            max_start_attempts: 3,
        }
    }
}

/// A leased instance. Dropping it without calling `release`/`evict`
/// leaks the slot from the pool's accounting, so the executor always
/// routes through one of those two paths.
pub struct Lease {
    pub vm: PooledVm,
    pub instance: Arc<dyn BackendInstance>,
    pub cold_start: bool,
}

struct Slot {
    vm: PooledVm,
    instance: Arc<dyn BackendInstance>,
}

/// Per-function bookkeeping: idle slots, inflight count, desired replica
/// target, and the circuit breaker guarding admission.
struct FunctionState {
    idle: Mutex<VecDeque<Slot>>,
    inflight: AtomicU32,
    queue_depth: AtomicU32,
    desired_replicas: AtomicU32,
    breaker: Mutex<CircuitBreaker>,
    /// Set once this function's first cold-booted instance has been
    /// handed off to `create_snapshot`, so the pool only asks the
    /// backend to snapshot once per function lifetime (or until the
    /// cache is explicitly invalidated after a code change).
    snapshot_requested: AtomicBool,
}

impl FunctionState {
    fn new(policy: CapacityPolicy, min_replicas: u32) -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
            inflight: AtomicU32::new(0),
            queue_depth: AtomicU32::new(0),
            desired_replicas: AtomicU32::new(min_replicas),
            breaker: Mutex::new(CircuitBreaker::new(policy)),
            snapshot_requested: AtomicBool::new(false),
        }
    }
}

pub struct Pool {
    store: Arc<dyn Store>,
    backend: Arc<dyn Backend>,
    notifier: Arc<dyn Notifier>,
    config: PoolConfig,
    functions: DashMap<FunctionId, Arc<FunctionState>>,
    /// `sum_f(idle + inflight)`, tracked separately from the per-function
    /// atomics so the global cap check doesn't have to sum the whole map.
    global_vms: AtomicU32,
    prewarm_semaphore: Arc<Semaphore>,
    shutdown: Arc<AtomicBool>,
    metrics: Arc<crate::metrics::Metrics>,
}

impl Pool {
    pub fn new(
        store: Arc<dyn Store>,
        backend: Arc<dyn Backend>,
        notifier: Arc<dyn Notifier>,
        config: PoolConfig,
    ) -> Arc<Self> {
        Self::new_with_metrics(store, backend, notifier, config, Arc::new(crate::metrics::Metrics::disabled()))
    }

    /// Same as [`Pool::new`], but publishes pool metrics to the
    /// given collector instead of a throwaway one. The server binary
    /// uses this; tests use `new`.
    pub fn new_with_metrics(
        store: Arc<dyn Store>,
        backend: Arc<dyn Backend>,
        notifier: Arc<dyn Notifier>,
        config: PoolConfig,
        metrics: Arc<crate::metrics::Metrics>,
    ) -> Arc<Self> {
        let prewarm_semaphore = Arc::new(Semaphore::new(config.max_prewarm_workers.max(1)));
        let pool = Arc::new(Self {
            store,
            backend,
            notifier,
            config,
            functions: DashMap::new(),
            global_vms: AtomicU32::new(0),
            prewarm_semaphore,
            shutdown: Arc::new(AtomicBool::new(false)),
            metrics,
        });
        pool.clone().start_background_tasks();
        pool
    }

    fn state_for(&self, function: &Function) -> Arc<FunctionState> {
        self.functions
            .entry(function.id)
            .or_insert_with(|| {
                Arc::new(FunctionState::new(
                    function.capacity_policy.unwrap_or_default(),
                    function.limits.min_replicas,
                ))
            })
            .clone()
    }

    /// Acquires a warm instance if one is idle, otherwise cold-starts one,
    /// subject to the function's admission policy, circuit breaker, and
    /// the pool's global concurrency cap.
    #[instrument(skip(self, function), fields(function_id = %function.id))]
    pub async fn acquire(&self, function: &Function, deadline: Instant) -> Result<Lease, PoolError> {
        let state = self.state_for(function);
        let policy = function.capacity_policy.unwrap_or_default();
        let fid = function.id.to_string();

        let mut queued = false;
        let wait_start = Instant::now();

        let admission_result = loop {
            let breaker_open = {
                let mut breaker = state.breaker.lock().await;
                !breaker.try_acquire(Instant::now())
            };

            let admission_state = AdmissionState {
                inflight: state.inflight.load(Ordering::SeqCst),
                queue_depth: state.queue_depth.load(Ordering::SeqCst),
            };

            match admission::evaluate(&policy, admission_state, breaker_open) {
                AdmissionDecision::Accept => {
                    self.metrics.admission_total.with_label_values(&["accept", "-"]).inc();
                    break Ok(());
                }
                AdmissionDecision::EnqueueThenWait { timeout } => {
                    if !queued {
                        queued = true;
                        state.queue_depth.fetch_add(1, Ordering::SeqCst);
                        self.metrics.queue_depth.with_label_values(&[&fid]).inc();
                    }
                    let wait_deadline = Instant::now() + timeout.min(deadline.saturating_duration_since(Instant::now()));
                    if Instant::now() >= wait_deadline {
                        self.metrics
                            .admission_total
                            .with_label_values(&["shed", "queue_wait_timeout"])
                            .inc();
                        break Err(PoolError::QueueWaitTimeout);
                    }
                    tokio::select! {
                        _ = self.notifier.wait() => {}
                        _ = tokio::time::sleep_until(wait_deadline.into()) => {
                            self.metrics
                                .admission_total
                                .with_label_values(&["shed", "queue_wait_timeout"])
                                .inc();
                            break Err(PoolError::QueueWaitTimeout);
                        }
                    }
                }
                AdmissionDecision::Shed { reason, retry_after_s, .. } => {
                    let reason_label = match reason {
                        ShedReason::CircuitOpen => "circuit_open",
                        ShedReason::InflightLimit => "inflight_limit",
                        ShedReason::QueueFull => "queue_full",
                    };
                    self.metrics.shed_total.with_label_values(&[reason_label]).inc();
                    self.metrics
                        .admission_total
                        .with_label_values(&["shed", reason_label])
                        .inc();
                    break Err(match reason {
                        ShedReason::CircuitOpen => PoolError::CircuitOpen {
                            retry_after: Duration::from_secs(retry_after_s),
                        },
                        ShedReason::InflightLimit => PoolError::InflightLimit {
                            retry_after: Duration::from_secs(retry_after_s),
                        },
                        ShedReason::QueueFull => PoolError::QueueFull {
                            retry_after: Duration::from_secs(retry_after_s),
                        },
                    });
                }
            }
        };

        if queued {
            state.queue_depth.fetch_sub(1, Ordering::SeqCst);
            self.metrics.queue_depth.with_label_values(&[&fid]).dec();
            self.metrics.queue_wait_ms.observe(wait_start.elapsed().as_millis() as f64);
        }
        admission_result?;

        state.inflight.fetch_add(1, Ordering::SeqCst);
        self.update_utilization(function, &state);

        let popped = {
            let mut idle = state.idle.lock().await;
            idle.pop_front()
        };

        if let Some(mut slot) = popped {
            slot.vm.state = InstanceState::Busy;
            slot.vm.last_used_at = chrono::Utc::now();
            debug!("warm start");
            self.metrics.warm_starts_total.inc();
            self.metrics.vm_pool_size.with_label_values(&[&fid, "idle"]).dec();
            self.metrics.vm_pool_size.with_label_values(&[&fid, "busy"]).inc();
            return Ok(Lease {
                vm: slot.vm,
                instance: slot.instance,
                cold_start: false,
            });
        }

        // Global cap: evict one idle instance from another function (LRU)
        // before provisioning a new one, or shed if nothing can be freed.
        if let Some(max_global) = self.config.max_global_vms {
            if self.global_vms.load(Ordering::SeqCst) >= max_global && !self.evict_one_lru(function.id).await {
                state.inflight.fetch_sub(1, Ordering::SeqCst);
                self.update_utilization(function, &state);
                return Err(PoolError::ConcurrencyLimit {
                    retry_after: Duration::from_secs(policy.retry_after_s),
                });
            }
        }

        let code = self.store.get_code(function.id).await.map_err(|e| {
            state.inflight.fetch_sub(1, Ordering::SeqCst);
            PoolError::StartFailed(e.to_string())
        })?;

        match self.start_with_retries(function, &code).await {
            Ok((instance, restore_from_snapshot)) => {
                info!("cold start");
                self.metrics.cold_starts_total.inc();
                self.metrics.active_vms.inc();
                self.global_vms.fetch_add(1, Ordering::SeqCst);
                self.metrics.vm_pool_size.with_label_values(&[&fid, "busy"]).inc();
                Ok(Lease {
                    vm: PooledVm::new_cold(function.id, restore_from_snapshot),
                    instance: Arc::from(instance),
                    cold_start: true,
                })
            }
            Err(e) => {
                state.inflight.fetch_sub(1, Ordering::SeqCst);
                self.update_utilization(function, &state);
                self.record_outcome(function.id, false).await;
                Err(PoolError::StartFailed(e.to_string()))
            }
        }
    }

    /// Starts a new instance, consulting the snapshot cache first, and
    /// probes it for health with bounded retries before handing it back.
    /// Retries the whole start-and-probe cycle up to `max_start_attempts`
    /// times before giving up.
    async fn start_with_retries(
        &self,
        function: &Function,
        code: &[u8],
    ) -> Result<(Box<dyn BackendInstance>, bool), BackendError> {
        let restore_from_snapshot =
            self.backend.snapshot_capable() && self.backend.snapshot_exists(function).await;

        let mut last_err = BackendError::StartFailed("no attempts made".to_string());
        for attempt in 0..self.config.max_start_attempts.max(1) {
            let boot_started = Instant::now();
            let started = self.backend.start_vm(function, code, restore_from_snapshot).await;
            let boot_ms = boot_started.elapsed().as_millis() as f64;

            let instance = match started {
                Ok(instance) => instance,
                Err(e) => {
                    warn!(attempt, error = %e, "start failed");
                    last_err = e;
                    continue;
                }
            };

            self.metrics
                .vm_boot_duration_ms
                .with_label_values(&[if restore_from_snapshot { "true" } else { "false" }])
                .observe(boot_ms);
            if restore_from_snapshot {
                self.metrics.snapshot_restore_ms.observe(boot_ms);
            }

            if self.probe_healthy(instance.as_ref()).await {
                return Ok((instance, restore_from_snapshot));
            }
            warn!(attempt, "new instance failed health probe, discarding");
            let _ = instance.stop().await;
            last_err = BackendError::StartFailed("instance failed health probe".to_string());
        }
        Err(last_err)
    }

    /// Bounded-retry liveness probe run right after a cold start.
    async fn probe_healthy(&self, instance: &dyn BackendInstance) -> bool {
        for probe in 0..self.config.health_probe_retries.max(1) {
            if instance.health_check().await {
                return true;
            }
            if probe + 1 < self.config.health_probe_retries {
                tokio::time::sleep(self.config.health_probe_backoff).await;
            }
        }
        false
    }

    /// Evicts the globally-oldest idle instance belonging to any function
    /// other than `except`. Returns whether one was freed.
    async fn evict_one_lru(&self, except: FunctionId) -> bool {
        let mut oldest: Option<(FunctionId, chrono::DateTime<chrono::Utc>)> = None;
        for entry in self.functions.iter() {
            let fid = *entry.key();
            if fid == except {
                continue;
            }
            let idle = entry.value().idle.lock().await;
            if let Some(slot) = idle.front() {
                if oldest.as_ref().map_or(true, |(_, t)| slot.vm.last_used_at < *t) {
                    oldest = Some((fid, slot.vm.last_used_at));
                }
            }
        }

        let Some((victim_fid, _)) = oldest else {
            return false;
        };
        let Some(state) = self.functions.get(&victim_fid) else {
            return false;
        };
        let mut idle = state.idle.lock().await;
        let Some(slot) = idle.pop_front() else {
            return false;
        };
        drop(idle);
        let _ = slot.instance.stop().await;
        self.global_vms.fetch_sub(1, Ordering::SeqCst);
        self.metrics.active_vms.dec();
        self.metrics
            .vm_pool_size
            .with_label_values(&[&victim_fid.to_string(), "idle"])
            .dec();
        true
    }

    /// Returns a healthy instance to the idle pool for reuse. The first
    /// instance released for a function that has no snapshot yet becomes
    /// the snapshot source, per the backend's `create_snapshot` hook.
    pub async fn release(&self, function: &Function, mut vm: PooledVm, instance: Arc<dyn BackendInstance>) {
        let fid_str = function.id.to_string();
        if let Some(state) = self.functions.get(&function.id) {
            state.inflight.fetch_sub(1, Ordering::SeqCst);
            vm.state = InstanceState::Idle;
            vm.last_used_at = chrono::Utc::now();
            self.metrics.vm_pool_size.with_label_values(&[&fid_str, "busy"]).dec();
            self.metrics.vm_pool_size.with_label_values(&[&fid_str, "idle"]).inc();

            if self.backend.snapshot_capable()
                && !state.snapshot_requested.swap(true, Ordering::SeqCst)
                && !self.backend.snapshot_exists(function).await
            {
                if let Err(e) = self.backend.create_snapshot(function, instance.as_ref()).await {
                    warn!(error = %e, "snapshot creation failed");
                    state.snapshot_requested.store(false, Ordering::SeqCst);
                }
            }

            state.idle.lock().await.push_back(Slot { vm, instance });
            self.update_utilization(function, &state);
        }
        self.notifier.notify();
    }

    /// Evicts (and stops) an instance instead of returning it to idle —
    /// used after a crash or a code update.
    pub async fn evict_vm(&self, function_id: FunctionId, instance: Arc<dyn BackendInstance>) {
        if let Some(state) = self.functions.get(&function_id) {
            state.inflight.fetch_sub(1, Ordering::SeqCst);
        }
        let _ = instance.stop().await;
        self.global_vms.fetch_sub(1, Ordering::SeqCst);
        self.metrics.active_vms.dec();
        self.metrics
            .vm_pool_size
            .with_label_values(&[&function_id.to_string(), "busy"])
            .dec();
        self.notifier.notify();
    }

    /// Best-effort hot reload: pushes new code to every currently idle
    /// instance in place, leaving busy instances running the old code
    /// until they're released and evicted. Idle-only by design —
    /// reloading a busy instance could race a concurrent invocation
    /// against the swap, so callers that need every instance updated
    /// immediately should `evict` instead and let the pool cold-start
    /// replacements with fresh code.
    pub async fn reload_code(&self, function_id: FunctionId, files: &[(String, Vec<u8>)]) -> Result<(), PoolError> {
        let Some(state) = self.functions.get(&function_id) else {
            return Ok(());
        };
        let idle = state.idle.lock().await;
        for slot in idle.iter() {
            match slot.instance.reload_code(files).await {
                Ok(()) => {}
                Err(BackendError::ReloadUnsupported) => return Err(PoolError::StartFailed(
                    "reload unsupported by backend, caller should evict instead".to_string(),
                )),
                Err(e) => return Err(PoolError::StartFailed(e.to_string())),
            }
        }
        Ok(())
    }

    /// Drops every idle instance for a function, e.g. after a code update
    /// invalidates its snapshot, and clears the snapshot cache so the next
    /// cold start rebuilds from scratch rather than an outdated restore.
    pub async fn evict(&self, function_id: FunctionId) {
        if let Some(state) = self.functions.get(&function_id) {
            let mut idle = state.idle.lock().await;
            let n = idle.len();
            for slot in idle.drain(..) {
                let _ = slot.instance.stop().await;
                self.metrics.active_vms.dec();
            }
            self.global_vms.fetch_sub(n as u32, Ordering::SeqCst);
            self.metrics
                .vm_pool_size
                .with_label_values(&[&function_id.to_string(), "idle"])
                .set(0);
            self.invalidate_snapshot_cache(function_id);
        }
    }

    /// Marks that no snapshot should be consulted for `function_id` until
    /// the backend reports a new one (e.g. after a code-hash change).
    pub fn invalidate_snapshot_cache(&self, function_id: FunctionId) {
        if let Some(state) = self.functions.get(&function_id) {
            state.snapshot_requested.store(false, Ordering::SeqCst);
        }
    }

    pub async fn record_outcome(&self, function_id: FunctionId, ok: bool) {
        if let Some(state) = self.functions.get(&function_id) {
            state.breaker.lock().await.record(Instant::now(), ok);
            let gauge_value = match state.breaker.lock().await.state() {
                admission::BreakerState::Closed => 0,
                admission::BreakerState::Open => 1,
                admission::BreakerState::HalfOpen => 2,
            };
            self.metrics
                .circuit_breaker_state
                .with_label_values(&[&function_id.to_string()])
                .set(gauge_value);
        }
    }

    pub async fn breaker_state(&self, function_id: FunctionId) -> Option<admission::BreakerState> {
        let state = self.functions.get(&function_id)?;
        Some(state.breaker.lock().await.state())
    }

    /// Autoscaler knob: sets the floor the pre-warm loop maintains.
    pub fn set_desired_replicas(&self, function: &Function, replicas: u32) {
        let state = self.state_for(function);
        state.desired_replicas.store(replicas, Ordering::SeqCst);
    }

    pub fn stats(&self, function_id: FunctionId) -> Option<PoolStats> {
        let state = self.functions.get(&function_id)?;
        Some(PoolStats {
            inflight: state.inflight.load(Ordering::SeqCst),
            queue_depth: state.queue_depth.load(Ordering::SeqCst),
            desired_replicas: state.desired_replicas.load(Ordering::SeqCst),
        })
    }

    fn update_utilization(&self, function: &Function, state: &FunctionState) {
        if let Some(max_replicas) = function.limits.max_replicas {
            if max_replicas > 0 {
                let ratio = state.inflight.load(Ordering::SeqCst) as f64 / max_replicas as f64;
                self.metrics
                    .pool_utilization_ratio
                    .with_label_values(&[&function.id.to_string()])
                    .set(ratio);
            }
        }
    }

    fn start_background_tasks(self: Arc<Self>) {
        let cleanup = self.clone();
        tokio::spawn(async move { cleanup.cleanup_loop().await });

        let health = self.clone();
        tokio::spawn(async move { health.health_check_loop().await });

        let prewarm = self.clone();
        tokio::spawn(async move { prewarm.prewarm_loop().await });
    }

    async fn cleanup_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.cleanup_interval);
        loop {
            interval.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let now = chrono::Utc::now();
            for entry in self.functions.iter() {
                let fid = *entry.key();
                let desired = entry.value().desired_replicas.load(Ordering::SeqCst);
                let mut idle = entry.value().idle.lock().await;
                let mut kept = VecDeque::new();
                let mut evicted = 0u32;
                while let Some(slot) = idle.pop_front() {
                    let age = now.signed_duration_since(slot.vm.last_used_at);
                    // Evicting this slot must still leave at least `desired`
                    // idle instances among what's kept so far plus what's
                    // still queued for inspection.
                    let remaining_if_evicted = kept.len() as u32 + idle.len() as u32;
                    if age > chrono::Duration::from_std(self.config.idle_ttl).unwrap_or_default()
                        && remaining_if_evicted >= desired
                    {
                        let _ = slot.instance.stop().await;
                        evicted += 1;
                    } else {
                        kept.push_back(slot);
                    }
                }
                *idle = kept;
                if evicted > 0 {
                    self.global_vms.fetch_sub(evicted, Ordering::SeqCst);
                    self.metrics.active_vms.sub(evicted as i64);
                    self.metrics
                        .vm_pool_size
                        .with_label_values(&[&fid.to_string(), "idle"])
                        .sub(evicted as i64);
                }
            }
        }
    }

    async fn health_check_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.health_check_interval);
        loop {
            interval.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            for entry in self.functions.iter() {
                let fid = *entry.key();
                let mut idle = entry.value().idle.lock().await;
                let mut kept = VecDeque::new();
                let mut evicted = 0u32;
                while let Some(slot) = idle.pop_front() {
                    if slot.vm.healthy && slot.instance.health_check().await {
                        kept.push_back(slot);
                    } else {
                        let _ = slot.instance.stop().await;
                        evicted += 1;
                    }
                }
                *idle = kept;
                if evicted > 0 {
                    self.global_vms.fetch_sub(evicted, Ordering::SeqCst);
                    self.metrics.active_vms.sub(evicted as i64);
                    self.metrics
                        .vm_pool_size
                        .with_label_values(&[&fid.to_string(), "idle"])
                        .sub(evicted as i64);
                }
            }
        }
    }

    /// Starts instances in the background, bounded by
    /// `max_prewarm_workers` concurrency, until each function's idle
    /// count reaches its `desired_replicas` floor.
    async fn prewarm_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.prewarm_interval);
        loop {
            interval.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let mut joins = Vec::new();
            for entry in self.functions.iter() {
                let fid = *entry.key();
                let desired = entry.value().desired_replicas.load(Ordering::SeqCst);
                if desired == 0 {
                    continue;
                }
                let idle_len = entry.value().idle.lock().await.len() as u32;
                let inflight = entry.value().inflight.load(Ordering::SeqCst);
                if idle_len + inflight >= desired {
                    continue;
                }
                let Ok(function) = self.store.get_function(fid).await else {
                    continue;
                };
                let pool = self.clone();
                let permit = self.prewarm_semaphore.clone();
                joins.push(tokio::spawn(async move {
                    let Ok(_permit) = permit.acquire_owned().await else {
                        return;
                    };
                    let deadline = Instant::now() + Duration::from_secs(function.limits.timeout_s.max(1) as u64);
                    if let Ok(lease) = pool.acquire(&function, deadline).await {
                        pool.release(&function, lease.vm, lease.instance).await;
                    }
                }));
            }
            for j in joins {
                let _ = j.await;
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub inflight: u32,
    pub queue_depth: u32,
    pub desired_replicas: u32,
}

impl From<BackendError> for PoolError {
    fn from(e: BackendError) -> Self {
        PoolError::StartFailed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_backend::MockBackend;
    use crate::model::ResourceLimits;
    use crate::notifier::ChannelNotifier;
    use crate::store::InMemoryStore;
    use test_r::test;

    fn function() -> Function {
        Function {
            id: FunctionId::new(),
            name: "fn-a".into(),
            runtime: "wasm".into(),
            handler: "handler".into(),
            limits: ResourceLimits {
                memory_mb: 128,
                timeout_s: 10,
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
    async fn acquire_cold_then_release_then_warm() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(MockBackend::new());
        let notifier = Arc::new(ChannelNotifier::new());
        let pool = Pool::new(store, backend.clone(), notifier, PoolConfig::default());
        let f = function();

        let lease = pool.acquire(&f, Instant::now() + Duration::from_secs(5)).await.unwrap();
        assert!(lease.cold_start);
        pool.release(&f, lease.vm, lease.instance).await;

        let lease2 = pool.acquire(&f, Instant::now() + Duration::from_secs(5)).await.unwrap();
        assert!(!lease2.cold_start);
        assert_eq!(backend.started_count(), 1);
    }

    #[test]
    async fn sheds_when_breaker_open() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(MockBackend::new());
        let notifier = Arc::new(ChannelNotifier::new());
        let pool = Pool::new(store, backend, notifier, PoolConfig::default());

        let mut f = function();
        f.capacity_policy = Some(CapacityPolicy {
            enabled: true,
            breaker_error_pct: 50,
            breaker_window_s: 60,
            breaker_open_s: 60,
            ..CapacityPolicy::default()
        });

        let _ = pool.state_for(&f);
        for _ in 0..10 {
            pool.record_outcome(f.id, false).await;
        }

        let result = pool.acquire(&f, Instant::now() + Duration::from_millis(50)).await;
        assert!(matches!(result, Err(PoolError::CircuitOpen { .. })));
    }

    #[test]
    async fn reload_code_pushes_to_idle_instances_only() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(MockBackend::new());
        let notifier = Arc::new(ChannelNotifier::new());
        let pool = Pool::new(store, backend, notifier, PoolConfig::default());
        let f = function();

        let lease = pool.acquire(&f, Instant::now() + Duration::from_secs(5)).await.unwrap();
        pool.release(&f, lease.vm, lease.instance).await;

        pool.reload_code(f.id, &[("main.wasm".to_string(), vec![1, 2, 3])]).await.unwrap();

        // unknown function: no idle state to reload, should be a no-op rather than an error
        pool.reload_code(FunctionId::new(), &[]).await.unwrap();
    }

    #[test]
    async fn second_acquire_restores_from_snapshot_after_first_release() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(MockBackend::new());
        let notifier = Arc::new(ChannelNotifier::new());
        let pool = Pool::new(store, backend.clone(), notifier, PoolConfig::default());
        let f = function();

        let lease = pool.acquire(&f, Instant::now() + Duration::from_secs(5)).await.unwrap();
        pool.evict_vm(f.id, lease.instance).await;
        assert!(!backend.snapshot_exists(&f).await);

        // Cold start again; release should now create a snapshot since none existed yet.
        let lease2 = pool.acquire(&f, Instant::now() + Duration::from_secs(5)).await.unwrap();
        pool.release(&f, lease2.vm, lease2.instance).await;
        assert!(backend.snapshot_exists(&f).await);
    }

    #[test]
    async fn global_cap_evicts_lru_instance_from_another_function() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(MockBackend::new());
        let notifier = Arc::new(ChannelNotifier::new());
        let mut config = PoolConfig::default();
        config.max_global_vms = Some(1);
        let pool = Pool::new(store, backend.clone(), notifier, config);

        let f1 = function();
        let f2 = function();

        let lease1 = pool.acquire(&f1, Instant::now() + Duration::from_secs(5)).await.unwrap();
        pool.release(&f1, lease1.vm, lease1.instance).await;

        // f1 now has one idle instance; acquiring for f2 should evict it
        // to stay under the global cap rather than shed.
        let lease2 = pool.acquire(&f2, Instant::now() + Duration::from_secs(5)).await.unwrap();
        assert!(lease2.cold_start);
        assert_eq!(backend.started_count(), 2);
    }
}
