//! The metadata store interface. Transactional semantics
//! are required for all lease acquisitions and deps-decrement by whatever
//! concrete store backs this trait in production (database schema itself
//! is out of scope). `InMemoryStore` is a reference
//! implementation used by tests and the demo binary; its locking is
//! coarse on purpose — it exists to pin down *semantics*, not performance.

use crate::error::{CoreError, TenantQuotaDecision};
use crate::model::*;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy)]
pub struct QuotaCheckResult {
    pub allowed: bool,
    pub used: u64,
    pub limit: u64,
    pub window_s: u64,
    pub retry_after_s: u64,
}

impl QuotaCheckResult {
    pub fn into_result(self) -> Result<(), CoreError> {
        if self.allowed {
            Ok(())
        } else {
            Err(CoreError::TenantQuotaExceeded(TenantQuotaDecision {
                used: self.used,
                limit: self.limit,
                window_s: self.window_s,
                retry_after_s: self.retry_after_s,
            }))
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_function(&self, id: FunctionId) -> Result<Function, CoreError>;
    async fn get_function_by_name(&self, name: &str) -> Result<Function, CoreError>;
    async fn put_function(&self, function: Function) -> Result<(), CoreError>;
    async fn get_code(&self, function_id: FunctionId) -> Result<Vec<u8>, CoreError>;

    // --- async queue ---
    async fn enqueue(
        &self,
        function_id: FunctionId,
        payload: serde_json::Value,
        tenant: TenantScope,
        max_attempts: u32,
        backoff_base_ms: u64,
        backoff_max_ms: u64,
    ) -> Result<AsyncInvocation, CoreError>;

    async fn enqueue_with_idempotency(
        &self,
        function_id: FunctionId,
        payload: serde_json::Value,
        tenant: TenantScope,
        max_attempts: u32,
        backoff_base_ms: u64,
        backoff_max_ms: u64,
        key: String,
        ttl: Duration,
    ) -> Result<(AsyncInvocation, bool), CoreError>;

    async fn acquire_due_async_invocation(
        &self,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<AsyncInvocation>, CoreError>;

    async fn mark_succeeded(
        &self,
        id: AsyncInvocationId,
        output: serde_json::Value,
    ) -> Result<(), CoreError>;

    async fn mark_for_retry(
        &self,
        id: AsyncInvocationId,
        next_run_at: DateTime<Utc>,
        error: String,
    ) -> Result<(), CoreError>;

    async fn mark_dlq(&self, id: AsyncInvocationId, error: String) -> Result<(), CoreError>;

    async fn get_global_async_pause(&self) -> Result<bool, CoreError>;
    async fn set_global_async_pause(&self, paused: bool) -> Result<(), CoreError>;
    async fn pause_function(&self, function_id: FunctionId, paused: bool) -> Result<(), CoreError>;
    async fn pause_workflow(&self, workflow_id: WorkflowId, paused: bool) -> Result<(), CoreError>;
    async fn async_queue_depth(&self, tenant: &TenantScope) -> Result<u64, CoreError>;

    /// Total non-terminal invocations across all tenants, awaiting
    /// acquisition (`queued`) or leased and in flight (`running`). Feeds
    /// the async worker pool's adaptive controller.
    async fn count_queued_invocations(&self) -> Result<u64, CoreError>;

    // --- tenant quotas ---
    async fn check_and_consume_tenant_quota(
        &self,
        tenant: &TenantScope,
        dimension: QuotaDimension,
        amount: u64,
    ) -> Result<QuotaCheckResult, CoreError>;

    async fn check_tenant_absolute_quota(
        &self,
        tenant: &TenantScope,
        dimension: QuotaDimension,
        candidate_value: u64,
    ) -> Result<QuotaCheckResult, CoreError>;

    // --- workflow ---
    async fn publish_workflow_version(
        &self,
        workflow_name: &str,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowVersion, CoreError>;

    async fn get_current_workflow_version(
        &self,
        workflow_name: &str,
    ) -> Result<WorkflowVersion, CoreError>;

    async fn create_run(
        &self,
        version: &WorkflowVersion,
        input: serde_json::Value,
        output_policy: TerminalOutputPolicy,
    ) -> Result<(WorkflowRun, Vec<RunNode>), CoreError>;

    async fn acquire_ready_node(
        &self,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<(RunNode, WorkflowRun, WorkflowVersion)>, CoreError>;

    async fn update_run_node(&self, node: RunNode) -> Result<(), CoreError>;

    /// Decrements `unresolved_deps` on `node_key`'s run node; returns the
    /// node if it transitioned `pending -> ready` as a result.
    async fn decrement_deps(
        &self,
        run_id: RunId,
        node_key: &str,
        predecessor_output: serde_json::Value,
        predecessor_key: String,
    ) -> Result<Option<RunNode>, CoreError>;

    async fn get_run(&self, run_id: RunId) -> Result<WorkflowRun, CoreError>;
    async fn get_run_nodes(&self, run_id: RunId) -> Result<Vec<RunNode>, CoreError>;
    async fn finalize_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        output: Option<serde_json::Value>,
    ) -> Result<(), CoreError>;
    async fn cancel_run(&self, run_id: RunId) -> Result<(), CoreError>;
}

struct IdempotencyEntry {
    invocation_id: AsyncInvocationId,
    expires_at: DateTime<Utc>,
}

struct RunNodeEntry {
    node: RunNode,
    /// predecessor_key -> its output, accumulated as predecessors finish.
    inputs: HashMap<String, serde_json::Value>,
}

#[derive(Default)]
struct StoreData {
    functions: HashMap<FunctionId, Function>,
    functions_by_name: HashMap<String, FunctionId>,
    code: HashMap<FunctionId, Vec<u8>>,

    async_invocations: HashMap<AsyncInvocationId, AsyncInvocation>,
    idempotency: HashMap<String, IdempotencyEntry>,
    global_pause: bool,
    paused_functions: std::collections::HashSet<FunctionId>,
    paused_workflows: std::collections::HashSet<WorkflowId>,

    quota_usage: HashMap<(String, QuotaDimension), (u64, DateTime<Utc>)>,
    quotas: HashMap<(String, QuotaDimension), TenantQuota>,

    workflow_versions: HashMap<WorkflowId, Vec<WorkflowVersion>>,
    workflow_names: HashMap<String, WorkflowId>,
    runs: HashMap<RunId, WorkflowRun>,
    run_nodes: HashMap<RunId, HashMap<String, RunNodeEntry>>,
    versions_by_id: HashMap<WorkflowVersionId, WorkflowVersion>,
}

/// Reference `Store` used by tests and the demo binary. Guarded by a
/// single `tokio::sync::Mutex` so every operation here is trivially
/// atomic, standing in for the transactional guarantees a real
/// database-backed store would need to provide.
pub struct InMemoryStore {
    data: Mutex<StoreData>,
    next_run_node_id: StdMutex<()>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            data: Mutex::new(StoreData::default()),
            next_run_node_id: StdMutex::new(()),
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_quota(&self, tenant: &TenantScope, dimension: QuotaDimension, quota: TenantQuota) {
        let mut data = self.data.lock().await;
        data.quotas.insert((tenant.tenant_id.clone(), dimension), quota);
    }

    pub async fn get_async_invocation(&self, id: AsyncInvocationId) -> Option<AsyncInvocation> {
        let data = self.data.lock().await;
        data.async_invocations.get(&id).cloned()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_function(&self, id: FunctionId) -> Result<Function, CoreError> {
        let data = self.data.lock().await;
        data.functions
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("function {id}")))
    }

    async fn get_function_by_name(&self, name: &str) -> Result<Function, CoreError> {
        let data = self.data.lock().await;
        let id = data
            .functions_by_name
            .get(name)
            .ok_or_else(|| CoreError::NotFound(format!("function named {name}")))?;
        Ok(data.functions[id].clone())
    }

    async fn put_function(&self, function: Function) -> Result<(), CoreError> {
        let mut data = self.data.lock().await;
        data.functions_by_name.insert(function.name.clone(), function.id);
        data.functions.insert(function.id, function);
        Ok(())
    }

    async fn get_code(&self, function_id: FunctionId) -> Result<Vec<u8>, CoreError> {
        let data = self.data.lock().await;
        Ok(data.code.get(&function_id).cloned().unwrap_or_default())
    }

    async fn enqueue(
        &self,
        function_id: FunctionId,
        payload: serde_json::Value,
        tenant: TenantScope,
        max_attempts: u32,
        backoff_base_ms: u64,
        backoff_max_ms: u64,
    ) -> Result<AsyncInvocation, CoreError> {
        let mut data = self.data.lock().await;
        let now = Utc::now();
        let inv = AsyncInvocation {
            id: AsyncInvocationId::new(),
            function_id,
            payload,
            status: AsyncStatus::Queued,
            attempt: 0,
            max_attempts,
            backoff_base_ms,
            backoff_max_ms,
            next_run_at: now,
            lease_owner: None,
            lease_expires_at: None,
            tenant_id: tenant.tenant_id,
            namespace: tenant.namespace,
            created_at: now,
            last_error: None,
            idempotency_key: None,
        };
        data.async_invocations.insert(inv.id, inv.clone());
        Ok(inv)
    }

    async fn enqueue_with_idempotency(
        &self,
        function_id: FunctionId,
        payload: serde_json::Value,
        tenant: TenantScope,
        max_attempts: u32,
        backoff_base_ms: u64,
        backoff_max_ms: u64,
        key: String,
        ttl: Duration,
    ) -> Result<(AsyncInvocation, bool), CoreError> {
        let mut data = self.data.lock().await;
        let now = Utc::now();

        if let Some(entry) = data.idempotency.get(&key) {
            if entry.expires_at > now {
                let existing = data.async_invocations[&entry.invocation_id].clone();
                return Ok((existing, true));
            }
        }

        let inv = AsyncInvocation {
            id: AsyncInvocationId::new(),
            function_id,
            payload,
            status: AsyncStatus::Queued,
            attempt: 0,
            max_attempts,
            backoff_base_ms,
            backoff_max_ms,
            next_run_at: now,
            lease_owner: None,
            lease_expires_at: None,
            tenant_id: tenant.tenant_id,
            namespace: tenant.namespace,
            created_at: now,
            last_error: None,
            idempotency_key: Some(key.clone()),
        };
        data.async_invocations.insert(inv.id, inv.clone());
        data.idempotency.insert(
            key,
            IdempotencyEntry {
                invocation_id: inv.id,
                expires_at: now + ChronoDuration::from_std(ttl).unwrap_or_default(),
            },
        );
        Ok((inv, false))
    }

    async fn acquire_due_async_invocation(
        &self,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<AsyncInvocation>, CoreError> {
        let mut data = self.data.lock().await;
        let now = Utc::now();

        let paused_functions = data.paused_functions.clone();
        let candidate = data
            .async_invocations
            .values()
            .filter(|inv| inv.is_acquirable(now) && !paused_functions.contains(&inv.function_id))
            .min_by_key(|inv| inv.next_run_at)
            .map(|inv| inv.id);

        match candidate {
            Some(id) => {
                let inv = data.async_invocations.get_mut(&id).unwrap();
                inv.status = AsyncStatus::Running;
                inv.lease_owner = Some(owner.to_string());
                inv.lease_expires_at = Some(now + ChronoDuration::from_std(lease).unwrap_or_default());
                Ok(Some(inv.clone()))
            }
            None => Ok(None),
        }
    }

    async fn mark_succeeded(
        &self,
        id: AsyncInvocationId,
        output: serde_json::Value,
    ) -> Result<(), CoreError> {
        let mut data = self.data.lock().await;
        let inv = data
            .async_invocations
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("async invocation {id}")))?;
        let _ = output;
        inv.status = AsyncStatus::Succeeded;
        inv.lease_owner = None;
        inv.lease_expires_at = None;
        Ok(())
    }

    async fn mark_for_retry(
        &self,
        id: AsyncInvocationId,
        next_run_at: DateTime<Utc>,
        error: String,
    ) -> Result<(), CoreError> {
        let mut data = self.data.lock().await;
        let inv = data
            .async_invocations
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("async invocation {id}")))?;
        inv.attempt += 1;
        inv.status = AsyncStatus::Queued;
        inv.next_run_at = next_run_at;
        inv.last_error = Some(error);
        inv.lease_owner = None;
        inv.lease_expires_at = None;
        Ok(())
    }

    async fn mark_dlq(&self, id: AsyncInvocationId, error: String) -> Result<(), CoreError> {
        let mut data = self.data.lock().await;
        let inv = data
            .async_invocations
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("async invocation {id}")))?;
        inv.attempt += 1;
        inv.status = AsyncStatus::Dlq;
        inv.last_error = Some(error);
        inv.lease_owner = None;
        inv.lease_expires_at = None;
        Ok(())
    }

    async fn get_global_async_pause(&self) -> Result<bool, CoreError> {
        Ok(self.data.lock().await.global_pause)
    }

    async fn set_global_async_pause(&self, paused: bool) -> Result<(), CoreError> {
        self.data.lock().await.global_pause = paused;
        Ok(())
    }

    async fn pause_function(&self, function_id: FunctionId, paused: bool) -> Result<(), CoreError> {
        let mut data = self.data.lock().await;
        if paused {
            data.paused_functions.insert(function_id);
        } else {
            data.paused_functions.remove(&function_id);
        }
        Ok(())
    }

    async fn pause_workflow(&self, workflow_id: WorkflowId, paused: bool) -> Result<(), CoreError> {
        let mut data = self.data.lock().await;
        if paused {
            data.paused_workflows.insert(workflow_id);
        } else {
            data.paused_workflows.remove(&workflow_id);
        }
        Ok(())
    }

    async fn async_queue_depth(&self, tenant: &TenantScope) -> Result<u64, CoreError> {
        let data = self.data.lock().await;
        Ok(data
            .async_invocations
            .values()
            .filter(|inv| inv.tenant_id == tenant.tenant_id && !inv.status.is_terminal())
            .count() as u64)
    }

    async fn count_queued_invocations(&self) -> Result<u64, CoreError> {
        let data = self.data.lock().await;
        Ok(data.async_invocations.values().filter(|inv| !inv.status.is_terminal()).count() as u64)
    }

    async fn check_and_consume_tenant_quota(
        &self,
        tenant: &TenantScope,
        dimension: QuotaDimension,
        amount: u64,
    ) -> Result<QuotaCheckResult, CoreError> {
        let mut data = self.data.lock().await;
        let quota = match data.quotas.get(&(tenant.tenant_id.clone(), dimension)) {
            Some(q) => *q,
            None => {
                return Ok(QuotaCheckResult {
                    allowed: true,
                    used: 0,
                    limit: u64::MAX,
                    window_s: 0,
                    retry_after_s: 0,
                })
            }
        };

        let now = Utc::now();
        let key = (tenant.tenant_id.clone(), dimension);
        let (used, window_start) = data
            .quota_usage
            .get(&key)
            .copied()
            .unwrap_or((0, now));

        let window_elapsed = now.signed_duration_since(window_start)
            > ChronoDuration::seconds(quota.window_s as i64);
        let (current_used, window_start) = if window_elapsed { (0, now) } else { (used, window_start) };

        let allowed_hard = quota.hard + quota.burst;
        let allowed = current_used + amount <= allowed_hard;
        if allowed {
            data.quota_usage.insert(key, (current_used + amount, window_start));
        }

        Ok(QuotaCheckResult {
            allowed,
            used: current_used,
            limit: quota.hard,
            window_s: quota.window_s,
            retry_after_s: quota.window_s,
        })
    }

    async fn check_tenant_absolute_quota(
        &self,
        tenant: &TenantScope,
        dimension: QuotaDimension,
        candidate_value: u64,
    ) -> Result<QuotaCheckResult, CoreError> {
        let data = self.data.lock().await;
        let quota = match data.quotas.get(&(tenant.tenant_id.clone(), dimension)) {
            Some(q) => *q,
            None => {
                return Ok(QuotaCheckResult {
                    allowed: true,
                    used: candidate_value,
                    limit: u64::MAX,
                    window_s: 0,
                    retry_after_s: 0,
                })
            }
        };
        Ok(QuotaCheckResult {
            allowed: candidate_value <= quota.hard,
            used: candidate_value,
            limit: quota.hard,
            window_s: quota.window_s,
            retry_after_s: quota.window_s.max(1),
        })
    }

    async fn publish_workflow_version(
        &self,
        workflow_name: &str,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowVersion, CoreError> {
        definition
            .validate()
            .map_err(|e| CoreError::BadRequest(e.to_string()))?;

        let mut data = self.data.lock().await;
        let workflow_id = *data
            .workflow_names
            .entry(workflow_name.to_string())
            .or_insert_with(WorkflowId::new);

        let versions = data.workflow_versions.entry(workflow_id).or_default();
        let next_version = versions.last().map(|v| v.version + 1).unwrap_or(1);
        let version = WorkflowVersion {
            id: WorkflowVersionId::new(),
            workflow_id,
            version: next_version,
            definition,
        };
        versions.push(version.clone());
        data.versions_by_id.insert(version.id, version.clone());
        Ok(version)
    }

    async fn get_current_workflow_version(
        &self,
        workflow_name: &str,
    ) -> Result<WorkflowVersion, CoreError> {
        let data = self.data.lock().await;
        let workflow_id = data
            .workflow_names
            .get(workflow_name)
            .ok_or_else(|| CoreError::NotFound(format!("workflow {workflow_name}")))?;
        data.workflow_versions
            .get(workflow_id)
            .and_then(|v| v.last())
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("no published version for {workflow_name}")))
    }

    async fn create_run(
        &self,
        version: &WorkflowVersion,
        input: serde_json::Value,
        output_policy: TerminalOutputPolicy,
    ) -> Result<(WorkflowRun, Vec<RunNode>), CoreError> {
        let _guard = self.next_run_node_id.lock().unwrap();
        let mut data = self.data.lock().await;

        let def = &version.definition;
        let mut indeg: HashMap<&str, u32> = def
            .nodes
            .iter()
            .map(|n| (n.node_key.as_str(), 0))
            .collect();
        for e in &def.edges {
            *indeg.get_mut(e.to.as_str()).unwrap() += 1;
        }

        let run = WorkflowRun {
            id: RunId::new(),
            version_id: version.id,
            status: RunStatus::Queued,
            input: input.clone(),
            output: None,
            output_policy,
            started_at: Utc::now(),
            finished_at: None,
        };

        let mut nodes = Vec::with_capacity(def.nodes.len());
        let mut entries = HashMap::new();
        for n in &def.nodes {
            let deps = indeg[n.node_key.as_str()];
            let status = if deps == 0 {
                RunNodeStatus::Ready
            } else {
                RunNodeStatus::Pending
            };
            let node = RunNode {
                id: RunNodeId::new(),
                run_id: run.id,
                node_key: n.node_key.clone(),
                status,
                unresolved_deps: deps,
                input: if deps == 0 { input.clone() } else { serde_json::Value::Null },
                output: None,
                error: None,
                attempt: 0,
                lease_owner: None,
                lease_expires_at: None,
            };
            nodes.push(node.clone());
            entries.insert(
                n.node_key.clone(),
                RunNodeEntry {
                    node,
                    inputs: HashMap::new(),
                },
            );
        }

        data.runs.insert(run.id, run.clone());
        data.run_nodes.insert(run.id, entries);
        Ok((run, nodes))
    }

    async fn acquire_ready_node(
        &self,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<(RunNode, WorkflowRun, WorkflowVersion)>, CoreError> {
        let mut data = self.data.lock().await;
        let now = Utc::now();

        let mut candidate: Option<(RunId, String)> = None;
        'outer: for (run_id, nodes) in data.run_nodes.iter() {
            let mut keys: Vec<&String> = nodes
                .iter()
                .filter(|(_, e)| {
                    e.node.status == RunNodeStatus::Ready
                        && e.node
                            .lease_expires_at
                            .map(|exp| exp <= now)
                            .unwrap_or(true)
                })
                .map(|(k, _)| k)
                .collect();
            keys.sort();
            if let Some(key) = keys.into_iter().next() {
                candidate = Some((*run_id, key.clone()));
                break 'outer;
            }
        }

        let (run_id, node_key) = match candidate {
            Some(c) => c,
            None => return Ok(None),
        };

        let run = data.runs.get(&run_id).unwrap().clone();
        let version = data.versions_by_id.get(&run.version_id).unwrap().clone();

        let entry = data
            .run_nodes
            .get_mut(&run_id)
            .unwrap()
            .get_mut(&node_key)
            .unwrap();
        entry.node.status = RunNodeStatus::Running;
        entry.node.attempt += 1;
        entry.node.lease_owner = Some(owner.to_string());
        entry.node.lease_expires_at = Some(now + ChronoDuration::from_std(lease).unwrap_or_default());

        Ok(Some((entry.node.clone(), run, version)))
    }

    async fn update_run_node(&self, node: RunNode) -> Result<(), CoreError> {
        let mut data = self.data.lock().await;
        let nodes = data
            .run_nodes
            .get_mut(&node.run_id)
            .ok_or_else(|| CoreError::NotFound(format!("run {}", node.run_id)))?;
        let entry = nodes
            .get_mut(&node.node_key)
            .ok_or_else(|| CoreError::NotFound(format!("run node {}", node.node_key)))?;
        entry.node = node;
        Ok(())
    }

    async fn decrement_deps(
        &self,
        run_id: RunId,
        node_key: &str,
        predecessor_output: serde_json::Value,
        predecessor_key: String,
    ) -> Result<Option<RunNode>, CoreError> {
        let mut data = self.data.lock().await;
        let nodes = data
            .run_nodes
            .get_mut(&run_id)
            .ok_or_else(|| CoreError::NotFound(format!("run {run_id}")))?;
        let entry = nodes
            .get_mut(node_key)
            .ok_or_else(|| CoreError::NotFound(format!("run node {node_key}")))?;

        entry.inputs.insert(predecessor_key, predecessor_output);
        if entry.node.unresolved_deps > 0 {
            entry.node.unresolved_deps -= 1;
        }

        if entry.node.unresolved_deps == 0 && entry.node.status == RunNodeStatus::Pending {
            entry.node.input = if entry.inputs.len() == 1 {
                entry.inputs.values().next().cloned().unwrap()
            } else {
                serde_json::to_value(&entry.inputs).unwrap_or(serde_json::Value::Null)
            };
            entry.node.mark_ready();
            Ok(Some(entry.node.clone()))
        } else {
            Ok(None)
        }
    }

    async fn get_run(&self, run_id: RunId) -> Result<WorkflowRun, CoreError> {
        let data = self.data.lock().await;
        data.runs
            .get(&run_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("run {run_id}")))
    }

    async fn get_run_nodes(&self, run_id: RunId) -> Result<Vec<RunNode>, CoreError> {
        let data = self.data.lock().await;
        let nodes = data
            .run_nodes
            .get(&run_id)
            .ok_or_else(|| CoreError::NotFound(format!("run {run_id}")))?;
        Ok(nodes.values().map(|e| e.node.clone()).collect())
    }

    async fn finalize_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        output: Option<serde_json::Value>,
    ) -> Result<(), CoreError> {
        let mut data = self.data.lock().await;
        let run = data
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| CoreError::NotFound(format!("run {run_id}")))?;
        run.status = status;
        run.output = output;
        run.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn cancel_run(&self, run_id: RunId) -> Result<(), CoreError> {
        let mut data = self.data.lock().await;
        let nodes = data
            .run_nodes
            .get_mut(&run_id)
            .ok_or_else(|| CoreError::NotFound(format!("run {run_id}")))?;
        for entry in nodes.values_mut() {
            if !entry.node.status.is_terminal() {
                entry.node.status = RunNodeStatus::Skipped;
            }
        }
        let run = data
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| CoreError::NotFound(format!("run {run_id}")))?;
        run.status = RunStatus::Failed;
        run.finished_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    fn tenant() -> TenantScope {
        TenantScope {
            tenant_id: "t1".to_string(),
            namespace: "default".to_string(),
        }
    }

    #[test]
    async fn idempotent_enqueue_returns_same_row() {
        let store = InMemoryStore::new();
        let fid = FunctionId::new();
        let (first, dup1) = store
            .enqueue_with_idempotency(
                fid,
                serde_json::json!({}),
                tenant(),
                3,
                10,
                100,
                "k1".to_string(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert!(!dup1);

        let (second, dup2) = store
            .enqueue_with_idempotency(
                fid,
                serde_json::json!({}),
                tenant(),
                3,
                10,
                100,
                "k1".to_string(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert!(dup2);
        assert_eq!(first.id, second.id);
    }

    #[test]
    async fn acquire_due_invocation_is_exclusive() {
        let store = InMemoryStore::new();
        let fid = FunctionId::new();
        store
            .enqueue(fid, serde_json::json!({}), tenant(), 3, 10, 100)
            .await
            .unwrap();

        let a = store
            .acquire_due_async_invocation("worker-a", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(a.is_some());

        let b = store
            .acquire_due_async_invocation("worker-b", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(b.is_none());
    }

    #[test]
    async fn fan_in_node_becomes_ready_only_once_both_preds_done() {
        let store = InMemoryStore::new();
        let def = WorkflowDefinition {
            nodes: vec![
                crate::model::WorkflowNode {
                    node_key: "a".into(),
                    node_type: NodeType::Function,
                    target_name: "a".into(),
                    retry_policy: RetryPolicy::default(),
                    timeout_s: 10,
                    input_mapping: None,
                },
                crate::model::WorkflowNode {
                    node_key: "b".into(),
                    node_type: NodeType::Function,
                    target_name: "b".into(),
                    retry_policy: RetryPolicy::default(),
                    timeout_s: 10,
                    input_mapping: None,
                },
                crate::model::WorkflowNode {
                    node_key: "c".into(),
                    node_type: NodeType::Function,
                    target_name: "c".into(),
                    retry_policy: RetryPolicy::default(),
                    timeout_s: 10,
                    input_mapping: None,
                },
            ],
            edges: vec![
                WorkflowEdge { from: "a".into(), to: "c".into() },
                WorkflowEdge { from: "b".into(), to: "c".into() },
            ],
        };
        let version = store.publish_workflow_version("wf", def).await.unwrap();
        let (_run, nodes) = store
            .create_run(&version, serde_json::json!({"x": 1}), TerminalOutputPolicy::LeafMap)
            .await
            .unwrap();
        let c = nodes.iter().find(|n| n.node_key == "c").unwrap();
        assert_eq!(c.unresolved_deps, 2);
        assert_eq!(c.status, RunNodeStatus::Pending);

        let ready = store
            .decrement_deps(c.run_id, "c", serde_json::json!("outA"), "a".to_string())
            .await
            .unwrap();
        assert!(ready.is_none());

        let ready = store
            .decrement_deps(c.run_id, "c", serde_json::json!("outB"), "b".to_string())
            .await
            .unwrap()
            .expect("c should become ready");
        assert_eq!(ready.status, RunNodeStatus::Ready);
        assert_eq!(ready.unresolved_deps, 0);
        assert_eq!(
            ready.input,
            serde_json::json!({"a": "outA", "b": "outB"})
        );
    }
}
