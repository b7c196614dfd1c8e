//! Workflow service + engine. Publishing validates and versions a
//! DAG; triggering materializes a run; the engine is a fixed worker pool
//! that leases ready nodes, invokes their target through the executor,
//! and propagates outputs to decrement dependents.

use crate::asyncworker::backoff_with_jitter;
use crate::error::CoreError;
use crate::executor::Executor;
use crate::model::{
    RunId, RunNode, RunNodeStatus, RunStatus, TerminalOutputPolicy, WorkflowDefinition, WorkflowRun,
    WorkflowVersion,
};
use crate::notifier::Notifier;
use crate::store::Store;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct WorkflowEngineConfig {
    pub worker_count: u32,
    pub lease_duration: Duration,
    pub poll_interval: Duration,
}

impl Default for WorkflowEngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            lease_duration: Duration::from_secs(30),
            poll_interval: Duration::from_millis(200),
        }
    }
}

pub struct WorkflowEngine {
    store: Arc<dyn Store>,
    executor: Arc<Executor>,
    notifier: Arc<dyn Notifier>,
    config: WorkflowEngineConfig,
    shutdown: Arc<AtomicBool>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn Store>,
        executor: Arc<Executor>,
        notifier: Arc<dyn Notifier>,
        config: WorkflowEngineConfig,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            store,
            executor,
            notifier,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        });
        engine.clone().spawn_workers();
        engine
    }

    pub async fn publish_version(
        &self,
        workflow_name: &str,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowVersion, CoreError> {
        self.store.publish_workflow_version(workflow_name, definition).await
    }

    /// Triggers a run of the current published version. `output_policy`
    /// selects how the run's final `output` is assembled once every leaf
    /// is terminal — a single designated node, or a map of every leaf's
    /// output when `None` is passed.
    pub async fn trigger_run(
        &self,
        workflow_name: &str,
        input: serde_json::Value,
        output_policy: Option<TerminalOutputPolicy>,
    ) -> Result<WorkflowRun, CoreError> {
        let version = self.store.get_current_workflow_version(workflow_name).await?;
        let (run, _nodes) = self
            .store
            .create_run(&version, input, output_policy.unwrap_or(TerminalOutputPolicy::LeafMap))
            .await?;
        self.notifier.notify();
        Ok(run)
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<WorkflowRun, CoreError> {
        self.store.get_run(run_id).await
    }

    pub async fn cancel_run(&self, run_id: RunId) -> Result<(), CoreError> {
        self.store.cancel_run(run_id).await?;
        self.notifier.notify();
        Ok(())
    }

    fn spawn_workers(self: Arc<Self>) {
        for id in 0..self.config.worker_count {
            let engine = self.clone();
            tokio::spawn(async move { engine.worker_loop(format!("workflow-worker-{id}")).await });
        }
    }

    #[instrument(skip(self))]
    async fn worker_loop(self: Arc<Self>, owner: String) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }

            match self.store.acquire_ready_node(&owner, self.config.lease_duration).await {
                Ok(Some((node, run, version))) => self.process_node(node, run, version).await,
                Ok(None) => {
                    tokio::select! {
                        _ = self.notifier.wait() => {}
                        _ = interval.tick() => {}
                    }
                }
                Err(e) => {
                    error!("failed to acquire ready run node: {e}");
                    interval.tick().await;
                }
            }
        }
    }

    async fn process_node(&self, mut node: RunNode, run: WorkflowRun, version: WorkflowVersion) {
        let def = &version.definition;
        let def_node = match def.node(&node.node_key) {
            Some(n) => n,
            None => {
                node.status = RunNodeStatus::Failed;
                node.error = Some("node missing from workflow definition".to_string());
                let _ = self.store.update_run_node(node).await;
                return;
            }
        };

        let target = match self.store.get_function_by_name(&def_node.target_name).await {
            Ok(f) => f,
            Err(e) => {
                self.fail_or_retry(node, def_node.retry_policy.max_attempts, def_node.retry_policy.base_ms, def_node.retry_policy.max_backoff_ms, e.to_string()).await;
                return;
            }
        };

        match self.executor.invoke(&target, node.input.clone(), None).await {
            Ok(outcome) => {
                node.status = RunNodeStatus::Succeeded;
                node.output = Some(outcome.output.clone());
                let node_key = node.node_key.clone();
                let _ = self.store.update_run_node(node).await;
                self.propagate(run.id, &node_key, &version, outcome.output).await;
            }
            Err(e) => {
                let (max_attempts, base_ms, max_backoff_ms) =
                    (def_node.retry_policy.max_attempts, def_node.retry_policy.base_ms, def_node.retry_policy.max_backoff_ms);
                self.fail_or_retry(node, max_attempts, base_ms, max_backoff_ms, e.to_string()).await;
            }
        }
    }

    async fn fail_or_retry(&self, mut node: RunNode, max_attempts: u32, base_ms: u64, max_backoff_ms: u64, error: String) {
        if node.attempt >= max_attempts {
            node.status = RunNodeStatus::Failed;
            node.error = Some(error);
            let run_id = node.run_id;
            let _ = self.store.update_run_node(node).await;
            warn!(%run_id, "run node failed permanently, failing run");
            let _ = self.store.finalize_run(run_id, RunStatus::Failed, None).await;
            return;
        }

        // Hold the node in `Running` (ineligible for `acquire_ready_node`)
        // for the whole backoff window before flipping it back to
        // `Ready`, so a sibling poller can't grab it and retry early.
        let delay = backoff_with_jitter(node.attempt, base_ms, max_backoff_ms);
        tokio::time::sleep(delay).await;
        node.status = RunNodeStatus::Ready;
        node.lease_owner = None;
        node.lease_expires_at = None;
        node.error = Some(error);
        let _ = self.store.update_run_node(node).await;
        self.notifier.notify();
    }

    /// Decrements every successor's dependency count with this node's
    /// output; finalizes the run once all leaves are terminal.
    async fn propagate(
        &self,
        run_id: RunId,
        node_key: &str,
        version: &WorkflowVersion,
        output: serde_json::Value,
    ) {
        let successors = version.definition.successors(node_key);
        let mut any_became_ready = false;
        for succ in successors {
            match self
                .store
                .decrement_deps(run_id, succ, output.clone(), node_key.to_string())
                .await
            {
                Ok(Some(_)) => any_became_ready = true,
                Ok(None) => {}
                Err(e) => error!(%run_id, "failed to propagate output to {succ}: {e}"),
            }
        }
        if any_became_ready {
            self.notifier.notify();
        }

        if let Err(e) = self.maybe_finalize(run_id, version).await {
            error!(%run_id, "failed to finalize run: {e}");
        }
    }

    async fn maybe_finalize(&self, run_id: RunId, version: &WorkflowVersion) -> Result<(), CoreError> {
        let nodes = self.store.get_run_nodes(run_id).await?;
        if !nodes.iter().all(|n| n.status.is_terminal()) {
            return Ok(());
        }

        if nodes.iter().any(|n| n.status == RunNodeStatus::Failed) {
            self.store.finalize_run(run_id, RunStatus::Failed, None).await?;
            return Ok(());
        }

        let run = self.store.get_run(run_id).await?;
        let output = match &run.output_policy {
            TerminalOutputPolicy::DesignatedNode(key) => nodes
                .iter()
                .find(|n| &n.node_key == key)
                .and_then(|n| n.output.clone())
                .unwrap_or(serde_json::Value::Null),
            TerminalOutputPolicy::LeafMap => {
                let leaves: Vec<&str> = nodes
                    .iter()
                    .filter(|n| version.definition.successors(&n.node_key).is_empty())
                    .map(|n| n.node_key.as_str())
                    .collect();
                let mut map = HashMap::new();
                for leaf in leaves {
                    if let Some(n) = nodes.iter().find(|n| n.node_key == leaf) {
                        map.insert(leaf.to_string(), n.output.clone().unwrap_or(serde_json::Value::Null));
                    }
                }
                serde_json::to_value(map).unwrap_or(serde_json::Value::Null)
            }
        };

        info!(%run_id, "run succeeded");
        self.store.finalize_run(run_id, RunStatus::Succeeded, Some(output)).await?;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use crate::mock_backend::MockBackend;
    use crate::model::{Function, FunctionId, NodeType, ResourceLimits, RetryPolicy, WorkflowEdge, WorkflowNode};
    use crate::notifier::ChannelNotifier;
    use crate::pool::{Pool, PoolConfig};
    use crate::store::InMemoryStore;
    use test_r::test;

    fn function(name: &str) -> Function {
        Function {
            id: FunctionId::new(),
            name: name.to_string(),
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

    fn node(key: &str) -> WorkflowNode {
        WorkflowNode {
            node_key: key.to_string(),
            node_type: NodeType::Function,
            target_name: key.to_string(),
            retry_policy: RetryPolicy { max_attempts: 1, base_ms: 10, max_backoff_ms: 50 },
            timeout_s: 5,
            input_mapping: None,
        }
    }

    #[test]
    async fn fan_in_run_completes_with_leaf_map_output() {
        let store = Arc::new(InMemoryStore::new());
        store.put_function(function("a")).await.unwrap();
        store.put_function(function("b")).await.unwrap();
        store.put_function(function("c")).await.unwrap();

        let backend = Arc::new(MockBackend::new());
        let notifier = Arc::new(ChannelNotifier::new());
        let pool = Pool::new(store.clone(), backend, notifier.clone(), PoolConfig::default());
        let log_sink = Arc::new(crate::logsink::LogSink::new(
            Arc::new(crate::logsink::NoopSinkBackend),
            crate::logsink::LogSinkConfig::default(),
        ));
        let executor = Arc::new(Executor::new(pool, log_sink));
        let engine = WorkflowEngine::new(store.clone(), executor, notifier, WorkflowEngineConfig {
            worker_count: 2,
            lease_duration: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
        });

        let def = WorkflowDefinition {
            nodes: vec![node("a"), node("b"), node("c")],
            edges: vec![
                WorkflowEdge { from: "a".into(), to: "c".into() },
                WorkflowEdge { from: "b".into(), to: "c".into() },
            ],
        };
        engine.publish_version("wf1", def).await.unwrap();
        let run = engine
            .trigger_run("wf1", serde_json::json!({"seed": 1}), None)
            .await
            .unwrap();

        let finished = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let r = engine.get_run(run.id).await.unwrap();
                if r.status != RunStatus::Queued && r.status != RunStatus::Running {
                    return r;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("run did not finish in time");

        assert_eq!(finished.status, RunStatus::Succeeded);
        assert!(finished.output.is_some());
    }

    #[test]
    async fn fan_in_run_with_designated_node_outputs_only_that_node() {
        let store = Arc::new(InMemoryStore::new());
        store.put_function(function("a")).await.unwrap();
        store.put_function(function("b")).await.unwrap();
        store.put_function(function("c")).await.unwrap();

        let backend = Arc::new(MockBackend::new());
        let notifier = Arc::new(ChannelNotifier::new());
        let pool = Pool::new(store.clone(), backend, notifier.clone(), PoolConfig::default());
        let log_sink = Arc::new(crate::logsink::LogSink::new(
            Arc::new(crate::logsink::NoopSinkBackend),
            crate::logsink::LogSinkConfig::default(),
        ));
        let executor = Arc::new(Executor::new(pool, log_sink));
        let engine = WorkflowEngine::new(store.clone(), executor, notifier, WorkflowEngineConfig {
            worker_count: 2,
            lease_duration: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
        });

        let def = WorkflowDefinition {
            nodes: vec![node("a"), node("b"), node("c")],
            edges: vec![
                WorkflowEdge { from: "a".into(), to: "c".into() },
                WorkflowEdge { from: "b".into(), to: "c".into() },
            ],
        };
        engine.publish_version("wf2", def).await.unwrap();
        let run = engine
            .trigger_run(
                "wf2",
                serde_json::json!({"seed": 1}),
                Some(TerminalOutputPolicy::DesignatedNode("c".to_string())),
            )
            .await
            .unwrap();

        let finished = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let r = engine.get_run(run.id).await.unwrap();
                if r.status != RunStatus::Queued && r.status != RunStatus::Running {
                    return r;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("run did not finish in time");

        assert_eq!(finished.status, RunStatus::Succeeded);
        // `c`'s input is the fan-in map of `a` and `b`'s outputs, and the
        // echo backend reflects input back as output, so this checks the
        // designated node's output specifically surfaced, not a leaf map.
        assert_eq!(
            finished.output,
            Some(serde_json::json!({"a": {"seed": 1}, "b": {"seed": 1}}))
        );
    }
}
