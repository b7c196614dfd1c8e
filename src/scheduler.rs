//! Cron-triggered invocations. A single background loop wakes once
//! a minute, finds schedules whose next fire time has passed, and routes
//! them to either the async worker pool (function schedules) or the
//! workflow engine (workflow schedules).

use crate::asyncworker::AsyncWorkerPool;
use crate::model::{FunctionId, TenantScope, WorkflowId};
use crate::workflow::WorkflowEngine;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Copy)]
pub struct ScheduleId(pub uuid::Uuid);

impl ScheduleId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ScheduleId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub enum ScheduleTarget {
    Function { function_id: FunctionId, payload: serde_json::Value, tenant: TenantScope },
    Workflow { workflow_id: WorkflowId, workflow_name: String, input: serde_json::Value },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid cron expression: {0}")]
    InvalidExpression(String),
    #[error("schedule not found")]
    NotFound,
}

struct ScheduleEntry {
    expr: Schedule,
    target: ScheduleTarget,
    enabled: bool,
    last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: std::time::Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: std::time::Duration::from_secs(30),
        }
    }
}

pub struct Scheduler {
    entries: Mutex<HashMap<ScheduleId, ScheduleEntry>>,
    async_pool: Arc<AsyncWorkerPool>,
    workflow_engine: Arc<WorkflowEngine>,
    config: SchedulerConfig,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        async_pool: Arc<AsyncWorkerPool>,
        workflow_engine: Arc<WorkflowEngine>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            async_pool,
            workflow_engine,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        });
        scheduler.clone().spawn_loop();
        scheduler
    }

    pub async fn add(&self, cron_expr: &str, target: ScheduleTarget) -> Result<ScheduleId, ScheduleError> {
        let expr = Schedule::from_str(cron_expr).map_err(|e| ScheduleError::InvalidExpression(e.to_string()))?;
        let id = ScheduleId::new();
        self.entries.lock().await.insert(
            id,
            ScheduleEntry {
                expr,
                target,
                enabled: true,
                last_run_at: None,
            },
        );
        Ok(id)
    }

    pub async fn remove(&self, id: ScheduleId) -> Result<(), ScheduleError> {
        self.entries.lock().await.remove(&id).ok_or(ScheduleError::NotFound)?;
        Ok(())
    }

    pub async fn set_enabled(&self, id: ScheduleId, enabled: bool) -> Result<(), ScheduleError> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(&id).ok_or(ScheduleError::NotFound)?;
        entry.enabled = enabled;
        Ok(())
    }

    fn spawn_loop(self: Arc<Self>) {
        tokio::spawn(async move { self.tick_loop().await });
    }

    async fn tick_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        loop {
            interval.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            self.fire_due().await;
        }
    }

    async fn fire_due(&self) {
        let now = Utc::now();
        let mut due = Vec::new();
        {
            let mut entries = self.entries.lock().await;
            for (id, entry) in entries.iter_mut() {
                if !entry.enabled {
                    continue;
                }
                let should_fire = match entry.expr.after(&entry.last_run_at.unwrap_or(now - chrono::Duration::minutes(1))).next() {
                    Some(next) => next <= now,
                    None => false,
                };
                if should_fire {
                    entry.last_run_at = Some(now);
                    due.push((*id, entry.target.clone()));
                }
            }
        }

        for (id, target) in due {
            if let Err(e) = self.fire(target).await {
                error!(schedule_id = ?id, "scheduled fire failed: {e}");
            } else {
                info!(schedule_id = ?id, "scheduled fire dispatched");
            }
        }
    }

    async fn fire(&self, target: ScheduleTarget) -> Result<(), crate::error::CoreError> {
        match target {
            ScheduleTarget::Function { function_id, payload, tenant } => {
                self.async_pool
                    .enqueue(function_id, payload, tenant, 3, 1_000, 60_000)
                    .await?;
            }
            ScheduleTarget::Workflow { workflow_name, input, .. } => {
                self.workflow_engine.trigger_run(&workflow_name, input, None).await?;
            }
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn rejects_malformed_cron_expression() {
        let result = Schedule::from_str("not a cron expr");
        assert!(result.is_err());
    }

    #[test]
    fn accepts_five_field_cron_expression() {
        // `cron` crate expects a seconds field; six fields total.
        let result = Schedule::from_str("0 */5 * * * *");
        assert!(result.is_ok());
    }
}
