//! Aggregate configuration for the execution core. Loaded from
//! `config/nebula-exec-core.toml` overlaid with `NEBULA__`-prefixed
//! environment variables, the same figment layering the rest of this
//! stack uses for its service configs.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TracingConfig {
    pub environment: String,
    pub json: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            environment: "dev".to_string(),
            json: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfigToml {
    #[serde(with = "humantime_serde")]
    pub idle_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub prewarm_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub acquire_poll_interval: Duration,
    pub max_global_vms: Option<u32>,
    pub max_prewarm_workers: usize,
    pub health_probe_retries: u32,
    #[serde(with = "humantime_serde")]
    pub health_probe_backoff: Duration,
    pub max_start_attempts: u32,
}

impl Default for PoolConfigToml {
    fn default() -> Self {
        let d = crate::pool::PoolConfig::default();
        Self {
            idle_ttl: d.idle_ttl,
            health_check_interval: d.health_check_interval,
            cleanup_interval: d.cleanup_interval,
            prewarm_interval: d.prewarm_interval,
            acquire_poll_interval: d.acquire_poll_interval,
            max_global_vms: d.max_global_vms,
            max_prewarm_workers: d.max_prewarm_workers,
            health_probe_retries: d.health_probe_retries,
            health_probe_backoff: d.health_probe_backoff,
            max_start_attempts: d.max_start_attempts,
        }
    }
}

impl From<PoolConfigToml> for crate::pool::PoolConfig {
    fn from(c: PoolConfigToml) -> Self {
        Self {
            idle_ttl: c.idle_ttl,
            health_check_interval: c.health_check_interval,
            cleanup_interval: c.cleanup_interval,
            prewarm_interval: c.prewarm_interval,
            acquire_poll_interval: c.acquire_poll_interval,
            max_global_vms: c.max_global_vms,
            max_prewarm_workers: c.max_prewarm_workers,
            health_probe_retries: c.health_probe_retries,
            health_probe_backoff: c.health_probe_backoff,
            max_start_attempts: c.max_start_attempts,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AsyncWorkerConfigToml {
    pub worker_count: u32,
    #[serde(with = "humantime_serde")]
    pub lease_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub idempotency_ttl: Duration,
    pub enable_adaptive: bool,
    #[serde(with = "humantime_serde")]
    pub adaptive_probe_interval: Duration,
    pub adaptive_min_workers: u32,
    pub adaptive_max_workers: u32,
    pub adaptive_min_batch_size: u32,
    pub adaptive_max_batch_size: u32,
    #[serde(with = "humantime_serde")]
    pub adaptive_min_poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub adaptive_max_poll_interval: Duration,
    pub adaptive_scale_up_step: u32,
    pub adaptive_scale_down_rate: f64,
    pub adaptive_stable_rounds_before_scale_down: u32,
}

impl Default for AsyncWorkerConfigToml {
    fn default() -> Self {
        let d = crate::asyncworker::AsyncWorkerConfig::default();
        let b = d.adaptive_bounds;
        Self {
            worker_count: d.worker_count,
            lease_duration: d.lease_duration,
            poll_interval: d.poll_interval,
            idempotency_ttl: d.idempotency_ttl,
            enable_adaptive: d.enable_adaptive,
            adaptive_probe_interval: d.adaptive_probe_interval,
            adaptive_min_workers: b.min_workers,
            adaptive_max_workers: b.max_workers,
            adaptive_min_batch_size: b.min_batch_size,
            adaptive_max_batch_size: b.max_batch_size,
            adaptive_min_poll_interval: b.min_poll_interval,
            adaptive_max_poll_interval: b.max_poll_interval,
            adaptive_scale_up_step: b.scale_up_step,
            adaptive_scale_down_rate: b.scale_down_rate,
            adaptive_stable_rounds_before_scale_down: b.stable_rounds_before_scale_down,
        }
    }
}

impl From<AsyncWorkerConfigToml> for crate::asyncworker::AsyncWorkerConfig {
    fn from(c: AsyncWorkerConfigToml) -> Self {
        Self {
            worker_count: c.worker_count,
            lease_duration: c.lease_duration,
            poll_interval: c.poll_interval,
            idempotency_ttl: c.idempotency_ttl,
            enable_adaptive: c.enable_adaptive,
            adaptive_probe_interval: c.adaptive_probe_interval,
            adaptive_bounds: crate::asyncworker::AdaptiveBounds {
                min_workers: c.adaptive_min_workers,
                max_workers: c.adaptive_max_workers,
                min_batch_size: c.adaptive_min_batch_size,
                max_batch_size: c.adaptive_max_batch_size,
                min_poll_interval: c.adaptive_min_poll_interval,
                max_poll_interval: c.adaptive_max_poll_interval,
                scale_up_step: c.adaptive_scale_up_step,
                scale_down_rate: c.adaptive_scale_down_rate,
                stable_rounds_before_scale_down: c.adaptive_stable_rounds_before_scale_down,
            },
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowEngineConfigToml {
    pub worker_count: u32,
    #[serde(with = "humantime_serde")]
    pub lease_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for WorkflowEngineConfigToml {
    fn default() -> Self {
        let d = crate::workflow::WorkflowEngineConfig::default();
        Self {
            worker_count: d.worker_count,
            lease_duration: d.lease_duration,
            poll_interval: d.poll_interval,
        }
    }
}

impl From<WorkflowEngineConfigToml> for crate::workflow::WorkflowEngineConfig {
    fn from(c: WorkflowEngineConfigToml) -> Self {
        Self {
            worker_count: c.worker_count,
            lease_duration: c.lease_duration,
            poll_interval: c.poll_interval,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogSinkConfigToml {
    pub batch_size: usize,
    pub buffer_size: usize,
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub flush_timeout: Duration,
}

impl Default for LogSinkConfigToml {
    fn default() -> Self {
        let d = crate::logsink::LogSinkConfig::default();
        Self {
            batch_size: d.batch_size,
            buffer_size: d.buffer_size,
            flush_interval: d.flush_interval,
            flush_timeout: d.flush_timeout,
        }
    }
}

impl From<LogSinkConfigToml> for crate::logsink::LogSinkConfig {
    fn from(c: LogSinkConfigToml) -> Self {
        Self {
            batch_size: c.batch_size,
            buffer_size: c.buffer_size,
            flush_interval: c.flush_interval,
            flush_timeout: c.flush_timeout,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfigToml {
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
}

impl Default for SchedulerConfigToml {
    fn default() -> Self {
        Self {
            tick_interval: crate::scheduler::SchedulerConfig::default().tick_interval,
        }
    }
}

impl From<SchedulerConfigToml> for crate::scheduler::SchedulerConfig {
    fn from(c: SchedulerConfigToml) -> Self {
        Self { tick_interval: c.tick_interval }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecutionCoreConfig {
    pub environment: String,
    pub http_port: u16,
    pub tracing: TracingConfig,
    pub pool: PoolConfigToml,
    pub async_worker: AsyncWorkerConfigToml,
    pub workflow_engine: WorkflowEngineConfigToml,
    pub log_sink: LogSinkConfigToml,
    pub scheduler: SchedulerConfigToml,
}

impl ExecutionCoreConfig {
    pub fn new() -> Self {
        Figment::new()
            .merge(Toml::file("config/nebula-exec-core.toml"))
            .merge(Env::prefixed("NEBULA__").split("__"))
            .extract()
            .expect("failed to parse configuration")
    }

    pub fn load() -> Self {
        Self::new()
    }

    /// Mirrors the `--dump-config` convenience every service binary in
    /// this stack supports: print the effective config and exit instead
    /// of starting.
    pub fn load_or_dump_config() -> Option<Self> {
        if std::env::args().any(|arg| arg == "--dump-config") {
            let config = Self::default_for_dump();
            println!(
                "{}",
                toml::to_string_pretty(&config).expect("config must serialize")
            );
            None
        } else {
            Some(Self::new())
        }
    }

    fn default_for_dump() -> Self {
        Self {
            environment: "dev".to_string(),
            http_port: 8080,
            tracing: TracingConfig::default(),
            pool: PoolConfigToml::default(),
            async_worker: AsyncWorkerConfigToml::default(),
            workflow_engine: WorkflowEngineConfigToml::default(),
            log_sink: LogSinkConfigToml::default(),
            scheduler: SchedulerConfigToml::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    pub fn default_config_round_trips_through_toml() {
        let config = ExecutionCoreConfig::default_for_dump();
        let serialized = toml::to_string(&config).expect("serialize");
        let _: ExecutionCoreConfig = toml::from_str(&serialized).expect("deserialize");
    }
}
