//! Observable metrics for the pool and executor, exposed through the same
//! `prometheus` registry + `opentelemetry-prometheus` bridge the rest of
//! this stack uses for its `/metrics` endpoint. Kept as one small struct
//! of pre-registered collectors rather than a process-wide static so it
//! stays an explicit collaborator instead of global mutable state.

use prometheus::{
    HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

pub struct Metrics {
    pub queue_depth: IntGaugeVec,
    pub queue_wait_ms: prometheus::Histogram,
    pub admission_total: IntCounterVec,
    pub shed_total: IntCounterVec,
    pub vm_pool_size: IntGaugeVec,
    pub active_vms: IntGauge,
    pub pool_utilization_ratio: prometheus::GaugeVec,
    pub vm_boot_duration_ms: HistogramVec,
    pub snapshot_restore_ms: prometheus::Histogram,
    pub circuit_breaker_state: IntGaugeVec,
    pub invocations_total: IntCounterVec,
    pub invocation_duration_ms: HistogramVec,
    pub cold_starts_total: IntCounter,
    pub warm_starts_total: IntCounter,
}

impl Metrics {
    /// Registers every collector into `registry`. Safe to call more than
    /// once with independent registries (e.g. once per test); the
    /// collectors themselves are freshly constructed each time.
    pub fn new(registry: &Registry) -> Self {
        let queue_depth = IntGaugeVec::new(
            Opts::new("queue_depth", "pending admission-queue entries per function"),
            &["function_id"],
        )
        .unwrap();
        let queue_wait_ms = prometheus::Histogram::with_opts(
            prometheus::HistogramOpts::new("queue_wait_ms", "time spent waiting in the admission queue"),
        )
        .unwrap();
        let admission_total = IntCounterVec::new(
            Opts::new("admission_total", "admission decisions"),
            &["result", "reason"],
        )
        .unwrap();
        let shed_total = IntCounterVec::new(
            Opts::new("shed_total", "requests shed at admission"),
            &["reason"],
        )
        .unwrap();
        let vm_pool_size = IntGaugeVec::new(
            Opts::new("vm_pool_size", "pooled sandbox instances"),
            &["function_id", "state"],
        )
        .unwrap();
        let active_vms = IntGauge::new("active_vms", "total pooled sandbox instances").unwrap();
        let pool_utilization_ratio = prometheus::GaugeVec::new(
            Opts::new("pool_utilization_ratio", "inflight / max_replicas per function"),
            &["function_id"],
        )
        .unwrap();
        let vm_boot_duration_ms = HistogramVec::new(
            prometheus::HistogramOpts::new("vm_boot_duration_ms", "sandbox start latency"),
            &["from_snapshot"],
        )
        .unwrap();
        let snapshot_restore_ms = prometheus::Histogram::with_opts(
            prometheus::HistogramOpts::new("snapshot_restore_ms", "snapshot restore latency"),
        )
        .unwrap();
        let circuit_breaker_state = IntGaugeVec::new(
            Opts::new("circuit_breaker_state", "0=closed 1=open 2=half-open"),
            &["function_id"],
        )
        .unwrap();
        let invocations_total = IntCounterVec::new(
            Opts::new("invocations_total", "completed invocations"),
            &["status"],
        )
        .unwrap();
        let invocation_duration_ms = HistogramVec::new(
            prometheus::HistogramOpts::new("invocation_duration_ms", "invocation latency"),
            &["cold_start"],
        )
        .unwrap();
        let cold_starts_total = IntCounter::new("cold_starts_total", "cold-start invocations").unwrap();
        let warm_starts_total = IntCounter::new("warm_starts_total", "warm-start invocations").unwrap();

        for c in [
            Box::new(queue_depth.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(admission_total.clone()),
            Box::new(shed_total.clone()),
            Box::new(vm_pool_size.clone()),
            Box::new(pool_utilization_ratio.clone()),
            Box::new(circuit_breaker_state.clone()),
            Box::new(invocations_total.clone()),
        ] {
            let _ = registry.register(c);
        }
        let _ = registry.register(Box::new(active_vms.clone()));
        let _ = registry.register(Box::new(vm_boot_duration_ms.clone()));
        let _ = registry.register(Box::new(snapshot_restore_ms.clone()));
        let _ = registry.register(Box::new(invocation_duration_ms.clone()));
        let _ = registry.register(Box::new(cold_starts_total.clone()));
        let _ = registry.register(Box::new(warm_starts_total.clone()));
        let _ = registry.register(Box::new(queue_wait_ms.clone()));

        Self {
            queue_depth,
            queue_wait_ms,
            admission_total,
            shed_total,
            vm_pool_size,
            active_vms,
            pool_utilization_ratio,
            vm_boot_duration_ms,
            snapshot_restore_ms,
            circuit_breaker_state,
            invocations_total,
            invocation_duration_ms,
            cold_starts_total,
            warm_starts_total,
        }
    }

    /// A `Metrics` with collectors registered to a throwaway registry,
    /// for call sites (mostly tests) that don't care about exposition.
    pub fn disabled() -> Self {
        Self::new(&Registry::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn registers_without_panicking_and_records() {
        let registry = Registry::new();
        let m = Metrics::new(&registry);
        m.invocations_total.with_label_values(&["success"]).inc();
        m.cold_starts_total.inc();
        assert!(!registry.gather().is_empty());
    }
}
