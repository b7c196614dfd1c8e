//! The async worker pool's adaptive controller: resizes worker count, batch
//! size, and poll interval from backlog behavior. Kept as a pure
//! state-transition function — `probe(state, obs) -> state'` — so the
//! feedback loop is unit-testable without timers; `AsyncWorkerPool`
//! wires a ticker around it at construction.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct AdaptiveBounds {
    pub min_workers: u32,
    pub max_workers: u32,
    pub min_batch_size: u32,
    pub max_batch_size: u32,
    pub min_poll_interval: Duration,
    pub max_poll_interval: Duration,
    pub scale_up_step: u32,
    /// Multiplier applied to `worker_count` on scale-down; must be in
    /// `(0, 1)`.
    pub scale_down_rate: f64,
    pub stable_rounds_before_scale_down: u32,
}

impl Default for AdaptiveBounds {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 32,
            min_batch_size: 1,
            max_batch_size: 64,
            min_poll_interval: Duration::from_millis(50),
            max_poll_interval: Duration::from_secs(5),
            scale_up_step: 2,
            scale_down_rate: 0.7,
            stable_rounds_before_scale_down: 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdaptiveState {
    pub worker_count: u32,
    pub batch_size: u32,
    pub poll_interval: Duration,
    pub bounds: AdaptiveBounds,
    /// Queue depth observed on the previous probe; `None` before the
    /// first probe.
    prev_depth: Option<u64>,
    /// Consecutive probes where the queue was non-increasing and
    /// draining (depth non-increasing while completions are happening).
    stable_rounds: u32,
}

impl AdaptiveState {
    pub fn new(worker_count: u32, batch_size: u32, poll_interval: Duration, bounds: AdaptiveBounds) -> Self {
        Self {
            worker_count: worker_count.clamp(bounds.min_workers, bounds.max_workers),
            batch_size: batch_size.clamp(bounds.min_batch_size, bounds.max_batch_size),
            poll_interval: poll_interval.clamp(bounds.min_poll_interval, bounds.max_poll_interval),
            bounds,
            prev_depth: None,
            stable_rounds: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdaptiveObservation {
    pub queue_depth: u64,
    pub completed_since_last_probe: u64,
}

pub struct AdaptiveController;

impl AdaptiveController {
    /// One feedback step: scale up on a strictly increasing
    /// or out-of-capacity backlog, scale down after
    /// `stable_rounds_before_scale_down` consecutive quiet/draining
    /// probes, otherwise hold. Never exceeds `[min,max]` bounds.
    pub fn probe(state: AdaptiveState, obs: AdaptiveObservation) -> AdaptiveState {
        let b = state.bounds;
        let capacity = (state.worker_count as u64) * (state.batch_size as u64);
        let increasing = state.prev_depth.map(|p| obs.queue_depth > p).unwrap_or(false);
        let draining = state
            .prev_depth
            .map(|p| obs.queue_depth <= p && obs.completed_since_last_probe > 0)
            .unwrap_or(false);

        let mut next = state;
        next.prev_depth = Some(obs.queue_depth);

        if increasing || obs.queue_depth > capacity {
            next.stable_rounds = 0;
            next.worker_count = (state.worker_count + b.scale_up_step).min(b.max_workers);
            next.poll_interval = halve(state.poll_interval, b.min_poll_interval);
            if obs.queue_depth > capacity.saturating_mul(3) {
                next.batch_size = (state.batch_size + 1).min(b.max_batch_size);
            }
        } else if obs.queue_depth == 0 || draining {
            next.stable_rounds = state.stable_rounds + 1;
            if next.stable_rounds >= b.stable_rounds_before_scale_down {
                let scaled = ((state.worker_count as f64) * b.scale_down_rate).floor() as u32;
                next.worker_count = scaled.max(b.min_workers).min(state.worker_count);
                next.poll_interval = double(state.poll_interval, b.max_poll_interval);
                next.stable_rounds = 0;
            }
        } else {
            next.stable_rounds = 0;
        }

        next.worker_count = next.worker_count.clamp(b.min_workers, b.max_workers);
        next.batch_size = next.batch_size.clamp(b.min_batch_size, b.max_batch_size);
        next.poll_interval = next.poll_interval.clamp(b.min_poll_interval, b.max_poll_interval);
        next
    }
}

fn halve(d: Duration, floor: Duration) -> Duration {
    (d / 2).max(floor)
}

fn double(d: Duration, ceil: Duration) -> Duration {
    (d * 2).min(ceil)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    fn state() -> AdaptiveState {
        AdaptiveState::new(4, 8, Duration::from_millis(200), AdaptiveBounds::default())
    }

    #[test]
    fn scales_up_on_growing_backlog() {
        let s0 = state();
        let s1 = AdaptiveController::probe(s0, AdaptiveObservation { queue_depth: 10, completed_since_last_probe: 0 });
        let s2 = AdaptiveController::probe(s1, AdaptiveObservation { queue_depth: 50, completed_since_last_probe: 2 });
        assert_eq!(s2.worker_count, s1.worker_count + s1.bounds.scale_up_step);
        assert!(s2.poll_interval <= s1.poll_interval);
    }

    #[test]
    fn scales_up_when_depth_exceeds_capacity_even_if_flat() {
        let s0 = state();
        let s1 = AdaptiveController::probe(s0, AdaptiveObservation { queue_depth: 1000, completed_since_last_probe: 0 });
        let s2 = AdaptiveController::probe(s1, AdaptiveObservation { queue_depth: 1000, completed_since_last_probe: 0 });
        assert!(s2.worker_count > s1.worker_count || s1.worker_count == s1.bounds.max_workers);
    }

    #[test]
    fn scales_down_only_after_stable_rounds() {
        let mut s = state();
        let before = s.worker_count;
        for _ in 0..s.bounds.stable_rounds_before_scale_down - 1 {
            s = AdaptiveController::probe(s, AdaptiveObservation { queue_depth: 0, completed_since_last_probe: 0 });
            assert_eq!(s.worker_count, before);
        }
        s = AdaptiveController::probe(s, AdaptiveObservation { queue_depth: 0, completed_since_last_probe: 0 });
        assert!(s.worker_count < before);
    }

    #[test]
    fn never_scales_below_minimum() {
        let mut s = state();
        s.worker_count = s.bounds.min_workers;
        for _ in 0..10 {
            s = AdaptiveController::probe(s, AdaptiveObservation { queue_depth: 0, completed_since_last_probe: 0 });
        }
        assert_eq!(s.worker_count, s.bounds.min_workers);
    }

    #[test]
    fn never_scales_above_maximum() {
        let mut s = state();
        for _ in 0..50 {
            s = AdaptiveController::probe(s, AdaptiveObservation { queue_depth: 100_000, completed_since_last_probe: 0 });
        }
        assert_eq!(s.worker_count, s.bounds.max_workers);
    }

    #[test]
    fn construction_clamps_out_of_range_initial_values() {
        let bounds = AdaptiveBounds::default();
        let s = AdaptiveState::new(1_000, 1_000, Duration::from_secs(999), bounds);
        assert_eq!(s.worker_count, bounds.max_workers);
        assert_eq!(s.batch_size, bounds.max_batch_size);
        assert_eq!(s.poll_interval, bounds.max_poll_interval);
    }
}
