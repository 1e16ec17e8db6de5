//! Step statistics tracking
//!
//! Counters for one agent's forward steps, swaps and time spent waiting on the
//! fleet.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// Statistics for forward steps
#[derive(Debug)]
pub struct StepStats {
    /// Forward steps completed
    pub steps: AtomicU64,

    /// Steps that failed
    pub steps_failed: AtomicU64,

    /// Steps that issued at least one swap-in
    pub swap_ins: AtomicU64,

    /// Steps that issued at least one swap-out
    pub swap_outs: AtomicU64,

    /// Steps whose swap maps were both empty
    pub swaps_skipped: AtomicU64,

    /// Tokens processed across all steps
    pub tokens: AtomicU64,

    /// Time spent blocked on the step barrier (microseconds)
    pub barrier_wait_us: AtomicU64,

    /// Time spent in broadcast + swap + compute (microseconds)
    pub forward_us: AtomicU64,

    /// Start time for uptime tracking
    pub start_time: Instant,
}

impl Default for StepStats {
    fn default() -> Self {
        Self::new()
    }
}

impl StepStats {
    /// Create new step statistics tracker
    pub fn new() -> Self {
        Self {
            steps: AtomicU64::new(0),
            steps_failed: AtomicU64::new(0),
            swap_ins: AtomicU64::new(0),
            swap_outs: AtomicU64::new(0),
            swaps_skipped: AtomicU64::new(0),
            tokens: AtomicU64::new(0),
            barrier_wait_us: AtomicU64::new(0),
            forward_us: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record the swap work of one step
    pub fn record_swaps(&self, swap_in: usize, swap_out: usize) {
        if swap_in > 0 {
            self.swap_ins.fetch_add(1, Ordering::Relaxed);
        }
        if swap_out > 0 {
            self.swap_outs.fetch_add(1, Ordering::Relaxed);
        }
        if swap_in == 0 && swap_out == 0 {
            self.swaps_skipped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record time spent waiting on the barrier
    pub fn record_barrier_wait(&self, waited: Duration) {
        self.barrier_wait_us
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record a completed step
    pub fn record_step(&self, tokens: usize, elapsed: Duration) {
        self.steps.fetch_add(1, Ordering::Relaxed);
        self.tokens.fetch_add(tokens as u64, Ordering::Relaxed);
        self.forward_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record a failed step
    pub fn record_failure(&self) {
        self.steps_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Average forward latency in milliseconds
    pub fn avg_step_ms(&self) -> f64 {
        let steps = self.steps.load(Ordering::Relaxed);
        if steps == 0 {
            return 0.0;
        }
        self.forward_us.load(Ordering::Relaxed) as f64 / steps as f64 / 1000.0
    }

    /// Average barrier wait in milliseconds
    pub fn avg_barrier_wait_ms(&self) -> f64 {
        let steps = self.steps.load(Ordering::Relaxed);
        if steps == 0 {
            return 0.0;
        }
        self.barrier_wait_us.load(Ordering::Relaxed) as f64 / steps as f64 / 1000.0
    }

    /// Tokens processed per second of forward time
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.forward_us.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        if secs == 0.0 {
            return 0.0;
        }
        self.tokens.load(Ordering::Relaxed) as f64 / secs
    }

    /// Print statistics summary
    pub fn print_summary(&self) {
        info!(
            steps = self.steps.load(Ordering::Relaxed),
            steps_failed = self.steps_failed.load(Ordering::Relaxed),
            tokens = self.tokens.load(Ordering::Relaxed),
            swap_ins = self.swap_ins.load(Ordering::Relaxed),
            swap_outs = self.swap_outs.load(Ordering::Relaxed),
            swaps_skipped = self.swaps_skipped.load(Ordering::Relaxed),
            avg_step_ms = format!("{:.3}", self.avg_step_ms()),
            avg_barrier_wait_ms = format!("{:.3}", self.avg_barrier_wait_ms()),
            tokens_per_second = format!("{:.1}", self.tokens_per_second()),
            uptime_s = self.start_time.elapsed().as_secs(),
            "Step statistics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_swaps() {
        let stats = StepStats::new();
        stats.record_swaps(0, 0);
        stats.record_swaps(2, 0);
        stats.record_swaps(1, 1);
        assert_eq!(stats.swaps_skipped.load(Ordering::Relaxed), 1);
        assert_eq!(stats.swap_ins.load(Ordering::Relaxed), 2);
        assert_eq!(stats.swap_outs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_averages() {
        let stats = StepStats::new();
        assert_eq!(stats.avg_step_ms(), 0.0);
        assert_eq!(stats.tokens_per_second(), 0.0);

        stats.record_step(10, Duration::from_millis(2));
        stats.record_step(10, Duration::from_millis(4));
        stats.record_barrier_wait(Duration::from_millis(1));
        assert!((stats.avg_step_ms() - 3.0).abs() < 1e-9);
        assert!((stats.avg_barrier_wait_ms() - 0.5).abs() < 1e-9);
        assert!((stats.tokens_per_second() - 20.0 / 0.006).abs() < 1e-6);
    }
}
