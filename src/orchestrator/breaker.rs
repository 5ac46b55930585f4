//! Run-level circuit breaker

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Counts consecutive task failures and opens once they reach the threshold
///
/// Once open it stays open for the rest of the run; a later success no longer
/// resets the count.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    consecutive: AtomicU32,
    open: AtomicBool,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: AtomicU32::new(0),
            open: AtomicBool::new(false),
        }
    }

    /// Configured threshold
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Whether new tasks must not start
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Current run of consecutive failures
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive.load(Ordering::SeqCst)
    }

    /// A task succeeded
    pub fn record_success(&self) {
        if !self.is_open() {
            self.consecutive.store(0, Ordering::SeqCst);
        }
    }

    /// A task failed; returns true for the one call that opened the breaker
    pub fn record_failure(&self) -> bool {
        let failures = self.consecutive.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        failures >= self.threshold && !self.open.swap(true, Ordering::SeqCst)
    }
}
