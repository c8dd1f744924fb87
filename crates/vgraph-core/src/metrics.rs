//! Global atomic counters for vgraph observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. when a command or daemon tick finishes).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters; no allocations, no locking.
pub struct Metrics {
    rows_written: AtomicU64,
    change_sets_applied: AtomicU64,
    change_sets_canceled: AtomicU64,
    propagations: AtomicU64,
    func_executions: AtomicU64,
    execution_faults: AtomicU64,
    events_dispatched: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            rows_written: AtomicU64::new(0),
            change_sets_applied: AtomicU64::new(0),
            change_sets_canceled: AtomicU64::new(0),
            propagations: AtomicU64::new(0),
            func_executions: AtomicU64::new(0),
            execution_faults: AtomicU64::new(0),
            events_dispatched: AtomicU64::new(0),
        }
    }

    /// Increment the rows-written counter by one.
    pub fn inc_rows_written(&self) {
        self.add_rows_written(1);
    }

    pub fn add_rows_written(&self, rows: u64) {
        self.rows_written.fetch_add(rows, Ordering::Relaxed);
        tracing::trace!(metric = "rows_written", rows, "counter incremented");
    }

    pub fn inc_change_sets_applied(&self) {
        self.change_sets_applied.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "change_sets_applied", "counter incremented");
    }

    pub fn inc_change_sets_canceled(&self) {
        self.change_sets_canceled.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "change_sets_canceled", "counter incremented");
    }

    /// Increment once per settled propagation run.
    pub fn inc_propagations(&self) {
        self.propagations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "propagations", "counter incremented");
    }

    /// Increment once per pipeline attempt, successful or not.
    pub fn inc_func_executions(&self) {
        self.func_executions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "func_executions", "counter incremented");
    }

    pub fn inc_execution_faults(&self) {
        self.execution_faults.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "execution_faults", "counter incremented");
    }

    pub fn inc_events_dispatched(&self) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "events_dispatched", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries rather than on every increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            rows_written = self.rows_written(),
            change_sets_applied = self.change_sets_applied(),
            change_sets_canceled = self.change_sets_canceled(),
            propagations = self.propagations(),
            func_executions = self.func_executions(),
            execution_faults = self.execution_faults(),
            events_dispatched = self.events_dispatched(),
        );
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Relaxed)
    }

    pub fn change_sets_applied(&self) -> u64 {
        self.change_sets_applied.load(Ordering::Relaxed)
    }

    pub fn change_sets_canceled(&self) -> u64 {
        self.change_sets_canceled.load(Ordering::Relaxed)
    }

    pub fn propagations(&self) -> u64 {
        self.propagations.load(Ordering::Relaxed)
    }

    pub fn func_executions(&self) -> u64 {
        self.func_executions.load(Ordering::Relaxed)
    }

    pub fn execution_faults(&self) -> u64 {
        self.execution_faults.load(Ordering::Relaxed)
    }

    pub fn events_dispatched(&self) -> u64 {
        self.events_dispatched.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.rows_written,
            &self.change_sets_applied,
            &self.change_sets_canceled,
            &self.propagations,
            &self.func_executions,
            &self.execution_faults,
            &self.events_dispatched,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
