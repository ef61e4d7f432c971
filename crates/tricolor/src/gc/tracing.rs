//! Marking spans and events.
//!
//! With the `tracing` feature enabled, this module provides structured
//! spans and events for marking cycles and the shared-drain protocol.
//! [`GcId`] is always available so cycles can be correlated in metrics.

use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "tracing")]
use tracing::Span;

#[cfg(feature = "tracing")]
use super::marker::{SharedDrainMode, SharedDrainResult};
#[cfg(feature = "tracing")]
use crate::heap::{CollectionScope, MarkingVersion};
#[cfg(feature = "tracing")]
use crate::metrics::MarkMetrics;

/// Stable identifier for one marking cycle.
///
/// Monotonically increasing, starting at 1. Every span and event of a cycle
/// carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GcId(pub u64);

static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

/// Generate the next cycle identifier.
pub fn next_gc_id() -> GcId {
    GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
}

/// Create a span covering one marking cycle.
#[cfg(feature = "tracing")]
pub fn span_marking_cycle(
    scope: CollectionScope,
    version: MarkingVersion,
    markers: usize,
    gc_id: GcId,
) -> Span {
    tracing::debug_span!(
        "marking_cycle",
        scope = ?scope,
        version = version.0,
        markers = markers,
        gc_id = gc_id.0
    )
}

/// Create a span for one tracer's stay in the shared drain.
#[cfg(feature = "tracing")]
pub fn span_drain_from_shared(mode: SharedDrainMode) -> Span {
    tracing::trace_span!("drain_from_shared", mode = ?mode)
}

/// Log cells handed to the shared stacks.
#[cfg(feature = "tracing")]
pub fn log_donation(collector: usize, mutator: usize) {
    tracing::trace!(donated = collector, donated_barrier = mutator, "donation");
}

/// Log cells taken from the shared stacks.
#[cfg(feature = "tracing")]
pub fn log_steal(stolen: usize, active: usize, waiting: usize) {
    tracing::trace!(stolen, active, waiting, "steal");
}

/// Log termination detected by a tracer.
#[cfg(feature = "tracing")]
pub fn log_termination(mode: SharedDrainMode, waiting: usize) {
    tracing::debug!(mode = ?mode, waiting, "termination");
}

/// Log a shared drain that ran out of time.
#[cfg(feature = "tracing")]
pub fn log_timeout(mode: SharedDrainMode, active: usize, waiting: usize) {
    tracing::debug!(mode = ?mode, active, waiting, "timeout");
}

/// Log the outcome of one parallel round.
#[cfg(feature = "tracing")]
pub fn log_round(round: usize, result: SharedDrainResult) {
    tracing::debug!(round, result = ?result, "parallel_round");
}

/// Log the summary of a finished cycle.
#[cfg(feature = "tracing")]
pub fn log_cycle_end(metrics: &MarkMetrics) {
    tracing::debug!(
        gc_id = metrics.gc_id.0,
        visit_count = metrics.visit_count,
        bytes_visited = metrics.bytes_visited,
        extra_memory_visited = metrics.extra_memory_visited,
        opaque_roots = metrics.opaque_roots,
        rounds = metrics.rounds,
        duration_us = u64::try_from(metrics.duration.as_micros()).unwrap_or(u64::MAX),
        "cycle_end"
    );
}

#[cfg(test)]
mod tests {
    use super::next_gc_id;

    #[test]
    fn test_gc_ids_increase() {
        let first = next_gc_id();
        let second = next_gc_id();
        assert!(second.0 > first.0);
    }
}
