//! Marking metrics and statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::gc::tracing::GcId;
use crate::heap::{CollectionScope, MarkingVersion};

/// Statistics from one marking cycle.
#[derive(Debug, Clone, Copy)]
pub struct MarkMetrics {
    /// Identifier of the cycle.
    pub gc_id: GcId,
    /// Which part of the heap was traced.
    pub scope: CollectionScope,
    /// Version the cycle marked with.
    pub marking_version: MarkingVersion,
    /// Number of marker tasks.
    pub markers: usize,
    /// Cells visited, summed over all tracers.
    pub visit_count: usize,
    /// Bytes of cells visited, summed over all tracers.
    pub bytes_visited: usize,
    /// Out-of-heap bytes reported by visited cells.
    pub extra_memory_visited: usize,
    /// Size of the shared opaque-root set at the end of marking.
    pub opaque_roots: usize,
    /// Parallel rounds run, including the ones that timed out.
    pub rounds: usize,
    /// Rounds that ended because their slice budget ran out.
    pub timed_out_rounds: usize,
    /// Unconditional finalizers run.
    pub finalizers_run: usize,
    /// Total duration of the cycle.
    pub duration: Duration,
    /// Time spent in parallel rounds.
    pub mark_duration: Duration,
    /// Time spent harvesting weak references to a fixed point.
    pub harvest_duration: Duration,
    /// Time spent running finalizers.
    pub finalize_duration: Duration,
}

impl MarkMetrics {
    /// Create metrics for a cycle that has not done any work yet.
    #[must_use]
    pub const fn new(gc_id: GcId, scope: CollectionScope, marking_version: MarkingVersion) -> Self {
        Self {
            gc_id,
            scope,
            marking_version,
            markers: 0,
            visit_count: 0,
            bytes_visited: 0,
            extra_memory_visited: 0,
            opaque_roots: 0,
            rounds: 0,
            timed_out_rounds: 0,
            finalizers_run: 0,
            duration: Duration::ZERO,
            mark_duration: Duration::ZERO,
            harvest_duration: Duration::ZERO,
            finalize_duration: Duration::ZERO,
        }
    }
}

/// Helper for capturing phase durations of a cycle.
///
/// Phases may run several times per cycle (one mark phase per slice), so
/// durations accumulate.
///
/// # Example
///
/// ```
/// use tricolor::metrics::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... parallel round ...
/// timer.end_mark();
///
/// timer.start();
/// // ... weak reference harvesting ...
/// timer.end_harvest();
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    /// Accumulated marking time.
    pub mark: Duration,
    /// Accumulated harvesting time.
    pub harvest: Duration,
    /// Accumulated finalization time.
    pub finalize: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// Create a new `PhaseTimer` with all durations set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mark: Duration::ZERO,
            harvest: Duration::ZERO,
            finalize: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    fn take(&mut self) -> Duration {
        self.current_start
            .take()
            .map_or(Duration::ZERO, |start| start.elapsed())
    }

    /// End a mark phase and add its duration.
    pub fn end_mark(&mut self) {
        let elapsed = self.take();
        self.mark += elapsed;
    }

    /// End a harvest phase and add its duration.
    pub fn end_harvest(&mut self) {
        let elapsed = self.take();
        self.harvest += elapsed;
    }

    /// End a finalize phase and add its duration.
    pub fn end_finalize(&mut self) {
        let elapsed = self.take();
        self.finalize += elapsed;
    }
}

/// Process-level cumulative marking statistics.
///
/// # Example
///
/// ```
/// use tricolor::metrics::global_metrics;
///
/// let metrics = global_metrics();
/// println!("Cycles: {}", metrics.total_cycles());
/// ```
#[derive(Debug)]
pub struct GlobalMetrics {
    cycles: AtomicUsize,
    cells_visited: AtomicUsize,
    bytes_visited: AtomicUsize,
    timed_out_rounds: AtomicUsize,
    mark_ns: AtomicU64,
}

impl Default for GlobalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalMetrics {
    /// Create a new `GlobalMetrics` with all counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cycles: AtomicUsize::new(0),
            cells_visited: AtomicUsize::new(0),
            bytes_visited: AtomicUsize::new(0),
            timed_out_rounds: AtomicUsize::new(0),
            mark_ns: AtomicU64::new(0),
        }
    }

    /// Returns the number of finished marking cycles.
    #[inline]
    #[must_use]
    pub fn total_cycles(&self) -> usize {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Returns the number of cells visited over all cycles.
    #[inline]
    #[must_use]
    pub fn total_cells_visited(&self) -> usize {
        self.cells_visited.load(Ordering::Relaxed)
    }

    /// Returns the number of bytes visited over all cycles.
    #[inline]
    #[must_use]
    pub fn total_bytes_visited(&self) -> usize {
        self.bytes_visited.load(Ordering::Relaxed)
    }

    /// Returns the number of rounds that ran out of time.
    #[inline]
    #[must_use]
    pub fn total_timed_out_rounds(&self) -> usize {
        self.timed_out_rounds.load(Ordering::Relaxed)
    }

    /// Returns the total time spent in parallel rounds, in nanoseconds.
    #[inline]
    #[must_use]
    pub fn total_mark_ns(&self) -> u64 {
        self.mark_ns.load(Ordering::Relaxed)
    }

    fn record(&self, metrics: &MarkMetrics) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.cells_visited
            .fetch_add(metrics.visit_count, Ordering::Relaxed);
        self.bytes_visited
            .fetch_add(metrics.bytes_visited, Ordering::Relaxed);
        self.timed_out_rounds
            .fetch_add(metrics.timed_out_rounds, Ordering::Relaxed);
        self.mark_ns.fetch_add(
            metrics.mark_duration.as_nanos().try_into().unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }
}

static GLOBAL_METRICS: GlobalMetrics = GlobalMetrics::new();

/// Get the cumulative marking statistics of this process.
#[must_use]
pub fn global_metrics() -> &'static GlobalMetrics {
    &GLOBAL_METRICS
}

/// Record a finished cycle.
pub(crate) fn record_metrics(metrics: &MarkMetrics) {
    GLOBAL_METRICS.record(metrics);
}
