//! Running a full marking cycle on several threads.
//!
//! [`ParallelMarker`] owns one [`Tracer`] per marker task. The first tracer
//! is the master: roots are appended to it and it drives termination. A
//! cycle is:
//!
//! 1. [`ParallelMarker::begin_cycle`] prepares the coordinator and tracers.
//! 2. Roots are appended through [`ParallelMarker::master`].
//! 3. [`ParallelMarker::mark`] runs parallel rounds on scoped threads until
//!    no work is left anywhere, or the deadline elapses. Barrier work that
//!    arrives between rounds is picked up by the next round.
//! 4. [`ParallelMarker::finish_cycle`] harvests weak references to a fixed
//!    point, runs unconditional finalizers and reports [`MarkMetrics`].

use std::sync::Arc;
use std::time::Instant;

use super::marker::{Coordinator, ParallelMarkConfig, SharedDrainMode, SharedDrainResult};
use super::sync::{Deadline, ParallelModeEnabler};
use super::tracer::Tracer;
use super::tracing::{next_gc_id, GcId};
use crate::heap::{Allocator, CollectionScope, ConservativeRoots, MarkingVersion, ObjectModel};
use crate::metrics::{record_metrics, MarkMetrics, PhaseTimer};

/// Abandons the parallel phase if its tracer unwinds, so the other tracers
/// stop waiting for it and the scope can join.
struct AbandonOnPanic<'a>(&'a Coordinator);

impl Drop for AbandonOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.abandon_parallel_phase();
        }
    }
}

/// A group of tracers sharing one coordinator.
pub struct ParallelMarker {
    coordinator: Arc<Coordinator>,
    allocator: Arc<dyn Allocator>,
    /// Never empty; index 0 is the master.
    tracers: Vec<Tracer>,
    cycle: Option<Cycle>,
}

struct Cycle {
    gc_id: GcId,
    scope: CollectionScope,
    version: MarkingVersion,
    started: Instant,
    timer: PhaseTimer,
    rounds: usize,
    timed_out_rounds: usize,
    #[cfg(feature = "tracing")]
    span: tracing::Span,
}

impl ParallelMarker {
    /// Create `config.number_of_markers` tracers over `allocator` and
    /// `model`.
    #[must_use]
    pub fn new(
        config: ParallelMarkConfig,
        allocator: Arc<dyn Allocator>,
        model: Arc<dyn ObjectModel>,
    ) -> Self {
        let coordinator = Arc::new(Coordinator::new(config));
        let tracers = (0..config.effective_markers())
            .map(|_| Tracer::new(Arc::clone(&coordinator), Arc::clone(&allocator), Arc::clone(&model)))
            .collect();
        Self {
            coordinator,
            allocator,
            tracers,
            cycle: None,
        }
    }

    /// The shared coordinator, for barriers and harvester registration.
    #[must_use]
    pub const fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// The master tracer; roots are appended here.
    pub fn master(&mut self) -> &mut Tracer {
        &mut self.tracers[0]
    }

    /// Every tracer, master first.
    #[must_use]
    pub fn tracers(&self) -> &[Tracer] {
        &self.tracers
    }

    /// Whether a cycle has begun and not yet finished.
    #[must_use]
    pub const fn is_marking(&self) -> bool {
        self.cycle.is_some()
    }

    /// Whether any tracer or shared stack still holds cells.
    #[must_use]
    pub fn has_pending_work(&self) -> bool {
        self.coordinator.has_shared_work() || self.tracers.iter().any(|tracer| !tracer.is_empty())
    }

    /// Prepare every tracer and the coordinator for a new cycle.
    ///
    /// The allocator must already have moved to the cycle's marking
    /// version.
    ///
    /// # Panics
    ///
    /// Panics if a cycle is already running or work from the previous one
    /// is still queued.
    pub fn begin_cycle(&mut self, scope: CollectionScope) {
        assert!(self.cycle.is_none(), "a marking cycle is already running");

        self.coordinator.did_start_marking();
        for tracer in &mut self.tracers {
            tracer.did_start_marking(scope);
        }

        let gc_id = next_gc_id();
        let version = self.allocator.marking_version();
        self.cycle = Some(Cycle {
            gc_id,
            scope,
            version,
            started: Instant::now(),
            timer: PhaseTimer::new(),
            rounds: 0,
            timed_out_rounds: 0,
            #[cfg(feature = "tracing")]
            span: super::tracing::span_marking_cycle(scope, version, self.tracers.len(), gc_id),
        });
    }

    /// Mark until no work is left or `deadline` elapses.
    ///
    /// On [`SharedDrainResult::TimedOut`] unfinished work stays queued and
    /// a later call resumes it.
    ///
    /// # Panics
    ///
    /// Panics if no cycle is running.
    pub fn mark(&mut self, deadline: Deadline) -> SharedDrainResult {
        loop {
            let result = self.run_round(deadline);
            if result == SharedDrainResult::TimedOut {
                return result;
            }
            if !self.has_pending_work() {
                return SharedDrainResult::Done;
            }
        }
    }

    /// Mark in slices of the configured `slice_timeout` until done.
    pub fn mark_to_completion(&mut self) {
        let timeout = self.coordinator.config().slice_timeout;
        loop {
            let deadline = timeout.map_or_else(Deadline::never, Deadline::after);
            if self.mark(deadline) == SharedDrainResult::Done {
                return;
            }
        }
    }

    fn run_round(&mut self, deadline: Deadline) -> SharedDrainResult {
        let Some(cycle) = self.cycle.as_mut() else {
            panic!("mark called outside a marking cycle");
        };
        #[cfg(feature = "tracing")]
        let _entered = cycle.span.enter();

        cycle.timer.start();
        self.coordinator.start_parallel_phase(self.tracers.len());

        let coordinator: &Coordinator = &self.coordinator;
        let Some((master, participants)) = self.tracers.split_first_mut() else {
            return SharedDrainResult::Done;
        };

        let result = crossbeam::thread::scope(|scope| {
            for tracer in participants.iter_mut() {
                scope.spawn(move |_| {
                    let _guard = AbandonOnPanic(coordinator);
                    ParallelModeEnabler::new(tracer)
                        .drain_from_shared(SharedDrainMode::Participant, deadline)
                });
            }
            let _guard = AbandonOnPanic(coordinator);
            ParallelModeEnabler::new(master).drain_in_parallel(deadline)
        })
        .unwrap_or_else(|panic| std::panic::resume_unwind(panic));

        cycle.timer.end_mark();
        cycle.rounds += 1;
        if result == SharedDrainResult::TimedOut {
            cycle.timed_out_rounds += 1;
        }

        #[cfg(feature = "tracing")]
        super::tracing::log_round(cycle.rounds, result);

        result
    }

    /// Reach the final fixed point and close the cycle.
    ///
    /// Marks any remaining work, lets weak-reference harvesters append new
    /// references until none appear, runs the unconditional finalizers and
    /// resets every tracer.
    ///
    /// # Panics
    ///
    /// Panics if no cycle is running.
    pub fn finish_cycle(&mut self) -> MarkMetrics {
        assert!(self.cycle.is_some(), "finish_cycle called outside a marking cycle");

        loop {
            if self.has_pending_work() {
                self.mark_to_completion();
            }
            self.with_timer(PhaseTimer::start, PhaseTimer::end_harvest, |marker| {
                marker.tracers[0].harvest_weak_references();
            });
            if !self.has_pending_work() {
                break;
            }
        }
        self.tracers[0].merge_opaque_roots_if_necessary();

        let pending = self.coordinator.pending_finalizers();
        self.with_timer(PhaseTimer::start, PhaseTimer::end_finalize, |marker| {
            marker.tracers[0].finalize_unconditionally();
        });

        let Some(cycle) = self.cycle.take() else {
            panic!("finish_cycle called outside a marking cycle");
        };

        let mut metrics = MarkMetrics::new(cycle.gc_id, cycle.scope, cycle.version);
        metrics.markers = self.tracers.len();
        for tracer in &mut self.tracers {
            assert!(tracer.is_empty(), "tracer still holds cells after marking");
            metrics.visit_count += tracer.visit_count();
            metrics.bytes_visited += tracer.bytes_visited();
            tracer.reset();
        }
        metrics.extra_memory_visited = self.coordinator.extra_memory_visited();
        metrics.opaque_roots = self.coordinator.opaque_root_count();
        metrics.rounds = cycle.rounds;
        metrics.timed_out_rounds = cycle.timed_out_rounds;
        metrics.finalizers_run = pending;
        metrics.mark_duration = cycle.timer.mark;
        metrics.harvest_duration = cycle.timer.harvest;
        metrics.finalize_duration = cycle.timer.finalize;
        metrics.duration = cycle.started.elapsed();

        #[cfg(feature = "tracing")]
        {
            let _entered = cycle.span.enter();
            super::tracing::log_cycle_end(&metrics);
        }
        record_metrics(&metrics);
        metrics
    }

    fn with_timer(
        &mut self,
        start: fn(&mut PhaseTimer),
        end: fn(&mut PhaseTimer),
        phase: impl FnOnce(&mut Self),
    ) {
        if let Some(cycle) = self.cycle.as_mut() {
            start(&mut cycle.timer);
        }
        phase(self);
        if let Some(cycle) = self.cycle.as_mut() {
            end(&mut cycle.timer);
        }
    }

    /// Run a whole cycle from conservative roots.
    pub fn collect(&mut self, scope: CollectionScope, roots: &ConservativeRoots) -> MarkMetrics {
        self.begin_cycle(scope);
        self.master().append_conservative_roots(roots);
        self.mark_to_completion();
        self.finish_cycle()
    }
}

impl std::fmt::Debug for ParallelMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelMarker")
            .field("markers", &self.tracers.len())
            .field("is_marking", &self.cycle.is_some())
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}
