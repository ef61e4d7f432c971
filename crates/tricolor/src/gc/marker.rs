//! Shared marking state and its configuration.
//!
//! The [`Coordinator`] is the per-collection bookkeeping every tracer is
//! handed at construction: the two shared mark stacks (one fed by normal
//! discovery, one by the write barrier), the active/waiting counters of the
//! shared-drain protocol, the exit flag, and the shared opaque-root set. All
//! of it lives behind one mutex paired with one condition variable. The
//! coordinator holds no tracing logic of its own.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex, MutexGuard};

use super::worklist::MarkStack;
use crate::cell::{CellRef, OpaqueRoot};
use crate::heap::{SnapshotBuilder, UnconditionalFinalizer, WeakReferenceHarvester};

/// Default number of cells scanned between donation attempts.
pub const DEFAULT_MIN_SCANS_BETWEEN_REBALANCE: usize = 100;
/// Default size at which a local opaque-root buffer is merged eagerly.
pub const DEFAULT_OPAQUE_ROOT_MERGE_THRESHOLD: usize = 1000;

/// Configuration for parallel marking behavior.
#[derive(Clone, Copy, Debug)]
pub struct ParallelMarkConfig {
    /// Number of marker tasks, including the master. 1 disables donation.
    pub number_of_markers: usize,
    /// Cells scanned from one stack before the tracer tries to donate.
    pub min_scans_between_rebalance: usize,
    /// Local opaque-root buffer size that triggers a merge.
    pub opaque_root_merge_threshold: usize,
    /// Time budget of one marking slice; `None` marks to completion.
    pub slice_timeout: Option<Duration>,
}

impl Default for ParallelMarkConfig {
    fn default() -> Self {
        Self {
            number_of_markers: available_parallelism(),
            min_scans_between_rebalance: DEFAULT_MIN_SCANS_BETWEEN_REBALANCE,
            opaque_root_merge_threshold: DEFAULT_OPAQUE_ROOT_MERGE_THRESHOLD,
            slice_timeout: None,
        }
    }
}

impl ParallelMarkConfig {
    /// Create a configuration for `number_of_markers` marker tasks.
    #[must_use]
    pub fn new(number_of_markers: usize) -> Self {
        Self {
            number_of_markers: number_of_markers.max(1),
            ..Default::default()
        }
    }

    /// Number of marker tasks actually used (at least 1).
    #[must_use]
    pub fn effective_markers(&self) -> usize {
        self.number_of_markers.max(1)
    }

    /// Whether more than one marker takes part.
    #[must_use]
    pub fn use_parallel(&self) -> bool {
        self.effective_markers() > 1
    }

    /// Set the number of marker tasks.
    pub const fn set_number_of_markers(&mut self, markers: usize) {
        self.number_of_markers = if markers < 1 { 1 } else { markers };
    }

    /// Set how many cells are scanned between donation attempts.
    pub const fn set_min_scans_between_rebalance(&mut self, scans: usize) {
        self.min_scans_between_rebalance = if scans < 1 { 1 } else { scans };
    }

    /// Set the opaque-root merge threshold.
    pub const fn set_opaque_root_merge_threshold(&mut self, threshold: usize) {
        self.opaque_root_merge_threshold = threshold;
    }

    /// Set the marking slice budget.
    pub const fn set_slice_timeout(&mut self, timeout: Option<Duration>) {
        self.slice_timeout = timeout;
    }
}

/// Get the number of CPUs available for parallel marking.
#[must_use]
pub fn available_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

/// How a tracer takes part in [`Tracer::drain_from_shared`].
///
/// [`Tracer::drain_from_shared`]: super::Tracer::drain_from_shared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedDrainMode {
    /// The elected tracer that detects termination and releases the others.
    Master,
    /// Any other tracer; returns once termination has been signaled.
    Participant,
}

/// Outcome of a shared drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum SharedDrainResult {
    /// Every tracer is idle and both shared stacks are empty.
    Done,
    /// The deadline elapsed first. The tracer may re-enter later.
    TimedOut,
}

/// State guarded by the coordinator's mutex.
///
/// The methods here are the counter transitions of the shared-drain
/// protocol. Callers hold the coordinator's lock around every call.
#[derive(Debug, Default)]
pub struct SharedMarkState {
    pub(crate) collector_stack: MarkStack,
    pub(crate) mutator_stack: MarkStack,
    pub(crate) active: usize,
    pub(crate) waiting: usize,
    pub(crate) should_exit: bool,
    pub(crate) abandoned: bool,
    pub(crate) opaque_roots: HashSet<OpaqueRoot>,
}

impl SharedMarkState {
    /// Whether either shared stack holds cells.
    #[must_use]
    pub fn has_work(&self) -> bool {
        !self.collector_stack.is_empty() || !self.mutator_stack.is_empty()
    }

    /// No tracer is active and nothing is left to steal.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.active == 0 && !self.has_work()
    }

    /// Number of tracers currently scanning.
    #[must_use]
    pub const fn active(&self) -> usize {
        self.active
    }

    /// Number of tracers blocked waiting for shared work.
    #[must_use]
    pub const fn waiting(&self) -> usize {
        self.waiting
    }

    /// Whether the exit flag is raised.
    #[must_use]
    pub const fn should_exit(&self) -> bool {
        self.should_exit
    }

    /// Whether a tracer panicked during the current parallel phase.
    #[must_use]
    pub const fn is_abandoned(&self) -> bool {
        self.abandoned
    }

    /// Count `participants` tracers as active and clear both flags.
    pub fn start_phase(&mut self, participants: usize) {
        self.active = participants;
        self.waiting = 0;
        self.should_exit = false;
        self.abandoned = false;
    }

    /// Raise the exit flag.
    pub fn raise_exit(&mut self) {
        self.should_exit = true;
    }

    /// Move the calling tracer from active to waiting.
    ///
    /// # Panics
    ///
    /// Panics if no tracer is counted as active.
    pub fn begin_waiting(&mut self) {
        assert!(
            self.active > 0,
            "tracer entered the shared drain without being counted as active"
        );
        self.active -= 1;
        self.waiting += 1;
    }

    /// Move the calling tracer from waiting back to active.
    pub fn end_waiting(&mut self) {
        self.waiting -= 1;
        self.active += 1;
    }

    /// Steal into the given local stacks, sharing the work among every
    /// waiting tracer, and count the caller as active again.
    pub fn steal_into(&mut self, collector: &mut MarkStack, mutator: &mut MarkStack) -> usize {
        let idle = self.waiting;
        let stolen = collector.steal_some_cells_from(&mut self.collector_stack, idle)
            + mutator.steal_some_cells_from(&mut self.mutator_stack, idle);
        self.end_waiting();
        stolen
    }

    /// The shared stack fed by normal discovery.
    pub fn collector_stack_mut(&mut self) -> &mut MarkStack {
        &mut self.collector_stack
    }

    /// The shared stack fed by the write barrier.
    pub fn mutator_stack_mut(&mut self) -> &mut MarkStack {
        &mut self.mutator_stack
    }
}

/// Per-collection shared bookkeeping for a group of tracers.
pub struct Coordinator {
    config: ParallelMarkConfig,
    state: Mutex<SharedMarkState>,
    condvar: Condvar,
    weak_reference_harvesters: Mutex<Vec<Arc<dyn WeakReferenceHarvester>>>,
    unconditional_finalizers: SegQueue<Box<dyn UnconditionalFinalizer>>,
    snapshot_builder: Mutex<Option<Arc<dyn SnapshotBuilder>>>,
    extra_memory_visited: AtomicUsize,
}

impl Coordinator {
    /// Create a coordinator for `config.number_of_markers` tracers.
    #[must_use]
    pub fn new(config: ParallelMarkConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SharedMarkState::default()),
            condvar: Condvar::new(),
            weak_reference_harvesters: Mutex::new(Vec::new()),
            unconditional_finalizers: SegQueue::new(),
            snapshot_builder: Mutex::new(None),
            extra_memory_visited: AtomicUsize::new(0),
        }
    }

    /// The configuration the coordinator was built with.
    #[must_use]
    pub const fn config(&self) -> &ParallelMarkConfig {
        &self.config
    }

    /// Whether more than one marker takes part.
    #[must_use]
    pub fn is_parallel(&self) -> bool {
        self.config.use_parallel()
    }

    /// Prepare the shared state for a new marking cycle.
    ///
    /// Clears the opaque-root set, the harvester list and the extra-memory
    /// counter.
    ///
    /// # Panics
    ///
    /// Panics if a shared stack still holds cells from the previous cycle.
    pub fn did_start_marking(&self) {
        let mut state = self.state.lock();
        assert!(
            !state.has_work(),
            "shared mark stacks must be empty at the start of a cycle"
        );
        state.opaque_roots.clear();
        state.start_phase(0);
        drop(state);
        self.weak_reference_harvesters.lock().clear();
        self.extra_memory_visited.store(0, Ordering::Relaxed);
    }

    /// Open a parallel phase with `participants` tracers, all active.
    ///
    /// Every tracer entering the phase is assumed to be draining locally
    /// until its first call to the shared-drain protocol, so termination
    /// cannot be detected while any of them may still produce work.
    pub fn start_parallel_phase(&self, participants: usize) {
        self.state.lock().start_phase(participants);
    }

    /// Raise the exit flag and wake every waiting tracer.
    pub fn request_exit(&self) {
        self.state.lock().raise_exit();
        self.condvar.notify_all();
    }

    /// Give up on the current parallel phase after a tracer panicked.
    ///
    /// Every tracer blocked in the shared drain wakes up and leaves, so the
    /// panic can reach whoever joins the marker threads.
    pub fn abandon_parallel_phase(&self) {
        let mut state = self.state.lock();
        state.abandoned = true;
        state.raise_exit();
        drop(state);
        self.condvar.notify_all();
    }

    /// Whether the exit flag is raised.
    #[must_use]
    pub fn should_exit(&self) -> bool {
        self.state.lock().should_exit()
    }

    /// Number of tracers currently scanning.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.state.lock().active()
    }

    /// Number of tracers blocked waiting for shared work.
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiting()
    }

    /// Whether either shared stack holds cells.
    #[must_use]
    pub fn has_shared_work(&self) -> bool {
        self.state.lock().has_work()
    }

    /// Number of cells in the shared collector stack.
    #[must_use]
    pub fn shared_collector_len(&self) -> usize {
        self.state.lock().collector_stack.len()
    }

    /// Number of cells in the shared mutator stack.
    #[must_use]
    pub fn shared_mutator_len(&self) -> usize {
        self.state.lock().mutator_stack.len()
    }

    /// Queue cells recorded by the write barrier for a re-scan and wake
    /// waiting tracers. Returns how many cells were queued.
    pub fn append_barriered_cells<I>(&self, cells: I) -> usize
    where
        I: IntoIterator<Item = CellRef>,
    {
        let mut state = self.state.lock();
        let before = state.mutator_stack.len();
        state.mutator_stack.extend(cells);
        let added = state.mutator_stack.len() - before;
        drop(state);
        if added > 0 {
            self.condvar.notify_all();
        }
        added
    }

    /// Whether `root` is in the shared opaque-root set.
    #[must_use]
    pub fn contains_opaque_root(&self, root: OpaqueRoot) -> bool {
        self.state.lock().opaque_roots.contains(&root)
    }

    /// Number of roots in the shared opaque-root set.
    #[must_use]
    pub fn opaque_root_count(&self) -> usize {
        self.state.lock().opaque_roots.len()
    }

    /// Add `root` directly to the shared set.
    pub fn add_opaque_root(&self, root: OpaqueRoot) {
        self.state.lock().opaque_roots.insert(root);
    }

    /// Union `roots` into the shared set, leaving `roots` empty.
    pub fn merge_opaque_roots(&self, roots: &mut HashSet<OpaqueRoot>) {
        if roots.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        state.opaque_roots.extend(roots.drain());
    }

    /// Register a harvester to run once this cycle's marking reaches a fixed
    /// point. Registrations last until the next cycle starts.
    pub fn add_weak_reference_harvester(&self, harvester: Arc<dyn WeakReferenceHarvester>) {
        self.weak_reference_harvesters.lock().push(harvester);
    }

    /// Snapshot of the registered harvesters.
    #[must_use]
    pub fn weak_reference_harvesters(&self) -> Vec<Arc<dyn WeakReferenceHarvester>> {
        self.weak_reference_harvesters.lock().clone()
    }

    /// Queue a finalizer to run once after marking.
    pub fn add_unconditional_finalizer(&self, finalizer: Box<dyn UnconditionalFinalizer>) {
        self.unconditional_finalizers.push(finalizer);
    }

    /// Take the next queued finalizer.
    pub fn take_unconditional_finalizer(&self) -> Option<Box<dyn UnconditionalFinalizer>> {
        self.unconditional_finalizers.pop()
    }

    /// Number of queued finalizers.
    #[must_use]
    pub fn pending_finalizers(&self) -> usize {
        self.unconditional_finalizers.len()
    }

    /// Install or remove the heap snapshot recorder used by the next cycle.
    pub fn set_snapshot_builder(&self, builder: Option<Arc<dyn SnapshotBuilder>>) {
        *self.snapshot_builder.lock() = builder;
    }

    /// The active snapshot recorder, if any.
    #[must_use]
    pub fn snapshot_builder(&self) -> Option<Arc<dyn SnapshotBuilder>> {
        self.snapshot_builder.lock().clone()
    }

    /// Account for out-of-heap memory kept alive by a visited cell.
    pub fn report_extra_memory_visited(&self, bytes: usize) {
        self.extra_memory_visited.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Extra memory reported during this cycle.
    #[must_use]
    pub fn extra_memory_visited(&self) -> usize {
        self.extra_memory_visited.load(Ordering::Relaxed)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SharedMarkState> {
        self.state.lock()
    }

    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, SharedMarkState>> {
        self.state.try_lock()
    }

    pub(crate) const fn condvar(&self) -> &Condvar {
        &self.condvar
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .field("pending_finalizers", &self.unconditional_finalizers.len())
            .finish_non_exhaustive()
    }
}
