//! The per-task tracer.
//!
//! A [`Tracer`] is the visitor one marker task uses to walk the object
//! graph. It owns two local mark stacks: the collector stack, fed by normal
//! discovery, and the mutator stack, fed by the write barrier. It drains
//! them depth-first, hands surplus work to the [`Coordinator`] and buffers
//! opaque roots locally until a merge point.
//!
//! Exactly-once queueing is not the tracer's doing: it relies on the
//! allocator's atomic test-and-set, so two tracers racing to append the
//! same cell cannot both push it.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use super::marker::{Coordinator, SharedMarkState};
use super::sync::Deadline;
use super::worklist::MarkStack;
use crate::cell::{CellKind, CellRef, CellState, OpaqueRoot, TriState, Value};
use crate::heap::{
    Allocator, CollectionScope, ConservativeRoots, MarkingVersion, ObjectModel, SnapshotBuilder,
    UnconditionalFinalizer, WeakReferenceHarvester,
};

/// Visitor state for one marker task.
pub struct Tracer {
    collector_stack: MarkStack,
    mutator_stack: MarkStack,
    /// Opaque roots not yet merged into the coordinator's set.
    opaque_roots: HashSet<OpaqueRoot>,

    bytes_visited: usize,
    visit_count: usize,
    is_in_parallel_mode: bool,
    marking_version: MarkingVersion,

    coordinator: Arc<Coordinator>,
    allocator: Arc<dyn Allocator>,
    model: Arc<dyn ObjectModel>,

    snapshot_builder: Option<Arc<dyn SnapshotBuilder>>,
    /// Cell whose children are being scanned, for snapshot edges.
    current_cell: Option<CellRef>,
    is_visiting_mutator_stack: bool,
}

impl Tracer {
    /// Create a tracer bound to `coordinator`.
    #[must_use]
    pub fn new(
        coordinator: Arc<Coordinator>,
        allocator: Arc<dyn Allocator>,
        model: Arc<dyn ObjectModel>,
    ) -> Self {
        Self {
            collector_stack: MarkStack::new(),
            mutator_stack: MarkStack::new(),
            opaque_roots: HashSet::new(),
            bytes_visited: 0,
            visit_count: 0,
            is_in_parallel_mode: false,
            marking_version: MarkingVersion::INITIAL,
            coordinator,
            allocator,
            model,
            snapshot_builder: None,
            current_cell: None,
            is_visiting_mutator_stack: false,
        }
    }

    /// The coordinator this tracer shares work through.
    #[must_use]
    pub const fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// The local stack fed by normal discovery.
    #[must_use]
    pub const fn collector_mark_stack(&self) -> &MarkStack {
        &self.collector_stack
    }

    /// The local stack fed by the write barrier.
    #[must_use]
    pub const fn mutator_mark_stack(&self) -> &MarkStack {
        &self.mutator_stack
    }

    /// Version this tracer marks with.
    #[must_use]
    pub const fn marking_version(&self) -> MarkingVersion {
        self.marking_version
    }

    /// Bytes of cells visited since the last reset.
    #[must_use]
    pub const fn bytes_visited(&self) -> usize {
        self.bytes_visited
    }

    /// Cells visited since the last reset.
    #[must_use]
    pub const fn visit_count(&self) -> usize {
        self.visit_count
    }

    /// Whether both local stacks are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.collector_stack.is_empty() && self.mutator_stack.is_empty()
    }

    /// Whether a heap snapshot is being recorded this cycle.
    #[must_use]
    pub const fn is_building_heap_snapshot(&self) -> bool {
        self.snapshot_builder.is_some()
    }

    /// Whether a [`ParallelModeEnabler`](super::ParallelModeEnabler) is live.
    #[must_use]
    pub const fn is_in_parallel_mode(&self) -> bool {
        self.is_in_parallel_mode
    }

    pub(crate) fn set_parallel_mode(&mut self, enabled: bool) {
        self.is_in_parallel_mode = enabled;
    }

    /// Prepare for a new marking cycle.
    ///
    /// # Panics
    ///
    /// For a full collection, panics if opaque roots from the last cycle
    /// were never merged or if a local stack still holds cells.
    pub fn did_start_marking(&mut self, scope: CollectionScope) {
        match scope {
            CollectionScope::Full => {
                assert!(
                    self.opaque_roots.is_empty(),
                    "local opaque roots must be merged before a full collection starts"
                );
                assert!(
                    self.is_empty(),
                    "local mark stacks must be empty when a full collection starts"
                );
            }
            CollectionScope::Eden => self.reset(),
        }

        self.snapshot_builder = self.coordinator.snapshot_builder();
        self.marking_version = self.allocator.marking_version();
    }

    /// Forget per-cycle statistics.
    ///
    /// # Panics
    ///
    /// Panics if local opaque roots were never merged or if a cell scan is
    /// in progress.
    pub fn reset(&mut self) {
        assert!(
            self.opaque_roots.is_empty(),
            "local opaque roots survived past the end of marking"
        );
        self.bytes_visited = 0;
        self.visit_count = 0;
        self.snapshot_builder = None;
        assert!(
            self.current_cell.is_none(),
            "tracer reset while scanning a cell"
        );
    }

    /// Drop all locally queued cells.
    pub fn clear_mark_stacks(&mut self) {
        self.collector_stack.clear();
        self.mutator_stack.clear();
    }

    /// Append every candidate found by a conservative scan.
    pub fn append_conservative_roots(&mut self, roots: &ConservativeRoots) {
        for &cell in roots.roots() {
            self.set_marked_and_append_to_mark_stack(cell);
        }
    }

    /// Trace a reference and record the snapshot edge to it.
    ///
    /// Non-cell values are ignored. A cell already marked in this cycle is
    /// not queued again.
    pub fn append(&mut self, value: impl Into<Value>) {
        let Some(cell) = value.into().as_cell() else {
            return;
        };
        if let Some(builder) = &self.snapshot_builder {
            builder.append_edge(self.current_cell, cell);
        }
        self.set_marked_and_append_to_mark_stack(cell);
    }

    /// Trace a reference that is hidden from heap snapshots.
    pub fn append_hidden(&mut self, value: impl Into<Value>) {
        if let Some(cell) = value.into().as_cell() {
            self.set_marked_and_append_to_mark_stack(cell);
        }
    }

    /// [`Tracer::append`] every value of a slice.
    pub fn append_values(&mut self, values: &[Value]) {
        for &value in values {
            self.append(value);
        }
    }

    /// [`Tracer::append_hidden`] every value of a slice.
    pub fn append_values_hidden(&mut self, values: &[Value]) {
        for &value in values {
            self.append_hidden(value);
        }
    }

    /// Keep an auxiliary allocation alive without scanning it.
    ///
    /// # Panics
    ///
    /// Panics if `cell` has no kind metadata.
    pub fn mark_auxiliary(&mut self, cell: CellRef) {
        self.expect_kind(cell);
        if self
            .allocator
            .test_and_set_marked(self.marking_version, cell)
        {
            return;
        }
        self.allocator.note_marked(cell);
        self.note_live_auxiliary_cell(cell);
    }

    /// Queue an already-marked cell for a re-scan on behalf of the write
    /// barrier.
    pub fn append_to_mutator_mark_stack(&mut self, cell: CellRef) {
        self.mutator_stack.push(cell);
    }

    /// Account for out-of-heap memory kept alive by the cell being scanned.
    pub fn report_extra_memory_visited(&self, bytes: usize) {
        self.coordinator.report_extra_memory_visited(bytes);
    }

    /// Register a weak-reference harvester with the coordinator.
    pub fn add_weak_reference_harvester(&self, harvester: Arc<dyn WeakReferenceHarvester>) {
        self.coordinator.add_weak_reference_harvester(harvester);
    }

    /// Register an unconditional finalizer with the coordinator.
    pub fn add_unconditional_finalizer(&self, finalizer: Box<dyn UnconditionalFinalizer>) {
        self.coordinator.add_unconditional_finalizer(finalizer);
    }

    fn expect_kind(&self, cell: CellRef) -> CellKind {
        match self.allocator.cell_kind(cell) {
            Some(kind) => kind,
            None => panic!("cell {cell} has no kind metadata; the heap is corrupted"),
        }
    }

    fn set_marked_and_append_to_mark_stack(&mut self, cell: CellRef) {
        let kind = self.expect_kind(cell);

        if self
            .allocator
            .test_and_set_marked(self.marking_version, cell)
        {
            return;
        }
        self.allocator.note_marked(cell);

        match kind {
            CellKind::Cell => {
                // First time grey in this cycle. A barrier re-visit may
                // already have made it black; the allocator keeps the darker
                // state.
                self.allocator.set_cell_state(cell, CellState::Grey);
                self.append_to_mark_stack(cell);
            }
            CellKind::Auxiliary => self.note_live_auxiliary_cell(cell),
        }
    }

    fn append_to_mark_stack(&mut self, cell: CellRef) {
        debug_assert!(self.allocator.is_marked(self.marking_version, cell));
        debug_assert_ne!(self.allocator.cell_state(cell), CellState::White);

        self.visit_count += 1;
        self.bytes_visited += self.allocator.cell_size(cell);
        self.collector_stack.push(cell);
    }

    fn note_live_auxiliary_cell(&mut self, cell: CellRef) {
        self.visit_count += 1;
        self.bytes_visited += self.allocator.cell_size(cell);
    }

    fn visit_children(&mut self, model: &dyn ObjectModel, cell: CellRef) {
        debug_assert_ne!(
            self.allocator.cell_state(cell),
            CellState::White,
            "popped a white cell"
        );
        assert!(
            self.current_cell.is_none(),
            "nested scan of {cell} while another cell is being scanned"
        );
        self.current_cell = Some(cell);

        // The cell may already be black if the barrier visited it while it
        // was being marked. Scanning it again is harmless.
        self.allocator.set_cell_state(cell, CellState::Black);

        // The black state must be visible before any child is read, so a
        // concurrent store that misses it is caught by the barrier.
        fence(Ordering::SeqCst);

        model.scan_children(cell, self);

        if !self.is_visiting_mutator_stack {
            if let Some(builder) = &self.snapshot_builder {
                builder.append_node(cell);
            }
        }
        self.current_cell = None;
    }

    /// Scan queued cells until both local stacks are empty or `deadline`
    /// elapses.
    ///
    /// The collector stack is preferred. After every batch of
    /// `min_scans_between_rebalance` cells the tracer offers work to the
    /// coordinator. Opaque roots buffered during the drain are merged before
    /// returning. A scan that has started always runs to completion; the
    /// deadline is only checked between batches.
    pub fn drain(&mut self, deadline: Deadline) {
        debug_assert!(self.is_in_parallel_mode, "drain outside parallel mode");

        let model = Arc::clone(&self.model);
        let batch = self.coordinator.config().min_scans_between_rebalance.max(1);

        while !self.is_empty() && !deadline.has_elapsed() {
            if self.collector_stack.is_empty() {
                // Barrier visits: every cell here was marked before it was
                // queued and may be visited again later.
                self.is_visiting_mutator_stack = true;
                for _ in 0..batch {
                    let Some(cell) = self.mutator_stack.pop() else {
                        break;
                    };
                    self.visit_children(&*model, cell);
                }
            } else {
                self.is_visiting_mutator_stack = false;
                for _ in 0..batch {
                    let Some(cell) = self.collector_stack.pop() else {
                        break;
                    };
                    self.visit_children(&*model, cell);
                }
            }
            if self.coordinator.is_parallel() {
                self.donate_known_parallel();
            }
        }
        self.is_visiting_mutator_stack = false;

        self.merge_opaque_roots_if_necessary();
    }

    /// Offer part of the local work to idle tracers.
    ///
    /// Silently does nothing when there is a single marker, when a local
    /// stack holds fewer than two cells, when the matching shared stack
    /// already has work, or when the coordinator lock is contended.
    pub fn donate(&mut self) {
        debug_assert!(self.is_in_parallel_mode, "donate outside parallel mode");
        if !self.coordinator.is_parallel() {
            return;
        }
        self.donate_known_parallel();
    }

    /// [`Tracer::donate`], then [`Tracer::drain`].
    pub fn donate_and_drain(&mut self, deadline: Deadline) {
        self.donate();
        self.drain(deadline);
    }

    fn donate_known_parallel(&mut self) {
        let collector = donate_known_parallel_from(
            &self.coordinator,
            &mut self.collector_stack,
            SharedMarkState::collector_stack_mut,
        );
        let mutator = donate_known_parallel_from(
            &self.coordinator,
            &mut self.mutator_stack,
            SharedMarkState::mutator_stack_mut,
        );

        #[cfg(feature = "tracing")]
        {
            if collector + mutator > 0 {
                super::tracing::log_donation(collector, mutator);
            }
        }
        let _ = (collector, mutator);
    }

    /// Record a root owned by an external handle table.
    ///
    /// With a single marker the root goes straight to the shared set.
    /// Otherwise it is buffered locally and merged at drain boundaries, or
    /// earlier once the buffer reaches the configured threshold.
    pub fn add_opaque_root(&mut self, root: impl Into<OpaqueRoot>) {
        let root = root.into();
        if !self.coordinator.is_parallel() {
            self.coordinator.add_opaque_root(root);
            return;
        }
        self.merge_opaque_roots_if_profitable();
        self.opaque_roots.insert(root);
    }

    /// Whether `root` is in the shared opaque-root set.
    ///
    /// # Panics
    ///
    /// Panics in parallel mode, where the shared set may still be missing
    /// roots buffered by other tracers; use
    /// [`Tracer::contains_opaque_root_tri_state`] there.
    #[must_use]
    pub fn contains_opaque_root(&self, root: impl Into<OpaqueRoot>) -> bool {
        assert!(
            !self.is_in_parallel_mode,
            "contains_opaque_root is only exact outside parallel mode"
        );
        self.coordinator.contains_opaque_root(root.into())
    }

    /// Non-blocking membership test usable while marking.
    ///
    /// Returns [`TriState::True`] if this tracer or the shared set knows the
    /// root. Otherwise a single marker answers [`TriState::False`], its roots
    /// never being buffered, and several markers answer [`TriState::Mixed`],
    /// since another tracer may still hold it in an unmerged buffer.
    #[must_use]
    pub fn contains_opaque_root_tri_state(&self, root: impl Into<OpaqueRoot>) -> TriState {
        let root = root.into();
        if self.opaque_roots.contains(&root) || self.coordinator.contains_opaque_root(root) {
            return TriState::True;
        }
        if !self.coordinator.is_parallel() {
            return TriState::False;
        }
        TriState::Mixed
    }

    /// Merge the local opaque-root buffer into the shared set, if non-empty.
    pub fn merge_opaque_roots_if_necessary(&mut self) {
        if self.opaque_roots.is_empty() {
            return;
        }
        self.coordinator.merge_opaque_roots(&mut self.opaque_roots);
    }

    fn merge_opaque_roots_if_profitable(&mut self) {
        if self.opaque_roots.len() < self.coordinator.config().opaque_root_merge_threshold {
            return;
        }
        self.coordinator.merge_opaque_roots(&mut self.opaque_roots);
    }

    /// Number of opaque roots buffered locally.
    #[must_use]
    pub fn local_opaque_root_count(&self) -> usize {
        self.opaque_roots.len()
    }

    /// Let every registered harvester revisit its weak references.
    ///
    /// Only valid once all tracers are quiescent.
    pub fn harvest_weak_references(&mut self) {
        debug_assert!(
            !self.is_in_parallel_mode,
            "weak references are harvested after the parallel phase"
        );
        for harvester in self.coordinator.weak_reference_harvesters() {
            harvester.visit_weak_references(self);
        }
    }

    /// Run and discard every queued unconditional finalizer.
    pub fn finalize_unconditionally(&mut self) {
        debug_assert!(
            !self.is_in_parallel_mode,
            "finalizers run after the parallel phase"
        );
        while let Some(mut finalizer) = self.coordinator.take_unconditional_finalizer() {
            finalizer.finalize_unconditionally();
        }
    }

    /// Write both local stacks as `Collector: [...], Mutator: [...]`.
    ///
    /// # Errors
    ///
    /// Propagates errors from `out`.
    pub fn dump(&self, out: &mut impl fmt::Write) -> fmt::Result {
        write!(
            out,
            "Collector: {}, Mutator: {}",
            self.collector_stack, self.mutator_stack
        )
    }

    pub(crate) const fn stacks_mut(&mut self) -> (&mut MarkStack, &mut MarkStack) {
        (&mut self.collector_stack, &mut self.mutator_stack)
    }
}

fn donate_known_parallel_from(
    coordinator: &Coordinator,
    from: &mut MarkStack,
    select: impl FnOnce(&mut SharedMarkState) -> &mut MarkStack,
) -> usize {
    // Retried after every batch, so err on the side of not donating.

    // A dead end in the graph; not worth the lock.
    if from.len() < 2 {
        return 0;
    }

    // Contended: another tracer is probably donating already.
    let Some(mut shared) = coordinator.try_lock() else {
        return 0;
    };

    // Someone already has work waiting to be stolen.
    let to = select(&mut *shared);
    if !to.is_empty() {
        return 0;
    }

    let donated = from.donate_some_cells_to(to);
    drop(shared);
    coordinator.condvar().notify_all();
    donated
}

impl fmt::Display for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.dump(f)
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("collector_stack", &self.collector_stack)
            .field("mutator_stack", &self.mutator_stack)
            .field("local_opaque_roots", &self.opaque_roots.len())
            .field("visit_count", &self.visit_count)
            .field("bytes_visited", &self.bytes_visited)
            .field("marking_version", &self.marking_version)
            .field("is_in_parallel_mode", &self.is_in_parallel_mode)
            .finish_non_exhaustive()
    }
}
