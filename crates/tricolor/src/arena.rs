//! A ready-made heap for the marking engine.
//!
//! [`ArenaHeap`] implements both [`Allocator`] and [`ObjectModel`] over a
//! flat arena of cells. Cells are grouped into blocks of
//! [`CELLS_PER_BLOCK`], each with its own versioned [`MarkBitmap`], so a new
//! cycle never has to clear mark bits up front.
//!
//! Cells are allocated while the heap is exclusively owned. Once shared
//! (behind an `Arc`), the object graph can still be mutated through
//! [`ArenaHeap::store`], or through [`ArenaHeap::write_with_barrier`] while
//! marking is running.

use std::collections::HashSet;
use std::sync::atomic::{fence, AtomicU32, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::cell::{AtomicCellState, CellKind, CellRef, CellState, OpaqueRoot, Value};
use crate::gc::mark::MarkBitmap;
use crate::gc::{Coordinator, Tracer};
use crate::heap::{Allocator, MarkingVersion, ObjectModel};

/// Number of cells sharing one mark bitmap.
pub const CELLS_PER_BLOCK: usize = 256;

struct ArenaCell {
    kind: Option<CellKind>,
    size: usize,
    state: AtomicCellState,
    slots: RwLock<Vec<Value>>,
    /// References traced without snapshot edges.
    hidden: Vec<CellRef>,
    /// Out-of-line storage owned by the cell.
    auxiliary: Option<CellRef>,
    opaque_root: Option<OpaqueRoot>,
    extra_memory: usize,
    scans: AtomicUsize,
}

impl ArenaCell {
    fn new(kind: Option<CellKind>, size: usize, slots: usize) -> Self {
        Self {
            kind,
            size,
            state: AtomicCellState::new(CellState::White),
            slots: RwLock::new(vec![Value::Empty; slots]),
            hidden: Vec::new(),
            auxiliary: None,
            opaque_root: None,
            extra_memory: 0,
            scans: AtomicUsize::new(0),
        }
    }
}

/// Flat arena of cells with versioned mark bitmaps.
pub struct ArenaHeap {
    cells: Vec<ArenaCell>,
    blocks: Vec<MarkBitmap>,
    version: AtomicU32,
    total_size: usize,
}

impl Default for ArenaHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl ArenaHeap {
    /// Create an empty heap. No cycle has started yet.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cells: Vec::new(),
            blocks: Vec::new(),
            version: AtomicU32::new(MarkingVersion::NULL.0),
            total_size: 0,
        }
    }

    fn push_cell(&mut self, cell: ArenaCell) -> CellRef {
        let index = self.cells.len();
        if index % CELLS_PER_BLOCK == 0 {
            self.blocks.push(MarkBitmap::new(CELLS_PER_BLOCK));
        }
        self.total_size += cell.size;
        self.cells.push(cell);
        CellRef::from_index(index)
    }

    /// Allocate a normal cell of `size` bytes with `slots` empty reference
    /// slots.
    pub fn allocate(&mut self, size: usize, slots: usize) -> CellRef {
        self.push_cell(ArenaCell::new(Some(CellKind::Cell), size, slots))
    }

    /// Allocate an auxiliary allocation of `size` bytes. Auxiliaries are
    /// kept alive but never scanned.
    pub fn allocate_auxiliary(&mut self, size: usize) -> CellRef {
        self.push_cell(ArenaCell::new(Some(CellKind::Auxiliary), size, 0))
    }

    /// Allocate a cell whose kind metadata is missing, as a corrupted heap
    /// would present it.
    pub fn allocate_without_metadata(&mut self, size: usize) -> CellRef {
        self.push_cell(ArenaCell::new(None, size, 0))
    }

    /// Add a hidden reference from `from` to `to`.
    pub fn connect_hidden(&mut self, from: CellRef, to: CellRef) {
        self.cell_mut(from).hidden.push(to);
    }

    /// Give `cell` out-of-line auxiliary storage.
    pub fn set_auxiliary(&mut self, cell: CellRef, auxiliary: CellRef) {
        self.cell_mut(cell).auxiliary = Some(auxiliary);
    }

    /// Make scanning `cell` report `root` as an opaque root.
    pub fn set_opaque_root(&mut self, cell: CellRef, root: OpaqueRoot) {
        self.cell_mut(cell).opaque_root = Some(root);
    }

    /// Make scanning `cell` report `bytes` of extra memory.
    pub fn set_extra_memory(&mut self, cell: CellRef, bytes: usize) {
        self.cell_mut(cell).extra_memory = bytes;
    }

    /// Append a reference slot from `from` to `to`.
    ///
    /// Not a barriered write: use it to build the graph between cycles.
    pub fn connect(&self, from: CellRef, to: CellRef) {
        self.cell_data(from).slots.write().push(Value::Cell(to));
    }

    /// Store `value` into slot `index` of `cell`, growing the slot list if
    /// needed. No barrier.
    pub fn store(&self, cell: CellRef, index: usize, value: impl Into<Value>) {
        let mut slots = self.cell_data(cell).slots.write();
        if index >= slots.len() {
            slots.resize(index + 1, Value::Empty);
        }
        slots[index] = value.into();
    }

    /// Store with the marking write barrier.
    ///
    /// If `cell` was already scanned in this cycle, it is handed to
    /// `coordinator` for a re-scan. Returns whether the barrier fired.
    pub fn write_with_barrier(
        &self,
        cell: CellRef,
        index: usize,
        value: impl Into<Value>,
        coordinator: &Coordinator,
    ) -> bool {
        self.store(cell, index, value);

        // Pairs with the fence between blackening and scanning: either the
        // tracer reads the new value, or this load sees Black.
        fence(Ordering::SeqCst);
        if self.cell_data(cell).state.load() != CellState::Black {
            return false;
        }
        coordinator.append_barriered_cells([cell]);
        true
    }

    /// Start a new cycle: bump the marking version and whiten every cell.
    ///
    /// Mark bits are not touched; the new version makes them stale.
    pub fn begin_marking(&self) -> MarkingVersion {
        let next = self.current_version().next();
        self.version.store(next.0, Ordering::Release);
        for cell in &self.cells {
            cell.state.store(CellState::White);
        }
        next
    }

    /// Version of the current (or last) cycle.
    #[must_use]
    pub fn current_version(&self) -> MarkingVersion {
        MarkingVersion(self.version.load(Ordering::Acquire))
    }

    /// Handle of the `index`-th allocated cell.
    #[must_use]
    pub const fn cell(&self, index: usize) -> CellRef {
        CellRef::from_index(index)
    }

    /// Iterate over every allocated cell.
    pub fn cells(&self) -> impl Iterator<Item = CellRef> + '_ {
        (0..self.cells.len()).map(CellRef::from_index)
    }

    /// Number of allocated cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether nothing was allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Sum of all cell sizes.
    #[must_use]
    pub const fn total_size(&self) -> usize {
        self.total_size
    }

    /// Current reference slots of `cell`.
    #[must_use]
    pub fn slots(&self, cell: CellRef) -> Vec<Value> {
        self.cell_data(cell).slots.read().clone()
    }

    /// Tri-color state of `cell`.
    #[must_use]
    pub fn state(&self, cell: CellRef) -> CellState {
        self.cell_data(cell).state.load()
    }

    /// How many times `cell` was scanned since allocation.
    #[must_use]
    pub fn scan_count(&self, cell: CellRef) -> usize {
        self.cell_data(cell).scans.load(Ordering::Relaxed)
    }

    /// Whether `cell` is marked in the current cycle.
    #[must_use]
    pub fn is_live(&self, cell: CellRef) -> bool {
        self.is_marked(self.current_version(), cell)
    }

    /// Cells marked in the current cycle.
    #[must_use]
    pub fn live_cells(&self) -> HashSet<CellRef> {
        self.cells().filter(|&cell| self.is_live(cell)).collect()
    }

    /// Mark `cell` and record it as already scanned, as if it had been
    /// visited earlier in the cycle.
    pub fn mark_black(&self, cell: CellRef) {
        let _ = self.test_and_set_marked(self.current_version(), cell);
        self.cell_data(cell).state.raise(CellState::Black);
    }

    /// Every cell reachable from `roots` by plain graph traversal.
    ///
    /// Runs on the calling thread without touching mark bits; useful to
    /// check what a marking cycle should have found.
    #[must_use]
    pub fn reachable_from(&self, roots: &[CellRef]) -> HashSet<CellRef> {
        let mut seen: HashSet<CellRef> = HashSet::new();
        let mut pending: Vec<CellRef> = roots.to_vec();
        while let Some(cell) = pending.pop() {
            if !seen.insert(cell) {
                continue;
            }
            let data = self.cell_data(cell);
            if data.kind != Some(CellKind::Cell) {
                continue;
            }
            pending.extend(data.slots.read().iter().filter_map(|value| value.as_cell()));
            pending.extend(data.hidden.iter().copied());
            pending.extend(data.auxiliary);
        }
        seen
    }

    fn cell_data(&self, cell: CellRef) -> &ArenaCell {
        match self.cells.get(cell.index()) {
            Some(data) => data,
            None => panic!("cell {cell} is not part of this arena"),
        }
    }

    fn cell_mut(&mut self, cell: CellRef) -> &mut ArenaCell {
        match self.cells.get_mut(cell.index()) {
            Some(data) => data,
            None => panic!("cell {cell} is not part of this arena"),
        }
    }

    fn block_of(&self, cell: CellRef) -> (&MarkBitmap, usize) {
        let index = cell.index();
        match self.blocks.get(index / CELLS_PER_BLOCK) {
            Some(block) => (block, index % CELLS_PER_BLOCK),
            None => panic!("cell {cell} is not part of this arena"),
        }
    }
}

impl Allocator for ArenaHeap {
    fn test_and_set_marked(&self, version: MarkingVersion, cell: CellRef) -> bool {
        let (block, slot) = self.block_of(cell);
        block.test_and_set(version, slot)
    }

    fn is_marked(&self, version: MarkingVersion, cell: CellRef) -> bool {
        let (block, slot) = self.block_of(cell);
        block.is_marked(version, slot)
    }

    fn marking_version(&self) -> MarkingVersion {
        self.current_version()
    }

    fn cell_size(&self, cell: CellRef) -> usize {
        self.cell_data(cell).size
    }

    fn cell_kind(&self, cell: CellRef) -> Option<CellKind> {
        self.cells.get(cell.index()).and_then(|data| data.kind)
    }

    fn cell_state(&self, cell: CellRef) -> CellState {
        self.cell_data(cell).state.load()
    }

    fn set_cell_state(&self, cell: CellRef, state: CellState) {
        // Never lets a cell go back to a lighter color.
        self.cell_data(cell).state.raise(state);
    }
}

impl ObjectModel for ArenaHeap {
    fn scan_children(&self, cell: CellRef, tracer: &mut Tracer) {
        let data = self.cell_data(cell);
        data.scans.fetch_add(1, Ordering::Relaxed);

        let slots = data.slots.read().clone();
        tracer.append_values(&slots);
        for &hidden in &data.hidden {
            tracer.append_hidden(hidden);
        }
        if let Some(auxiliary) = data.auxiliary {
            tracer.mark_auxiliary(auxiliary);
        }
        if let Some(root) = data.opaque_root {
            tracer.add_opaque_root(root);
        }
        if data.extra_memory > 0 {
            tracer.report_extra_memory_visited(data.extra_memory);
        }
    }
}

impl std::fmt::Debug for ArenaHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaHeap")
            .field("cells", &self.cells.len())
            .field("blocks", &self.blocks.len())
            .field("version", &self.current_version())
            .field("total_size", &self.total_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{ArenaHeap, CELLS_PER_BLOCK};
    use crate::cell::{CellKind, CellState, Value};
    use crate::gc::{Coordinator, ParallelMarkConfig};
    use crate::heap::{Allocator, MarkingVersion};

    #[test]
    fn test_blocks_follow_allocation() {
        let mut heap = ArenaHeap::new();
        for _ in 0..=CELLS_PER_BLOCK {
            heap.allocate(8, 0);
        }
        assert_eq!(heap.len(), CELLS_PER_BLOCK + 1);
        assert_eq!(heap.total_size(), 8 * (CELLS_PER_BLOCK + 1));

        let last = heap.cell(CELLS_PER_BLOCK);
        let version = heap.begin_marking();
        assert!(!heap.test_and_set_marked(version, last));
        assert!(heap.is_live(last));
        assert!(!heap.is_live(heap.cell(0)));
    }

    #[test]
    fn test_begin_marking_makes_old_marks_stale() {
        let mut heap = ArenaHeap::new();
        let cell = heap.allocate(8, 0);

        let first = heap.begin_marking();
        assert_eq!(first, MarkingVersion::INITIAL);
        heap.mark_black(cell);
        assert!(heap.is_live(cell));
        assert_eq!(heap.state(cell), CellState::Black);

        heap.begin_marking();
        assert!(!heap.is_live(cell));
        assert_eq!(heap.state(cell), CellState::White);
    }

    #[test]
    fn test_state_never_lightens() {
        let mut heap = ArenaHeap::new();
        let cell = heap.allocate(8, 0);
        heap.begin_marking();

        heap.set_cell_state(cell, CellState::Black);
        heap.set_cell_state(cell, CellState::Grey);

        assert_eq!(heap.state(cell), CellState::Black);
    }

    #[test]
    fn test_kinds() {
        let mut heap = ArenaHeap::new();
        let cell = heap.allocate(8, 0);
        let aux = heap.allocate_auxiliary(8);
        let broken = heap.allocate_without_metadata(8);

        assert_eq!(heap.cell_kind(cell), Some(CellKind::Cell));
        assert_eq!(heap.cell_kind(aux), Some(CellKind::Auxiliary));
        assert_eq!(heap.cell_kind(broken), None);
        assert_eq!(heap.cell_kind(heap.cell(99)), None);
    }

    #[test]
    fn test_store_grows_slots() {
        let mut heap = ArenaHeap::new();
        let a = heap.allocate(8, 1);
        let b = heap.allocate(8, 0);

        heap.store(a, 2, b);

        assert_eq!(heap.slots(a), vec![Value::Empty, Value::Empty, Value::Cell(b)]);
    }

    #[test]
    fn test_barrier_fires_only_for_black_owner() {
        let mut heap = ArenaHeap::new();
        let a = heap.allocate(8, 1);
        let b = heap.allocate(8, 1);
        let c = heap.allocate(8, 0);
        heap.begin_marking();
        let coordinator = Coordinator::new(ParallelMarkConfig::new(2));

        assert!(!heap.write_with_barrier(a, 0, c, &coordinator));

        heap.mark_black(b);
        assert!(heap.write_with_barrier(b, 0, c, &coordinator));
        assert_eq!(coordinator.shared_mutator_len(), 1);
    }

    #[test]
    fn test_reachable_from_follows_every_edge_kind() {
        let mut heap = ArenaHeap::new();
        let root = heap.allocate(8, 0);
        let child = heap.allocate(8, 0);
        let hidden = heap.allocate(8, 0);
        let aux = heap.allocate_auxiliary(8);
        let unreachable = heap.allocate(8, 0);
        heap.connect(root, child);
        heap.connect_hidden(child, hidden);
        heap.set_auxiliary(root, aux);
        heap.connect(unreachable, root);

        let reachable = heap.reachable_from(&[root]);

        assert_eq!(reachable.len(), 4);
        assert!(!reachable.contains(&unreachable));
    }
}
