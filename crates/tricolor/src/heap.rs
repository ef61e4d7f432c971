//! Interfaces the marking engine consumes from the rest of the collector.
//!
//! The engine owns no heap memory. It talks to an [`Allocator`] for mark
//! bits, states and sizes, to an [`ObjectModel`] to find the outgoing
//! references of a cell, and optionally to a [`SnapshotBuilder`] that
//! records the object graph for heap introspection.

use crate::cell::{CellKind, CellRef, CellState};
use crate::gc::Tracer;

/// Generation counter distinguishing this cycle's marks from stale ones.
///
/// Mark bits stamped with an older version read as unmarked, so they never
/// need to be cleared eagerly between cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MarkingVersion(pub u32);

impl MarkingVersion {
    /// Version that no cycle ever uses; fresh mark bitmaps carry it.
    pub const NULL: Self = Self(0);
    /// Version of the first cycle.
    pub const INITIAL: Self = Self(1);

    /// The version of the following cycle. Wraps around, skipping
    /// [`MarkingVersion::NULL`].
    #[must_use]
    pub const fn next(self) -> Self {
        match self.0.wrapping_add(1) {
            0 => Self::INITIAL,
            v => Self(v),
        }
    }
}

/// Which part of the heap a cycle traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionScope {
    /// Young cells only; tracer statistics restart with every cycle.
    Eden,
    /// The whole heap.
    Full,
}

/// Storage-side collaborator: owns cells and their mark bits.
pub trait Allocator: Send + Sync {
    /// Atomically mark `cell` for `version`.
    ///
    /// Returns `true` if the cell was **already** marked in `version`. Among
    /// any number of concurrent callers for the same cell and version,
    /// exactly one observes `false`.
    fn test_and_set_marked(&self, version: MarkingVersion, cell: CellRef) -> bool;

    /// Whether `cell` is marked in `version`.
    fn is_marked(&self, version: MarkingVersion, cell: CellRef) -> bool;

    /// The current marking version.
    fn marking_version(&self) -> MarkingVersion;

    /// Size in bytes of the storage behind `cell`.
    fn cell_size(&self, cell: CellRef) -> usize;

    /// Kind metadata for `cell`, or `None` when the cell has none.
    ///
    /// A cell without metadata reaching the tracer means the heap is
    /// corrupted; the tracer treats it as fatal.
    fn cell_kind(&self, cell: CellRef) -> Option<CellKind>;

    /// Current tri-color state of `cell`.
    fn cell_state(&self, cell: CellRef) -> CellState;

    /// Store the tri-color state of `cell`.
    fn set_cell_state(&self, cell: CellRef, state: CellState);

    /// Called once per cell the first time it is marked in a cycle.
    fn note_marked(&self, _cell: CellRef) {}
}

/// Object-layout collaborator: knows where the references inside a cell are.
pub trait ObjectModel: Send + Sync {
    /// Report every outgoing reference of `cell` to `tracer`, through the
    /// [`Tracer::append`] family.
    fn scan_children(&self, cell: CellRef, tracer: &mut Tracer);
}

/// Heap snapshot recorder. Absent in ordinary cycles.
pub trait SnapshotBuilder: Send + Sync {
    /// `cell` was scanned.
    fn append_node(&self, cell: CellRef);

    /// An edge from `from` (`None` for a root) to `to` was traced.
    fn append_edge(&self, from: Option<CellRef>, to: CellRef);
}

/// Something holding weak references that must be revisited once marking
/// reaches a fixed point.
pub trait WeakReferenceHarvester: Send + Sync {
    /// Visit weak references; may append newly discovered strong references.
    fn visit_weak_references(&self, tracer: &mut Tracer);
}

/// Work that runs exactly once per cycle after marking, whatever was marked.
pub trait UnconditionalFinalizer: Send {
    /// Run the finalizer.
    fn finalize_unconditionally(&mut self);
}

/// Candidate roots found by a conservative stack/register scan.
///
/// Every entry is a valid cell handle; whether it is a normal cell or an
/// auxiliary allocation is decided by the [`Allocator`] when appended.
#[derive(Debug, Default, Clone)]
pub struct ConservativeRoots {
    roots: Vec<CellRef>,
}

impl ConservativeRoots {
    /// Create an empty root set.
    #[must_use]
    pub const fn new() -> Self {
        Self { roots: Vec::new() }
    }

    /// Record a candidate root.
    pub fn add(&mut self, cell: CellRef) {
        self.roots.push(cell);
    }

    /// All candidates, in discovery order.
    #[must_use]
    pub fn roots(&self) -> &[CellRef] {
        &self.roots
    }

    /// Number of candidates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Whether no candidates were found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

impl FromIterator<CellRef> for ConservativeRoots {
    fn from_iter<I: IntoIterator<Item = CellRef>>(iter: I) -> Self {
        Self {
            roots: iter.into_iter().collect(),
        }
    }
}
