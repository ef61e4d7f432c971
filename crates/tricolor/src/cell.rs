//! Cell handles, tri-color states and traced values.
//!
//! A [`CellRef`] is a weak reference in the strict sense: it names a cell
//! owned by an [`Allocator`](crate::heap::Allocator) and is only ever used
//! to look that cell up. The marking engine never owns, allocates or frees
//! cells.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU8, Ordering};

/// Non-owning handle to a heap cell.
///
/// The handle is an opaque non-zero word. Allocators are free to encode an
/// address or an index in it; [`CellRef::from_index`] and
/// [`CellRef::index`] are provided for index-based heaps.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellRef(NonZeroUsize);

impl CellRef {
    /// Build a handle from a raw non-zero word.
    ///
    /// Returns `None` for zero, which is reserved for "no cell".
    #[must_use]
    pub const fn from_raw(raw: usize) -> Option<Self> {
        match NonZeroUsize::new(raw) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    /// Build a handle for the cell stored at `index` of an index-based heap.
    ///
    /// # Panics
    ///
    /// Panics if `index == usize::MAX`.
    #[must_use]
    pub const fn from_index(index: usize) -> Self {
        assert!(index < usize::MAX, "cell index out of range");
        match NonZeroUsize::new(index + 1) {
            Some(raw) => Self(raw),
            None => unreachable!(),
        }
    }

    /// The raw word behind this handle.
    #[must_use]
    pub const fn raw(self) -> usize {
        self.0.get()
    }

    /// Index for handles created with [`CellRef::from_index`].
    #[must_use]
    pub const fn index(self) -> usize {
        self.0.get() - 1
    }
}

impl fmt::Debug for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CellRef({:#x})", self.raw())
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.raw())
    }
}

/// What kind of allocation a cell is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    /// An object with outgoing references; scanned by the object model.
    Cell,
    /// Backing storage with no references of its own (butterflies, buffers).
    /// Marked and counted, never queued.
    Auxiliary,
}

/// Tri-color state of a cell within one marking cycle.
///
/// Transitions are monotonic: `White -> Grey -> Black`. A barrier re-visit
/// may store `Black` over `Black`; nothing ever stores a lighter color over a
/// darker one during a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum CellState {
    /// Not visited in this cycle.
    White = 0,
    /// Marked and queued, children not yet scanned.
    Grey = 1,
    /// Children scanned.
    Black = 2,
}

impl CellState {
    #[must_use]
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::White,
            1 => Self::Grey,
            _ => Self::Black,
        }
    }
}

/// Atomic storage for a [`CellState`].
///
/// Stores use `Release` and loads use `Acquire`; the tracer adds a full
/// fence between blackening a cell and scanning it.
#[derive(Debug)]
pub struct AtomicCellState(AtomicU8);

impl AtomicCellState {
    /// Create a state cell holding `state`.
    #[must_use]
    pub const fn new(state: CellState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    /// Load the current state.
    #[must_use]
    pub fn load(&self) -> CellState {
        CellState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Store `state` unconditionally.
    pub fn store(&self, state: CellState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Raise the state to at least `state` and return the previous one.
    ///
    /// This is the monotonic store: a `Black` cell stays `Black` even if a
    /// racing tracer tries to make it `Grey`.
    pub fn raise(&self, state: CellState) -> CellState {
        CellState::from_u8(self.0.fetch_max(state as u8, Ordering::AcqRel))
    }
}

impl Default for AtomicCellState {
    fn default() -> Self {
        Self::new(CellState::White)
    }
}

/// A value found in a cell slot or a root.
///
/// Only [`Value::Cell`] refers to the heap; appending any other value is a
/// no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Value {
    /// The null/empty value.
    #[default]
    Empty,
    /// A non-heap value (number, boolean, tagged immediate).
    Immediate(u64),
    /// A reference to a heap cell.
    Cell(CellRef),
}

impl Value {
    /// The referenced cell, if this value is a heap reference.
    #[must_use]
    pub const fn as_cell(self) -> Option<CellRef> {
        match self {
            Self::Cell(cell) => Some(cell),
            Self::Empty | Self::Immediate(_) => None,
        }
    }

    /// Whether this value refers to the heap.
    #[must_use]
    pub const fn is_cell(self) -> bool {
        matches!(self, Self::Cell(_))
    }
}

impl From<CellRef> for Value {
    fn from(cell: CellRef) -> Self {
        Self::Cell(cell)
    }
}

impl From<Option<CellRef>> for Value {
    fn from(cell: Option<CellRef>) -> Self {
        cell.map_or(Self::Empty, Self::Cell)
    }
}

/// A root owned by an external handle table, known only by its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpaqueRoot(pub usize);

impl<T> From<*const T> for OpaqueRoot {
    fn from(ptr: *const T) -> Self {
        Self(ptr as usize)
    }
}

/// Three-valued answer for queries that may race with concurrent merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriState {
    /// Definitely true.
    True,
    /// Definitely false.
    False,
    /// Not known yet; another tracer may still merge the answer in.
    Mixed,
}

#[cfg(test)]
mod tests {
    use super::{AtomicCellState, CellRef, CellState, Value};

    #[test]
    fn test_cell_ref_index_round_trip() {
        let cell = CellRef::from_index(0);
        assert_eq!(cell.raw(), 1);
        assert_eq!(cell.index(), 0);
        assert_eq!(CellRef::from_index(41).index(), 41);
    }

    #[test]
    fn test_cell_ref_zero_is_not_a_cell() {
        assert!(CellRef::from_raw(0).is_none());
        assert_eq!(CellRef::from_raw(0x1000).map(CellRef::raw), Some(0x1000));
    }

    #[test]
    fn test_cell_ref_display_is_hex() {
        let cell = CellRef::from_raw(0x2a).unwrap();
        assert_eq!(cell.to_string(), "0x2a");
    }

    #[test]
    fn test_state_raise_is_monotonic() {
        let state = AtomicCellState::default();
        assert_eq!(state.load(), CellState::White);

        assert_eq!(state.raise(CellState::Grey), CellState::White);
        assert_eq!(state.raise(CellState::Black), CellState::Grey);
        assert_eq!(state.raise(CellState::Grey), CellState::Black);
        assert_eq!(state.load(), CellState::Black);
    }

    #[test]
    fn test_value_as_cell() {
        let cell = CellRef::from_index(3);
        assert_eq!(Value::from(cell).as_cell(), Some(cell));
        assert_eq!(Value::Immediate(7).as_cell(), None);
        assert_eq!(Value::Empty.as_cell(), None);
        assert_eq!(Value::from(None), Value::Empty);
    }
}
