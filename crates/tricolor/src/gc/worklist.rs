//! Mark stacks: the work queues of the tracing engine.
//!
//! A tracer owns two local [`MarkStack`]s and the [`Coordinator`] owns two
//! shared ones. Local stacks are touched only by their owner; shared stacks
//! only under the coordinator's lock. Work moves between them in bulk:
//! a busy tracer donates part of its stack to the shared one, an idle tracer
//! steals a fair share back.
//!
//! [`Coordinator`]: super::marker::Coordinator

use std::fmt;

use crate::cell::CellRef;

/// Number of cells per segment.
///
/// Segments only bound how much is moved by one steal: when the source holds
/// more than one segment, a steal takes exactly one segment.
pub const SEGMENT_CAPACITY: usize = 512;

/// A LIFO stack of grey cells.
///
/// Pushing and popping happen at the top, which keeps depth-first traversal
/// cache friendly. Donations take cells from the bottom (the oldest, usually
/// closest to the roots) and steals take cells from the top of the source.
///
/// # Invariants
///
/// - `donate_some_cells_to` never leaves the source empty: a stack of one
///   cell donates nothing, a stack of `n >= 2` cells donates `n / 2`.
/// - `steal_some_cells_from` takes at least one cell when the source is not
///   empty.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct MarkStack {
    cells: Vec<CellRef>,
}

impl MarkStack {
    /// Create an empty stack.
    #[must_use]
    pub const fn new() -> Self {
        Self { cells: Vec::new() }
    }

    /// Push a cell on top.
    pub fn push(&mut self, cell: CellRef) {
        self.cells.push(cell);
    }

    /// Pop the top cell.
    pub fn pop(&mut self) -> Option<CellRef> {
        self.cells.pop()
    }

    /// Number of queued cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the stack is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Drop every queued cell.
    pub fn clear(&mut self) {
        self.cells.clear();
    }

    /// Iterate bottom to top.
    pub fn iter(&self) -> impl Iterator<Item = CellRef> + '_ {
        self.cells.iter().copied()
    }

    /// Move a conservative share of this stack to `to`.
    ///
    /// Moves half of the cells (rounded down), taken from the bottom, and
    /// returns how many moved. A stack with fewer than two cells keeps
    /// everything.
    pub fn donate_some_cells_to(&mut self, to: &mut Self) -> usize {
        let count = self.cells.len() / 2;
        if count == 0 {
            return 0;
        }
        to.cells.extend(self.cells.drain(..count));
        count
    }

    /// Take a fair share of `from` for one of `idle_tracers` waiting tracers.
    ///
    /// When `from` holds more than one segment, exactly one segment is
    /// taken; otherwise `ceil(len / idle_tracers)` cells. Returns how many
    /// cells moved.
    pub fn steal_some_cells_from(&mut self, from: &mut Self, idle_tracers: usize) -> usize {
        let available = from.cells.len();
        if available == 0 {
            return 0;
        }
        let count = if available > SEGMENT_CAPACITY {
            SEGMENT_CAPACITY
        } else {
            available.div_ceil(idle_tracers.max(1))
        };
        let split = available - count;
        self.cells.extend(from.cells.drain(split..));
        count
    }
}

impl fmt::Debug for MarkStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarkStack")
            .field("len", &self.cells.len())
            .finish()
    }
}

/// Renders the cells as `[0x1, 0x2, ...]`, bottom to top.
impl fmt::Display for MarkStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, cell) in self.cells.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{cell}")?;
        }
        f.write_str("]")
    }
}

impl Extend<CellRef> for MarkStack {
    fn extend<I: IntoIterator<Item = CellRef>>(&mut self, iter: I) {
        self.cells.extend(iter);
    }
}

impl FromIterator<CellRef> for MarkStack {
    fn from_iter<I: IntoIterator<Item = CellRef>>(iter: I) -> Self {
        Self {
            cells: iter.into_iter().collect(),
        }
    }
}
