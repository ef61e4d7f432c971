//! Time bounds and parallel-mode scoping for marker tasks.
//!
//! Every blocking wait in the engine is bounded by a [`Deadline`]. A tracer
//! only blocks on the coordinator's condition variable, and only until its
//! deadline; cancellation is cooperative and checked between scan batches,
//! never in the middle of scanning a cell.

use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use super::tracer::Tracer;

/// A point on the monotonic clock after which work should stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline that never elapses.
    #[must_use]
    pub const fn never() -> Self {
        Self(None)
    }

    /// A deadline at `instant`.
    #[must_use]
    pub const fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    /// A deadline `timeout` from now.
    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    /// A deadline that has already elapsed.
    #[must_use]
    pub fn elapsed() -> Self {
        Self(Some(Instant::now()))
    }

    /// The instant, or `None` for [`Deadline::never`].
    #[must_use]
    pub const fn instant(self) -> Option<Instant> {
        self.0
    }

    /// Whether the deadline has passed.
    #[must_use]
    pub fn has_elapsed(self) -> bool {
        self.0.is_some_and(|instant| Instant::now() >= instant)
    }

    /// Time left, `None` when unbounded.
    #[must_use]
    pub fn remaining(self) -> Option<Duration> {
        self.0
            .map(|instant| instant.saturating_duration_since(Instant::now()))
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::never()
    }
}

impl From<Instant> for Deadline {
    fn from(instant: Instant) -> Self {
        Self::at(instant)
    }
}

/// Puts a tracer in parallel mode for the lifetime of the guard.
///
/// Draining, donating and the shared-drain protocol are only valid in
/// parallel mode. Nesting two enablers on the same tracer is a fatal error.
///
/// ```
/// # use std::sync::Arc;
/// # use tricolor::arena::ArenaHeap;
/// # use tricolor::gc::{Coordinator, Deadline, ParallelMarkConfig, ParallelModeEnabler, Tracer};
/// let heap = Arc::new(ArenaHeap::new());
/// let coordinator = Arc::new(Coordinator::new(ParallelMarkConfig::new(1)));
/// let mut tracer = Tracer::new(coordinator, heap.clone(), heap);
///
/// let mut parallel = ParallelModeEnabler::new(&mut tracer);
/// parallel.drain(Deadline::never());
/// ```
pub struct ParallelModeEnabler<'t> {
    tracer: &'t mut Tracer,
}

impl<'t> ParallelModeEnabler<'t> {
    /// Enter parallel mode.
    ///
    /// # Panics
    ///
    /// Panics if `tracer` is already in parallel mode.
    #[must_use = "parallel mode ends when the enabler is dropped"]
    pub fn new(tracer: &'t mut Tracer) -> Self {
        assert!(
            !tracer.is_in_parallel_mode(),
            "tracer is already in parallel mode"
        );
        tracer.set_parallel_mode(true);
        Self { tracer }
    }
}

impl Deref for ParallelModeEnabler<'_> {
    type Target = Tracer;

    fn deref(&self) -> &Tracer {
        self.tracer
    }
}

impl DerefMut for ParallelModeEnabler<'_> {
    fn deref_mut(&mut self) -> &mut Tracer {
        self.tracer
    }
}

impl Drop for ParallelModeEnabler<'_> {
    fn drop(&mut self) {
        debug_assert!(self.tracer.is_in_parallel_mode());
        self.tracer.set_parallel_mode(false);
    }
}
