//! A parallel tri-color marking engine.
//!
//! `tricolor` is the mark phase of a tracing garbage collector, detached
//! from any particular heap. Given roots, it finds and marks every reachable
//! cell exactly once per cycle while several marker threads share the work
//! and the program keeps mutating the graph behind a write barrier.
//!
//! # Features
//!
//! - **Tri-color marking**: cells move White → Grey → Black, never back
//! - **Versioned mark bits**: a new cycle never clears the heap up front
//! - **Work donation and stealing**: busy tracers hand half their stack to
//!   idle ones through one shared coordinator
//! - **Distributed termination**: marking ends once no tracer is active and
//!   nothing is left to steal, with every wait bounded by a deadline
//! - **Opaque roots**: external handle tables are tracked per tracer and
//!   merged in bulk
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use tricolor::arena::ArenaHeap;
//! use tricolor::gc::{ParallelMarkConfig, ParallelMarker};
//! use tricolor::heap::{CollectionScope, ConservativeRoots};
//!
//! let mut heap = ArenaHeap::new();
//! let root = heap.allocate(32, 0);
//! let child = heap.allocate(16, 0);
//! let garbage = heap.allocate(16, 0);
//! heap.connect(root, child);
//!
//! let heap = Arc::new(heap);
//! heap.begin_marking();
//!
//! let mut marker = ParallelMarker::new(ParallelMarkConfig::new(2), heap.clone(), heap.clone());
//! let roots: ConservativeRoots = [root].into_iter().collect();
//! let metrics = marker.collect(CollectionScope::Full, &roots);
//!
//! assert_eq!(metrics.visit_count, 2);
//! assert!(heap.is_live(child));
//! assert!(!heap.is_live(garbage));
//! ```
//!
//! # Plugging in a heap
//!
//! The engine only talks to the [`heap::Allocator`] and
//! [`heap::ObjectModel`] traits. [`arena::ArenaHeap`] implements both and is
//! what the tests and benches use.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod arena;
pub mod cell;
pub mod gc;
pub mod heap;
pub mod metrics;

// Re-export public API
pub use cell::{CellKind, CellRef, CellState, OpaqueRoot, TriState, Value};
pub use gc::{
    Coordinator, Deadline, ParallelMarkConfig, ParallelMarker, ParallelModeEnabler,
    SharedDrainMode, SharedDrainResult, Tracer,
};
pub use heap::{CollectionScope, ConservativeRoots, MarkingVersion};
pub use metrics::{global_metrics, MarkMetrics};
