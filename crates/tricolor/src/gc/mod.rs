//! Parallel marking.
//!
//! This module provides the marking engine:
//! - [`Tracer`], the per-task visitor with local mark stacks
//! - [`Coordinator`], the shared stacks, counters and opaque-root set
//! - the shared-drain protocol for work stealing and termination
//! - [`ParallelMarker`], which runs a whole cycle on scoped threads

mod driver;
pub mod mark;
pub mod marker;
mod parallel;
pub mod sync;
mod tracer;
pub mod tracing;
pub mod worklist;

pub use driver::ParallelMarker;
pub use marker::{
    available_parallelism, Coordinator, ParallelMarkConfig, SharedDrainMode, SharedDrainResult,
    SharedMarkState,
};
pub use sync::{Deadline, ParallelModeEnabler};
pub use tracer::Tracer;
pub use worklist::{MarkStack, SEGMENT_CAPACITY};
