//! Mark-bit storage.
//!
//! Allocators use [`MarkBitmap`] to provide the versioned test-and-set
//! primitive the tracer relies on for exactly-once queueing.

pub mod bitmap;

pub use bitmap::MarkBitmap;
