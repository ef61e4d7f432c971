//! Conditions that mean the heap or the collector itself is broken. Each of
//! them stops the process instead of marking on.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use tricolor::arena::ArenaHeap;
use tricolor::gc::{Coordinator, ParallelMarkConfig, ParallelMarker, ParallelModeEnabler, Tracer};
use tricolor::heap::CollectionScope;
use tricolor::{CellRef, OpaqueRoot};

fn tracer_over(heap: &Arc<ArenaHeap>, markers: usize) -> Tracer {
    let coordinator = Arc::new(Coordinator::new(ParallelMarkConfig::new(markers)));
    coordinator.did_start_marking();
    let mut tracer = Tracer::new(coordinator, heap.clone(), heap.clone());
    tracer.did_start_marking(CollectionScope::Full);
    tracer
}

#[test]
#[should_panic(expected = "has no kind metadata")]
fn test_reference_to_cell_without_metadata_is_fatal() {
    let mut heap = ArenaHeap::new();
    let root = heap.allocate(16, 0);
    let broken = heap.allocate_without_metadata(16);
    heap.connect(root, broken);
    let heap = Arc::new(heap);
    heap.begin_marking();

    let mut marker = ParallelMarker::new(ParallelMarkConfig::new(1), heap.clone(), heap);
    marker.collect(CollectionScope::Full, &[root].into_iter().collect());
}

#[test]
#[should_panic(expected = "only exact outside parallel mode")]
fn test_exact_opaque_root_query_while_marking_is_fatal() {
    let heap = Arc::new(ArenaHeap::new());
    heap.begin_marking();
    let mut tracer = tracer_over(&heap, 2);

    let tracer = ParallelModeEnabler::new(&mut tracer);
    let _ = tracer.contains_opaque_root(OpaqueRoot(8));
}

#[test]
#[should_panic(expected = "shared mark stacks must be empty")]
fn test_leftover_shared_work_is_fatal() {
    let mut heap = ArenaHeap::new();
    let cell = heap.allocate(16, 0);
    let heap = Arc::new(heap);
    heap.begin_marking();

    let coordinator = Coordinator::new(ParallelMarkConfig::new(2));
    coordinator.did_start_marking();
    heap.mark_black(cell);
    coordinator.append_barriered_cells([cell]);

    // The barrier work was never drained.
    coordinator.did_start_marking();
}

#[test]
#[should_panic(expected = "must be merged before a full collection")]
fn test_full_collection_with_unmerged_opaque_roots_is_fatal() {
    let heap = Arc::new(ArenaHeap::new());
    heap.begin_marking();
    let mut tracer = tracer_over(&heap, 4);

    tracer.add_opaque_root(OpaqueRoot(8));
    heap.begin_marking();
    tracer.did_start_marking(CollectionScope::Full);
}

/// Run a full collection on its own thread and report whether it panicked,
/// failing if it neither returns nor panics in time.
fn collection_panics(markers: usize, heap: ArenaHeap, root: CellRef) -> bool {
    let heap = Arc::new(heap);
    heap.begin_marking();
    let mut marker = ParallelMarker::new(ParallelMarkConfig::new(markers), heap.clone(), heap);

    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            marker.collect(CollectionScope::Full, &[root].into_iter().collect());
        }));
        let _ = sender.send(outcome.is_err());
    });
    receiver
        .recv_timeout(Duration::from_secs(10))
        .expect("collection hung after a fatal error")
}

#[test]
fn test_fatal_error_in_master_stops_every_marker() {
    let mut heap = ArenaHeap::new();
    let root = heap.allocate(16, 0);
    let broken = heap.allocate_without_metadata(16);
    heap.connect(root, broken);

    assert!(collection_panics(2, heap, root));
}

#[test]
fn test_fatal_error_in_any_marker_stops_every_marker() {
    let mut heap = ArenaHeap::new();
    let root = heap.allocate(16, 0);
    // Enough fan-out that the broken cells get donated to other markers.
    for _ in 0..2_000 {
        let child = heap.allocate(16, 0);
        heap.connect(root, child);
        let broken = heap.allocate_without_metadata(16);
        heap.connect(child, broken);
    }

    assert!(collection_panics(4, heap, root));
}
