//! End-to-end marking scenarios on small, hand-built graphs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tricolor::arena::ArenaHeap;
use tricolor::gc::{
    Coordinator, Deadline, ParallelMarkConfig, ParallelModeEnabler, SharedDrainMode,
    SharedDrainResult, Tracer,
};
use tricolor::heap::{CollectionScope, ConservativeRoots};
use tricolor::{CellRef, CellState};

fn start(heap: &Arc<ArenaHeap>, markers: usize) -> Arc<Coordinator> {
    heap.begin_marking();
    let coordinator = Arc::new(Coordinator::new(ParallelMarkConfig::new(markers)));
    coordinator.did_start_marking();
    coordinator
}

fn tracer(heap: &Arc<ArenaHeap>, coordinator: &Arc<Coordinator>) -> Tracer {
    let mut tracer = Tracer::new(Arc::clone(coordinator), heap.clone(), heap.clone());
    tracer.did_start_marking(CollectionScope::Full);
    tracer
}

#[test]
fn test_linked_list_from_conservative_root() {
    let mut heap = ArenaHeap::new();
    let cells: Vec<CellRef> = (0..5).map(|_| heap.allocate(24, 0)).collect();
    for pair in cells.windows(2) {
        heap.connect(pair[0], pair[1]);
    }
    let heap = Arc::new(heap);
    let coordinator = start(&heap, 1);
    let mut tracer = tracer(&heap, &coordinator);

    let roots: ConservativeRoots = [cells[0]].into_iter().collect();
    tracer.append_conservative_roots(&roots);
    ParallelModeEnabler::new(&mut tracer).drain(Deadline::never());

    for &cell in &cells {
        assert_eq!(heap.state(cell), CellState::Black);
    }
    assert_eq!(tracer.visit_count(), 5);
    assert_eq!(tracer.bytes_visited(), 5 * 24);
    assert!(tracer.is_empty());
}

#[test]
fn test_idle_tracer_steals_donated_work() {
    let mut heap = ArenaHeap::new();
    let mut roots = Vec::new();
    for _ in 0..10 {
        let root = heap.allocate(16, 0);
        let child = heap.allocate(16, 0);
        heap.connect(root, child);
        roots.push(root);
    }
    let heap = Arc::new(heap);
    let coordinator = start(&heap, 2);
    let mut a = tracer(&heap, &coordinator);
    let mut b = tracer(&heap, &coordinator);

    for &root in &roots {
        a.append(root);
    }
    assert_eq!(a.collector_mark_stack().len(), 10);
    assert!(b.is_empty());

    coordinator.start_parallel_phase(2);
    let deadline = Deadline::after(Duration::from_secs(30));

    let (result_a, result_b) = crossbeam::thread::scope(|scope| {
        let mut a = ParallelModeEnabler::new(&mut a);
        a.donate();
        assert_eq!(coordinator.shared_collector_len(), 5);

        let participant = scope.spawn(|_| {
            ParallelModeEnabler::new(&mut b).drain_from_shared(SharedDrainMode::Participant, deadline)
        });

        // Let B take the donation before A goes looking for work.
        let waited = Instant::now();
        while coordinator.has_shared_work() && waited.elapsed() < Duration::from_secs(10) {
            std::thread::yield_now();
        }

        let result_a = a.drain_from_shared(SharedDrainMode::Master, deadline);
        (result_a, participant.join().unwrap())
    })
    .unwrap();

    assert_eq!(result_a, SharedDrainResult::Done);
    assert_eq!(result_b, SharedDrainResult::Done);

    // B scanned the five stolen roots and marked their children.
    assert_eq!(b.visit_count(), 5);
    assert_eq!(a.visit_count() + b.visit_count(), 20);
    for cell in heap.cells() {
        assert_eq!(heap.state(cell), CellState::Black);
    }
    assert!(a.is_empty() && b.is_empty());
}

#[test]
fn test_cycle_is_scanned_once() {
    let mut heap = ArenaHeap::new();
    let a = heap.allocate(16, 0);
    let b = heap.allocate(16, 0);
    heap.connect(a, b);
    heap.connect(b, a);
    let heap = Arc::new(heap);
    let coordinator = start(&heap, 1);
    let mut tracer = tracer(&heap, &coordinator);

    tracer.append(a);
    ParallelModeEnabler::new(&mut tracer).drain(Deadline::never());

    assert_eq!(heap.scan_count(a), 1);
    assert_eq!(heap.scan_count(b), 1);
    assert_eq!(tracer.visit_count(), 2);
}

#[test]
fn test_elapsed_deadline_processes_nothing() {
    let mut heap = ArenaHeap::new();
    let cells: Vec<CellRef> = (0..4).map(|_| heap.allocate(16, 0)).collect();
    let heap = Arc::new(heap);
    let coordinator = start(&heap, 1);
    let mut tracer = tracer(&heap, &coordinator);

    for &cell in &cells {
        tracer.append(cell);
    }
    ParallelModeEnabler::new(&mut tracer).drain(Deadline::elapsed());

    assert_eq!(tracer.collector_mark_stack().len(), 4);
    for &cell in &cells {
        assert_eq!(heap.scan_count(cell), 0);
        assert_eq!(heap.state(cell), CellState::Grey);
    }
}
