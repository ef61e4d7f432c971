//! Parallel marking on larger random graphs.
//!
//! Whatever the number of markers, a cycle must mark exactly the cells
//! reachable from the roots and scan each of them once.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tricolor::arena::ArenaHeap;
use tricolor::gc::{Deadline, ParallelMarkConfig, ParallelMarker, SharedDrainResult};
use tricolor::heap::{CollectionScope, ConservativeRoots};
use tricolor::{CellRef, CellState};

/// Deterministic xorshift generator so failures reproduce.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

fn random_graph(cells: usize, edges_per_cell: usize, seed: u64) -> ArenaHeap {
    let mut rng = Rng(seed);
    let mut heap = ArenaHeap::new();
    for _ in 0..cells {
        heap.allocate(16 + rng.below(8) * 8, 0);
    }
    for from in 0..cells {
        for _ in 0..rng.below(edges_per_cell + 1) {
            heap.connect(heap.cell(from), heap.cell(rng.below(cells)));
        }
    }
    heap
}

fn roots(heap: &ArenaHeap, count: usize, seed: u64) -> Vec<CellRef> {
    let mut rng = Rng(seed);
    (0..count).map(|_| heap.cell(rng.below(heap.len()))).collect()
}

fn check_cycle(heap: &ArenaHeap, roots: &[CellRef]) {
    let expected = heap.reachable_from(roots);
    assert_eq!(heap.live_cells(), expected);
    for cell in heap.cells() {
        if expected.contains(&cell) {
            assert_eq!(heap.state(cell), CellState::Black, "{cell} not black");
        } else {
            assert_eq!(heap.state(cell), CellState::White, "{cell} not white");
        }
    }
}

#[test]
fn test_marked_set_matches_reachability_for_any_marker_count() {
    for markers in [1, 2, 4, 8] {
        let heap = Arc::new(random_graph(5_000, 3, 0x9e37_79b9_7f4a_7c15));
        let roots = roots(&heap, 16, 42);
        heap.begin_marking();

        let mut marker = ParallelMarker::new(ParallelMarkConfig::new(markers), heap.clone(), heap.clone());
        let root_set: ConservativeRoots = roots.iter().copied().collect();
        let metrics = marker.collect(CollectionScope::Full, &root_set);

        check_cycle(&heap, &roots);
        let expected = heap.reachable_from(&roots);
        assert_eq!(metrics.visit_count, expected.len(), "markers = {markers}");
        for &cell in &expected {
            assert_eq!(heap.scan_count(cell), 1, "markers = {markers}");
        }
    }
}

#[test]
fn test_wide_graph_spreads_work() {
    // One root fanning out to many children gives every marker something
    // to steal.
    let mut heap = ArenaHeap::new();
    let root = heap.allocate(64, 0);
    for _ in 0..20_000 {
        let child = heap.allocate(16, 0);
        heap.connect(root, child);
        let grandchild = heap.allocate(16, 0);
        heap.connect(child, grandchild);
    }
    let heap = Arc::new(heap);
    heap.begin_marking();

    let mut config = ParallelMarkConfig::new(4);
    config.set_min_scans_between_rebalance(16);
    let mut marker = ParallelMarker::new(config, heap.clone(), heap.clone());
    let metrics = marker.collect(CollectionScope::Full, &[root].into_iter().collect());

    assert_eq!(metrics.visit_count, heap.len());
    assert_eq!(metrics.bytes_visited, heap.total_size());
    assert_eq!(heap.live_cells().len(), heap.len());
}

#[test]
fn test_consecutive_cycles_use_fresh_versions() {
    let heap = Arc::new(random_graph(2_000, 2, 7));
    let mut marker = ParallelMarker::new(ParallelMarkConfig::new(3), heap.clone(), heap.clone());

    let mut seen_versions = HashSet::new();
    for seed in 0..4 {
        let version = heap.begin_marking();
        assert!(seen_versions.insert(version));

        let roots = roots(&heap, 4, seed + 1);
        let metrics = marker.collect(
            CollectionScope::Full,
            &roots.iter().copied().collect::<ConservativeRoots>(),
        );

        assert_eq!(metrics.marking_version, version);
        check_cycle(&heap, &roots);
    }
}

#[test]
fn test_sliced_marking_converges() {
    let heap = Arc::new(random_graph(10_000, 3, 99));
    let roots = roots(&heap, 8, 3);
    heap.begin_marking();

    let mut config = ParallelMarkConfig::new(4);
    config.set_min_scans_between_rebalance(8);
    let mut marker = ParallelMarker::new(config, heap.clone(), heap.clone());
    marker.begin_cycle(CollectionScope::Full);
    for &root in &roots {
        marker.master().append(root);
    }

    let mut slices = 0;
    while marker.mark(Deadline::after(Duration::from_millis(2))) == SharedDrainResult::TimedOut {
        slices += 1;
        assert!(slices < 1_000_000, "marking never converged");
    }
    let metrics = marker.finish_cycle();

    check_cycle(&heap, &roots);
    assert_eq!(metrics.timed_out_rounds, slices);
    assert_eq!(metrics.rounds, metrics.timed_out_rounds + 1);
}

#[test]
fn test_eden_cycles_restart_counters() {
    let heap = Arc::new(random_graph(500, 2, 11));
    let roots = roots(&heap, 2, 5);
    let mut marker = ParallelMarker::new(ParallelMarkConfig::new(2), heap.clone(), heap.clone());

    heap.begin_marking();
    let first = marker.collect(CollectionScope::Eden, &roots.iter().copied().collect());
    heap.begin_marking();
    let second = marker.collect(CollectionScope::Eden, &roots.iter().copied().collect());

    assert_eq!(first.visit_count, second.visit_count);
    assert_eq!(first.scope, CollectionScope::Eden);
    assert!(second.gc_id.0 > first.gc_id.0);
}
