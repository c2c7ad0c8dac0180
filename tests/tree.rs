use std::sync::Arc;

use mdboxtree::{
    BoxController, BoxNode, BulkAddOutcome, CancelAfter, EventTree, Extents, LeanEvent,
    NullProgress,
};
use rand::prelude::*;
use rand::rngs::StdRng;

type Event2 = LeanEvent<2>;

fn controller(threshold: usize, split_into: usize, max_depth: usize) -> Arc<BoxController> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let bc = BoxController::new(2);
    bc.set_split_threshold(threshold);
    bc.set_split_into(split_into);
    bc.set_max_depth(max_depth);
    Arc::new(bc)
}

fn unit_tree(bc: Arc<BoxController>) -> EventTree<Event2, 2> {
    EventTree::new(Extents::new([0.0, 0.0], [1.0, 1.0]), bc).unwrap()
}

fn random_events(n: usize, seed: u64) -> Vec<Event2> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| Event2::new(1.0, 1.0, [rng.r#gen::<f32>(), rng.r#gen::<f32>()]))
        .collect()
}

#[test]
fn test_accumulates_below_threshold() {
    let bc = controller(100, 2, 5);
    let tree = unit_tree(bc.clone());

    for event in random_events(100, 1) {
        assert!(tree.add_event(event).unwrap());
    }
    assert_eq!(tree.n_points(), 100);
    assert_eq!(tree.leaf_count(), 1, "population == threshold must not flag");
    assert_eq!(bc.num_boxes_to_split(), 0);
}

#[test]
fn test_deferred_split_preserves_events() {
    let bc = controller(200, 2, 5);
    let mut tree = unit_tree(bc.clone());

    for event in random_events(500, 2) {
        tree.add_event(event).unwrap();
    }
    // The root is over threshold but only flagged: splitting never happens
    // on the insertion call stack.
    assert_eq!(tree.leaf_count(), 1);
    assert_eq!(bc.num_boxes_to_split(), 1);

    let converted = tree.split_all_if_needed().unwrap();
    assert_eq!(converted, 1);
    assert_eq!(tree.leaf_count(), 4, "2x2 children replace the root leaf");
    assert_eq!(tree.n_points(), 500, "no events lost or duplicated");
    assert_eq!(bc.num_boxes_to_split(), 0, "old flag cleaned up");
    assert_eq!(bc.total_num_grid_boxes(), 1);
    assert_eq!(bc.num_boxes(), vec![0, 4, 0, 0, 0, 0]);
}

#[test]
fn test_children_tile_and_receive_by_coordinate() {
    let bc = controller(3, 2, 5);
    let mut tree = unit_tree(bc);

    // One event per quadrant, plus one more to push past the threshold.
    tree.add_event(Event2::new(1.0, 1.0, [0.25, 0.25])).unwrap();
    tree.add_event(Event2::new(2.0, 1.0, [0.75, 0.25])).unwrap();
    tree.add_event(Event2::new(3.0, 1.0, [0.25, 0.75])).unwrap();
    tree.add_event(Event2::new(4.0, 1.0, [0.75, 0.75])).unwrap();
    tree.split_all_if_needed().unwrap();

    assert_eq!(tree.leaf_count(), 4);
    let mut total_volume = 0.0;
    for leaf in tree.leaves() {
        assert_eq!(leaf.n_points(), 1, "each quadrant holds its own event");
        assert_eq!(leaf.depth(), 1);
        total_volume += leaf.extents().volume();
    }
    assert!(
        (total_volume - 1.0).abs() < 1e-9,
        "children tile the root volume, got {}",
        total_volume
    );
    // Signal went to the right quadrant.
    let quadrant = tree
        .leaves_filtered(|e| e.contains(&[0.9, 0.9]))
        .next()
        .expect("upper-right leaf exists");
    assert_eq!(quadrant.signal_total(), 4.0);
}

#[test]
fn test_overfull_children_are_reflagged_not_split_in_pass() {
    let bc = controller(10, 2, 5);
    let mut tree = unit_tree(bc.clone());

    // Everything in one corner: after the first split one child still holds
    // all events and is over threshold again.
    for i in 0..50 {
        let c = 0.001 + (i as f32) * 0.0001;
        tree.add_event(Event2::new(1.0, 1.0, [c, c])).unwrap();
    }
    let converted = tree.split_all_if_needed().unwrap();
    assert_eq!(converted, 1, "one pass converts only the flagged snapshot");
    assert_eq!(
        bc.num_boxes_to_split(),
        1,
        "the overfull child is flagged for the next pass"
    );

    let converted = tree.split_all_if_needed().unwrap();
    assert_eq!(converted, 1);
    assert_eq!(tree.n_points(), 50);
    assert_eq!(tree.leaf_count(), 7, "4 children, one replaced by 4 more");
}

#[test]
fn test_depth_ceiling_stops_splitting() {
    let bc = controller(5, 2, 1);
    let mut tree = unit_tree(bc.clone());

    for event in random_events(200, 3) {
        tree.add_event(event).unwrap();
    }
    tree.split_all_if_needed().unwrap();
    // Depth-1 leaves are over threshold but at the ceiling: they simply
    // accumulate, nothing is flagged.
    assert_eq!(tree.leaf_count(), 4);
    assert_eq!(bc.num_boxes_to_split(), 0);
    for _ in 0..3 {
        assert_eq!(tree.split_all_if_needed().unwrap(), 0);
    }
    assert_eq!(tree.n_points(), 200);
}

#[test]
fn test_rejects_out_of_bounds() {
    let bc = controller(1000, 2, 5);
    let tree = unit_tree(bc);
    assert!(!tree.add_event(Event2::new(1.0, 1.0, [1.5, 0.5])).unwrap());
    assert!(!tree.add_event(Event2::new(1.0, 1.0, [0.5, -0.1])).unwrap());
    assert_eq!(tree.n_points(), 0);
}

#[test]
fn test_dimension_mismatch_rejected() {
    let bc = Arc::new(BoxController::new(3));
    let result = EventTree::<Event2, 2>::new(Extents::new([0.0, 0.0], [1.0, 1.0]), bc);
    assert!(result.is_err());
}

#[test]
fn test_bulk_add_counts_and_splits() {
    let bc = controller(50, 2, 6);
    bc.set_events_per_task(100);
    bc.set_tasks_per_block(4);
    let mut tree = unit_tree(bc.clone());

    let mut events = random_events(5_000, 4);
    // A few out-of-bounds stragglers.
    events.push(Event2::new(1.0, 1.0, [2.0, 2.0]));
    events.push(Event2::new(1.0, 1.0, [-1.0, 0.5]));

    let outcome = tree.add_events(&events, &NullProgress).unwrap();
    assert_eq!(
        outcome,
        BulkAddOutcome {
            added: 5_000,
            rejected: 2,
            cancelled: false
        }
    );
    assert_eq!(tree.n_points(), 5_000);
    assert!(
        tree.leaf_count() > 4,
        "dense uniform data must split beyond the root grid"
    );
    // One track_num_boxes call per conversion keeps the stats consistent
    // with the real tree.
    assert_eq!(bc.total_num_boxes(), tree.leaf_count() as u64);
    let signal: f64 = tree.signal_total();
    assert!((signal - 5_000.0).abs() < 1e-6);
}

#[test]
fn test_bulk_add_cancellation_leaves_consistent_tree() {
    let bc = controller(50, 2, 6);
    bc.set_events_per_task(100);
    bc.set_tasks_per_block(1);
    let mut tree = unit_tree(bc.clone());

    let events = random_events(10_000, 5);
    let progress = CancelAfter::new(3);
    let outcome = tree.add_events(&events, &progress).unwrap();
    assert!(outcome.cancelled);
    assert!(outcome.added < 10_000, "cancelled before the batch finished");
    assert_eq!(
        tree.n_points(),
        outcome.added,
        "whatever was added is all there"
    );
    // Statistics remain queryable and consistent in the partial state.
    assert_eq!(bc.total_num_boxes(), tree.leaf_count() as u64);
    let _ = bc.average_depth();

    // A later pass can resume with whatever remained flagged.
    tree.split_all_if_needed().unwrap();
    assert_eq!(tree.n_points(), outcome.added);
}

#[test]
fn test_parallel_insertion_preserves_all_events() {
    let bc = controller(100, 2, 6);
    let mut tree = unit_tree(bc.clone());
    tree.split_root_box().unwrap();

    const N: usize = 50_000;
    let events = random_events(N, 6);

    // Insertion runs from many rayon workers over &tree; only per-leaf data
    // mutexes are contended.
    use rayon::prelude::*;
    events.par_chunks(500).for_each(|chunk| {
        for event in chunk {
            tree.add_event(*event).unwrap();
        }
    });
    assert_eq!(tree.n_points(), N as u64);

    // Alternate phases until no box wants splitting any more.
    let mut conversions = 0;
    loop {
        let converted = tree.split_all_if_needed().unwrap();
        if converted == 0 {
            break;
        }
        conversions += converted;
    }
    assert!(conversions > 0);
    assert_eq!(tree.n_points(), N as u64, "no events lost or duplicated");

    let counted: u64 = tree.leaves().map(|leaf| leaf.n_points()).sum();
    assert_eq!(counted, N as u64);
    assert_eq!(bc.total_num_boxes(), tree.leaf_count() as u64);
    // Root conversion + every pass conversion, exactly once each.
    assert_eq!(bc.total_num_grid_boxes(), 1 + conversions as u64);
}

#[test]
fn test_filtered_iteration_prunes_subtrees() {
    let bc = controller(10, 2, 4);
    let mut tree = unit_tree(bc);
    let events = random_events(2_000, 7);
    tree.add_events(&events, &NullProgress).unwrap();

    // Only leaves overlapping the left half.
    let left: Vec<_> = tree
        .leaves_filtered(|e| e.min[0] < 0.5)
        .collect();
    let all = tree.leaf_count();
    assert!(!left.is_empty());
    assert!(left.len() < all);
    for leaf in &left {
        assert!(leaf.extents().min[0] < 0.5);
    }
}

#[test]
fn test_forced_root_split_ignores_policy() {
    let bc = controller(1_000_000, 3, 5);
    let mut tree = unit_tree(bc.clone());
    tree.add_event(Event2::new(1.0, 1.0, [0.5, 0.5])).unwrap();

    // Far below threshold, but the forced path converts anyway.
    tree.split_root_box().unwrap();
    assert_eq!(tree.leaf_count(), 9);
    assert_eq!(tree.n_points(), 1);
    assert!(matches!(tree.root(), BoxNode::Grid(_)));

    // Idempotent on an already-grid root.
    tree.split_root_box().unwrap();
    assert_eq!(tree.leaf_count(), 9);
}

#[test]
fn test_forced_split_beyond_zero_ceiling_widens_it() {
    let bc = controller(10, 2, 0);
    let mut tree = unit_tree(bc.clone());
    assert!(!bc.will_split(1_000, 0));

    tree.split_root_box().unwrap();
    assert_eq!(
        bc.max_depth(),
        1,
        "track_num_boxes widens the ceiling for the forced path"
    );
    assert_eq!(tree.leaf_count(), 4);
}
