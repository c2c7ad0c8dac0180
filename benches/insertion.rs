use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use mdboxtree::{BoxController, EventTree, Extents, LeanEvent, NullProgress};

type Event3 = LeanEvent<3>;

const EVENT_COUNTS: [usize; 3] = [10_000, 100_000, 500_000];

fn random_events(n: usize, seed: u64) -> Vec<Event3> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            Event3::new(
                rng.r#gen::<f64>(),
                1.0,
                [rng.r#gen::<f32>(), rng.r#gen::<f32>(), rng.r#gen::<f32>()],
            )
        })
        .collect()
}

fn make_tree(threshold: usize) -> EventTree<Event3, 3> {
    let bc = BoxController::new(3);
    bc.set_split_threshold(threshold);
    bc.set_split_into(5);
    bc.set_max_depth(5);
    EventTree::new(Extents::new([0.0; 3], [1.0; 3]), Arc::new(bc))
        .expect("dimensions match by construction")
}

fn benchmark_bulk_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulk_insert_3d");
    group.sample_size(20);

    for &n in &EVENT_COUNTS {
        let events = random_events(n, 42);
        group.bench_with_input(BenchmarkId::new("threshold_1000", n), &events, |b, events| {
            b.iter(|| {
                let mut tree = make_tree(1000);
                tree.add_events(black_box(events), &NullProgress).unwrap();
                black_box(tree.n_points());
            })
        });
    }
    group.finish();
}

fn benchmark_insert_no_splitting(c: &mut Criterion) {
    // Threshold above the population: pure leaf-append cost, no subdivision.
    let events = random_events(100_000, 7);

    c.bench_function("insert_100k_no_split", |b| {
        b.iter(|| {
            let mut tree = make_tree(1_000_000);
            tree.add_events(black_box(&events), &NullProgress).unwrap();
            black_box(tree.n_points());
        })
    });
}

criterion_group!(benches, benchmark_bulk_insert, benchmark_insert_no_splitting);
criterion_main!(benches);
