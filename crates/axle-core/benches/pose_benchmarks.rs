use axle_core::angle::Radians;
use axle_core::pose::{planar_transform, PoseTree};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn bench_with_respect_to(c: &mut Criterion) {
    let mut tree = PoseTree::new();
    let origin = tree.add_origin();

    // A chain the depth of a realistic frame tree: origin -> object ->
    // marker -> pre-action pose.
    let mut deep = origin;
    for i in 0..8 {
        deep = tree.add_pose(
            deep,
            planar_transform(10.0 * i as f32, 5.0, 0.0, Radians::from_degrees(15.0)),
        );
    }
    let robot = tree.add_pose(origin, planar_transform(3.0, 4.0, 0.0, Radians::new(0.0)));

    c.bench_function("with_respect_to_deep_chain", |b| {
        b.iter(|| {
            let rel = tree.with_respect_to(black_box(deep), black_box(robot)).unwrap();
            black_box(rel);
        })
    });
}

criterion_group!(benches, bench_with_respect_to);
criterion_main!(benches);
