use cartgrid::bitmask::BitMask32;
use cartgrid::{CellStencil, StencilConstants};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn stencil_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("stencil");

    // A 64^3 slab with a one-cell halo, fully periodic on a single
    // task: every direction is a self-wrap, so the shift path is hot.
    let all_but_center = BitMask32::new(0b00000111111111111101111111111111);
    let wrapped = StencilConstants::new(
        [64, 64, 64],
        [1, 66, 66 * 66],
        1 + 66 + 66 * 66,
        all_but_center,
        BitMask32::new(0),
    );
    // The same slab surrounded by real neighbours: no shifts, no
    // fallbacks.
    let interior = StencilConstants::new(
        [64, 64, 64],
        [1, 66, 66 * 66],
        1 + 66 + 66 * 66,
        BitMask32::new(0),
        BitMask32::new(0),
    );

    group.bench_function("calculate_index interior sweep", |b| {
        b.iter(|| {
            let mut acc = 0usize;
            for x in 0..64 {
                let stencil = CellStencil::new([x, 32, 32], interior);
                acc = acc.wrapping_add(stencil.calculate_index(black_box([x + 1, 31, 33])));
            }
            acc
        })
    });

    group.bench_function("indices wrapped edge", |b| {
        b.iter(|| {
            let stencil = CellStencil::new(black_box([0, 0, 0]), wrapped);
            stencil.indices()
        })
    });

    group.bench_function("indices interior", |b| {
        b.iter(|| {
            let stencil = CellStencil::new(black_box([32, 32, 32]), interior);
            stencil.indices()
        })
    });

    group.finish();
}

criterion_group!(benches, stencil_benchmark);
criterion_main!(benches);
