use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;

use packnn_ops::{convert_packing, Options};
use packnn_tensor::{cpu_allocator, Tensor};

fn bench_convert_packing(c: &mut Criterion) {
    let mut group = c.benchmark_group("convert_packing");
    let opt = Options::default();
    let alloc = cpu_allocator();

    for &(size, channels) in &[(64usize, 32usize), (128, 64)] {
        let data: Vec<f32> = (0..size * size * channels).map(|x| x as f32).collect();
        let scalar = Tensor::from_vec_3d(size, size, channels, 1, data, &alloc).unwrap();
        let packed = convert_packing(&scalar, 4, &opt).unwrap();

        let id = format!("{size}x{size}x{channels}");
        group.bench_with_input(BenchmarkId::new("pack1_to_4", &id), &scalar, |b, t| {
            b.iter(|| black_box(convert_packing(black_box(t), 4, &opt).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("pack4_to_1", &id), &packed, |b, t| {
            b.iter(|| black_box(convert_packing(black_box(t), 1, &opt).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("pack1_to_8", &id), &scalar, |b, t| {
            b.iter(|| black_box(convert_packing(black_box(t), 8, &opt).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_convert_packing);
criterion_main!(benches);
