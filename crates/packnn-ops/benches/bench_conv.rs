use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;

use packnn_ops::conv::{
    conv3x3s1_winograd43, conv3x3s1_winograd43_transform_kernel, conv_direct_f32, ConvParams,
};
use packnn_ops::Options;
use packnn_tensor::{cpu_allocator, Tensor};

fn bench_conv3x3(c: &mut Criterion) {
    let mut group = c.benchmark_group("conv3x3s1");
    let opt = Options::default();
    let alloc = cpu_allocator();

    for &(size, channels) in &[(32usize, 16usize), (64, 32)] {
        let data: Vec<f32> = (0..size * size * channels)
            .map(|x| (x as f32 * 0.01).sin())
            .collect();
        let input = Tensor::from_vec_3d(size, size, channels, 1, data, &alloc).unwrap();
        let weights: Vec<f32> = (0..channels * channels * 9)
            .map(|x| (x as f32 * 0.02).cos())
            .collect();
        let params = ConvParams {
            num_output: channels,
            kernel_size: 3,
            stride: 1,
            dilation: 1,
        };
        let kernel_tm =
            conv3x3s1_winograd43_transform_kernel(&weights, channels, channels, &opt).unwrap();

        let id = format!("{size}x{size}x{channels}");
        group.bench_with_input(BenchmarkId::new("direct", &id), &input, |b, input| {
            b.iter(|| {
                let out = conv_direct_f32(black_box(input), &weights, &[], &params, &opt).unwrap();
                black_box(out)
            })
        });
        group.bench_with_input(BenchmarkId::new("winograd43", &id), &input, |b, input| {
            b.iter(|| {
                let out =
                    conv3x3s1_winograd43(black_box(input), &kernel_tm, &[], channels, &opt)
                        .unwrap();
                black_box(out)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_conv3x3);
criterion_main!(benches);
