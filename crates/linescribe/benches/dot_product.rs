use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use linescribe::dotproduct::{self, DotProduct};
use linescribe::network::{Network, NetworkIO, NetworkScratch, StrideMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;

fn random_vector(len: usize, rng: &mut StdRng) -> Vec<f32> {
    (0..len).map(|_| rng.random_range(-1.0f32..1.0)).collect()
}

/// Benchmark: every available back end on typical layer widths
fn bench_backends(c: &mut Criterion) {
    let mut group = c.benchmark_group("dot_product");
    let mut rng = StdRng::seed_from_u64(42);

    for len in [16usize, 97, 385, 1024] {
        let a = random_vector(len, &mut rng);
        let b = random_vector(len, &mut rng);
        group.throughput(Throughput::Elements(len as u64));
        for backend in dotproduct::available_backends() {
            let dot = DotProduct::with_backend(backend);
            group.bench_with_input(BenchmarkId::new(backend.name(), len), &len, |bench, _| {
                bench.iter(|| dot.compute(black_box(&a), black_box(&b)));
            });
        }
    }
    group.finish();
}

/// Benchmark: forward pass of a small recognizer network
fn bench_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward");
    let network = Network::from_spec("[I36 Ct3,16 Mp2 Lbx48 O1c111]", 1).expect("valid bench network");
    let mut rng = StdRng::seed_from_u64(7);

    let width = 400;
    let mut input = NetworkIO::new_float(StrideMap::single(width), 36);
    for t in 0..width {
        input.f_mut(t).copy_from_slice(&random_vector(36, &mut rng));
    }

    for threads in [1usize, 4] {
        let scratch = NetworkScratch::new(threads).expect("worker pool");
        group.bench_with_input(BenchmarkId::new("threads", threads), &threads, |bench, _| {
            bench.iter(|| network.forward(black_box(&input), &scratch));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_backends, bench_forward);
criterion_main!(benches);
