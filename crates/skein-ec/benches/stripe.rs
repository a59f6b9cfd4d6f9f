//! Criterion benchmarks for the per-stripe coder
//!
//! Run with: cargo bench -p skein-ec

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::Rng;
use skein_ec::{ErasureConfig, StripeCoder};

const CHUNKS: &[(usize, &str)] = &[(4 * 1024, "4KB"), (64 * 1024, "64KB"), (1024 * 1024, "1MB")];

fn random_blocks(count: usize, size: usize) -> Vec<Vec<u8>> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let mut block = vec![0u8; size];
            rng.fill(&mut block[..]);
            block
        })
        .collect()
}

fn bench_encode_parity(c: &mut Criterion) {
    let mut group = c.benchmark_group("stripe_encode_parity");
    let config = ErasureConfig::from_k_n(4, 6).unwrap();

    for (chunk, name) in CHUNKS {
        let coder = StripeCoder::new(config, *chunk).unwrap();
        let data = random_blocks(4, *chunk);
        group.throughput(Throughput::Bytes(coder.stripe_data_size() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), chunk, |b, _| {
            b.iter(|| coder.encode_parity(black_box(&data)))
        });
    }
    group.finish();
}

fn bench_reconstruct(c: &mut Criterion) {
    let mut group = c.benchmark_group("stripe_reconstruct");
    let config = ErasureConfig::from_k_n(4, 6).unwrap();

    for (chunk, name) in CHUNKS {
        let coder = StripeCoder::new(config, *chunk).unwrap();
        let data = random_blocks(4, *chunk);
        let parity = coder.encode_parity(&data).unwrap();
        let inputs: Vec<(usize, &[u8])> = vec![
            (2, &data[2][..]),
            (3, &data[3][..]),
            (4, &parity[0][..]),
            (5, &parity[1][..]),
        ];
        group.throughput(Throughput::Bytes(coder.stripe_data_size() as u64));
        group.bench_with_input(BenchmarkId::new("two_data_lost", name), chunk, |b, _| {
            b.iter(|| coder.reconstruct_some(black_box(&inputs), &[0, 1]))
        });
    }
    group.finish();
}

fn bench_config_comparison(c: &mut Criterion) {
    let mut group = c.benchmark_group("stripe_config_comparison");
    let chunk = 64 * 1024;

    for (config, name) in [
        (ErasureConfig::rs_4_2(), "RS(4,2)"),
        (ErasureConfig::rs_6_3(), "RS(6,3)"),
        (ErasureConfig::rs_10_4(), "RS(10,4)"),
    ] {
        let coder = StripeCoder::new(config, chunk).unwrap();
        let data = random_blocks(config.data_shards(), chunk);
        group.throughput(Throughput::Bytes(coder.stripe_data_size() as u64));
        group.bench_function(name, |b| b.iter(|| coder.encode_parity(black_box(&data))));
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_encode_parity,
    bench_reconstruct,
    bench_config_comparison
);
criterion_main!(benches);
