use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tilestore::codec::{compress, decompress, Codec, CodecCtx};

fn generate_tile_data(cells: usize) -> Vec<u8> {
    // Slowly varying i32 cells, the shape tile data usually has
    let mut data = Vec::with_capacity(cells * 4);
    for i in 0..cells {
        data.extend_from_slice(&((i / 13) as i32).to_le_bytes());
    }
    data
}

fn generate_random_data(cells: usize) -> Vec<u8> {
    // Pseudo-random cells that do not compress well
    let mut data = Vec::with_capacity(cells * 4);
    let mut state = 0x12345678u32;
    for _ in 0..cells {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        data.extend_from_slice(&state.to_le_bytes());
    }
    data
}

fn bench_codecs(c: &mut Criterion) {
    let cells = 256 * 1024; // 1MB of i32 cells
    let ctx = CodecCtx::new(4, 1);

    for (label, data) in [
        ("compressible", generate_tile_data(cells)),
        ("random", generate_random_data(cells)),
    ] {
        let mut group = c.benchmark_group(format!("tile_{}", label));
        group.throughput(Throughput::Bytes(data.len() as u64));

        for codec in [
            Codec::Gzip,
            Codec::Zstd,
            Codec::Lz4,
            Codec::Bzip2,
            Codec::Rle,
            Codec::DoubleDelta,
        ] {
            group.bench_with_input(
                BenchmarkId::new("compress", format!("{:?}", codec)),
                &data,
                |b, data| {
                    b.iter(|| compress(codec, -1, ctx, black_box(data)).unwrap());
                },
            );

            let encoded = compress(codec, -1, ctx, &data).unwrap();
            group.bench_with_input(
                BenchmarkId::new("decompress", format!("{:?}", codec)),
                &encoded,
                |b, encoded| {
                    b.iter(|| {
                        let mut raw = vec![0u8; cells * 4];
                        decompress(codec, ctx, black_box(encoded), &mut raw).unwrap();
                        raw
                    });
                },
            );
        }
        group.finish();
    }
}

fn bench_coords_rle(c: &mut Criterion) {
    // Row-major walk of a 1024x256 grid, the best case for coordinate runs
    let mut coords = Vec::new();
    for r in 0..1024i32 {
        for col in 0..256i32 {
            coords.extend_from_slice(&r.to_le_bytes());
            coords.extend_from_slice(&col.to_le_bytes());
        }
    }
    let ctx = CodecCtx::new(4, 2);

    let mut group = c.benchmark_group("coords_rle");
    group.throughput(Throughput::Bytes(coords.len() as u64));
    for codec in [Codec::RleCoordsRow, Codec::RleCoordsCol, Codec::DoubleDelta] {
        group.bench_with_input(
            BenchmarkId::new("compress", format!("{:?}", codec)),
            &coords,
            |b, coords| {
                b.iter(|| compress(codec, -1, ctx, black_box(coords)).unwrap());
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_codecs, bench_coords_rle);
criterion_main!(benches);
