use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use mesh_distributor::algs::communicator::NoComm;
use mesh_distributor::data::crs_padding::CrsPadding;
use mesh_distributor::distributor::Distributor;

/// Serial destinations with every tenth item discarded; `grouped` sorts them.
fn destinations(n: usize, grouped: bool) -> Vec<Option<usize>> {
    let mut rng = SmallRng::seed_from_u64(0x5eed);
    let mut ids: Vec<Option<usize>> = (0..n)
        .map(|_| (rng.gen_range(0..10) != 0).then_some(0))
        .collect();
    if grouped {
        ids.sort_unstable();
    }
    ids
}

fn bench_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("distributor_plan");
    let comm = NoComm;

    for &n in &[10_000usize, 100_000] {
        for grouped in [true, false] {
            let ids = destinations(n, grouped);
            let label = if grouped { "contiguous" } else { "scattered" };
            group.bench_with_input(BenchmarkId::new(format!("create_{label}"), n), &ids, |b, ids| {
                b.iter(|| {
                    let mut dist = Distributor::new(&comm);
                    black_box(dist.create_from_sends(black_box(ids)).unwrap())
                })
            });

            let mut dist = Distributor::new(&comm);
            let m = dist.create_from_sends(&ids).unwrap();
            let mut imports = vec![0.0f64; m * 3];
            let exports3: Vec<f64> = (0..n).flat_map(|i| [i as f64; 3]).collect();
            group.bench_function(BenchmarkId::new(format!("exchange_{label}"), n), |b| {
                b.iter(|| {
                    dist.do_posts_and_waits(black_box(&exports3), 3, &mut imports)
                        .unwrap();
                })
            });
        }
    }
    group.finish();
}

fn bench_padding(c: &mut Criterion) {
    let mut rng = SmallRng::seed_from_u64(7);
    let rows: Vec<(Vec<u64>, Vec<u64>)> = (0..2_000)
        .map(|_| {
            let tgt = (0..32).map(|_| rng.gen_range(0..512)).collect();
            let src = (0..32).map(|_| rng.gen_range(0..512)).collect();
            (tgt, src)
        })
        .collect();

    c.bench_function("crs_padding_update", |b| {
        b.iter(|| {
            let mut pad = CrsPadding::<u32, u64>::new(0);
            for (row, (tgt, src)) in rows.iter().enumerate() {
                let (mut t, mut s) = (tgt.clone(), src.clone());
                pad.update_import(row, row as u32 % 500, &mut t, false, &mut s, false);
            }
            black_box(pad.num_rows())
        })
    });
}

criterion_group!(benches, bench_plan, bench_padding);
criterion_main!(benches);
