use criterion::{black_box, Bencher, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};

use recorddb::{Subspace, Tuple, TupleElement};

const CHUNK_SIZE: usize = 64;
const SEED: [u8; 32] = [100; 32];

fn sample_tuples(rng: &mut StdRng) -> Vec<Tuple> {
    (0..CHUNK_SIZE)
        .map(|_| {
            Tuple::from_elements(vec![
                TupleElement::String("R".into()),
                TupleElement::String("User".into()),
                TupleElement::Int(rng.gen()),
                TupleElement::String(format!("u{:08}", rng.gen::<u32>())),
            ])
        })
        .collect()
}

fn bench_pack(bencher: &mut Bencher<'_>) {
    let mut rng = StdRng::from_seed(SEED);
    let tuples = sample_tuples(&mut rng);
    bencher.iter(|| {
        for tuple in &tuples {
            black_box(tuple.pack());
        }
    });
}

fn bench_unpack(bencher: &mut Bencher<'_>) {
    let mut rng = StdRng::from_seed(SEED);
    let packed: Vec<Vec<u8>> = sample_tuples(&mut rng)
        .iter()
        .map(Tuple::pack)
        .collect();
    bencher.iter(|| {
        for bytes in &packed {
            black_box(Tuple::unpack(bytes).unwrap());
        }
    });
}

fn bench_subspace_pack(bencher: &mut Bencher<'_>) {
    let mut rng = StdRng::from_seed(SEED);
    let subspace = Subspace::from_bytes(vec![0x15, 0x09]);
    let tuples = sample_tuples(&mut rng);
    bencher.iter(|| {
        for tuple in &tuples {
            black_box(subspace.pack(tuple));
        }
    });
}

pub fn bench_encoding(criterion: &mut Criterion) {
    criterion
        .benchmark_group("tuple_encoding")
        .bench_function("pack", bench_pack)
        .bench_function("unpack", bench_unpack)
        .bench_function("subspace_pack", bench_subspace_pack);
}
