use criterion::{Criterion, black_box, criterion_group, criterion_main};
use cardscan::l2::{knn_l2, l2_sqr, nearest_l2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DIM: usize = 128;

fn random_vectors(n: usize) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(42); // 使用固定种子确保结果可重现
    (0..n * DIM).map(|_| rng.random::<f32>()).collect()
}

fn bench_l2(c: &mut Criterion) {
    let query = random_vectors(1);
    // 一张卡牌最多 250 个描述符
    let train = random_vectors(250);

    c.bench_function("l2_sqr_128", |b| b.iter(|| l2_sqr(black_box(&query), black_box(&train[..DIM]))));
    c.bench_function("nearest_l2_250", |b| {
        b.iter(|| nearest_l2(black_box(&query), black_box(&train), DIM))
    });
    c.bench_function("knn_l2_250_k2", |b| {
        b.iter(|| knn_l2(black_box(&query), black_box(&train), DIM, 2))
    });
}

criterion_group!(benches, bench_l2);
criterion_main!(benches);
