use kmeans::{EuclideanDistance, KMeans, KMeansConfig, KMeansState};
use log::debug;
use rand::SeedableRng;
use rand::rngs::StdRng;

/// 计算不平衡度，1.0 表示完全平衡
pub fn imbalance_factor(hist: &[usize]) -> f32 {
    let (mut tot, mut uf) = (0.0, 0.0);
    for h in hist {
        let h = *h as f32;
        tot += h;
        uf += h.powf(2.0);
    }
    uf * hist.len() as f32 / tot.powf(2.0)
}

/// 对行优先的 `f32` 向量进行 Lloyd k-means 聚类，返回 `k * d` 个中心点
///
/// 初始中心点由固定种子的 RNG 抽取，相同的输入和种子得到相同的中心点。
///
/// 参数：
/// - x: 输入向量，共 `n * d` 个值
/// - d: 向量维度
/// - k: 中心点数量，不能超过 `n`
/// - max_iter: 最大迭代次数
/// - seed: 初始中心点的随机种子
pub fn train_centroids(x: &[f32], d: usize, k: usize, max_iter: usize, seed: u64) -> Vec<f32> {
    assert!(d > 0 && x.len() % d == 0, "x.len() must be a multiple of d");
    let n = x.len() / d;
    assert!(k > 0 && k <= n, "k must be in 1..={n}, got {k}");

    let samples = x.to_vec();
    let km: KMeans<_, 8, _> = KMeans::new(&samples, n, d, EuclideanDistance);
    let conf = KMeansConfig::build()
        .random_generator(StdRng::seed_from_u64(seed))
        .iteration_done(&|s: &KMeansState<f32>, nr: usize, new_distsum: f32| {
            debug!(
                "第 {} 轮 - 不平衡度：{:.2} | 距离和变化：{:+.4}",
                nr,
                imbalance_factor(&s.centroid_frequency),
                new_distsum - s.distsum
            );
        })
        .build();
    let state = km.kmeans_lloyd(k, max_iter, KMeans::init_random_sample, &conf);

    let centroids = state.centroids.to_vec();
    // 中心点可能按 SIMD 宽度补齐，去掉补齐部分
    let stride = centroids.len() / k;
    if stride == d {
        return centroids;
    }
    centroids.chunks_exact(stride).flat_map(|c| &c[..d]).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_blobs() -> Vec<f32> {
        let mut x = vec![];
        for i in 0..20 {
            let e = i as f32 * 0.01;
            x.extend_from_slice(&[0.0 + e, 0.0 - e]);
            x.extend_from_slice(&[10.0 - e, 10.0 + e]);
        }
        x
    }

    #[test]
    fn test_train_two_blobs() {
        let x = two_blobs();
        let centroids = train_centroids(&x, 2, 2, 20, 7);
        assert_eq!(centroids.len(), 4);

        let mut centers: Vec<&[f32]> = centroids.chunks(2).collect();
        centers.sort_by(|a, b| a[0].total_cmp(&b[0]));
        assert!(centers[0][0].abs() < 0.2);
        assert!((centers[1][0] - 10.0).abs() < 0.2);
    }

    #[test]
    fn test_train_is_deterministic() {
        let x: Vec<f32> = (0..300).map(|i| ((i * 37) % 101) as f32 / 7.0).collect();
        let a = train_centroids(&x, 3, 8, 25, 1234);
        let b = train_centroids(&x, 3, 8, 25, 1234);
        assert_eq!(a, b);
        assert_eq!(a.len(), 8 * 3);
    }

    #[test]
    fn test_train_unpadded_dimension() {
        // 维度不是 SIMD 宽度的倍数
        let x: Vec<f32> = (0..5 * 40).map(|i| (i % 13) as f32).collect();
        let centroids = train_centroids(&x, 5, 4, 10, 0);
        assert_eq!(centroids.len(), 4 * 5);
    }

    #[test]
    #[should_panic(expected = "k must be in")]
    fn test_train_too_many_centroids() {
        train_centroids(&[1.0, 2.0], 1, 3, 10, 0);
    }

    #[test]
    fn test_imbalance_factor() {
        assert!((imbalance_factor(&[2, 2, 1]) - 1.08).abs() < 0.01);
        assert_eq!(imbalance_factor(&[5, 5]), 1.0);
    }
}
