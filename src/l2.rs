/// 计算两个等长向量的 L2 距离平方
#[inline(always)]
pub fn l2_sqr(va: &[f32], vb: &[f32]) -> f32 {
    debug_assert_eq!(va.len(), vb.len());
    // NOTE: 使用 4 个独立累加器，LLVM 可以在没有 fast-math 的情况下自动向量化
    let mut acc = [0f32; 4];
    let (ca, ra) = va.as_chunks::<4>();
    let (cb, rb) = vb.as_chunks::<4>();
    for (a, b) in ca.iter().zip(cb) {
        for i in 0..4 {
            let d = a[i] - b[i];
            acc[i] += d * d;
        }
    }
    let mut sum = (acc[0] + acc[1]) + (acc[2] + acc[3]);
    for (a, b) in ra.iter().zip(rb) {
        let d = a - b;
        sum += d * d;
    }
    sum
}

/// 在 `vb`（`d` 列的行优先矩阵）中寻找距离 `va` 最近的一行
///
/// 返回 `(行号, 距离平方)`，`vb` 为空时返回 `None`
pub fn nearest_l2(va: &[f32], vb: &[f32], d: usize) -> Option<(usize, f32)> {
    let mut best = None;
    let mut best_dis = f32::MAX;
    for (i, row) in vb.chunks_exact(d).enumerate() {
        let dis = l2_sqr(va, row);
        if dis < best_dis {
            best_dis = dis;
            best = Some(i);
        }
    }
    best.map(|i| (i, best_dis))
}

/// 计算向量 va 到 vb 每一行的 L2 距离平方，并按距离升序返回最近的 k 行
///
/// 距离相同时行号小的在前，结果只取决于输入
///
/// 参数：
/// - va: 长度为 d 的查询向量
/// - vb: d 列的行优先矩阵
/// - k: 返回的最近邻居数量
pub fn knn_l2(va: &[f32], vb: &[f32], d: usize, k: usize) -> Vec<(usize, f32)> {
    assert!(k <= 8, "k must be less than 8");
    if k == 0 {
        return vec![];
    }
    // 此处维护一个长度为 K 的单调递减数组，位于数组尾部
    // 插入时将前面的元素向左移动，保证最大的元素在前面
    let mut dis = [f32::MAX; 8];
    let mut idx = [usize::MAX; 8];
    for (i, row) in vb.chunks_exact(d).enumerate() {
        let dd = l2_sqr(va, row);
        if dd >= dis[8 - k] {
            continue;
        }
        for j in (8 - k..8).rev() {
            if dd < dis[j] {
                dis[8 - k..=j].rotate_left(1);
                dis[j] = dd;
                idx[8 - k..=j].rotate_left(1);
                idx[j] = i;
                break;
            }
        }
    }
    (8 - k..8)
        .rev()
        .filter(|&j| idx[j] != usize::MAX)
        .map(|j| (idx[j], dis[j]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_sqr() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0];
        let b = [1.0, 0.0, 3.0, 1.0, 7.0];
        assert_eq!(l2_sqr(&a, &b), 4.0 + 9.0 + 4.0);
        assert_eq!(l2_sqr(&a, &a), 0.0);
    }

    #[test]
    fn test_nearest_l2() {
        let base = [0.0, 0.0, 5.0, 5.0, 1.0, 1.0];
        let (i, d) = nearest_l2(&[0.9, 1.2], &base, 2).unwrap();
        assert_eq!(i, 2);
        assert!((d - 0.05).abs() < 1e-6);
        assert_eq!(nearest_l2(&[0.9, 1.2], &[], 2), None);
    }

    #[test]
    fn test_knn_l2_sorted() {
        let base = [10.0, 0.0, 3.0, 1.0, 2.0, 7.0];
        let r = knn_l2(&[0.0], &base, 1, 3);
        assert_eq!(r, vec![(1, 0.0), (3, 1.0), (4, 4.0)]);
    }

    #[test]
    fn test_knn_l2_fewer_rows_than_k() {
        let base = [3.0, 1.0];
        let r = knn_l2(&[0.0], &base, 1, 3);
        assert_eq!(r, vec![(1, 1.0), (0, 9.0)]);
    }

    #[test]
    fn test_knn_l2_ties_keep_first() {
        let base = [1.0, -1.0, 1.0];
        let r = knn_l2(&[0.0], &base, 1, 2);
        assert_eq!(r, vec![(0, 1.0), (1, 1.0)]);
    }
}
