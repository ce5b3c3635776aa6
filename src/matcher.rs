use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use log::{debug, warn};
use opencv::calib3d;
use opencv::core::{self, Mat, Point2f, Vector};
use opencv::prelude::*;
use rayon::prelude::*;
use serde::Serialize;
use utoipa::ToSchema;

use crate::config::MatchOptions;
use crate::l2::knn_l2;
use crate::resource::ModelSnapshot;
use crate::sift::{FeatureExtractor, Features};
use crate::store::DescriptorSet;

/// 估计单应矩阵所需的最少匹配点数量
const MIN_HOMOGRAPHY_MATCHES: usize = 4;

/// 识别结果，找不到匹配不是错误
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MatchOutcome {
    Matched { card_id: String, inliers: usize },
    NoMatch,
    NoFeatures,
}

impl MatchOutcome {
    pub fn card_id(&self) -> Option<&str> {
        match self {
            Self::Matched { card_id, .. } => Some(card_id),
            _ => None,
        }
    }

    /// 用于日志和指标的标签
    pub fn label(&self) -> &'static str {
        match self {
            Self::Matched { .. } => "matched",
            Self::NoMatch => "no_match",
            Self::NoFeatures => "no_features",
        }
    }
}

/// 经过几何验证的候选卡牌
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct CandidateReport {
    pub card_id: String,
    /// 近邻投票数
    pub votes: usize,
    /// 所有参考图的 RANSAC 内点数之和
    pub inliers: usize,
}

/// 各阶段耗时，单位为毫秒
#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
pub struct MatchTimings {
    pub extract_ms: f64,
    pub ann_ms: f64,
    pub verify_ms: f64,
    pub total_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct MatchReport {
    pub outcome: MatchOutcome,
    /// 本次识别使用的数据包代数
    pub generation: u64,
    pub timings: MatchTimings,
    /// 按投票排名排列
    pub candidates: Vec<CandidateReport>,
}

/// 识别流程：提取特征 → 近邻投票 → 候选排序 → 逐个候选做几何验证 → 取内点最多者
pub struct Matcher<E> {
    extractor: Arc<E>,
    opts: MatchOptions,
}

impl<E: FeatureExtractor> Matcher<E> {
    pub fn new(extractor: Arc<E>, opts: MatchOptions) -> Self {
        Self { extractor, opts }
    }

    /// 识别一张编码后的图片
    pub fn match_image(&self, snapshot: &ModelSnapshot, image: &[u8]) -> MatchReport {
        let start = Instant::now();
        let features = self.extractor.extract(image);
        let extract_ms = elapsed_ms(start);
        let mut report = match features {
            Some(features) => self.match_features(snapshot, &features),
            None => MatchReport {
                outcome: MatchOutcome::NoFeatures,
                generation: snapshot.generation,
                timings: MatchTimings::default(),
                candidates: vec![],
            },
        };
        report.timings.extract_ms = extract_ms;
        report.timings.total_ms = elapsed_ms(start);
        report
    }

    /// 使用已经提取好的特征进行识别
    pub fn match_features(&self, snapshot: &ModelSnapshot, features: &Features) -> MatchReport {
        let start = Instant::now();
        let mut report = MatchReport {
            outcome: MatchOutcome::NoFeatures,
            generation: snapshot.generation,
            timings: MatchTimings::default(),
            candidates: vec![],
        };
        if features.is_empty() {
            return report;
        }
        if features.dim != snapshot.index.dim() {
            warn!("查询描述符维度 {} 与索引维度 {} 不一致", features.dim, snapshot.index.dim());
            report.outcome = MatchOutcome::NoMatch;
            return report;
        }

        let t = Instant::now();
        let candidates = self.rank_candidates(snapshot, features);
        report.timings.ann_ms = elapsed_ms(t);

        let t = Instant::now();
        let verified = candidates
            .into_par_iter()
            .map(|(card_id, votes)| {
                let inliers = match self.verify_candidate(snapshot, features, card_id) {
                    Ok(inliers) => inliers,
                    Err(e) => {
                        warn!("验证候选 {card_id} 失败: {e:#}");
                        0
                    }
                };
                CandidateReport { card_id: card_id.to_string(), votes, inliers }
            })
            .collect::<Vec<_>>();
        report.timings.verify_ms = elapsed_ms(t);

        // 内点数相同时，排名靠前的候选胜出
        let best = verified.iter().fold(None::<&CandidateReport>, |best, c| match best {
            Some(b) if b.inliers >= c.inliers => Some(b),
            _ => Some(c),
        });
        report.outcome = match best {
            Some(best) if best.inliers >= self.opts.min_inliers => {
                MatchOutcome::Matched { card_id: best.card_id.clone(), inliers: best.inliers }
            }
            _ => MatchOutcome::NoMatch,
        };
        debug!("识别结果：{:?}，候选：{:?}", report.outcome, verified);
        report.candidates = verified;
        report.timings.total_ms = elapsed_ms(start);
        report
    }

    /// 对每个查询描述符取 k 个近邻，按卡牌计票
    ///
    /// 返回票数不少于 `min_candidate_votes` 的前 `max_candidates` 个候选，
    /// 按票数降序、card_id 升序排列
    fn rank_candidates<'a>(
        &self,
        snapshot: &'a ModelSnapshot,
        features: &Features,
    ) -> Vec<(&'a str, usize)> {
        let neighbors =
            snapshot.index.search_batch(&features.descriptors, self.opts.k, self.opts.nprobe);
        let mut votes: HashMap<&str, usize> = HashMap::new();
        for neighbor in neighbors.iter().flatten() {
            if let Some(card_id) = snapshot.id_map.get(neighbor.id) {
                *votes.entry(card_id).or_default() += 1;
            }
        }
        let mut ranked = votes
            .into_iter()
            .filter(|(_, v)| *v >= self.opts.min_candidate_votes)
            .collect::<Vec<_>>();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        ranked.truncate(self.opts.max_candidates);
        ranked
    }

    /// 对一张候选卡牌的所有参考图计算内点数之和
    fn verify_candidate(
        &self,
        snapshot: &ModelSnapshot,
        query: &Features,
        card_id: &str,
    ) -> Result<usize> {
        let sets = snapshot.store.load(card_id)?;
        let mut total = 0;
        for DescriptorSet { features, .. } in &sets {
            total += geometric_inliers(query, features, self.opts.ratio, self.opts.ransac_threshold)?;
        }
        Ok(total)
    }
}

/// 比率测试：最近邻距离小于次近邻距离的 `ratio` 倍时视为可靠匹配
///
/// 返回 `(查询下标, 参考下标)`
pub fn ratio_test(query: &Features, train: &Features, ratio: f32) -> Vec<(usize, usize)> {
    if train.dim != query.dim {
        return vec![];
    }
    (0..query.len())
        .filter_map(|i| {
            let nn = knn_l2(query.descriptor(i), &train.descriptors, train.dim, 2);
            match nn.as_slice() {
                [(j, d1), (_, d2)] if d1.sqrt() < ratio * d2.sqrt() => Some((i, *j)),
                _ => None,
            }
        })
        .collect()
}

/// 通过比率测试筛选匹配点，再用 RANSAC 估计单应矩阵，返回内点数量
pub fn geometric_inliers(
    query: &Features,
    train: &Features,
    ratio: f32,
    ransac_threshold: f64,
) -> opencv::Result<usize> {
    let good = ratio_test(query, train, ratio);
    if good.len() < MIN_HOMOGRAPHY_MATCHES {
        return Ok(0);
    }
    let src = good
        .iter()
        .map(|&(i, _)| Point2f::new(query.keypoints[i].x, query.keypoints[i].y))
        .collect::<Vector<Point2f>>();
    let dst = good
        .iter()
        .map(|&(_, j)| Point2f::new(train.keypoints[j].x, train.keypoints[j].y))
        .collect::<Vector<Point2f>>();
    let mut mask = Mat::default();
    let h = calib3d::find_homography(&src, &dst, &mut mask, calib3d::RANSAC, ransac_threshold)?;
    if h.empty() || mask.empty() {
        return Ok(0);
    }
    Ok(core::count_non_zero(&mask)? as usize)
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::sift::Keypoint;

    fn random_features(n: usize, dim: usize, seed: u64) -> Features {
        let mut rng = StdRng::seed_from_u64(seed);
        let keypoints = (0..n)
            .map(|_| Keypoint::at(rng.random_range(0.0..256.0), rng.random_range(0.0..256.0)))
            .collect();
        let descriptors = (0..n * dim).map(|_| rng.random::<f32>()).collect();
        Features::new(keypoints, descriptors, dim)
    }

    #[test]
    fn test_ratio_test_identical() {
        let f = random_features(30, 16, 1);
        let good = ratio_test(&f, &f, 0.75);
        assert_eq!(good, (0..30).map(|i| (i, i)).collect::<Vec<_>>());
    }

    #[test]
    fn test_ratio_test_needs_two_neighbors() {
        let query = random_features(5, 16, 1);
        let train = random_features(1, 16, 2);
        assert!(ratio_test(&query, &train, 0.75).is_empty());
    }

    #[test]
    fn test_geometric_inliers_shifted() {
        let train = random_features(60, 16, 3);
        let mut query = train.clone();
        // 整体平移 + 小于 2 像素的扰动
        let mut rng = StdRng::seed_from_u64(4);
        for kp in &mut query.keypoints {
            kp.x += 10.0 + rng.random_range(-1.5..1.5);
            kp.y -= 7.0 + rng.random_range(-1.5..1.5);
        }
        let inliers = geometric_inliers(&query, &train, 0.75, 5.0).unwrap();
        assert!(inliers >= 50, "inliers = {inliers}");
    }

    #[test]
    fn test_geometric_inliers_unrelated() {
        let a = random_features(60, 16, 5);
        let b = random_features(60, 16, 6);
        assert!(geometric_inliers(&a, &b, 0.75, 5.0).unwrap() < 8);
    }
}
