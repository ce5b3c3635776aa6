use anyhow::{Result, ensure};
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::kmeans::train_centroids;
use crate::l2::{l2_sqr, nearest_l2};

/// 每个子空间最多的中心点数量，对应 8 bit 编码
pub const MAX_KSUB: usize = 256;

/// 乘积量化器
///
/// 把 d 维向量切成 m 段，每段独立聚类，向量编码为 m 个字节
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductQuantizer {
    pub d: usize,
    pub m: usize,
    pub dsub: usize,
    pub ksub: usize,
    /// m 个子空间的中心点，形状为 m * ksub * dsub
    pub centroids: Vec<f32>,
}

impl ProductQuantizer {
    /// 训练量化器，子空间数量不足 256 个样本时使用更少的中心点
    pub fn train(x: &[f32], d: usize, m: usize, max_iter: usize, seed: u64) -> Result<Self> {
        ensure!(m > 0 && d % m == 0, "向量维度 {d} 不能被子空间数量 {m} 整除");
        let n = x.len() / d;
        ensure!(n > 0, "没有可用于训练的向量");
        let dsub = d / m;
        let ksub = MAX_KSUB.min(n);
        debug!("训练 PQ：n = {n}, m = {m}, ksub = {ksub}");

        let centroids = (0..m)
            .into_par_iter()
            .map(|j| {
                let sub = x
                    .chunks_exact(d)
                    .flat_map(|v| &v[j * dsub..(j + 1) * dsub])
                    .copied()
                    .collect::<Vec<_>>();
                train_centroids(&sub, dsub, ksub, max_iter, seed.wrapping_add(j as u64))
            })
            .collect::<Vec<_>>()
            .concat();

        Ok(Self { d, m, dsub, ksub, centroids })
    }

    fn sub_centroids(&self, j: usize) -> &[f32] {
        let size = self.ksub * self.dsub;
        &self.centroids[j * size..(j + 1) * size]
    }

    /// 编码单个向量
    pub fn encode(&self, x: &[f32]) -> Vec<u8> {
        (0..self.m)
            .map(|j| {
                let sub = &x[j * self.dsub..(j + 1) * self.dsub];
                nearest_l2(sub, self.sub_centroids(j), self.dsub).map_or(0, |(i, _)| i as u8)
            })
            .collect()
    }

    /// 计算查询向量到每个子空间每个中心点的距离表，形状为 m * ksub
    pub fn distance_table(&self, q: &[f32]) -> Vec<f32> {
        let mut table = Vec::with_capacity(self.m * self.ksub);
        for j in 0..self.m {
            let sub = &q[j * self.dsub..(j + 1) * self.dsub];
            table.extend(self.sub_centroids(j).chunks_exact(self.dsub).map(|c| l2_sqr(sub, c)));
        }
        table
    }

    /// 使用距离表计算非对称距离
    #[inline(always)]
    pub fn adc(&self, table: &[f32], code: &[u8]) -> f32 {
        code.iter().enumerate().map(|(j, &c)| table[j * self.ksub + c as usize]).sum()
    }

    /// 解码为近似向量
    #[cfg(test)]
    fn decode(&self, code: &[u8]) -> Vec<f32> {
        let mut v = Vec::with_capacity(self.d);
        for (j, &c) in code.iter().enumerate() {
            let c = c as usize;
            v.extend_from_slice(&self.sub_centroids(j)[c * self.dsub..(c + 1) * self.dsub]);
        }
        v
    }
}
