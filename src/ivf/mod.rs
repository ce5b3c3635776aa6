mod invlists;
mod pq;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Result, bail, ensure};
pub use invlists::*;
use log::{debug, info};
pub use pq::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::artifact::BundleStamp;
use crate::config::IndexOptions;
use crate::error::CardscanError;
use crate::kmeans::train_centroids;
use crate::l2::{l2_sqr, nearest_l2};

const INDEX_MAGIC: [u8; 4] = *b"CSIX";
const INDEX_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: u64,
    pub distance: f32,
}

impl Eq for Neighbor {}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance.total_cmp(&other.distance).then(self.id.cmp(&other.id))
    }
}

/// 维护距离最小的 k 个邻居
pub struct TopKNeighbors {
    heap: BinaryHeap<Neighbor>,
    k: usize,
}

impl TopKNeighbors {
    pub fn new(k: usize) -> Self {
        Self { heap: BinaryHeap::with_capacity(k + 1), k }
    }

    pub fn push(&mut self, neighbor: Neighbor) {
        if self.heap.len() < self.k {
            self.heap.push(neighbor);
        } else if let Some(mut top) = self.heap.peek_mut() {
            if neighbor < *top {
                *top = neighbor;
            }
        }
    }

    /// 按距离升序返回
    pub fn into_sorted_vec(self) -> Vec<Neighbor> {
        self.heap.into_sorted_vec()
    }
}

/// IVF-PQ 索引
///
/// 粗量化器把向量分配到 nlist 个倒排列表，列表中保存残差的 PQ 编码。
/// 向量 ID 就是添加顺序，与 id_map 的下标一一对应。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IvfPqIndex {
    dim: usize,
    /// 粗量化中心点，形状为 nlist * dim
    coarse: Vec<f32>,
    pq: ProductQuantizer,
    invlists: ArrayInvertedLists,
    ntotal: u64,
    stamp: Option<BundleStamp>,
}

impl IvfPqIndex {
    /// 训练一个空索引
    ///
    /// 只使用前 `opts.train_size` 个向量训练，向量总数少于 `nlist` 时返回
    /// [`CardscanError::TooFewDescriptors`]
    pub fn train(x: &[f32], dim: usize, opts: &IndexOptions) -> Result<Self> {
        ensure!(dim > 0 && x.len() % dim == 0, "向量数据长度 {} 不是维度 {dim} 的整数倍", x.len());
        let n = x.len() / dim;
        if n < opts.nlist || opts.nlist == 0 {
            bail!(CardscanError::TooFewDescriptors { got: n, nlist: opts.nlist });
        }
        ensure!(dim % opts.pq_m == 0, "向量维度 {dim} 不能被 pq_m = {} 整除", opts.pq_m);

        let ntrain = opts.train_size.max(opts.nlist).min(n);
        let sample = &x[..ntrain * dim];
        info!("训练粗量化器：{ntrain} 组向量，nlist = {}", opts.nlist);
        let coarse = train_centroids(sample, dim, opts.nlist, opts.max_iter, opts.seed);

        let residuals = sample
            .par_chunks_exact(dim)
            .flat_map_iter(|v| residual(v, &coarse, dim))
            .collect::<Vec<_>>();
        info!("训练乘积量化器：m = {}", opts.pq_m);
        let pq = ProductQuantizer::train(&residuals, dim, opts.pq_m, opts.max_iter, opts.seed)?;

        let invlists = ArrayInvertedLists::new(opts.nlist, pq.m);
        Ok(Self { dim, coarse, pq, invlists, ntotal: 0, stamp: None })
    }

    /// 添加向量，ID 从当前 ntotal 开始递增
    pub fn add(&mut self, x: &[f32]) -> Result<()> {
        ensure!(x.len() % self.dim == 0, "向量数据长度 {} 不是维度 {} 的整数倍", x.len(), self.dim);
        // 并行计算编码，然后按顺序写入，保证列表内的顺序与输入顺序一致
        let encoded = x
            .par_chunks_exact(self.dim)
            .map(|v| {
                let (list_no, _) = nearest_l2(v, &self.coarse, self.dim).unwrap_or((0, 0.0));
                let r = residual_to(v, &self.coarse[list_no * self.dim..(list_no + 1) * self.dim]);
                (list_no, self.pq.encode(&r))
            })
            .collect::<Vec<_>>();
        for (list_no, code) in encoded {
            self.invlists.add_entry(list_no, self.ntotal, &code);
            self.ntotal += 1;
        }
        debug!("索引向量数量：{}，不平衡度：{:.2}", self.ntotal, self.invlists.imbalance());
        Ok(())
    }

    /// 搜索单个查询向量的 k 个近似最近邻，按距离升序返回
    pub fn search(&self, q: &[f32], k: usize, nprobe: usize) -> Vec<Neighbor> {
        let mut probes = self
            .coarse
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(i, c)| (i, l2_sqr(q, c)))
            .collect::<Vec<_>>();
        probes.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        probes.truncate(nprobe.max(1));

        let mut topk = TopKNeighbors::new(k);
        for (list_no, _) in probes {
            let (ids, codes) = self.invlists.get_list(list_no);
            if ids.is_empty() {
                continue;
            }
            let r = residual_to(q, &self.coarse[list_no * self.dim..(list_no + 1) * self.dim]);
            let table = self.pq.distance_table(&r);
            for (id, code) in ids.iter().zip(codes.chunks_exact(self.pq.m)) {
                topk.push(Neighbor { id: *id, distance: self.pq.adc(&table, code) });
            }
        }
        topk.into_sorted_vec()
    }

    /// 批量搜索，`queries` 为行优先矩阵
    pub fn search_batch(&self, queries: &[f32], k: usize, nprobe: usize) -> Vec<Vec<Neighbor>> {
        queries.par_chunks_exact(self.dim).map(|q| self.search(q, k, nprobe)).collect()
    }

    pub fn ntotal(&self) -> u64 {
        self.ntotal
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn nlist(&self) -> usize {
        self.invlists.nlist()
    }

    /// PQ 子空间数量
    pub fn pq_m(&self) -> usize {
        self.pq.m
    }

    /// 倒排列表的不平衡度，1 表示完全均匀
    pub fn imbalance(&self) -> f32 {
        self.invlists.imbalance()
    }

    pub fn stamp(&self) -> Option<&BundleStamp> {
        self.stamp.as_ref()
    }

    pub fn set_stamp(&mut self, stamp: BundleStamp) {
        self.stamp = Some(stamp);
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&INDEX_MAGIC)?;
        bincode::serialize_into(&mut writer, &INDEX_VERSION)?;
        bincode::serialize_into(&mut writer, self)?;
        writer.into_inner()?.sync_all()?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut magic = [0u8; 4];
        std::io::Read::read_exact(&mut reader, &mut magic)?;
        ensure!(magic == INDEX_MAGIC, "不是 cardscan 索引文件");
        let version: u32 = bincode::deserialize_from(&mut reader)?;
        ensure!(version == INDEX_VERSION, "不支持的索引版本: {version}");
        let index: Self = bincode::deserialize_from(&mut reader)?;
        ensure!(index.coarse.len() == index.nlist() * index.dim, "索引文件已损坏");
        Ok(index)
    }
}

fn residual(v: &[f32], coarse: &[f32], dim: usize) -> Vec<f32> {
    let (list_no, _) = nearest_l2(v, coarse, dim).unwrap_or((0, 0.0));
    residual_to(v, &coarse[list_no * dim..(list_no + 1) * dim])
}

fn residual_to(v: &[f32], centroid: &[f32]) -> Vec<f32> {
    v.iter().zip(centroid).map(|(a, b)| a - b).collect()
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n * dim).map(|_| rng.random::<f32>()).collect()
    }

    fn small_opts() -> IndexOptions {
        IndexOptions { nlist: 4, pq_m: 4, train_size: 10000, max_iter: 10, seed: 42 }
    }

    #[test]
    fn test_search_finds_itself() {
        let x = random_vectors(200, 16, 1);
        let mut index = IvfPqIndex::train(&x, 16, &small_opts()).unwrap();
        index.add(&x).unwrap();
        assert_eq!(index.ntotal(), 200);

        let mut hits = 0;
        for (i, q) in x.chunks_exact(16).enumerate().take(50) {
            let r = index.search(q, 3, 4);
            assert!(r.windows(2).all(|w| w[0].distance <= w[1].distance));
            if r.iter().any(|n| n.id == i as u64) {
                hits += 1;
            }
        }
        // ksub = 200 时每个训练样本都接近自己的子中心点，召回率应当很高
        assert!(hits >= 45, "recall too low: {hits}/50");
    }

    #[test]
    fn test_too_few_descriptors() {
        let x = random_vectors(3, 16, 2);
        let err = IvfPqIndex::train(&x, 16, &small_opts()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CardscanError>(),
            Some(CardscanError::TooFewDescriptors { got: 3, nlist: 4 })
        ));
    }

    #[test]
    fn test_train_is_deterministic() {
        let x = random_vectors(120, 16, 3);
        let mut a = IvfPqIndex::train(&x, 16, &small_opts()).unwrap();
        let mut b = IvfPqIndex::train(&x, 16, &small_opts()).unwrap();
        a.add(&x).unwrap();
        b.add(&x).unwrap();
        assert_eq!(bincode::serialize(&a).unwrap(), bincode::serialize(&b).unwrap());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.ivfpq");
        let x = random_vectors(64, 16, 4);
        let mut index = IvfPqIndex::train(&x, 16, &small_opts()).unwrap();
        index.add(&x).unwrap();
        index.set_stamp(BundleStamp { id_map: "a".into(), feature_store: "b".into() });
        index.save(&path).unwrap();

        let loaded = IvfPqIndex::load(&path).unwrap();
        assert_eq!(loaded, index);
        assert_eq!(loaded.search(&x[..16], 2, 2), index.search(&x[..16], 2, 2));
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.ivfpq");
        std::fs::write(&path, b"not an index").unwrap();
        assert!(IvfPqIndex::load(&path).is_err());
    }

    #[test]
    fn test_topk_neighbors() {
        let mut topk = TopKNeighbors::new(2);
        for (id, d) in [(0, 3.0), (1, 1.0), (2, 2.0), (3, 1.0)] {
            topk.push(Neighbor { id, distance: d });
        }
        let ids = topk.into_sorted_vec().iter().map(|n| n.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 3]);
    }
}
