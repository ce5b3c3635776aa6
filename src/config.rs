use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use clap::{Parser, Subcommand, ValueEnum};
use directories::ProjectDirs;

use crate::cli::*;

static DATA_DIR: LazyLock<String> = LazyLock::new(|| {
    ProjectDirs::from("", "cardscan", "cardscan")
        .map(|dirs| dirs.data_dir().to_string_lossy().into_owned())
        .unwrap_or_else(|| "cardscan-data".to_string())
});

fn default_data_dir() -> &'static str {
    DATA_DIR.as_str()
}

#[derive(Parser, Debug, Clone, PartialEq)]
pub struct SiftOptions {
    /// 提取特征前将图片缩放到的正方形边长
    #[arg(long, value_name = "SIZE", default_value_t = 256)]
    pub image_size: i32,
    /// 最多保留的特征点数量，按响应强度排序
    #[arg(long, value_name = "N", default_value_t = 250)]
    pub max_keypoints: usize,
    /// CLAHE 对比度限制
    #[arg(long, value_name = "LIMIT", default_value_t = 2.0)]
    pub clahe_clip_limit: f64,
    /// CLAHE 网格边长
    #[arg(long, value_name = "N", default_value_t = 8)]
    pub clahe_tile_grid: i32,
    /// RootSIFT 归一化时使用的 eps
    #[arg(long, value_name = "EPS", default_value_t = 1e-7)]
    pub root_sift_eps: f32,
}

impl Default for SiftOptions {
    fn default() -> Self {
        Self {
            image_size: 256,
            max_keypoints: 250,
            clahe_clip_limit: 2.0,
            clahe_tile_grid: 8,
            root_sift_eps: 1e-7,
        }
    }
}

#[derive(Parser, Debug, Clone, PartialEq)]
pub struct IndexOptions {
    /// 倒排列表数量
    #[arg(long, value_name = "N", default_value_t = 100)]
    pub nlist: usize,
    /// PQ 子量化器数量，必须能整除向量维度
    #[arg(long, value_name = "M", default_value_t = 8)]
    pub pq_m: usize,
    /// 用于训练的向量数量，取最前面的 N 个
    #[arg(long, value_name = "N", default_value_t = 10000)]
    pub train_size: usize,
    /// k-means 最大迭代次数
    #[arg(long, value_name = "N", default_value_t = 25)]
    pub max_iter: usize,
    /// k-means 随机种子，固定种子保证重复构建的结果一致
    #[arg(long, value_name = "SEED", default_value_t = 0x5eed)]
    pub seed: u64,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self { nlist: 100, pq_m: 8, train_size: 10000, max_iter: 25, seed: 0x5eed }
    }
}

#[derive(Parser, Debug, Clone, PartialEq)]
pub struct MatchOptions {
    /// 每个查询描述符找到的最近邻数量
    #[arg(short, value_name = "K", default_value_t = 3)]
    pub k: usize,
    /// 候选卡牌的最少票数
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub min_candidate_votes: usize,
    /// 判定匹配成功的最少内点数量
    #[arg(long, value_name = "N", default_value_t = 8)]
    pub min_inliers: usize,
    /// 进行几何验证的最大候选数量
    #[arg(long, value_name = "N", default_value_t = 10)]
    pub max_candidates: usize,
    /// 搜索的倒排列表数量
    #[arg(long, value_name = "N", default_value_t = 10)]
    pub nprobe: usize,
    /// 比率测试阈值
    #[arg(long, value_name = "RATIO", default_value_t = 0.75)]
    pub ratio: f32,
    /// RANSAC 重投影误差阈值，单位为像素
    #[arg(long, value_name = "PX", default_value_t = 5.0)]
    pub ransac_threshold: f64,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            k: 3,
            min_candidate_votes: 1,
            min_inliers: 8,
            max_candidates: 10,
            nprobe: 10,
            ratio: 0.75,
            ransac_threshold: 5.0,
        }
    }
}

#[derive(Parser, Debug, Clone, PartialEq)]
pub struct BuildOptions {
    /// 同时下载的图片数量
    #[arg(long, value_name = "N", default_value_t = 16)]
    pub fetch_concurrency: usize,
    /// 提取特征的线程数量，默认为 CPU 核心数
    #[arg(long, value_name = "N", default_value_t = num_cpus::get())]
    pub workers: usize,
    /// 图片下载超时，单位为秒
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub fetch_timeout: u64,
    /// 构建成功后将数据包打包到 exports 目录
    #[arg(long)]
    pub publish: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self { fetch_concurrency: 16, workers: num_cpus::get(), fetch_timeout: 10, publish: false }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "cardscan", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// 数据目录，包含 staging、serving、probes 和 exports
    #[arg(short, long, default_value = default_data_dir())]
    pub data_dir: ResourceDir,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 从卡牌目录增量提取特征，重建索引，验证后发布
    Build(BuildCommand),
    /// 识别单张图片
    Match(MatchCommand),
    /// 启动 HTTP 识别服务
    Serve(ServeCommand),
    /// 查看 staging 和 serving 数据包的状态
    Inspect(InspectCommand),
}

/// 重新加载策略
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReloadPolicy {
    /// 文件变化稳定后立即在监视线程中重新加载
    #[default]
    Eager,
    /// 只标记需要重新加载，由下一个请求触发
    Lazy,
}

/// 数据目录，所有文件路径都从这里得到
#[derive(Debug, Clone)]
pub struct ResourceDir {
    path: PathBuf,
}

/// 一个数据包目录（staging 或 serving）中的固定文件名
pub const FEATURE_STORE_FILE: &str = "features.bin";
pub const INDEX_FILE: &str = "index.ivfpq";
pub const ID_MAP_FILE: &str = "id_map.json";
pub const BUILD_META_FILE: &str = "build_meta.json";
pub const BUILD_LOCK_FILE: &str = ".build.lock";

/// 数据包中的三个文件，按照发布顺序排列
pub const BUNDLE_FILES: [&str; 3] = [FEATURE_STORE_FILE, ID_MAP_FILE, INDEX_FILE];

impl ResourceDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 构建中的数据包目录
    pub fn staging(&self) -> BundleDir {
        BundleDir(self.path.join("staging"))
    }

    /// 正在服务的数据包目录
    pub fn serving(&self) -> BundleDir {
        BundleDir(self.path.join("serving"))
    }

    /// 验证用的查询图片目录，文件名为 `<card_id>.<ext>`
    pub fn probes(&self) -> PathBuf {
        self.path.join("probes")
    }

    /// 打包导出目录
    pub fn exports(&self) -> PathBuf {
        self.path.join("exports")
    }

    /// 卡牌目录数据库
    pub fn catalog(&self) -> PathBuf {
        self.path.join("catalog.db")
    }

    /// 构建锁文件，多个进程共用
    pub fn build_lock(&self) -> PathBuf {
        self.staging().path().join(BUILD_LOCK_FILE)
    }
}

impl FromStr for ResourceDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

/// staging 或 serving 目录
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BundleDir(PathBuf);

impl BundleDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    pub fn feature_store(&self) -> PathBuf {
        self.0.join(FEATURE_STORE_FILE)
    }

    pub fn index(&self) -> PathBuf {
        self.0.join(INDEX_FILE)
    }

    pub fn id_map(&self) -> PathBuf {
        self.0.join(ID_MAP_FILE)
    }

    pub fn build_meta(&self) -> PathBuf {
        self.0.join(BUILD_META_FILE)
    }

    /// 三个数据文件是否都存在
    pub fn is_complete(&self) -> bool {
        BUNDLE_FILES.iter().all(|name| self.0.join(name).is_file())
    }
}
