mod index;
mod tasks;
mod validate;

use std::fs::{self, File, OpenOptions, TryLockError};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::task::spawn_blocking;

pub use self::index::rebuild_index;
pub use self::tasks::{ExtractionResult, extract_records};
pub use self::validate::{ValidationProbe, load_probes, validate_bundle};
use crate::artifact::{BuildMetadata, BuildStatus, copy_bundle};
use crate::catalog::CardCatalog;
use crate::config::{BuildOptions, BundleDir, IndexOptions, MatchOptions, ResourceDir};
use crate::error::CardscanError;
use crate::fetch::ImageFetcher;
use crate::matcher::Matcher;
use crate::metrics;
use crate::publisher::{ArtifactPublisher, NoopPublisher};
use crate::sift::{DESCRIPTOR_DIM, FeatureExtractor};
use crate::store::FeatureStore;

/// 数据目录的构建锁
///
/// 使用 staging 目录下锁文件的 advisory lock，同一数据目录上的所有进程互斥，drop 时释放
pub struct BuildLock {
    file: File,
    path: PathBuf,
}

impl BuildLock {
    /// 获取构建锁，已被占用时立即返回 [`CardscanError::BuildInProgress`]
    pub fn acquire(dir: &ResourceDir) -> Result<Self> {
        let staging = dir.staging();
        fs::create_dir_all(staging.path())?;
        let path = dir.build_lock();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("打开构建锁 {} 失败", path.display()))?;
        match file.try_lock() {
            Ok(()) => Ok(Self { file, path }),
            Err(TryLockError::WouldBlock) => {
                Err(CardscanError::BuildInProgress(staging.path().to_path_buf()).into())
            }
            Err(TryLockError::Error(e)) => {
                Err(anyhow::Error::from(e).context(format!("获取构建锁 {} 失败", path.display())))
            }
        }
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!("释放构建锁 {} 失败: {e}", self.path.display());
        }
    }
}

/// 数据目录中是否有构建正在运行，包括其他进程中的构建
pub fn is_build_running(dir: &ResourceDir) -> bool {
    let Ok(file) = File::open(dir.build_lock()) else {
        return false;
    };
    matches!(file.try_lock_shared(), Err(TryLockError::WouldBlock))
}

/// 构建流程：增量提取特征 → 重建索引 → 验证 → 发布到 serving → 导出
pub struct Builder<C, F, E, P = NoopPublisher> {
    dir: ResourceDir,
    catalog: Arc<C>,
    fetcher: Arc<F>,
    extractor: Arc<E>,
    publisher: P,
    index: IndexOptions,
    matching: MatchOptions,
    build: BuildOptions,
    /// 除 probes 目录以外额外的验证图片
    probes: Vec<ValidationProbe>,
}

impl<C, F, E> Builder<C, F, E>
where
    C: CardCatalog,
    F: ImageFetcher,
    E: FeatureExtractor,
{
    pub fn new(dir: ResourceDir, catalog: Arc<C>, fetcher: Arc<F>, extractor: Arc<E>) -> Self {
        Self {
            dir,
            catalog,
            fetcher,
            extractor,
            publisher: NoopPublisher,
            index: IndexOptions::default(),
            matching: MatchOptions::default(),
            build: BuildOptions::default(),
            probes: vec![],
        }
    }
}

impl<C, F, E, P> Builder<C, F, E, P>
where
    C: CardCatalog,
    F: ImageFetcher,
    E: FeatureExtractor,
    P: ArtifactPublisher,
{
    pub fn index_options(mut self, opts: IndexOptions) -> Self {
        self.index = opts;
        self
    }

    pub fn match_options(mut self, opts: MatchOptions) -> Self {
        self.matching = opts;
        self
    }

    pub fn build_options(mut self, opts: BuildOptions) -> Self {
        self.build = opts;
        self
    }

    pub fn probes(mut self, probes: Vec<ValidationProbe>) -> Self {
        self.probes = probes;
        self
    }

    /// 发布成功后把数据包交给 `publisher`
    pub fn publisher<Q: ArtifactPublisher>(self, publisher: Q) -> Builder<C, F, E, Q> {
        Builder {
            dir: self.dir,
            catalog: self.catalog,
            fetcher: self.fetcher,
            extractor: self.extractor,
            publisher,
            index: self.index,
            matching: self.matching,
            build: self.build,
            probes: self.probes,
        }
    }

    /// 执行一次构建
    ///
    /// 已有构建在运行时立即返回 [`CardscanError::BuildInProgress`]，
    /// 其余失败都记录在返回的 [`BuildMetadata`] 中，staging 目录保持原样
    pub async fn run(&self) -> Result<BuildMetadata> {
        let _lock = BuildLock::acquire(&self.dir)?;
        let staging = self.dir.staging();

        let mut meta = BuildMetadata::start();
        meta.save(staging.build_meta())?;
        info!("开始构建：{}", self.dir.path().display());

        if let Err(e) = self.run_inner(&staging, &mut meta).await {
            error!("构建失败: {e:#}");
            meta.fail(&e);
        }
        metrics::inc_build_count(meta.status.as_str());
        meta.save(staging.build_meta())?;

        info!(
            "构建结束：{}，共 {} 条记录，新增 {}，失败 {}，描述符 {}",
            meta.status.as_str(),
            meta.cards_total,
            meta.cards_new,
            meta.cards_failed,
            meta.descriptors_total
        );
        Ok(meta)
    }

    async fn run_inner(&self, staging: &BundleDir, meta: &mut BuildMetadata) -> Result<()> {
        self.prepare_staging(staging)?;

        let records = self.catalog.eligible_records().await?;
        meta.cards_total = records.len();

        let mut store = FeatureStore::open(staging.feature_store())?;
        let pending = records.into_iter().filter(|r| !store.contains(&r.card_id)).collect::<Vec<_>>();
        info!("目录中共 {} 条记录，需要提取 {} 条", meta.cards_total, pending.len());

        if !pending.is_empty() {
            let result =
                extract_records(pending, self.fetcher.clone(), self.extractor.clone(), &self.build).await?;
            meta.cards_failed = result.failed;
            if !result.sets.is_empty() {
                meta.cards_new = store.append(result.sets)?;
            }
            meta.save(staging.build_meta())?;
        }
        drop(store);

        meta.descriptors_total = spawn_blocking({
            let staging = staging.clone();
            let opts = self.index.clone();
            move || rebuild_index(&staging, &opts)
        })
        .await??;

        spawn_blocking({
            let staging = staging.clone();
            let probe_dir = self.dir.probes();
            let mut probes = self.probes.clone();
            let extractor = self.extractor.clone();
            let matcher = Matcher::new(self.extractor.clone(), self.matching.clone());
            move || {
                probes.extend(load_probes(&probe_dir, &*extractor)?);
                validate_bundle(&staging, &probes, &matcher)
            }
        })
        .await??;

        let serving = self.dir.serving();
        spawn_blocking({
            let staging = staging.clone();
            let serving = serving.clone();
            move || copy_bundle(&staging, &serving)
        })
        .await??;
        info!("数据包已发布到 {}", serving.path().display());

        if let Err(e) = self.publisher.publish(&serving).await {
            warn!("导出数据包失败: {e:#}");
            meta.publish_error = Some(format!("{e:#}"));
        }

        meta.finish(match meta.cards_failed {
            0 => BuildStatus::Success,
            _ => BuildStatus::PartialSuccess,
        });
        Ok(())
    }

    /// staging 中没有可用的特征库时，从 serving 复制一份，都没有则创建空的特征库
    fn prepare_staging(&self, staging: &BundleDir) -> Result<()> {
        let path = staging.feature_store();
        if path.is_file() {
            match FeatureStore::open(&path) {
                Ok(_) => return Ok(()),
                Err(e) => warn!("staging 特征库无法打开，重新初始化: {e:#}"),
            }
        }
        let serving = self.dir.serving();
        if serving.is_complete() {
            info!("从 serving 复制特征库到 staging");
            copy_bundle(&serving, staging)
        } else {
            info!("创建空的特征库");
            FeatureStore::create(&path, DESCRIPTOR_DIM)?;
            Ok(())
        }
    }
}
