use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use log::{error, info, warn};

use crate::artifact::{BundleStamp, IdMap};
use crate::config::{BUNDLE_FILES, BundleDir, ReloadPolicy};
use crate::error::CardscanError;
use crate::ivf::IvfPqIndex;
use crate::metrics;
use crate::store::FeatureStore;

/// 加载到内存中的数据包
///
/// 创建后不再修改，重新加载时整体替换
pub struct ModelSnapshot {
    pub generation: u64,
    pub index: IvfPqIndex,
    pub store: FeatureStore,
    pub id_map: IdMap,
    pub loaded_at: DateTime<Utc>,
}

impl ModelSnapshot {
    /// 从数据包目录加载，并检查三个文件是否来自同一次构建
    pub fn open(dir: &BundleDir, generation: u64) -> Result<Self> {
        for name in BUNDLE_FILES {
            let path = dir.path().join(name);
            if !path.is_file() {
                return Err(CardscanError::MissingArtifact(path).into());
            }
        }

        // 先打开特征库和 id_map 并计算摘要，最后读取索引，
        // 发布时索引最后写入，这样读到的新索引一定能发现旧的特征库或 id_map
        let store = FeatureStore::open(dir.feature_store())?;
        let (id_map, id_map_digest) = IdMap::load_with_digest(dir.id_map())?;
        let stamp = BundleStamp { id_map: id_map_digest, feature_store: store.digest()? };
        let index = IvfPqIndex::load(dir.index())?;

        if id_map.len() as u64 != index.ntotal() {
            return Err(CardscanError::InconsistentBundle(format!(
                "id_map 长度 {} 与索引向量数量 {} 不一致",
                id_map.len(),
                index.ntotal()
            ))
            .into());
        }
        if index.dim() != store.dim() {
            return Err(CardscanError::InconsistentBundle(format!(
                "索引维度 {} 与特征库维度 {} 不一致",
                index.dim(),
                store.dim()
            ))
            .into());
        }
        if index.stamp() != Some(&stamp) {
            return Err(CardscanError::InconsistentBundle(
                "索引记录的摘要与 id_map 或特征库不符".to_string(),
            )
            .into());
        }

        Ok(Self { generation, index, store, id_map, loaded_at: Utc::now() })
    }
}

/// 持有当前正在服务的数据包
///
/// 读者通过 [`ResourceManager::current`] 拿到一个 `Arc`，在一次请求内一直使用它；
/// 重新加载只替换指针，旧的数据包在最后一个读者释放后才关闭。
pub struct ResourceManager {
    bundle: BundleDir,
    policy: ReloadPolicy,
    current: ArcSwapOption<ModelSnapshot>,
    /// 保证同一时间只有一个加载过程
    reload_lock: Mutex<()>,
    reload_due: AtomicBool,
    generation: AtomicU64,
}

impl ResourceManager {
    pub fn new(bundle: BundleDir, policy: ReloadPolicy) -> Self {
        Self {
            bundle,
            policy,
            current: ArcSwapOption::empty(),
            reload_lock: Mutex::new(()),
            reload_due: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    pub fn bundle(&self) -> &BundleDir {
        &self.bundle
    }

    /// 当前数据包的代数，从未加载成功时为 0
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// 重新读取 serving 目录并替换当前数据包
    ///
    /// 数据包不一致时返回错误，当前数据包保持不变
    pub fn load(&self) -> Result<Arc<ModelSnapshot>> {
        let _guard = self.reload_lock.lock().unwrap_or_else(|e| e.into_inner());
        let generation = self.generation.load(Ordering::Acquire) + 1;
        match ModelSnapshot::open(&self.bundle, generation) {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                self.current.store(Some(snapshot.clone()));
                self.generation.store(generation, Ordering::Release);
                metrics::inc_reload_count("ok");
                metrics::set_snapshot_generation(generation);
                info!(
                    "已加载第 {generation} 代数据包：{} 个向量，{} 张卡牌",
                    snapshot.index.ntotal(),
                    snapshot.store.num_cards()
                );
                Ok(snapshot)
            }
            Err(e) => {
                metrics::inc_reload_count("rejected");
                error!("拒绝加载 {}: {e:#}", self.bundle.path().display());
                Err(e)
            }
        }
    }

    /// 返回当前数据包，不会阻塞
    pub fn current(&self) -> Option<Arc<ModelSnapshot>> {
        self.current.load_full()
    }

    /// 标记需要重新加载，由下一次 [`ResourceManager::maybe_reload`] 处理
    pub fn mark_reload_due(&self) {
        self.reload_due.store(true, Ordering::Release);
    }

    pub fn is_reload_due(&self) -> bool {
        self.reload_due.load(Ordering::Acquire)
    }

    /// 如果之前被标记过，则重新加载，返回是否加载成功
    pub fn maybe_reload(&self) -> Result<bool> {
        if self.reload_due.swap(false, Ordering::AcqRel) {
            self.load()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// 文件监视器在 serving 目录稳定后调用
    pub fn on_bundle_changed(&self) {
        match self.policy {
            ReloadPolicy::Eager => {
                if let Err(e) = self.load() {
                    warn!("重新加载失败，继续使用当前数据包: {e:#}");
                }
            }
            ReloadPolicy::Lazy => {
                info!("serving 目录已更新，下一次请求时重新加载");
                self.mark_reload_due();
            }
        }
    }

    /// 为一次请求取得数据包，懒加载模式下会先处理待定的重新加载
    pub fn snapshot_for_request(&self) -> Result<Arc<ModelSnapshot>> {
        if self.policy == ReloadPolicy::Lazy {
            if let Err(e) = self.maybe_reload() {
                warn!("重新加载失败，继续使用当前数据包: {e:#}");
            }
        }
        self.current().ok_or_else(|| anyhow!("还没有可用的数据包"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ResourceManager::new(BundleDir::new(dir.path()), ReloadPolicy::Eager);
        let err = manager.load().unwrap_err();
        assert!(matches!(err.downcast_ref(), Some(CardscanError::MissingArtifact(_))));
        assert_eq!(manager.generation(), 0);
        assert!(manager.current().is_none());
        assert!(manager.snapshot_for_request().is_err());
    }

    #[test]
    fn test_eager_change_without_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ResourceManager::new(BundleDir::new(dir.path()), ReloadPolicy::Eager);
        manager.on_bundle_changed();
        assert_eq!(manager.generation(), 0);
        assert!(manager.current().is_none());
        assert!(!manager.is_reload_due());
    }

    #[test]
    fn test_lazy_marks_reload() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ResourceManager::new(BundleDir::new(dir.path()), ReloadPolicy::Lazy);
        manager.on_bundle_changed();
        assert!(manager.is_reload_due());
        // 加载失败也会清除标记，等待下一次文件变化
        assert!(manager.maybe_reload().is_err());
        assert!(!manager.is_reload_due());
        assert!(!manager.maybe_reload().unwrap());
    }
}
