use anyhow::Result;
use log::info;

use crate::artifact::{BundleStamp, IdMap};
use crate::config::{BundleDir, IndexOptions};
use crate::ivf::IvfPqIndex;
use crate::store::FeatureStore;

/// 用特征库中的全部描述符从头构建索引和 id_map，返回描述符数量
///
/// 先写 id_map，再计算摘要写入索引，索引最后落盘。
/// 已有索引的摘要和参数与当前特征库一致时直接沿用
pub fn rebuild_index(bundle: &BundleDir, opts: &IndexOptions) -> Result<usize> {
    if let Some(count) = reusable_index(bundle, opts) {
        info!("特征库没有变化，沿用现有索引：{count} 个描述符");
        return Ok(count);
    }

    let store = FeatureStore::open(bundle.feature_store())?;
    let (descriptors, ids) = store.concat_descriptors()?;
    info!("开始训练索引：{} 个描述符，{} 张卡牌", ids.len(), store.num_cards());

    let mut index = IvfPqIndex::train(&descriptors, store.dim(), opts)?;
    index.add(&descriptors)?;
    info!("倒排列表不平衡度：{:.3}", index.imbalance());

    let id_map = IdMap::new(ids);
    id_map.save(bundle.id_map())?;
    index.set_stamp(BundleStamp::compute(bundle)?);
    index.save(bundle.index())?;

    info!("索引已写入 {}", bundle.index().display());
    Ok(id_map.len())
}

/// staging 中的索引是否由当前的特征库和参数构建，是则返回描述符数量
fn reusable_index(bundle: &BundleDir, opts: &IndexOptions) -> Option<usize> {
    let index = IvfPqIndex::load(bundle.index()).ok()?;
    let id_map = IdMap::load(bundle.id_map()).ok()?;
    let stamp = BundleStamp::compute(bundle).ok()?;
    let reusable = index.stamp() == Some(&stamp)
        && index.nlist() == opts.nlist
        && index.pq_m() == opts.pq_m
        && id_map.len() as u64 == index.ntotal();
    reusable.then(|| id_map.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CardscanError;
    use crate::store::DescriptorSet;
    use crate::sift::{Features, Keypoint};

    fn set(n: usize, offset: f32) -> DescriptorSet {
        let keypoints = (0..n).map(|i| Keypoint::at(i as f32, 0.)).collect();
        let descriptors = (0..n * 8).map(|i| offset + (i % 13) as f32).collect();
        DescriptorSet {
            features: Features::new(keypoints, descriptors, 8),
            source_image_url: String::new(),
            face_index: 0,
        }
    }

    #[test]
    fn test_rebuild_index() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = BundleDir::new(dir.path());
        let mut store = FeatureStore::create(bundle.feature_store(), 8).unwrap();
        store.append([("b".to_string(), set(20, 10.)), ("a".to_string(), set(12, 0.))]).unwrap();

        let opts = IndexOptions { nlist: 4, pq_m: 4, ..Default::default() };
        assert_eq!(rebuild_index(&bundle, &opts).unwrap(), 32);

        let id_map = IdMap::load(bundle.id_map()).unwrap();
        assert_eq!(id_map.get(0), Some("a"));
        assert_eq!(id_map.get(12), Some("b"));
        let index = IvfPqIndex::load(bundle.index()).unwrap();
        assert_eq!(index.ntotal(), 32);
        assert_eq!(index.stamp(), Some(&BundleStamp::compute(&bundle).unwrap()));
    }

    #[test]
    fn test_too_few_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = BundleDir::new(dir.path());
        let mut store = FeatureStore::create(bundle.feature_store(), 8).unwrap();
        store.append([("a".to_string(), set(3, 0.))]).unwrap();

        let opts = IndexOptions { nlist: 4, pq_m: 4, ..Default::default() };
        let err = rebuild_index(&bundle, &opts).unwrap_err();
        assert!(matches!(
            err.downcast_ref(),
            Some(CardscanError::TooFewDescriptors { got: 3, nlist: 4 })
        ));
        assert!(!bundle.index().exists());
    }

    #[test]
    fn test_unchanged_store_reuses_index() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = BundleDir::new(dir.path());
        let mut store = FeatureStore::create(bundle.feature_store(), 8).unwrap();
        store.append([("a".to_string(), set(16, 0.)), ("b".to_string(), set(16, 10.))]).unwrap();

        let opts = IndexOptions { nlist: 4, pq_m: 4, ..Default::default() };
        rebuild_index(&bundle, &opts).unwrap();
        let first = std::fs::read(bundle.index()).unwrap();
        assert_eq!(rebuild_index(&bundle, &opts).unwrap(), 32);
        assert_eq!(std::fs::read(bundle.index()).unwrap(), first);

        // 参数变化时重新训练
        let opts = IndexOptions { nlist: 2, ..opts };
        rebuild_index(&bundle, &opts).unwrap();
        assert_eq!(IvfPqIndex::load(bundle.index()).unwrap().nlist(), 2);

        store.append([("c".to_string(), set(8, 20.))]).unwrap();
        assert_eq!(rebuild_index(&bundle, &opts).unwrap(), 40);
        assert_eq!(IvfPqIndex::load(bundle.index()).unwrap().ntotal(), 40);
    }
}
