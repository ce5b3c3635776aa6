use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::Result;
use log::{info, warn};
use walkdir::WalkDir;

use crate::config::BundleDir;
use crate::error::CardscanError;
use crate::matcher::{MatchOutcome, Matcher};
use crate::resource::ModelSnapshot;
use crate::sift::{FeatureExtractor, Features};

/// 一张已知答案的验证图片
#[derive(Debug, Clone)]
pub struct ValidationProbe {
    pub label: String,
    /// 识别结果属于其中之一即为通过
    pub expected: BTreeSet<String>,
    /// 提取失败时为 `None`，这样的验证图片一定不通过
    pub features: Option<Features>,
}

impl ValidationProbe {
    pub fn new(
        label: impl Into<String>,
        expected: impl IntoIterator<Item = impl Into<String>>,
        features: Option<Features>,
    ) -> Self {
        Self {
            label: label.into(),
            expected: expected.into_iter().map(Into::into).collect(),
            features,
        }
    }
}

/// 读取验证图片目录，文件名（不含扩展名）即为期望的 card_id
///
/// 目录不存在时返回空列表
pub fn load_probes<E: FeatureExtractor>(dir: &Path, extractor: &E) -> Result<Vec<ValidationProbe>> {
    if !dir.is_dir() {
        return Ok(vec![]);
    }
    let mut probes = vec![];
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Some(card_id) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
            continue;
        };
        let data = fs::read(path)?;
        let features = extractor.extract(&data);
        if features.is_none() {
            warn!("验证图片 {} 没有提取到特征", path.display());
        }
        probes.push(ValidationProbe::new(path.display().to_string(), [card_id], features));
    }
    Ok(probes)
}

/// 用完整的识别流程检查数据包，所有验证图片都识别正确才通过
pub fn validate_bundle<E: FeatureExtractor>(
    bundle: &BundleDir,
    probes: &[ValidationProbe],
    matcher: &Matcher<E>,
) -> Result<()> {
    if probes.is_empty() {
        return Err(CardscanError::ValidationFailed("没有可用的验证图片".to_string()).into());
    }
    let snapshot = ModelSnapshot::open(bundle, 0)?;
    for probe in probes {
        let outcome = match &probe.features {
            Some(features) => matcher.match_features(&snapshot, features).outcome,
            None => MatchOutcome::NoFeatures,
        };
        match outcome.card_id() {
            Some(card_id) if probe.expected.contains(card_id) => {
                info!("验证通过: {} -> {card_id}", probe.label);
            }
            _ => {
                return Err(CardscanError::ValidationFailed(format!(
                    "{} 期望 {:?}，实际结果 {:?}",
                    probe.label, probe.expected, outcome
                ))
                .into());
            }
        }
    }
    info!("全部 {} 张验证图片通过", probes.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sift::Keypoint;

    struct LenExtractor;

    impl FeatureExtractor for LenExtractor {
        fn extract(&self, image: &[u8]) -> Option<Features> {
            (!image.is_empty())
                .then(|| Features::new(vec![Keypoint::at(0., 0.)], vec![image.len() as f32], 1))
        }
    }

    #[test]
    fn test_load_probes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bbb.jpg"), b"xx").unwrap();
        fs::write(dir.path().join("aaa.png"), b"x").unwrap();
        fs::write(dir.path().join("empty.png"), b"").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let probes = load_probes(dir.path(), &LenExtractor).unwrap();
        let expected = probes.iter().map(|p| p.expected.iter().next().unwrap().as_str()).collect::<Vec<_>>();
        assert_eq!(expected, ["aaa", "bbb", "empty"]);
        assert!(probes[2].features.is_none());
    }

    #[test]
    fn test_missing_probe_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_probes(&dir.path().join("probes"), &LenExtractor).unwrap().is_empty());
    }

    #[test]
    fn test_no_probes_fails() {
        let dir = tempfile::tempdir().unwrap();
        let matcher = Matcher::new(std::sync::Arc::new(LenExtractor), Default::default());
        let err = validate_bundle(&BundleDir::new(dir.path()), &[], &matcher).unwrap_err();
        assert!(matches!(err.downcast_ref(), Some(CardscanError::ValidationFailed(_))));
    }
}
