use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::{BUNDLE_FILES, BundleDir};
use crate::error::CardscanError;

/// 向量 ID 到卡牌 ID 的映射，第 i 项对应索引中的第 i 个向量
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdMap(Vec<String>);

impl IdMap {
    pub fn new(ids: Vec<String>) -> Self {
        Self(ids)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&str> {
        self.0.get(id as usize).map(String::as_str)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::load_with_digest(path)?.0)
    }

    /// 读取 id_map 并返回文件内容的摘要，两者来自同一次读取
    pub fn load_with_digest(path: impl AsRef<Path>) -> Result<(Self, String)> {
        let path = path.as_ref();
        let data = fs::read(path).with_context(|| format!("读取 {} 失败", path.display()))?;
        let digest = blake3::hash(&data).to_hex().to_string();
        Ok((serde_json::from_slice(&data)?, digest))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.into_inner()?.sync_all()?;
        Ok(())
    }
}

/// 索引构建时所依据的 id_map 和特征库的 BLAKE3 摘要
///
/// 发布时三个文件逐个复制，如果中途崩溃，serving 中的文件可能来自不同的构建，
/// 加载时通过对比摘要发现这种情况
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleStamp {
    pub id_map: String,
    pub feature_store: String,
}

impl BundleStamp {
    /// 计算数据包目录中 id_map 和特征库的摘要
    pub fn compute(dir: &BundleDir) -> Result<Self> {
        Ok(Self { id_map: file_digest(dir.id_map())?, feature_store: file_digest(dir.feature_store())? })
    }
}

/// 计算文件的 BLAKE3 摘要
pub fn file_digest(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("打开 {} 失败", path.display()))?;
    let mut hasher = blake3::Hasher::new();
    hasher.update_reader(BufReader::new(file))?;
    Ok(hasher.finalize().to_hex().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    InProgress,
    Success,
    /// 已发布，但有部分卡牌提取失败
    PartialSuccess,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Failed => "failed",
        }
    }
}

/// 一次构建的记录，写在 staging 目录中
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct BuildMetadata {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: BuildStatus,
    /// 目录中符合条件的卡牌记录数量
    pub cards_total: usize,
    /// 本次新提取成功的记录数量
    pub cards_new: usize,
    /// 本次提取失败的记录数量
    pub cards_failed: usize,
    /// 索引中的描述符总数
    pub descriptors_total: usize,
    pub error: Option<String>,
    /// 打包导出失败的原因，不影响构建状态
    pub publish_error: Option<String>,
}

impl BuildMetadata {
    pub fn start() -> Self {
        Self {
            start_time: Utc::now(),
            end_time: None,
            status: BuildStatus::InProgress,
            cards_total: 0,
            cards_new: 0,
            cards_failed: 0,
            descriptors_total: 0,
            error: None,
            publish_error: None,
        }
    }

    pub fn finish(&mut self, status: BuildStatus) {
        self.status = status;
        self.end_time = Some(Utc::now());
    }

    pub fn fail(&mut self, error: &anyhow::Error) {
        self.error = Some(format!("{error:#}"));
        self.finish(BuildStatus::Failed);
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.into_inner()?.sync_all()?;
        Ok(())
    }
}

/// 将数据包的三个文件逐个复制到目标目录
///
/// 每个文件先写入同目录的临时文件再重命名，已经打开旧文件的读者不受影响。
/// 索引文件最后复制，它携带的摘要用来判断整个数据包是否一致。
pub fn copy_bundle(from: &BundleDir, to: &BundleDir) -> Result<()> {
    fs::create_dir_all(to.path())?;
    for name in BUNDLE_FILES {
        let src = from.path().join(name);
        if !src.is_file() {
            return Err(CardscanError::MissingArtifact(src).into());
        }
        let dst = to.path().join(name);
        let tmp = to.path().join(format!(".{name}.tmp"));
        fs::copy(&src, &tmp).with_context(|| format!("复制 {} 失败", src.display()))?;
        File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, &dst)?;
        info!("已复制 {} -> {}", src.display(), dst.display());
    }
    Ok(())
}
