use axum::body::Bytes;
use axum_typed_multipart::TryFromMultipart;
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::artifact::BuildMetadata;
use crate::catalog::CardMetadata;
use crate::matcher::MatchReport;

/// 识别请求参数
#[derive(TryFromMultipart)]
pub struct MatchRequest {
    pub file: Bytes,
    pub min_inliers: Option<usize>,
    pub nprobe: Option<usize>,
    pub max_candidates: Option<usize>,
}

/// 识别表单（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct MatchForm {
    /// 上传的卡牌图片
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub file: String,
    /// 判定匹配成功的最少内点数量
    pub min_inliers: Option<usize>,
    /// 搜索扫描的倒排列表数量
    pub nprobe: Option<usize>,
    /// 进行几何验证的最大候选数量
    pub max_candidates: Option<usize>,
}

/// 识别响应
#[derive(Debug, Serialize, ToSchema)]
pub struct MatchResponse {
    #[serde(flatten)]
    pub report: MatchReport,
    /// 卡牌信息，识别成功但目录中已经没有这张卡牌时为空
    pub card: Option<CardMetadata>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ReloadResponse {
    /// 重新加载后的数据包代数
    pub generation: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BuildAccepted {
    pub message: String,
}

/// 服务状态
#[derive(Debug, Serialize, ToSchema)]
pub struct StatusResponse {
    /// 当前数据包代数，0 表示还没有加载
    pub generation: u64,
    pub loaded_at: Option<DateTime<Utc>>,
    pub vectors: u64,
    pub cards: usize,
    /// 是否有待处理的懒加载
    pub reload_due: bool,
    pub build_running: bool,
    /// 最近一次构建的记录
    pub last_build: Option<BuildMetadata>,
}
