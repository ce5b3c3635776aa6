use std::sync::Arc;

use anyhow::anyhow;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum_auth::AuthBearer;
use axum_typed_multipart::TypedMultipart;
use log::{error, info};
use tokio::task::block_in_place;

use super::error::{AppError, Result};
use super::state::AppState;
use super::types::*;
use crate::artifact::BuildMetadata;
use crate::builder::{Builder, is_build_running};
use crate::catalog::lookup_metadata;
use crate::config::MatchOptions;
use crate::matcher::MatchOutcome;
use crate::metrics;
use crate::publisher::TarPublisher;

fn check_token(state: &AppState, token: &str) -> Result<()> {
    if token != state.token {
        return Err(AppError::new(StatusCode::UNAUTHORIZED, anyhow!("token 错误")));
    }
    Ok(())
}

/// 识别一张卡牌图片
#[utoipa::path(
    post,
    path = "/match",
    request_body(content = MatchForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = MatchResponse),
    )
)]
pub async fn match_handler(
    State(state): State<Arc<AppState>>,
    data: TypedMultipart<MatchRequest>,
) -> Result<Json<MatchResponse>> {
    let opts = MatchOptions {
        min_inliers: data.min_inliers.unwrap_or(state.matching.min_inliers),
        nprobe: data.nprobe.unwrap_or(state.matching.nprobe),
        max_candidates: data.max_candidates.unwrap_or(state.matching.max_candidates),
        ..state.matching.clone()
    };
    let matcher = state.matcher(opts);

    // 懒加载模式下这里可能会读取新的数据包
    let snapshot = block_in_place(|| state.manager.snapshot_for_request())
        .map_err(|e| AppError::new(StatusCode::SERVICE_UNAVAILABLE, e))?;
    let report = block_in_place(|| matcher.match_image(&snapshot, &data.file));

    metrics::inc_match_count(report.outcome.label());
    metrics::observe_match_duration("extract", report.timings.extract_ms / 1000.);
    metrics::observe_match_duration("ann", report.timings.ann_ms / 1000.);
    metrics::observe_match_duration("verify", report.timings.verify_ms / 1000.);
    metrics::observe_match_duration("total", report.timings.total_ms / 1000.);

    let mut card = None;
    if let MatchOutcome::Matched { card_id, inliers } = &report.outcome {
        metrics::observe_match_inliers(*inliers);
        info!("识别结果：{card_id}，内点 {inliers}，耗时 {:.1}ms", report.timings.total_ms);
        if let Some(catalog) = &state.catalog {
            card = lookup_metadata(&**catalog, card_id).await;
        }
        if card.is_none() {
            info!("{card_id} 没有卡牌信息");
        }
    } else {
        info!("识别结果：{}，耗时 {:.1}ms", report.outcome.label(), report.timings.total_ms);
    }

    Ok(Json(MatchResponse { report, card }))
}

/// 立即重新加载 serving 目录中的数据包
#[utoipa::path(
    post,
    path = "/reload",
    responses(
        (status = 200, body = ReloadResponse),
    ),
    security(("bearer" = []))
)]
pub async fn reload_handler(
    State(state): State<Arc<AppState>>,
    AuthBearer(token): AuthBearer,
) -> Result<Json<ReloadResponse>> {
    check_token(&state, &token)?;
    let snapshot = block_in_place(|| state.manager.load())?;
    Ok(Json(ReloadResponse { generation: snapshot.generation }))
}

/// 在后台执行一次构建
#[utoipa::path(
    post,
    path = "/build",
    responses(
        (status = 202, body = BuildAccepted),
        (status = 409, description = "已有构建正在运行"),
    ),
    security(("bearer" = []))
)]
pub async fn build_handler(
    State(state): State<Arc<AppState>>,
    AuthBearer(token): AuthBearer,
) -> Result<(StatusCode, Json<BuildAccepted>)> {
    check_token(&state, &token)?;
    let Some(catalog) = state.catalog.clone() else {
        return Err(AppError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            anyhow!("找不到卡牌目录 {}", state.dir.catalog().display()),
        ));
    };
    if is_build_running(&state.dir) {
        return Err(AppError::new(StatusCode::CONFLICT, anyhow!("已有构建正在运行")));
    }

    let builder = Builder::new(state.dir.clone(), catalog, state.fetcher.clone(), state.extractor.clone())
        .index_options(state.index.clone())
        .match_options(state.matching.clone())
        .build_options(state.build.clone());
    if state.build.publish {
        let builder = builder.publisher(TarPublisher::new(state.dir.exports()));
        tokio::spawn(async move { log_build(builder.run().await) });
    } else {
        tokio::spawn(async move { log_build(builder.run().await) });
    }

    Ok((StatusCode::ACCEPTED, Json(BuildAccepted { message: "构建已开始".to_string() })))
}

fn log_build(result: anyhow::Result<BuildMetadata>) {
    match result {
        Ok(meta) => info!("后台构建结束：{}", meta.status.as_str()),
        Err(e) => error!("后台构建未能开始: {e:#}"),
    }
}

/// 查看服务状态
#[utoipa::path(
    get,
    path = "/status",
    responses(
        (status = 200, body = StatusResponse),
    )
)]
pub async fn status_handler(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>> {
    let snapshot = state.manager.current();
    let last_build = BuildMetadata::load(state.dir.staging().build_meta()).ok();
    Ok(Json(StatusResponse {
        generation: state.manager.generation(),
        loaded_at: snapshot.as_ref().map(|s| s.loaded_at),
        vectors: snapshot.as_ref().map_or(0, |s| s.index.ntotal()),
        cards: snapshot.as_ref().map_or(0, |s| s.store.num_cards()),
        reload_due: state.manager.is_reload_due(),
        build_running: is_build_running(&state.dir),
        last_build,
    }))
}

/// Prometheus 指标
#[utoipa::path(get, path = "/metrics")]
pub async fn metrics_handler() -> String {
    metrics::gather_text()
}
