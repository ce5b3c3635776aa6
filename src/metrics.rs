use std::sync::LazyLock;

use prometheus::*;

static METRIC_MATCH_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("cardscan_match_count", "count of match requests by outcome", &[
        "outcome"
    ])
    .unwrap()
});

static METRIC_MATCH_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "cardscan_match_duration",
        "duration of the per-image match in seconds",
        &["stage"]
    )
    .unwrap()
});

static METRIC_MATCH_INLIERS: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "cardscan_match_inliers",
        "inlier count of the winning candidate",
        (0..=200).step_by(10).map(|x| x as f64).collect()
    )
    .unwrap()
});

static METRIC_RELOAD_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("cardscan_reload_count", "count of snapshot reloads by result", &[
        "result"
    ])
    .unwrap()
});

static METRIC_SNAPSHOT_GENERATION: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("cardscan_snapshot_generation", "generation of the active snapshot").unwrap()
});

static METRIC_BUILD_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("cardscan_build_count", "count of build runs by status", &["status"])
        .unwrap()
});

/// 记录一次识别的结果
pub fn inc_match_count(outcome: &str) {
    METRIC_MATCH_COUNT.with_label_values(&[outcome]).inc();
}

/// 记录识别各阶段耗时，单位为秒
pub fn observe_match_duration(stage: &str, seconds: f64) {
    METRIC_MATCH_DURATION.with_label_values(&[stage]).observe(seconds);
}

pub fn observe_match_inliers(inliers: usize) {
    METRIC_MATCH_INLIERS.observe(inliers as f64);
}

/// 记录重新加载的结果，`ok` 或 `rejected`
pub fn inc_reload_count(result: &str) {
    METRIC_RELOAD_COUNT.with_label_values(&[result]).inc();
}

pub fn set_snapshot_generation(generation: u64) {
    METRIC_SNAPSHOT_GENERATION.set(generation as i64);
}

pub fn inc_build_count(status: &str) {
    METRIC_BUILD_COUNT.with_label_values(&[status]).inc();
}

/// 以文本格式导出所有指标
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    encoder.encode_to_string(&gather()).unwrap_or_default()
}
