use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::hash_map::Entry;

use log::debug;
use opencv::core::{Mat, Ptr, Size, Vector};
use opencv::features2d::SIFT;
use opencv::prelude::*;
use opencv::{core, imgcodecs, imgproc};
use serde::{Deserialize, Serialize};

use crate::config::SiftOptions;

/// SIFT 描述符维度
pub const DESCRIPTOR_DIM: usize = 128;

thread_local! {
    static SIFT_DETECTOR: RefCell<SiftDetector> = RefCell::new(SiftDetector::default());
}

/// 可序列化的特征点，字段与 OpenCV 的 KeyPoint 一一对应
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub size: f32,
    pub angle: f32,
    pub response: f32,
    pub octave: i32,
    pub class_id: i32,
}

impl Keypoint {
    pub fn at(x: f32, y: f32) -> Self {
        Self { x, y, size: 1.0, angle: -1.0, response: 0.0, octave: 0, class_id: -1 }
    }
}

impl From<&core::KeyPoint> for Keypoint {
    fn from(kp: &core::KeyPoint) -> Self {
        let pt = kp.pt();
        Self {
            x: pt.x,
            y: pt.y,
            size: kp.size(),
            angle: kp.angle(),
            response: kp.response(),
            octave: kp.octave(),
            class_id: kp.class_id(),
        }
    }
}

/// 一张图片的特征点和对应的描述符
///
/// `descriptors` 按行优先存储，第 i 行对应 `keypoints[i]`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Features {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<f32>,
    pub dim: usize,
}

impl Features {
    pub fn new(keypoints: Vec<Keypoint>, descriptors: Vec<f32>, dim: usize) -> Self {
        assert_eq!(keypoints.len() * dim, descriptors.len(), "特征点与描述符数量不一致");
        Self { keypoints, descriptors, dim }
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn descriptor(&self, i: usize) -> &[f32] {
        &self.descriptors[i * self.dim..(i + 1) * self.dim]
    }
}

/// 特征提取器
///
/// 构建参考图和识别查询图必须使用同一个实现，两边的结果才可比较
pub trait FeatureExtractor: Send + Sync + 'static {
    /// 从编码后的图片中提取特征，解码失败或没有特征点时返回 `None`
    fn extract(&self, image: &[u8]) -> Option<Features>;
}

/// 基于 OpenCV SIFT 的特征提取器
///
/// 流程：缩放 → Lab 色彩空间 → 对亮度通道做 CLAHE → 转回灰度 → SIFT → 按响应强度截断 → RootSIFT
#[derive(Debug, Clone, Default)]
pub struct SiftExtractor {
    opts: SiftOptions,
}

impl SiftExtractor {
    pub fn new(opts: SiftOptions) -> Self {
        Self { opts }
    }

    pub fn detect_bytes(&self, bytes: &[u8]) -> opencv::Result<Option<Features>> {
        let image = imgcodecs::imdecode(&Vector::<u8>::from_slice(bytes), imgcodecs::IMREAD_COLOR)?;
        if image.empty() {
            return Ok(None);
        }
        self.detect_image(&image)
    }

    fn detect_image(&self, image: &Mat) -> opencv::Result<Option<Features>> {
        let gray = enhance_contrast(image, &self.opts)?;
        let (keypoints, descriptors) =
            SIFT_DETECTOR.with(|sift| sift.borrow_mut().detect_and_compute(&gray))?;
        if keypoints.is_empty() {
            return Ok(None);
        }
        let (keypoints, mut descriptors) =
            keep_strongest(keypoints, &descriptors, DESCRIPTOR_DIM, self.opts.max_keypoints);
        root_sift(&mut descriptors, DESCRIPTOR_DIM, self.opts.root_sift_eps);
        Ok(Some(Features::new(keypoints, descriptors, DESCRIPTOR_DIM)))
    }
}

impl FeatureExtractor for SiftExtractor {
    fn extract(&self, image: &[u8]) -> Option<Features> {
        match self.detect_bytes(image) {
            Ok(features) => features,
            Err(e) => {
                debug!("提取特征失败: {e}");
                None
            }
        }
    }
}

#[derive(Default)]
struct SiftDetector {
    sift: Option<Ptr<SIFT>>,
}

impl SiftDetector {
    fn detect_and_compute(&mut self, gray: &Mat) -> opencv::Result<(Vec<Keypoint>, Vec<f32>)> {
        let mut sift = match self.sift.take() {
            Some(sift) => sift,
            None => SIFT::create_def()?,
        };
        let mask = Mat::default();
        let mut kps = Vector::<core::KeyPoint>::new();
        let mut des = Mat::default();
        let r = sift.detect_and_compute(gray, &mask, &mut kps, &mut des, false);
        self.sift = Some(sift);
        r?;
        if kps.is_empty() || des.empty() {
            return Ok((vec![], vec![]));
        }
        let keypoints = kps.iter().map(|kp| Keypoint::from(&kp)).collect();
        let descriptors = des.data_typed::<f32>()?.to_vec();
        Ok((keypoints, descriptors))
    }
}

thread_local! {
    static CLAHE_CACHE: RefCell<HashMap<(u64, i32), Ptr<imgproc::CLAHE>>> = RefCell::new(HashMap::new());
}

/// 缩放到固定大小，仅对亮度通道做 CLAHE，然后转换为灰度图
fn enhance_contrast(image: &Mat, opts: &SiftOptions) -> opencv::Result<Mat> {
    let mut resized = Mat::default();
    let size = Size::new(opts.image_size, opts.image_size);
    imgproc::resize(image, &mut resized, size, 0., 0., imgproc::INTER_LINEAR)?;

    let mut lab = Mat::default();
    imgproc::cvt_color_def(&resized, &mut lab, imgproc::COLOR_BGR2Lab)?;

    let mut channels = Vector::<Mat>::new();
    core::split(&lab, &mut channels)?;
    let mut l_eq = Mat::default();
    CLAHE_CACHE.with(|cache| -> opencv::Result<()> {
        let mut cache = cache.borrow_mut();
        let key = (opts.clahe_clip_limit.to_bits(), opts.clahe_tile_grid);
        let clahe = match cache.entry(key) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let grid = Size::new(opts.clahe_tile_grid, opts.clahe_tile_grid);
                e.insert(imgproc::create_clahe(opts.clahe_clip_limit, grid)?)
            }
        };
        clahe.apply(&channels.get(0)?, &mut l_eq)
    })?;
    channels.set(0, l_eq)?;

    let mut merged = Mat::default();
    core::merge(&channels, &mut merged)?;
    let mut enhanced = Mat::default();
    imgproc::cvt_color_def(&merged, &mut enhanced, imgproc::COLOR_Lab2BGR)?;
    let mut gray = Mat::default();
    imgproc::cvt_color_def(&enhanced, &mut gray, imgproc::COLOR_BGR2GRAY)?;
    Ok(gray)
}

/// 按响应强度降序保留最多 `n` 个特征点
///
/// 响应强度相同时按坐标排序，保证结果与 OpenCV 内部的并行顺序无关
pub fn keep_strongest(
    keypoints: Vec<Keypoint>,
    descriptors: &[f32],
    dim: usize,
    n: usize,
) -> (Vec<Keypoint>, Vec<f32>) {
    let mut order: Vec<usize> = (0..keypoints.len()).collect();
    order.sort_by(|&a, &b| {
        let (ka, kb) = (&keypoints[a], &keypoints[b]);
        kb.response
            .total_cmp(&ka.response)
            .then(ka.x.total_cmp(&kb.x))
            .then(ka.y.total_cmp(&kb.y))
            .then(ka.size.total_cmp(&kb.size))
            .then(ka.angle.total_cmp(&kb.angle))
            .then(ka.octave.cmp(&kb.octave))
    });
    order.truncate(n);

    let mut kps = Vec::with_capacity(order.len());
    let mut des = Vec::with_capacity(order.len() * dim);
    for i in order {
        kps.push(keypoints[i]);
        des.extend_from_slice(&descriptors[i * dim..(i + 1) * dim]);
    }
    (kps, des)
}

/// RootSIFT：每行先做 L1 归一化，再逐元素开平方
pub fn root_sift(descriptors: &mut [f32], dim: usize, eps: f32) {
    for row in descriptors.chunks_exact_mut(dim) {
        let sum: f32 = row.iter().sum();
        for v in row.iter_mut() {
            *v = (*v / (sum + eps)).max(0.0).sqrt();
        }
    }
}
