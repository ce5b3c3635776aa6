use anyhow::Result;
use clap::Parser;
use serde::Serialize;

use crate::artifact::{BuildMetadata, IdMap};
use crate::cli::SubCommandExtend;
use crate::config::{BundleDir, Opts};
use crate::ivf::IvfPqIndex;
use crate::resource::ModelSnapshot;
use crate::store::FeatureStore;

#[derive(Parser, Debug, Clone)]
pub struct InspectCommand {}

/// 一个数据包目录的概况，读取失败的部分为空
#[derive(Debug, Default, Serialize)]
pub struct BundleReport {
    pub path: String,
    pub complete: bool,
    pub cards: Option<usize>,
    pub descriptor_sets: Option<usize>,
    pub vectors: Option<u64>,
    pub nlist: Option<usize>,
    pub imbalance: Option<f32>,
    pub id_map_len: Option<usize>,
    /// 三个文件能否作为一个整体加载，不能时为失败原因
    pub consistency: Option<String>,
}

impl BundleReport {
    pub fn collect(bundle: &BundleDir) -> Self {
        let mut report = Self {
            path: bundle.path().display().to_string(),
            complete: bundle.is_complete(),
            ..Default::default()
        };
        if let Ok(store) = FeatureStore::open(bundle.feature_store()) {
            report.cards = Some(store.num_cards());
            report.descriptor_sets = Some(store.num_sets());
        }
        if let Ok(index) = IvfPqIndex::load(bundle.index()) {
            report.vectors = Some(index.ntotal());
            report.nlist = Some(index.nlist());
            report.imbalance = Some(index.imbalance());
        }
        if let Ok(id_map) = IdMap::load(bundle.id_map()) {
            report.id_map_len = Some(id_map.len());
        }
        if report.complete {
            report.consistency = Some(match ModelSnapshot::open(bundle, 0) {
                Ok(_) => "ok".to_string(),
                Err(e) => format!("{e:#}"),
            });
        }
        report
    }
}

#[derive(Debug, Serialize)]
struct InspectReport {
    staging: BundleReport,
    serving: BundleReport,
    last_build: Option<BuildMetadata>,
}

impl SubCommandExtend for InspectCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let staging = opts.data_dir.staging();
        let report = InspectReport {
            staging: BundleReport::collect(&staging),
            serving: BundleReport::collect(&opts.data_dir.serving()),
            last_build: BuildMetadata::load(staging.build_meta()).ok(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }
}
