use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::warn;
use serde_json::json;

use crate::catalog::{SqliteCatalog, lookup_metadata};
use crate::cli::SubCommandExtend;
use crate::config::{MatchOptions, Opts, ReloadPolicy, SiftOptions};
use crate::matcher::Matcher;
use crate::resource::ResourceManager;
use crate::sift::SiftExtractor;

#[derive(Parser, Debug, Clone)]
pub struct MatchCommand {
    #[command(flatten)]
    pub sift: SiftOptions,
    #[command(flatten)]
    pub matching: MatchOptions,
    /// 图片路径
    pub image: PathBuf,
}

impl SubCommandExtend for MatchCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let manager = ResourceManager::new(opts.data_dir.serving(), ReloadPolicy::Eager);
        let snapshot = manager.load()?;

        let data = tokio::fs::read(&self.image).await?;
        let matcher = Matcher::new(Arc::new(SiftExtractor::new(self.sift.clone())), self.matching.clone());
        let report = matcher.match_image(&snapshot, &data);

        // 有卡牌目录时附带卡牌信息
        let mut card = None;
        let catalog_path = opts.data_dir.catalog();
        if let (Some(card_id), true) = (report.outcome.card_id(), catalog_path.is_file()) {
            match SqliteCatalog::open(&catalog_path).await {
                Ok(catalog) => card = lookup_metadata(&catalog, card_id).await,
                Err(e) => warn!("打开卡牌目录失败，只输出卡牌 ID: {e:#}"),
            }
        }

        println!("{}", serde_json::to_string_pretty(&json!({ "report": report, "card": card }))?);
        Ok(())
    }
}
