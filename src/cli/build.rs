use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use log::info;

use crate::artifact::BuildStatus;
use crate::builder::Builder;
use crate::catalog::SqliteCatalog;
use crate::cli::SubCommandExtend;
use crate::config::{BuildOptions, IndexOptions, MatchOptions, Opts, SiftOptions};
use crate::fetch::HttpFetcher;
use crate::publisher::TarPublisher;
use crate::sift::SiftExtractor;

#[derive(Parser, Debug, Clone)]
pub struct BuildCommand {
    #[command(flatten)]
    pub sift: SiftOptions,
    #[command(flatten)]
    pub index: IndexOptions,
    #[command(flatten)]
    pub matching: MatchOptions,
    #[command(flatten)]
    pub build: BuildOptions,
    /// 卡牌目录数据库，默认为数据目录下的 catalog.db
    #[arg(long, value_name = "PATH")]
    pub catalog: Option<PathBuf>,
}

impl SubCommandExtend for BuildCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let path = self.catalog.clone().unwrap_or_else(|| opts.data_dir.catalog());
        info!("打开卡牌目录: {}", path.display());
        let catalog = SqliteCatalog::open(&path).await?;
        let fetcher = HttpFetcher::new(Duration::from_secs(self.build.fetch_timeout))?;
        let extractor = SiftExtractor::new(self.sift.clone());

        let builder = Builder::new(
            opts.data_dir.clone(),
            Arc::new(catalog),
            Arc::new(fetcher),
            Arc::new(extractor),
        )
        .index_options(self.index.clone())
        .match_options(self.matching.clone())
        .build_options(self.build.clone());
        let meta = if self.build.publish {
            builder.publisher(TarPublisher::new(opts.data_dir.exports())).run().await?
        } else {
            builder.run().await?
        };

        println!("{}", serde_json::to_string_pretty(&meta)?);
        if meta.status == BuildStatus::Failed {
            bail!("构建失败: {}", meta.error.unwrap_or_default());
        }
        Ok(())
    }
}
