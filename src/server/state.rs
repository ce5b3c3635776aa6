use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::catalog::SqliteCatalog;
use crate::cli::ServeCommand;
use crate::config::{BuildOptions, IndexOptions, MatchOptions, ResourceDir};
use crate::fetch::HttpFetcher;
use crate::matcher::Matcher;
use crate::resource::ResourceManager;
use crate::sift::SiftExtractor;

/// 应用状态
pub struct AppState {
    /// 数据目录
    pub dir: ResourceDir,
    /// 持有当前数据包
    pub manager: Arc<ResourceManager>,
    pub extractor: Arc<SiftExtractor>,
    /// 卡牌目录，不存在时无法构建，识别结果也没有卡牌信息
    pub catalog: Option<Arc<SqliteCatalog>>,
    pub fetcher: Arc<HttpFetcher>,
    pub index: IndexOptions,
    pub matching: MatchOptions,
    pub build: BuildOptions,
    /// 鉴权 token
    pub token: String,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(
        dir: ResourceDir,
        manager: Arc<ResourceManager>,
        catalog: Option<SqliteCatalog>,
        opts: ServeCommand,
    ) -> Result<Arc<Self>> {
        let fetcher = HttpFetcher::new(Duration::from_secs(opts.build.fetch_timeout))?;
        Ok(Arc::new(AppState {
            dir,
            manager,
            extractor: Arc::new(SiftExtractor::new(opts.sift)),
            catalog: catalog.map(Arc::new),
            fetcher: Arc::new(fetcher),
            index: opts.index,
            matching: opts.matching,
            build: opts.build,
            token: opts.token,
        }))
    }

    /// 使用请求中覆盖的参数创建识别器
    pub fn matcher(&self, opts: MatchOptions) -> Matcher<SiftExtractor> {
        Matcher::new(self.extractor.clone(), opts)
    }
}
