use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use rand::distr::{Alphanumeric, SampleString};
use tokio::net::TcpListener;

use crate::catalog::SqliteCatalog;
use crate::cli::SubCommandExtend;
use crate::config::{BuildOptions, IndexOptions, MatchOptions, Opts, ReloadPolicy, SiftOptions};
use crate::resource::ResourceManager;
use crate::server;
use crate::watcher::BundleWatcher;

#[derive(Parser, Debug, Clone)]
pub struct ServeCommand {
    #[command(flatten)]
    pub sift: SiftOptions,
    #[command(flatten)]
    pub index: IndexOptions,
    #[command(flatten)]
    pub matching: MatchOptions,
    #[command(flatten)]
    pub build: BuildOptions,
    /// 监听地址
    #[arg(long, default_value = "127.0.0.1:8000")]
    pub addr: String,
    /// 请求验证 token，不填则随机生成
    #[arg(long, default_value_t = String::new())]
    pub token: String,
    /// serving 目录变化后的重新加载策略
    #[arg(long, value_enum, default_value_t = ReloadPolicy::Eager)]
    pub reload: ReloadPolicy,
    /// 文件变化后等待多久没有新的变化才重新加载，单位为毫秒
    #[arg(long, value_name = "MS", default_value_t = 2000)]
    pub debounce_ms: u64,
}

impl SubCommandExtend for ServeCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let dir = opts.data_dir.clone();
        let manager = Arc::new(ResourceManager::new(dir.serving(), self.reload));
        if dir.serving().is_complete() {
            if let Err(e) = manager.load() {
                warn!("加载数据包失败，服务照常启动，等待下一次发布: {e:#}");
            }
        } else {
            warn!("serving 目录中没有数据包，识别请求将返回 503");
        }

        let catalog = if dir.catalog().is_file() {
            Some(SqliteCatalog::open(dir.catalog()).await?)
        } else {
            warn!("找不到卡牌目录 {}，无法构建，识别结果不附带卡牌信息", dir.catalog().display());
            None
        };

        let mut self_clone = self.clone();
        if self_clone.token.is_empty() {
            self_clone.token = Alphanumeric.sample_string(&mut rand::rng(), 32);
            info!("鉴权 token: {}", self_clone.token);
        }

        let _watcher = BundleWatcher::spawn(manager.clone(), Duration::from_millis(self.debounce_ms))?;

        // 创建应用状态
        let state = server::AppState::new(dir, manager, catalog, self_clone)?;

        // 创建应用
        let app = server::create_app(state);

        // 启动服务器
        info!("服务器启动：http://{}", &self.addr);
        let listener = TcpListener::bind(&self.addr).await?;
        axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

        info!("服务器已停止");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("监听退出信号失败: {e}");
        std::future::pending::<()>().await;
    }
}
