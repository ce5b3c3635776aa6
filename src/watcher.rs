use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use log::{debug, error, info, warn};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::config::BUNDLE_FILES;
use crate::resource::ResourceManager;

/// 没有等待中的信号时，单次等待的上限
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// 合并短时间内的多次文件变化
///
/// 每个有效事件都会重新开始计时，只有安静 `quiet` 之后才发出一次信号
#[derive(Debug)]
pub struct Debouncer {
    quiet: Duration,
    seen: HashMap<String, SystemTime>,
    pending_since: Option<Instant>,
}

impl Debouncer {
    pub fn new(quiet: Duration) -> Self {
        Self { quiet, seen: HashMap::new(), pending_since: None }
    }

    /// 记录目录中现有文件的修改时间，之后修改时间不变的事件会被忽略
    pub fn prime(&mut self, dir: &Path) {
        for name in BUNDLE_FILES {
            if let Some(mtime) = modified(&dir.join(name)) {
                self.seen.insert(name.to_string(), mtime);
            }
        }
    }

    /// 处理一个文件事件，返回是否重新开始计时
    pub fn observe(&mut self, path: &Path, now: Instant) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if !BUNDLE_FILES.contains(&name) {
            return false;
        }
        match modified(path) {
            Some(mtime) if self.seen.get(name) == Some(&mtime) => return false,
            Some(mtime) => {
                self.seen.insert(name.to_string(), mtime);
            }
            None => {
                self.seen.remove(name);
            }
        }
        self.pending_since = Some(now);
        true
    }

    /// 安静期结束时返回 true，并清除等待状态
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.pending_since {
            Some(since) if now.duration_since(since) >= self.quiet => {
                self.pending_since = None;
                true
            }
            _ => false,
        }
    }

    /// 距离下一次可能发出信号还要等待多久
    pub fn timeout(&self, now: Instant) -> Duration {
        match self.pending_since {
            Some(since) => (since + self.quiet).saturating_duration_since(now),
            None => IDLE_WAIT,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending_since.is_some()
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// 事件循环，在通道关闭时退出
pub fn run_debounce_loop(rx: Receiver<PathBuf>, mut debouncer: Debouncer, mut on_settled: impl FnMut()) {
    loop {
        match rx.recv_timeout(debouncer.timeout(Instant::now())) {
            Ok(path) => {
                if debouncer.observe(&path, Instant::now()) {
                    debug!("检测到文件变化: {}", path.display());
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if debouncer.poll(Instant::now()) {
            on_settled();
        }
    }
}

/// serving 目录监视器，drop 时停止
pub struct BundleWatcher {
    watcher: Option<RecommendedWatcher>,
    handle: Option<JoinHandle<()>>,
}

impl BundleWatcher {
    /// 监视 `manager` 的 serving 目录，文件稳定后调用 [`ResourceManager::on_bundle_changed`]
    pub fn spawn(manager: Arc<ResourceManager>, quiet: Duration) -> Result<Self> {
        let dir = manager.bundle().path().to_path_buf();
        fs::create_dir_all(&dir)?;

        let (tx, rx) = unbounded();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)) {
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
            }
            Err(e) => error!("文件监视出错: {e}"),
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let mut debouncer = Debouncer::new(quiet);
        debouncer.prime(&dir);

        let handle = std::thread::Builder::new().name("bundle-watcher".into()).spawn(move || {
            run_debounce_loop(rx, debouncer, || {
                if manager.bundle().is_complete() {
                    info!("serving 目录已稳定，准备重新加载");
                    manager.on_bundle_changed();
                } else {
                    warn!("serving 目录文件不完整，暂不重新加载");
                }
            })
        })?;
        info!("开始监视 {}", dir.display());

        Ok(Self { watcher: Some(watcher), handle: Some(handle) })
    }
}

impl Drop for BundleWatcher {
    fn drop(&mut self) {
        // 先释放 watcher，通道随之关闭，监视线程退出
        self.watcher.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
