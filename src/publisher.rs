use std::future::Future;
use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use log::info;
use tokio_tar::Builder;

use crate::config::{BUNDLE_FILES, BundleDir};

/// 将发布后的数据包交给外部存储，失败只记录，不影响构建结果
pub trait ArtifactPublisher: Send + Sync + 'static {
    fn publish(&self, bundle: &BundleDir) -> impl Future<Output = Result<PathBuf>> + Send;
}

/// 把数据包打成 tar 归档放到导出目录，由外部同步程序上传
pub struct TarPublisher {
    dir: PathBuf,
}

impl TarPublisher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ArtifactPublisher for TarPublisher {
    async fn publish(&self, bundle: &BundleDir) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let name = format!("bundle-{}.tar", Utc::now().format("%Y-%m-%d"));
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!(".{name}.tmp"));

        let file = tokio::fs::File::create(&tmp).await?;
        let mut builder = Builder::new(file);
        for file_name in BUNDLE_FILES {
            builder.append_path_with_name(bundle.path().join(file_name), file_name).await?;
        }
        let file = builder.into_inner().await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, &path).await?;

        info!("数据包已导出: {}", path.display());
        Ok(path)
    }
}

/// 不做任何事的发布器
pub struct NoopPublisher;

impl ArtifactPublisher for NoopPublisher {
    async fn publish(&self, bundle: &BundleDir) -> Result<PathBuf> {
        Ok(bundle.path().to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio_tar::Archive;

    use super::*;

    #[tokio::test]
    async fn test_tar_publisher() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = BundleDir::new(dir.path().join("serving"));
        std::fs::create_dir_all(bundle.path()).unwrap();
        for name in BUNDLE_FILES {
            std::fs::write(bundle.path().join(name), name).unwrap();
        }

        let publisher = TarPublisher::new(dir.path().join("exports"));
        let path = publisher.publish(&bundle).await.unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("bundle-"));

        let mut archive = Archive::new(tokio::fs::File::open(&path).await.unwrap());
        let mut entries = archive.entries().unwrap();
        let mut names = vec![];
        while let Some(entry) = entries.next().await {
            names.push(entry.unwrap().path().unwrap().to_string_lossy().to_string());
        }
        assert_eq!(names, BUNDLE_FILES);
    }

    #[tokio::test]
    async fn test_tar_publisher_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = BundleDir::new(dir.path().join("serving"));
        let publisher = TarPublisher::new(dir.path().join("exports"));
        assert!(publisher.publish(&bundle).await.is_err());
    }
}
