use std::path::PathBuf;

use thiserror::Error;

/// 需要调用方区分处理的领域错误，通过 `anyhow::Error::downcast_ref` 取回
#[derive(Debug, Error)]
pub enum CardscanError {
    #[error("已有构建任务正在运行: {}", .0.display())]
    BuildInProgress(PathBuf),

    #[error("描述符数量不足以训练索引: {got} < nlist = {nlist}")]
    TooFewDescriptors { got: usize, nlist: usize },

    #[error("数据包不一致: {0}")]
    InconsistentBundle(String),

    #[error("验证失败: {0}")]
    ValidationFailed(String),

    #[error("缺少文件: {}", .0.display())]
    MissingArtifact(PathBuf),
}
