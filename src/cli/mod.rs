mod build;
mod inspect;
mod r#match;
mod serve;

pub use build::*;
pub use inspect::*;
pub use r#match::*;
pub use serve::*;

use crate::config::Opts;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}
