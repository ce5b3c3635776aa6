pub mod artifact;
pub mod builder;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod fetch;
pub mod ivf;
pub mod kmeans;
pub mod l2;
pub mod matcher;
mod metrics;
pub mod publisher;
pub mod resource;
mod server;
pub mod sift;
pub mod store;
pub mod utils;
pub mod watcher;

pub use config::Opts;
pub use error::CardscanError;
