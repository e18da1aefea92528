pub mod cluster;
pub mod config;
pub mod dispatcher;
pub mod groupkey;
pub mod kubernetes;
pub mod metrics;
pub mod models;
pub mod server;
pub mod store;
pub mod template;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Alert store error: {0}")]
    Store(#[from] store::StoreError),
    #[error("Cluster error: {0}")]
    Cluster(#[from] cluster::ClusterError),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("Timed out waiting for {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, Error>;
