use async_trait::async_trait;

use crate::error::Result;

/// Metadata for a file on the cluster filesystem.
#[derive(Debug, Clone)]
pub struct FileStat {
    pub path: String,
    pub len: u64,
    pub modified_ms: i64,
}

/// The slice of the cluster filesystem needed to localize container
/// resources. The hosting application binds this to its filesystem client.
#[async_trait]
pub trait ClusterFs: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool>;

    /// List the files directly under a directory.
    async fn list_status(&self, path: &str) -> Result<Vec<FileStat>>;

    /// Metadata for a single file, resolving the URI against the runtime
    /// configuration.
    async fn file_status(&self, path: &str) -> Result<FileStat>;
}
