use async_trait::async_trait;

use crate::file::FileContent;

/// Read-only source of file content, addressed by request path.
///
/// Implementations: physical directory, in-memory table, provider chains.
/// A missing file is `Ok(None)`; `Err` is reserved for I/O failures.
#[async_trait]
pub trait FileProvider: Send + Sync {
    /// Short provider name for diagnostics (e.g., `"physical"`, `"chain"`).
    fn name(&self) -> &str;

    /// Look up the content stored under `path`.
    async fn try_get_content(&self, path: &str) -> anyhow::Result<Option<FileContent>>;
}
