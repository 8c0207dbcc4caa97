//! File provider implementations.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tenancy_core::{normalize_path, FileContent, FileProvider};

// ---------------------------------------------------------------------------
// PhysicalFileProvider
// ---------------------------------------------------------------------------

/// Serves files beneath a directory on disk.
///
/// Request paths are normalized first; paths that climb out of the root
/// are not found. A missing root directory simply finds nothing. Paths whose
/// first segment names an excluded directory are not found either.
#[derive(Debug, Clone)]
pub struct PhysicalFileProvider {
    root: PathBuf,
    name: String,
    excluded: Vec<String>,
}

impl PhysicalFileProvider {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let name = format!("physical:{}", root.display());
        Self {
            root,
            name,
            excluded: Vec::new(),
        }
    }

    /// Hides the top-level directory `dir` (and everything beneath it).
    #[must_use]
    pub fn with_excluded_dir(mut self, dir: &str) -> Self {
        if let Some(first) = normalize_path(dir).as_deref().and_then(first_segment) {
            self.excluded.push(first.to_string());
        }
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn is_excluded(&self, relative: &str) -> bool {
        first_segment(relative).is_some_and(|first| {
            self.excluded
                .iter()
                .any(|dir| dir.eq_ignore_ascii_case(first))
        })
    }
}

fn first_segment(relative: &str) -> Option<&str> {
    relative.split('/').find(|segment| !segment.is_empty())
}

#[async_trait]
impl FileProvider for PhysicalFileProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_get_content(&self, path: &str) -> anyhow::Result<Option<FileContent>> {
        let Some(relative) = normalize_path(path) else {
            return Ok(None);
        };
        if self.is_excluded(&relative) {
            return Ok(None);
        }
        let full = self.root.join(&relative);
        match tokio::fs::metadata(&full).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Ok(None),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        let data = tokio::fs::read(&full).await?;
        Ok(Some(FileContent::new(relative, data)))
    }
}

// ---------------------------------------------------------------------------
// InMemoryFileProvider
// ---------------------------------------------------------------------------

/// Serves files from an in-memory table keyed by normalized path.
#[derive(Debug, Default)]
pub struct InMemoryFileProvider {
    name: String,
    files: DashMap<String, Bytes>,
}

impl InMemoryFileProvider {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            files: DashMap::new(),
        }
    }

    #[must_use]
    pub fn with_file(self, path: &str, data: impl Into<Bytes>) -> Self {
        self.insert(path, data);
        self
    }

    /// Adds or replaces a file. Returns `false` if `path` does not name a file.
    pub fn insert(&self, path: &str, data: impl Into<Bytes>) -> bool {
        match normalize_path(path) {
            Some(key) => {
                self.files.insert(key, data.into());
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[async_trait]
impl FileProvider for InMemoryFileProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_get_content(&self, path: &str) -> anyhow::Result<Option<FileContent>> {
        let Some(key) = normalize_path(path) else {
            return Ok(None);
        };
        let data = self.files.get(&key).map(|entry| entry.value().clone());
        Ok(data.map(|data| FileContent::new(key, data)))
    }
}

// ---------------------------------------------------------------------------
// NullFileProvider
// ---------------------------------------------------------------------------

/// Finds nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullFileProvider;

#[async_trait]
impl FileProvider for NullFileProvider {
    fn name(&self) -> &str {
        "null"
    }

    async fn try_get_content(&self, _path: &str) -> anyhow::Result<Option<FileContent>> {
        Ok(None)
    }
}
