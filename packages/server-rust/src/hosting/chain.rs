//! Provider chains and per-tenant content-root partitions.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use dashmap::DashMap;
use tenancy_core::{partition_for, FileContent, FileProvider, PartitionId, TenantIdentity};
use tracing::debug;

// ---------------------------------------------------------------------------
// FileProviderChain
// ---------------------------------------------------------------------------

/// Ordered providers; the first provider that has the file wins.
#[derive(Clone)]
pub struct FileProviderChain {
    name: String,
    providers: Vec<Arc<dyn FileProvider>>,
}

impl FileProviderChain {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            providers: Vec::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, provider: Arc<dyn FileProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    #[must_use]
    pub fn providers(&self) -> &[Arc<dyn FileProvider>] {
        &self.providers
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[async_trait]
impl FileProvider for FileProviderChain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_get_content(&self, path: &str) -> anyhow::Result<Option<FileContent>> {
        for provider in &self.providers {
            let found = provider
                .try_get_content(path)
                .await
                .with_context(|| format!("file provider '{}' failed", provider.name()))?;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }
}

impl fmt::Debug for FileProviderChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.providers.iter().map(|p| p.name()).collect();
        f.debug_struct("FileProviderChain")
            .field("name", &self.name)
            .field("providers", &names)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ContentRootPartition
// ---------------------------------------------------------------------------

/// A tenant's view of a file root: its own partition, then the shared root.
pub struct ContentRootPartition {
    partition_id: PartitionId,
    primary: Arc<dyn FileProvider>,
    fallback: Arc<dyn FileProvider>,
    chain: FileProviderChain,
}

impl ContentRootPartition {
    #[must_use]
    pub fn new(
        partition_id: PartitionId,
        primary: Arc<dyn FileProvider>,
        fallback: Arc<dyn FileProvider>,
    ) -> Self {
        let chain = FileProviderChain::new(format!("partition:{partition_id}"))
            .with(Arc::clone(&primary))
            .with(Arc::clone(&fallback));
        Self {
            partition_id,
            primary,
            fallback,
            chain,
        }
    }

    #[must_use]
    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    #[must_use]
    pub fn primary(&self) -> &Arc<dyn FileProvider> {
        &self.primary
    }

    #[must_use]
    pub fn fallback(&self) -> &Arc<dyn FileProvider> {
        &self.fallback
    }

    /// Looks up `path` in the partition, then in the shared root.
    /// `Ok(None)` is not-found.
    ///
    /// # Errors
    ///
    /// Propagates provider I/O failures.
    pub async fn resolve(&self, path: &str) -> anyhow::Result<Option<FileContent>> {
        self.chain.try_get_content(path).await
    }
}

#[async_trait]
impl FileProvider for ContentRootPartition {
    fn name(&self) -> &str {
        self.chain.name()
    }

    async fn try_get_content(&self, path: &str) -> anyhow::Result<Option<FileContent>> {
        self.resolve(path).await
    }
}

impl fmt::Debug for ContentRootPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentRootPartition")
            .field("partition_id", &self.partition_id)
            .field("primary", &self.primary.name())
            .field("fallback", &self.fallback.name())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PartitionedRoot
// ---------------------------------------------------------------------------

/// Builds the primary provider of a partition.
pub type PrimaryProviderFn = Arc<dyn Fn(PartitionId) -> Arc<dyn FileProvider> + Send + Sync>;

/// One file root split into per-tenant partitions over a shared fallback.
///
/// Each partition is created once and cached by [`PartitionId`]; all
/// null-tenant traffic shares the empty partition.
pub struct PartitionedRoot {
    name: String,
    fallback: Arc<dyn FileProvider>,
    primary_for: PrimaryProviderFn,
    partitions: DashMap<PartitionId, Arc<ContentRootPartition>>,
    created: AtomicU64,
}

impl PartitionedRoot {
    pub fn new<F>(name: impl Into<String>, fallback: Arc<dyn FileProvider>, primary_for: F) -> Self
    where
        F: Fn(PartitionId) -> Arc<dyn FileProvider> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            fallback,
            primary_for: Arc::new(primary_for),
            partitions: DashMap::new(),
            created: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tenant's partition, creating it on first use.
    #[must_use]
    pub fn partition(&self, identity: &TenantIdentity) -> Arc<ContentRootPartition> {
        let id = partition_for(identity);
        if let Some(existing) = self.partitions.get(&id) {
            return Arc::clone(existing.value());
        }
        let entry = self.partitions.entry(id).or_insert_with(|| {
            self.created.fetch_add(1, Ordering::Relaxed);
            debug!(root = %self.name, partition = %id, "content root partition created");
            Arc::new(ContentRootPartition::new(
                id,
                (self.primary_for)(id),
                Arc::clone(&self.fallback),
            ))
        });
        Arc::clone(entry.value())
    }

    /// Number of partitions created so far.
    #[must_use]
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

impl fmt::Debug for PartitionedRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionedRoot")
            .field("name", &self.name)
            .field("fallback", &self.fallback.name())
            .field("partitions", &self.partitions.len())
            .finish_non_exhaustive()
    }
}
