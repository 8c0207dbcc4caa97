//! Tenant-partitioned hosting environment: content root and web root.
//!
//! - [`providers`]: Physical, in-memory and null file providers
//! - [`chain`]: Provider chains, tenant partitions, partitioned roots
//!
//! On disk a tenant's files live under `<root>/.tenants/<partition-id>/`
//! and fall back to `<root>/` itself. The shared fallback never serves
//! anything beneath `<root>/.tenants/`.

pub mod chain;
pub mod providers;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tenancy_core::{partition_path, FileProvider, PartitionId, TenantIdentity};

pub use chain::{ContentRootPartition, FileProviderChain, PartitionedRoot, PrimaryProviderFn};
pub use providers::{InMemoryFileProvider, NullFileProvider, PhysicalFileProvider};

/// The two partitioned file roots of the process.
#[derive(Debug)]
pub struct TenantHostingEnvironment {
    content_root: PartitionedRoot,
    web_root: PartitionedRoot,
}

impl TenantHostingEnvironment {
    #[must_use]
    pub fn new(content_root: PartitionedRoot, web_root: PartitionedRoot) -> Self {
        Self {
            content_root,
            web_root,
        }
    }

    /// Physical roots: each tenant reads `<base>/<partition_dir>/<id>/`
    /// first and `<base>/` second.
    #[must_use]
    pub fn physical(content_base: PathBuf, web_base: PathBuf, partition_dir: &str) -> Self {
        Self::new(
            physical_root("content", content_base, partition_dir),
            physical_root("web", web_base, partition_dir),
        )
    }

    #[must_use]
    pub fn content_root(&self) -> &PartitionedRoot {
        &self.content_root
    }

    #[must_use]
    pub fn web_root(&self) -> &PartitionedRoot {
        &self.web_root
    }

    /// The tenant's partitions of both roots.
    #[must_use]
    pub fn file_system(&self, identity: &TenantIdentity) -> TenantFileSystem {
        TenantFileSystem {
            content_root: self.content_root.partition(identity),
            web_root: self.web_root.partition(identity),
        }
    }
}

fn physical_root(name: &str, base: PathBuf, partition_dir: &str) -> PartitionedRoot {
    let fallback: Arc<dyn FileProvider> =
        Arc::new(PhysicalFileProvider::new(base.clone()).with_excluded_dir(partition_dir));
    let partition_dir = partition_dir.to_string();
    PartitionedRoot::new(name, fallback, move |partition: PartitionId| {
        let dir = partition_path(Path::new(&base), &partition_dir, partition);
        Arc::new(PhysicalFileProvider::new(dir)) as Arc<dyn FileProvider>
    })
}

/// A tenant's file roots, registered in its root container.
#[derive(Debug, Clone)]
pub struct TenantFileSystem {
    pub content_root: Arc<ContentRootPartition>,
    pub web_root: Arc<ContentRootPartition>,
}

impl TenantFileSystem {
    #[must_use]
    pub fn partition_id(&self) -> PartitionId {
        self.content_root.partition_id()
    }
}
