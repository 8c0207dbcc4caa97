//! Tenant partition derivation for hosting-environment file roots.
//!
//! A tenant's files live in a partition named after a [`PartitionId`]. The
//! mapping from [`TenantIdentity`] to [`PartitionId`] is a pure function so
//! that every re-resolution of the same tenant lands in the same partition.
//! All null-tenant traffic maps to the empty (nil) partition.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::TenantIdentity;

/// Directory name under a root that holds all tenant partitions.
pub const DEFAULT_PARTITION_DIR: &str = ".tenants";

/// Identifier of a tenant's file partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(Uuid);

impl PartitionId {
    /// Partition shared by every unresolved (null-tenant) request.
    pub const EMPTY: PartitionId = PartitionId(Uuid::nil());

    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_nil()
    }

    /// Directory name for this partition: the lower-case hyphenated UUID.
    #[must_use]
    pub fn directory_name(&self) -> String {
        self.0.hyphenated().to_string()
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// Compute the partition for a tenant.
///
/// The partition is keyed by the tenant's stable id only, so renaming a
/// tenant never moves its files.
///
/// # Examples
///
/// ```
/// use tenancy_core::{partition_for, PartitionId, TenantIdentity};
///
/// assert_eq!(partition_for(&TenantIdentity::null()), PartitionId::EMPTY);
/// ```
#[must_use]
pub fn partition_for(identity: &TenantIdentity) -> PartitionId {
    PartitionId(*identity.id().as_uuid())
}

/// Directory of a partition beneath `root`: `<root>/<partition_dir>/<partition-id>`.
#[must_use]
pub fn partition_path(root: &Path, partition_dir: &str, partition: PartitionId) -> PathBuf {
    root.join(partition_dir).join(partition.directory_name())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
