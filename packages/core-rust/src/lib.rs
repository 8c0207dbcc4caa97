//! Tenancy Core: tenant identities, partition derivation, and the file
//! provider capability shared by hosts and the tenancy runtime.

pub mod file;
pub mod partition;
pub mod traits;
pub mod types;

pub use file::{normalize_path, FileContent};
pub use partition::{partition_for, partition_path, PartitionId, DEFAULT_PARTITION_DIR};
pub use traits::FileProvider;
pub use types::{TenantId, TenantIdentity};
