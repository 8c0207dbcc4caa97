use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable, opaque identifier of a tenant.
///
/// The nil UUID is reserved for the null tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub Uuid);

impl TenantId {
    /// Identifier shared by every request that matched no tenant.
    pub const NULL: TenantId = TenantId(Uuid::nil());

    /// Generates a fresh random tenant identifier.
    #[must_use]
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns `true` for the reserved null-tenant identifier.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0.is_nil()
    }

    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for TenantId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for TenantId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Resolved identity of the tenant a request belongs to.
///
/// Immutable once resolved. Used as the cache key for tenant shells and
/// tenant pipelines, so two identities are the same tenant only when both
/// the id and the display name agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantIdentity {
    id: TenantId,
    name: String,
}

impl TenantIdentity {
    /// Creates an identity for a named tenant.
    #[must_use]
    pub fn new(id: TenantId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// The well-known identity for requests that matched no tenant.
    ///
    /// It is a valid, cacheable identity: all unresolved traffic shares one
    /// shell and one content-root partition.
    #[must_use]
    pub fn null() -> Self {
        Self {
            id: TenantId::NULL,
            name: String::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> TenantId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.id.is_null()
    }
}

impl Default for TenantIdentity {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Display for TenantIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("{null tenant}")
        } else {
            write!(f, "{} ({})", self.name, self.id)
        }
    }
}
