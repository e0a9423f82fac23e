//! Tenant scoping carried through every store call.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{StoreError, StoreResult};

/// Opaque tenant identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> StoreResult<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(StoreError::validation("tenant id must not be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Isolation boundary for a single call.
///
/// An unscoped call sees every row. A scoped call only sees rows whose owning
/// repository belongs to the tenant; everything else behaves as if it did not
/// exist, so cross-tenant access surfaces as `NotFound`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantScope {
    tenant: Option<TenantId>,
}

impl TenantScope {
    pub fn unscoped() -> Self {
        Self { tenant: None }
    }

    pub fn tenant(id: TenantId) -> Self {
        Self { tenant: Some(id) }
    }

    pub fn from_option(id: Option<TenantId>) -> Self {
        Self { tenant: id }
    }

    pub fn tenant_id(&self) -> Option<&TenantId> {
        self.tenant.as_ref()
    }

    pub fn is_scoped(&self) -> bool {
        self.tenant.is_some()
    }

    /// Value bound into `(? IS NULL OR tenant_id = ?)` clauses.
    pub fn as_param(&self) -> Option<String> {
        self.tenant.as_ref().map(|t| t.0.clone())
    }
}
