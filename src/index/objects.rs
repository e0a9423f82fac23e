// Repository-level object bookkeeping: hash mappings, merge bases, repositories

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Owning repository row. Everything else cascades from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub tenant_id: Option<String>,
    pub owner: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// One object known under both hashing schemes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashMapping {
    pub repo_id: i64,
    pub git_hash: String,
    pub got_hash: String,
    pub object_type: String,
}

impl HashMapping {
    pub fn new(
        repo_id: i64,
        git_hash: impl Into<String>,
        got_hash: impl Into<String>,
        object_type: impl Into<String>,
    ) -> Self {
        Self {
            repo_id,
            git_hash: git_hash.into(),
            got_hash: got_hash.into(),
            object_type: object_type.into(),
        }
    }

    pub fn validated(&self) -> StoreResult<HashMapping> {
        let git_hash = self.git_hash.trim();
        let got_hash = self.got_hash.trim();
        if git_hash.is_empty() || got_hash.is_empty() {
            return Err(StoreError::validation(
                "hash mapping requires both git and got hashes",
            ));
        }
        Ok(HashMapping {
            repo_id: self.repo_id,
            git_hash: git_hash.to_string(),
            got_hash: got_hash.to_string(),
            object_type: self.object_type.trim().to_string(),
        })
    }
}

/// Canonical `(smaller, larger)` ordering of a merge-base pair.
pub fn merge_base_pair(left: &str, right: &str) -> StoreResult<(String, String)> {
    let left = left.trim();
    let right = right.trim();
    if left.is_empty() || right.is_empty() {
        return Err(StoreError::validation(
            "merge-base lookup requires two commit hashes",
        ));
    }
    if left <= right {
        Ok((left.to_string(), right.to_string()))
    } else {
        Ok((right.to_string(), left.to_string()))
    }
}
