//! Access conditions attached to blob writes.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, StorageError, StorageResult};

use super::blob::BlobModel;

/// Conditions the store validates before accepting a write or commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessConditions {
    /// Only write if the blob's ETag matches (`*` matches any existing blob).
    pub if_match: Option<String>,
    /// Only write if the blob's ETag does not match (`*` requires absence).
    pub if_none_match: Option<String>,
    /// Only write if the resulting blob length stays within this bound.
    pub max_size: Option<u64>,
    /// Only append if the blob's current length equals this offset.
    pub append_position: Option<u64>,
}

impl AccessConditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn if_match(mut self, etag: impl Into<String>) -> Self {
        self.if_match = Some(etag.into());
        self
    }

    pub fn if_none_match(mut self, etag: impl Into<String>) -> Self {
        self.if_none_match = Some(etag.into());
        self
    }

    /// Requires that the blob does not exist yet.
    pub fn if_not_exists() -> Self {
        Self::default().if_none_match("*")
    }

    pub fn max_size(mut self, max_size: u64) -> Self {
        self.max_size = Some(max_size);
        self
    }

    pub fn append_position(mut self, position: u64) -> Self {
        self.append_position = Some(position);
        self
    }

    /// Checks the ETag conditions against the current state of a blob.
    pub fn check_etag(&self, blob: Option<&BlobModel>) -> StorageResult<()> {
        self.check_etag_value(blob.map(|b| b.properties.etag.as_str()))
    }

    /// Checks the ETag conditions against a blob's current ETag, `None` when
    /// the blob does not exist.
    pub fn check_etag_value(&self, current: Option<&str>) -> StorageResult<()> {
        if let Some(etag) = self.if_match.as_deref() {
            match current {
                Some(current) if etag == "*" || etag == current => {}
                _ => return Err(StorageError::new(ErrorCode::ConditionNotMet)),
            }
        }

        if let Some(etag) = self.if_none_match.as_deref() {
            if let Some(current) = current {
                if etag == "*" || etag == current {
                    return Err(StorageError::new(ErrorCode::ConditionNotMet));
                }
            }
        }

        Ok(())
    }

    /// Checks the max-size condition against a prospective blob length.
    pub fn check_max_size(&self, resulting_length: u64) -> StorageResult<()> {
        match self.max_size {
            Some(max) if resulting_length > max => {
                Err(StorageError::new(ErrorCode::MaxBlobSizeConditionNotMet))
            }
            _ => Ok(()),
        }
    }

    /// Checks the append-position condition against the current blob length.
    pub fn check_append_position(&self, current_length: u64) -> StorageResult<()> {
        match self.append_position {
            Some(expected) if expected != current_length => {
                Err(StorageError::new(ErrorCode::AppendPositionConditionNotMet))
            }
            _ => Ok(()),
        }
    }
}
