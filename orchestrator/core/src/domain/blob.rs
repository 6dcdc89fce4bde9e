// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::domain::pool::PoolName;

/// Prefix shared by every device-mapper device this crate creates.
pub const DM_NAME_PREFIX: &str = "lvblob-";

// ============================================================================
// Value Objects
// ============================================================================

/// Globally unique blob name. Doubles as the thin LV name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobName(pub String);

impl BlobName {
    /// Validate and wrap a blob name.
    ///
    /// Names end up in LVM, device-mapper and NBD export names, so they are
    /// restricted to the character set all three accept.
    pub fn parse(name: impl Into<String>) -> Result<Self, BlobError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(BlobError::InvalidName("Blob name cannot be empty".to_string()));
        }
        // dm names are limited to 127 bytes including our prefix and suffix
        if name.len() > 100 {
            return Err(BlobError::InvalidName(format!(
                "Blob name '{}' is longer than 100 characters",
                name
            )));
        }
        if name.starts_with('-') || name.starts_with('_') {
            return Err(BlobError::InvalidName(format!(
                "Blob name '{}' must start with an alphanumeric character",
                name
            )));
        }
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+')))
        {
            return Err(BlobError::InvalidName(format!(
                "Blob name '{}' contains invalid character '{}'",
                name, c
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Thin logical volume name.
    pub fn lv_name(&self) -> &str {
        &self.0
    }

    /// Upper (multipath) device-mapper name; this is the stable device.
    pub fn dm_upper_name(&self) -> String {
        format!("{}{}", DM_NAME_PREFIX, self.0)
    }

    /// Lower (linear) device-mapper name whose table gets swapped.
    pub fn dm_lower_name(&self) -> String {
        format!("{}{}-linear", DM_NAME_PREFIX, self.0)
    }

    /// Stable path consumers open, independent of the backing device.
    pub fn dm_path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/mapper/{}", self.dm_upper_name()))
    }

    /// NBD export id used when the blob is relayed to another node.
    pub fn export_id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlobName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// Entity: Blob
// ============================================================================

/// A thin-provisioned logical volume exposed as an attachable unit.
///
/// Immutable once created. A blob copied from another is a distinct entity
/// sharing the source's pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    pub name: BlobName,
    pub pool: PoolName,
    pub volume_group: String,
    pub size_bytes: u64,
}

impl Blob {
    pub fn new(
        name: BlobName,
        pool: PoolName,
        volume_group: impl Into<String>,
        size_bytes: u64,
    ) -> Result<Self, BlobError> {
        if size_bytes == 0 || size_bytes % 512 != 0 {
            return Err(BlobError::InvalidSize(format!(
                "Blob size must be a positive multiple of 512 bytes, got {}",
                size_bytes
            )));
        }
        let volume_group = volume_group.into();
        if volume_group.trim().is_empty() {
            return Err(BlobError::InvalidName(
                "Volume group cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            name,
            pool,
            volume_group,
            size_bytes,
        })
    }

    /// Device node of the thin LV on the node where the pool is active.
    pub fn lv_path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/{}/{}", self.volume_group, self.name.lv_name()))
    }

    pub fn size_sectors(&self) -> u64 {
        self.size_bytes / 512
    }
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("Invalid blob name: {0}")]
    InvalidName(String),

    #[error("Invalid blob size: {0}")]
    InvalidSize(String),

    #[error("Blob not found: {0}")]
    NotFound(BlobName),

    #[error("Blob already exists: {0}")]
    AlreadyExists(BlobName),

    #[error("Blob {blob} is still attached ({holders} holder(s))")]
    StillAttached { blob: BlobName, holders: usize },

    #[error("Blob {blob} cannot shrink from {current} to {requested} bytes")]
    CannotShrink {
        blob: BlobName,
        current: u64,
        requested: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_name_validation() {
        assert!(BlobName::parse("pvc-1234.abcd").is_ok());
        assert!(BlobName::parse("").is_err());
        assert!(BlobName::parse("-leading-dash").is_err());
        assert!(BlobName::parse("has space").is_err());
        assert!(BlobName::parse("slash/inside").is_err());
        assert!(BlobName::parse("x".repeat(101)).is_err());
    }

    #[test]
    fn test_derived_names() {
        let name = BlobName::parse("vol1").unwrap();
        assert_eq!(name.lv_name(), "vol1");
        assert_eq!(name.dm_upper_name(), "lvblob-vol1");
        assert_eq!(name.dm_lower_name(), "lvblob-vol1-linear");
        assert_eq!(name.dm_path(), PathBuf::from("/dev/mapper/lvblob-vol1"));
        assert_eq!(name.export_id(), "vol1");
    }

    #[test]
    fn test_blob_paths_and_sizes() {
        let blob = Blob::new(BlobName::from("vol1"), PoolName::from("vol1"), "vg0", 1 << 30).unwrap();
        assert_eq!(blob.lv_path(), PathBuf::from("/dev/vg0/vol1"));
        assert_eq!(blob.size_sectors(), (1 << 30) / 512);
    }

    #[test]
    fn test_blob_rejects_unaligned_size() {
        assert!(Blob::new(BlobName::from("v"), PoolName::from("v"), "vg0", 1000).is_err());
        assert!(Blob::new(BlobName::from("v"), PoolName::from("v"), "vg0", 0).is_err());
        assert!(Blob::new(BlobName::from("v"), PoolName::from("v"), "", 4096).is_err());
    }
}
