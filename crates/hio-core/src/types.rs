use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{HioError, HioResult};

/// Request the committed dataset with the most recent modification time.
pub const DATASET_ID_NEWEST: i64 = i64::MAX;
/// Request the committed dataset with the largest id.
pub const DATASET_ID_HIGHEST: i64 = i64::MAX - 1;

/// True when `id` asks the library to pick the dataset id itself.
pub fn dataset_id_is_sentinel(id: i64) -> bool {
    id == DATASET_ID_NEWEST || id == DATASET_ID_HIGHEST
}

bitflags! {
    /// Dataset open flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DatasetFlags: u32 {
        /// Open for reading
        const READ     = 0x01;
        /// Open for writing
        const WRITE    = 0x02;
        /// Create the dataset if it does not exist
        const CREATE   = 0x04;
        /// Discard existing contents of the dataset id
        const TRUNCATE = 0x08;
        /// Keep existing contents and extend
        const APPEND   = 0x10;
        /// All element operations are non-blocking; completion requires
        /// an explicit wait or flush
        const NONBLOCK = 0x20;
    }
}

/// Element namespace mode for a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetMode {
    /// Each rank owns a private copy of every element name
    Unique,
    /// All ranks share one element namespace
    Shared,
}

impl DatasetMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DatasetMode::Unique => "unique",
            DatasetMode::Shared => "shared",
        }
    }

    pub fn parse(s: &str) -> HioResult<Self> {
        match s {
            "unique" => Ok(DatasetMode::Unique),
            "shared" => Ok(DatasetMode::Shared),
            _ => Err(HioError::BadParam),
        }
    }
}

/// Physical layout mode for a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileMode {
    /// One physical file per element per rank; no manifest segments
    Basic,
    /// Striped placement with explicit segments in the manifest
    Optimized,
}

impl FileMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FileMode::Basic => "basic",
            FileMode::Optimized => "optimized",
        }
    }

    pub fn parse(s: &str) -> HioResult<Self> {
        match s {
            "basic" => Ok(FileMode::Basic),
            "optimized" => Ok(FileMode::Optimized),
            _ => Err(HioError::BadParam),
        }
    }
}

/// Filesystem type backing a data root. Detected at dataset open and
/// exposed as a read-only configuration value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsType {
    #[default]
    Default,
    Lustre,
    Gpfs,
    Datawarp,
}

impl FsType {
    pub fn as_str(self) -> &'static str {
        match self {
            FsType::Default => "default",
            FsType::Lustre => "lustre",
            FsType::Gpfs => "gpfs",
            FsType::Datawarp => "datawarp",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!(DatasetMode::parse("unique").unwrap(), DatasetMode::Unique);
        assert_eq!(DatasetMode::parse("shared").unwrap(), DatasetMode::Shared);
        assert_eq!(DatasetMode::parse("other"), Err(HioError::BadParam));
        assert_eq!(FileMode::parse("basic").unwrap(), FileMode::Basic);
        assert_eq!(FileMode::parse("optimized").unwrap(), FileMode::Optimized);
        assert_eq!(FileMode::parse(""), Err(HioError::BadParam));
    }

    #[test]
    fn test_sentinels() {
        assert!(dataset_id_is_sentinel(DATASET_ID_NEWEST));
        assert!(dataset_id_is_sentinel(DATASET_ID_HIGHEST));
        assert!(!dataset_id_is_sentinel(0));
        assert!(!dataset_id_is_sentinel(42));
    }
}
