//! Replica and per-file status types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaType {
    /// Holds full file copies and can run batch jobs
    Bitarchive,
    /// Holds only checksums
    Checksum,
}

impl std::fmt::Display for ReplicaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaType::Bitarchive => write!(f, "BITARCHIVE"),
            ReplicaType::Checksum => write!(f, "CHECKSUM"),
        }
    }
}

/// One independent copy-holding unit of the archive
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Replica {
    pub id: String,
    pub name: String,
    pub replica_type: ReplicaType,
}

impl Replica {
    pub fn new(id: impl Into<String>, name: impl Into<String>, replica_type: ReplicaType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            replica_type,
        }
    }
}

/// Outcome of the checksum vote for one replica's copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChecksumStatus {
    Unknown,
    Ok,
    Corrupt,
}

/// Whether the replica's latest file listing contained the file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileListStatus {
    NoStatus,
    Ok,
    Missing,
}

/// Upload state of the file on the replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UploadStatus {
    Unknown,
    Completed,
    Failed,
}

macro_rules! status_codes {
    ($ty:ident { $($variant:ident = $code:expr => $label:expr),+ $(,)? }) => {
        impl $ty {
            /// Integer code stored in the database
            pub fn code(self) -> i64 {
                match self {
                    $($ty::$variant => $code,)+
                }
            }

            /// Decode a stored integer code
            pub fn from_code(code: i64) -> Option<Self> {
                match code {
                    $($code => Some($ty::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $($ty::$variant => write!(f, $label),)+
                }
            }
        }
    };
}

status_codes!(ChecksumStatus {
    Unknown = 0 => "UNKNOWN",
    Ok = 1 => "OK",
    Corrupt = 2 => "CORRUPT",
});

status_codes!(FileListStatus {
    NoStatus = 0 => "NO_STATUS",
    Ok = 1 => "OK",
    Missing = 2 => "MISSING",
});

status_codes!(UploadStatus {
    Unknown = 0 => "UNKNOWN",
    Completed = 1 => "UPLOAD_COMPLETED",
    Failed = 2 => "UPLOAD_FAILED",
});

/// Status of one file on one replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaFileStatus {
    pub filename: String,
    pub replica_id: String,
    pub checksum: Option<String>,
    pub checksum_status: ChecksumStatus,
    pub file_list_status: FileListStatus,
    pub upload_status: UploadStatus,
    pub checksum_checked_at: Option<DateTime<Utc>>,
    pub file_list_checked_at: Option<DateTime<Utc>>,
}

impl ReplicaFileStatus {
    /// Whether this entry takes part in a checksum vote
    pub fn can_vote(&self) -> bool {
        self.file_list_status != FileListStatus::Missing
            && self.checksum.as_deref().map(|c| !c.is_empty()).unwrap_or(false)
    }
}
