//! State Management Module
//!
//! Handles the replica model, the persistent per-replica file status store
//! and the replica liveness table.

mod replica;
mod liveness;
mod store;

pub use replica::{
    ChecksumStatus, FileListStatus, Replica, ReplicaFileStatus, ReplicaType, UploadStatus,
};
pub use liveness::{ReplicaLiveness, ReplicaLivenessTable};
pub use store::{ReplicaStore, ReplicaUpdateDates};
