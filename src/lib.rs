//! Bitarchive - Replicated Preservation Archive
//!
//! A set of replicas each holding full copies of archived files, coordinated
//! by a monitor node that fans batch jobs out to the replicas, tracks which
//! replicas are alive and keeps a per-replica record of every file's checksum.
//!
//! # Architecture
//!
//! Nodes talk over named message queues. A queue is either shared by all
//! replicas (batch broadcast), by any one replica (competing consumers for
//! uploads), addressed to a single replica or to the monitor. Replies are
//! correlated by message id.
//!
//! # Features
//!
//! - Batch jobs (checksum, file list, custom) with per-job timeouts and
//!   order-independent aggregation of replica outputs
//! - Uploads, gets and a guarded remove-and-get with credential and
//!   checksum checks
//! - Checksum voting across replicas with corrupt copy detection
//! - A remove then reupload repair workflow for corrupt copies
//! - Heartbeat-based replica liveness
//! - HTTP admin API

pub mod config;
pub mod error;
pub mod state;
pub mod checksum;
pub mod batch;
pub mod notify;
pub mod protocol;
pub mod transport;
pub mod router;
pub mod replica;
pub mod reconcile;
pub mod monitor;
pub mod api;

pub use config::ArchiveConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ArchiveConfig, NodeRole};
    pub use crate::error::{Error, Result};
    pub use crate::batch::{BatchJob, BatchKind};
    pub use crate::protocol::{Destination, Envelope, Header, Message, MessageId};
    pub use crate::transport::{LocalTransport, TcpTransport, Transport};
    pub use crate::router::{MessageHandler, MessageRouter};
    pub use crate::replica::ReplicaServer;
    pub use crate::monitor::{BatchCoordinator, MonitorServer};
    pub use crate::reconcile::ReconciliationEngine;
    pub use crate::state::{ReplicaLivenessTable, ReplicaStore};
}
