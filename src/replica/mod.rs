//! Replica side: the local archive, batch execution, heartbeats and the
//! message handler serving them.

pub mod archive;
pub mod batch;
pub mod heartbeat;
pub mod server;

pub use archive::{Archive, FixedSpaceProbe, SpaceProbe, StorageRoot, SystemSpaceProbe};
pub use batch::{run_job, BatchRegistry, LocalBatchResult};
pub use heartbeat::HeartbeatSender;
pub use server::ReplicaServer;
