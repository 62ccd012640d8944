//! Monitor side: batch fan-out and aggregation plus the message handler
//! that ties coordination, liveness and reconciliation together.

pub mod coordinator;
pub mod server;

pub use coordinator::{BatchCoordinator, BatchOrigin, BatchOutcome, BatchTarget, PendingBatch};
pub use server::MonitorServer;
