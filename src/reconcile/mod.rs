//! Reconciliation
//!
//! Checksum voting over the per-replica statuses and the repair workflow
//! that swaps a corrupt copy for a good one.

pub mod engine;
pub mod repair;
pub mod vote;

pub use engine::{FileReport, ReconciliationEngine, SweepReport};
pub use repair::{CorrectionOrigin, CorrectionPhase, CorrectionWorkflow, PendingCorrection, RepairCoordinator};
pub use vote::{checksum_vote, tally, voting_checksums, VoteOutcome, VoteResult};
