//! Checksum voting
//!
//! Pure functions deciding which checksum of a file is canonical. Nothing
//! here touches the store; the engine applies the result.

use std::collections::{BTreeMap, HashMap};

use crate::state::{ChecksumStatus, ReplicaFileStatus};

/// How a vote was decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    /// No entry carried a checksum
    NoChecksums,
    /// All voters reported the same checksum
    Agreed(String),
    /// One checksum had strictly more votes than any other
    Majority { winner: String, votes: usize },
    /// Several checksums share the highest count
    Tie { leaders: Vec<(String, usize)> },
}

impl VoteOutcome {
    /// The canonical checksum, if the vote produced one
    pub fn winner(&self) -> Option<&str> {
        match self {
            VoteOutcome::Agreed(checksum) => Some(checksum),
            VoteOutcome::Majority { winner, .. } => Some(winner),
            VoteOutcome::NoChecksums | VoteOutcome::Tie { .. } => None,
        }
    }
}

/// Outcome plus the checksum status every voter gets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteResult {
    pub outcome: VoteOutcome,
    /// Replica id -> new status; only replicas that voted appear
    pub statuses: BTreeMap<String, ChecksumStatus>,
}

impl VoteResult {
    pub fn status_list(&self) -> Vec<(String, ChecksumStatus)> {
        self.statuses
            .iter()
            .map(|(replica, status)| (replica.clone(), *status))
            .collect()
    }
}

/// Count votes per checksum, highest first (ties ordered by checksum)
pub fn tally<'a>(checksums: impl IntoIterator<Item = &'a str>) -> Vec<(String, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for checksum in checksums {
        *counts.entry(checksum).or_default() += 1;
    }

    let mut tally: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(checksum, count)| (checksum.to_string(), count))
        .collect();
    tally.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    tally
}

/// Vote over `replica id -> checksum`.
///
/// Empty checksums do not vote. A single distinct value makes every voter
/// OK; a strict majority makes the winners OK and the rest corrupt; a tie
/// for the highest count leaves every voter unknown.
pub fn checksum_vote(checksums: &BTreeMap<String, String>) -> VoteResult {
    let voters: Vec<(&String, &String)> = checksums
        .iter()
        .filter(|(_, checksum)| !checksum.is_empty())
        .collect();

    if voters.is_empty() {
        return VoteResult {
            outcome: VoteOutcome::NoChecksums,
            statuses: BTreeMap::new(),
        };
    }

    let tally = tally(voters.iter().map(|(_, checksum)| checksum.as_str()));

    let outcome = match tally.as_slice() {
        [(only, _)] => VoteOutcome::Agreed(only.clone()),
        [(first, top), (_, second), ..] if top > second => VoteOutcome::Majority {
            winner: first.clone(),
            votes: *top,
        },
        [(_, top), ..] => VoteOutcome::Tie {
            leaders: tally.iter().filter(|(_, count)| count == top).cloned().collect(),
        },
        [] => VoteOutcome::NoChecksums,
    };

    let statuses = voters
        .into_iter()
        .map(|(replica, checksum)| {
            let status = match outcome.winner() {
                Some(winner) if winner == checksum => ChecksumStatus::Ok,
                Some(_) => ChecksumStatus::Corrupt,
                None => ChecksumStatus::Unknown,
            };
            (replica.clone(), status)
        })
        .collect();

    VoteResult { outcome, statuses }
}

/// Entries that take part in a persisted vote
pub fn voting_checksums(entries: &[ReplicaFileStatus]) -> BTreeMap<String, String> {
    entries
        .iter()
        .filter(|entry| entry.can_vote())
        .filter_map(|entry| {
            entry
                .checksum
                .as_ref()
                .map(|checksum| (entry.replica_id.clone(), checksum.clone()))
        })
        .collect()
}
