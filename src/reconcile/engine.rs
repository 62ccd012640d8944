//! Reconciliation Engine
//!
//! Feeds batch results into the replica store, runs checksum votes and
//! answers canonical checksum and good-copy queries.

use std::collections::BTreeMap;
use std::sync::Arc;
use serde::{Deserialize, Serialize};

use super::vote::{checksum_vote, tally, voting_checksums, VoteOutcome, VoteResult};
use crate::batch::parse_checksum_line;
use crate::error::{Error, Result};
use crate::notify::{NotificationLevel, Notifier};
use crate::state::{ChecksumStatus, Replica, ReplicaFileStatus, ReplicaStore};

/// Counts of a full consistency sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub files: usize,
    pub agreed: usize,
    pub majority: usize,
    pub ties: usize,
    pub no_checksums: usize,
    pub corrupt_copies: usize,
}

/// Everything known about one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReport {
    pub filename: String,
    pub checksum: Option<String>,
    pub replicas: Vec<ReplicaFileStatus>,
}

pub struct ReconciliationEngine {
    store: Arc<ReplicaStore>,
    notifier: Arc<dyn Notifier>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<ReplicaStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    pub fn store(&self) -> &Arc<ReplicaStore> {
        &self.store
    }

    /// Vote on a file over every entry that can vote and persist the result
    pub async fn vote_file(&self, filename: &str) -> Result<VoteResult> {
        let entries = self.store.file_statuses(filename).await?;
        self.vote_entries(filename, voting_checksums(&entries)).await
    }

    async fn vote_entries(
        &self,
        filename: &str,
        checksums: BTreeMap<String, String>,
    ) -> Result<VoteResult> {
        let result = checksum_vote(&checksums);

        match &result.outcome {
            VoteOutcome::NoChecksums => {
                self.notifier.notify(
                    NotificationLevel::Warning,
                    &format!("The file '{}' is missing in all replicas", filename),
                );
                return Ok(result);
            }
            VoteOutcome::Agreed(checksum) => {
                tracing::debug!("All replicas agree on checksum {} for '{}'", checksum, filename);
            }
            VoteOutcome::Majority { winner, votes } => {
                for (replica, status) in &result.statuses {
                    if *status == ChecksumStatus::Corrupt {
                        tracing::warn!(
                            "Replica {} holds a corrupt copy of '{}' ({} of {} votes for {})",
                            replica,
                            filename,
                            votes,
                            result.statuses.len(),
                            winner
                        );
                    }
                }
            }
            VoteOutcome::Tie { leaders } => {
                let counts: Vec<String> = leaders
                    .iter()
                    .map(|(checksum, count)| format!("{} ({} votes)", checksum, count))
                    .collect();
                self.notifier.notify(
                    NotificationLevel::Warning,
                    &format!(
                        "Could not find a correct checksum for '{}': tie between {}",
                        filename,
                        counts.join(", ")
                    ),
                );
            }
        }

        self.store
            .apply_checksum_statuses(filename, &result.status_list())
            .await?;
        Ok(result)
    }

    /// Re-vote every known file
    pub async fn sweep(&self) -> Result<SweepReport> {
        let filenames = self.store.filenames().await?;
        let mut report = SweepReport {
            files: filenames.len(),
            ..Default::default()
        };

        for filename in &filenames {
            let result = self.vote_file(filename).await?;
            match result.outcome {
                VoteOutcome::NoChecksums => report.no_checksums += 1,
                VoteOutcome::Agreed(_) => report.agreed += 1,
                VoteOutcome::Majority { .. } => report.majority += 1,
                VoteOutcome::Tie { .. } => report.ties += 1,
            }
            report.corrupt_copies += result
                .statuses
                .values()
                .filter(|s| **s == ChecksumStatus::Corrupt)
                .count();
        }

        tracing::info!(
            "Consistency sweep over {} files: {} agreed, {} by majority, {} ties, {} without checksums",
            report.files,
            report.agreed,
            report.majority,
            report.ties,
            report.no_checksums
        );
        Ok(report)
    }

    /// The canonical checksum of a file.
    ///
    /// An entry already marked OK is used as is. Otherwise the non-corrupt
    /// entries are voted on again and the result is stored; a tie or an
    /// unknown file gives `None`.
    pub async fn get_checksum(&self, filename: &str) -> Result<Option<String>> {
        let entries = self.store.file_statuses(filename).await?;
        if entries.is_empty() {
            return Ok(None);
        }

        if let Some(entry) = entries
            .iter()
            .find(|e| e.checksum_status == ChecksumStatus::Ok && e.can_vote())
        {
            return Ok(entry.checksum.clone());
        }

        let candidates = entries
            .iter()
            .filter(|e| e.checksum_status != ChecksumStatus::Corrupt)
            .cloned()
            .collect::<Vec<_>>();
        let result = self.vote_entries(filename, voting_checksums(&candidates)).await?;
        Ok(result.outcome.winner().map(str::to_string))
    }

    /// The canonical checksum, failing with the vote counts when there is none
    pub async fn require_checksum(&self, filename: &str) -> Result<String> {
        if let Some(checksum) = self.get_checksum(filename).await? {
            return Ok(checksum);
        }
        let entries = self.store.file_statuses(filename).await?;
        if entries.is_empty() {
            return Err(Error::UnknownFile(filename.to_string()));
        }
        let candidates = voting_checksums(&entries);
        Err(Error::ConsistencyConflict {
            filename: filename.to_string(),
            votes: tally(candidates.values().map(String::as_str)),
        })
    }

    /// A file with its canonical checksum and every replica's status.
    ///
    /// Goes through [`get_checksum`](Self::get_checksum), so a lazy vote is
    /// persisted before the statuses are read.
    pub async fn file_report(&self, filename: &str) -> Result<Option<FileReport>> {
        let checksum = self.get_checksum(filename).await?;
        let replicas = self.store.file_statuses(filename).await?;
        if replicas.is_empty() {
            return Ok(None);
        }
        Ok(Some(FileReport {
            filename: filename.to_string(),
            checksum,
            replicas,
        }))
    }

    /// Apply a replica's full checksum list (`name##checksum` lines).
    ///
    /// A name reported twice keeps the checksum of its first line.
    pub async fn add_checksum_information(&self, lines: &[String], replica_id: &str) -> Result<()> {
        let mut unique: BTreeMap<String, String> = BTreeMap::new();
        for line in lines {
            let (name, checksum) = match parse_checksum_line(line) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Skipping checksum line from {}: {}", replica_id, e);
                    continue;
                }
            };
            match unique.get(&name) {
                Some(kept) if *kept != checksum => {
                    self.notifier.notify(
                        NotificationLevel::Warning,
                        &format!(
                            "Replica {} reports unidentical duplicates of '{}': keeping {}, ignoring {}",
                            replica_id, name, kept, checksum
                        ),
                    );
                }
                Some(_) => {}
                None => {
                    unique.insert(name, checksum);
                }
            }
        }

        let entries: Vec<(String, String)> = unique.into_iter().collect();
        self.store.apply_checksum_list(replica_id, &entries).await
    }

    /// Apply a replica's full file list
    pub async fn add_filelist_information(&self, names: &[String], replica_id: &str) -> Result<()> {
        let mut names: Vec<String> = names
            .iter()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        names.sort();
        names.dedup();

        self.store.apply_filelist(replica_id, &names).await
    }

    /// Record a single checksum result; `None` marks the file missing
    pub async fn update_checksum_for_file(
        &self,
        filename: &str,
        checksum: Option<&str>,
        replica_id: &str,
    ) -> Result<()> {
        match checksum {
            Some(checksum) => self.store.set_checksum(filename, replica_id, checksum).await,
            None => self.store.mark_missing(filename, replica_id).await,
        }
    }

    /// A bitarchive replica holding a copy that won the vote
    pub async fn bitarchive_with_good_file(
        &self,
        filename: &str,
        excluding: Option<&str>,
    ) -> Result<Option<Replica>> {
        let found = self.store.bitarchive_with_ok_copy(filename, excluding).await?;
        if found.is_none() {
            self.notifier.notify(
                NotificationLevel::Warning,
                &format!("No bitarchive replica has a correct copy of '{}'", filename),
            );
        }
        Ok(found)
    }

    pub async fn missing_files(&self, replica_id: &str) -> Result<Vec<String>> {
        self.store.missing_files(replica_id).await
    }

    pub async fn corrupt_files(&self, replica_id: &str) -> Result<Vec<String>> {
        self.store.corrupt_files(replica_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingNotifier;
    use crate::state::{FileListStatus, ReplicaType};

    fn engine() -> (ReconciliationEngine, Arc<RecordingNotifier>) {
        let store = ReplicaStore::in_memory(vec![
            Replica::new("ONE", "one", ReplicaType::Bitarchive),
            Replica::new("TWO", "two", ReplicaType::Bitarchive),
            Replica::new("THREE", "three", ReplicaType::Checksum),
        ])
        .unwrap();
        let notifier = Arc::new(RecordingNotifier::new());
        (ReconciliationEngine::new(Arc::new(store), notifier.clone()), notifier)
    }

    fn lines(pairs: &[(&str, &str)]) -> Vec<String> {
        pairs.iter().map(|(n, c)| format!("{}##{}", n, c)).collect()
    }

    async fn status(engine: &ReconciliationEngine, file: &str, replica: &str) -> ReplicaFileStatus {
        engine.store().status(file, replica).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_vote_after_checksum_lists() {
        let (engine, _) = engine();
        engine.add_checksum_information(&lines(&[("f", "A")]), "ONE").await.unwrap();
        engine.add_checksum_information(&lines(&[("f", "A")]), "TWO").await.unwrap();
        engine.add_checksum_information(&lines(&[("f", "B")]), "THREE").await.unwrap();

        let result = engine.vote_file("f").await.unwrap();
        assert_eq!(result.outcome.winner(), Some("A"));
        assert_eq!(status(&engine, "f", "ONE").await.checksum_status, ChecksumStatus::Ok);
        assert_eq!(status(&engine, "f", "THREE").await.checksum_status, ChecksumStatus::Corrupt);
        assert_eq!(engine.corrupt_files("THREE").await.unwrap(), vec!["f"]);

        assert_eq!(engine.get_checksum("f").await.unwrap().as_deref(), Some("A"));
        let good = engine.bitarchive_with_good_file("f", Some("ONE")).await.unwrap();
        assert_eq!(good.map(|r| r.id), Some("TWO".to_string()));
    }

    #[tokio::test]
    async fn test_tie_notifies_and_stays_unknown() {
        let (engine, notifier) = engine();
        engine.update_checksum_for_file("f", Some("A"), "ONE").await.unwrap();
        engine.update_checksum_for_file("f", Some("B"), "TWO").await.unwrap();

        let result = engine.vote_file("f").await.unwrap();
        assert!(matches!(result.outcome, VoteOutcome::Tie { .. }));
        assert!(notifier.contains("Could not find a correct checksum for 'f'"));
        assert_eq!(status(&engine, "f", "ONE").await.checksum_status, ChecksumStatus::Unknown);
        assert_eq!(engine.get_checksum("f").await.unwrap(), None);
        assert!(engine.bitarchive_with_good_file("f", None).await.unwrap().is_none());
        assert!(notifier.contains("No bitarchive replica has a correct copy of 'f'"));
    }

    #[tokio::test]
    async fn test_missing_everywhere_leaves_statuses() {
        let (engine, notifier) = engine();
        engine.update_checksum_for_file("f", None, "ONE").await.unwrap();

        let result = engine.vote_file("f").await.unwrap();
        assert_eq!(result.outcome, VoteOutcome::NoChecksums);
        assert!(notifier.contains("missing in all replicas"));
        assert_eq!(status(&engine, "f", "ONE").await.file_list_status, FileListStatus::Missing);
    }

    #[tokio::test]
    async fn test_duplicates_and_unlisted_files() {
        let (engine, notifier) = engine();
        engine
            .add_checksum_information(&lines(&[("old", "X"), ("f", "A")]), "ONE")
            .await
            .unwrap();
        engine
            .add_checksum_information(&lines(&[("f", "B"), ("f", "A")]), "ONE")
            .await
            .unwrap();

        assert!(notifier.contains("unidentical duplicates of 'f': keeping B, ignoring A"));
        assert_eq!(status(&engine, "f", "ONE").await.checksum.as_deref(), Some("B"));
        assert_eq!(engine.missing_files("ONE").await.unwrap(), vec!["old"]);

        engine
            .add_filelist_information(&["f".to_string(), "f".to_string(), " ".to_string()], "TWO")
            .await
            .unwrap();
        assert_eq!(status(&engine, "f", "TWO").await.file_list_status, FileListStatus::Ok);
        assert_eq!(engine.missing_files("TWO").await.unwrap(), vec!["old"]);
    }

    #[tokio::test]
    async fn test_lazy_checksum_ignores_corrupt_copies() {
        let (engine, _) = engine();
        engine.update_checksum_for_file("f", Some("A"), "ONE").await.unwrap();
        engine.update_checksum_for_file("f", Some("A"), "TWO").await.unwrap();
        engine.update_checksum_for_file("f", Some("B"), "THREE").await.unwrap();
        engine.vote_file("f").await.unwrap();

        // ONE reports again: its status goes back to unknown
        engine.update_checksum_for_file("f", Some("A"), "ONE").await.unwrap();
        engine.update_checksum_for_file("f", Some("A"), "TWO").await.unwrap();
        assert_eq!(engine.get_checksum("f").await.unwrap().as_deref(), Some("A"));
        assert_eq!(status(&engine, "f", "ONE").await.checksum_status, ChecksumStatus::Ok);
        assert_eq!(status(&engine, "f", "THREE").await.checksum_status, ChecksumStatus::Corrupt);

        let report = engine.sweep().await.unwrap();
        assert_eq!(report.files, 1);
        assert_eq!(report.majority, 1);
        assert_eq!(report.corrupt_copies, 1);

        let view = engine.file_report("f").await.unwrap().unwrap();
        assert_eq!(view.checksum.as_deref(), Some("A"));
        assert_eq!(view.replicas.len(), 3);
        assert!(engine.file_report("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_report_persists_lazy_vote() {
        let (engine, _) = engine();
        engine.update_checksum_for_file("f", Some("A"), "ONE").await.unwrap();
        engine.update_checksum_for_file("f", Some("A"), "TWO").await.unwrap();
        assert_eq!(status(&engine, "f", "ONE").await.checksum_status, ChecksumStatus::Unknown);

        let view = engine.file_report("f").await.unwrap().unwrap();
        assert_eq!(view.checksum.as_deref(), Some("A"));
        // Rows come in replica id order: ONE, THREE, TWO
        let statuses: Vec<ChecksumStatus> = view.replicas.iter().map(|r| r.checksum_status).collect();
        assert_eq!(statuses, vec![ChecksumStatus::Ok, ChecksumStatus::Unknown, ChecksumStatus::Ok]);
        assert_eq!(status(&engine, "f", "TWO").await.checksum_status, ChecksumStatus::Ok);
    }

    #[tokio::test]
    async fn test_require_checksum_reports_tie() {
        let (engine, _) = engine();
        engine.update_checksum_for_file("f", Some("A"), "ONE").await.unwrap();
        engine.update_checksum_for_file("f", Some("B"), "TWO").await.unwrap();

        match engine.require_checksum("f").await.unwrap_err() {
            Error::ConsistencyConflict { filename, votes } => {
                assert_eq!(filename, "f");
                assert_eq!(votes, vec![("A".to_string(), 1), ("B".to_string(), 1)]);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(matches!(engine.require_checksum("nope").await, Err(Error::UnknownFile(_))));

        engine.update_checksum_for_file("f", Some("A"), "THREE").await.unwrap();
        assert_eq!(engine.require_checksum("f").await.unwrap(), "A");
    }
}
