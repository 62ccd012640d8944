//! Batch execution on a replica server
//!
//! Each batch job runs as its own task, registered by job id with a
//! cancellation token. Cancellation is checked between files.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::archive::Archive;
use crate::batch::BatchJob;
use crate::error::{Error, Result};
use crate::protocol::{BatchEnded, MessageId};

/// Result of running a job locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalBatchResult {
    pub files_processed: u64,
    pub files_failed: BTreeSet<String>,
    pub output: Vec<u8>,
}

impl LocalBatchResult {
    /// Convert into the ended-message of this replica
    pub fn into_ended(self, replica_id: &str) -> BatchEnded {
        let error = if self.files_failed.is_empty() {
            None
        } else {
            Some(format!("Batch job failed on {} files.", self.files_failed.len()))
        };
        BatchEnded {
            replica_id: replica_id.to_string(),
            files_processed: self.files_processed,
            files_failed: self.files_failed.into_iter().collect(),
            result: self.output,
            error,
        }
    }
}

/// Registry of running batch jobs
#[derive(Default)]
pub struct BatchRegistry {
    running: Mutex<HashMap<MessageId, CancellationToken>>,
}

impl BatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job; fails if the id is already running
    pub async fn register(&self, job_id: MessageId) -> Result<CancellationToken> {
        let mut running = self.running.lock().await;
        if running.contains_key(&job_id) {
            return Err(Error::Validation(format!("batch job {} is already running", job_id)));
        }
        let token = CancellationToken::new();
        running.insert(job_id, token.clone());
        Ok(token)
    }

    pub async fn finish(&self, job_id: &MessageId) {
        self.running.lock().await.remove(job_id);
    }

    /// Signal a running job to stop; false when it is not running here
    pub async fn cancel(&self, job_id: &MessageId) -> bool {
        match self.running.lock().await.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn running(&self) -> usize {
        self.running.lock().await.len()
    }
}

/// Run a job over the archive's files.
///
/// Files that fail are collected and processing continues. Returns
/// [`Error::Cancelled`] when the token fires between two files.
pub async fn run_job(
    job_id: MessageId,
    job: &BatchJob,
    archive: &Arc<Archive>,
    cancel: &CancellationToken,
) -> Result<LocalBatchResult> {
    let files = archive.list_files().await?;
    let mut result = LocalBatchResult {
        files_processed: 0,
        files_failed: BTreeSet::new(),
        output: Vec::new(),
    };

    for (name, path) in files.iter().filter(|(name, _)| job.accepts(name)) {
        if cancel.is_cancelled() {
            tracing::info!(
                "Batch job {} cancelled after {} files",
                job_id,
                result.files_processed
            );
            return Err(Error::Cancelled(job_id.to_string()));
        }

        match job.process_file(name, path).await {
            Ok(line) => {
                result.output.extend_from_slice(line.as_bytes());
                result.files_processed += 1;
            }
            Err(e) => {
                tracing::warn!("Batch job {} failed on {}: {}", job_id, name, e);
                result.files_failed.insert(name.clone());
            }
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::archive::FixedSpaceProbe;
    use tempfile::tempdir;
    use uuid::Uuid;

    async fn archive_with(dir: &std::path::Path, names: &[&str]) -> Arc<Archive> {
        let archive = Archive::open(&[dir.to_path_buf()], 1, Box::new(FixedSpaceProbe(u64::MAX)))
            .unwrap();
        for name in names {
            archive.store(name, name.as_bytes()).await.unwrap();
        }
        Arc::new(archive)
    }

    #[tokio::test]
    async fn test_run_filelist_job() {
        let dir = tempdir().unwrap();
        let archive = archive_with(dir.path(), &["b.warc", "a.warc"]).await;

        let result = run_job(Uuid::new_v4(), &BatchJob::filelist(), &archive, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.files_processed, 2);
        assert_eq!(result.output, b"a.warc\nb.warc\n");

        let ended = result.into_ended("ONE");
        assert!(ended.is_ok());
    }

    #[tokio::test]
    async fn test_named_filter_and_cancellation() {
        let dir = tempdir().unwrap();
        let archive = archive_with(dir.path(), &["a.warc", "b.warc"]).await;

        let job = BatchJob::checksum().only_file("b.warc");
        let result = run_job(Uuid::new_v4(), &job, &archive, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.files_processed, 1);
        assert!(String::from_utf8(result.output).unwrap().starts_with("b.warc##"));

        let token = CancellationToken::new();
        token.cancel();
        let err = run_job(Uuid::new_v4(), &BatchJob::filelist(), &archive, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[test]
    fn test_failed_files_make_ended_not_ok() {
        let result = LocalBatchResult {
            files_processed: 3,
            files_failed: ["x".to_string(), "y".to_string()].into_iter().collect(),
            output: Vec::new(),
        };
        let ended = result.into_ended("ONE");
        assert_eq!(ended.error.as_deref(), Some("Batch job failed on 2 files."));
        assert_eq!(ended.files_failed, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_registry() {
        let registry = BatchRegistry::new();
        let id = Uuid::new_v4();
        let token = registry.register(id).await.unwrap();
        assert!(registry.register(id).await.is_err());

        assert!(registry.cancel(&id).await);
        assert!(token.is_cancelled());
        registry.finish(&id).await;
        assert!(!registry.cancel(&id).await);
        assert_eq!(registry.running().await, 0);
    }
}
