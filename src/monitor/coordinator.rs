//! Batch Coordinator
//!
//! Fans batch jobs out to the replicas that are live at dispatch time and
//! aggregates their replies. A registration completes when every expected
//! replica has replied or when its deadline passes, whichever comes first.
//! Whoever removes the registration from the map completes it, so the
//! aggregate is produced exactly once.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::batch::{output_lines, parse_checksum_line, BatchJob, BatchKind};
use crate::error::{Error, Result};
use crate::protocol::*;
use crate::state::ReplicaLivenessTable;
use crate::transport::Transport;

/// Which replicas a batch job goes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchTarget {
    AllReplicas,
    Replica(String),
}

impl From<Option<String>> for BatchTarget {
    fn from(replica_id: Option<String>) -> Self {
        match replica_id {
            Some(id) => BatchTarget::Replica(id),
            None => BatchTarget::AllReplicas,
        }
    }
}

/// Where the aggregate goes
pub enum BatchOrigin {
    /// A remote requester gets a `BatchReply`
    Remote(Header),
    /// A local task waits for the outcome
    Local(oneshot::Sender<BatchOutcome>),
}

/// Aggregated result of a batch job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub job_id: MessageId,
    pub files_processed: u64,
    pub files_failed: Vec<String>,
    pub result: Vec<u8>,
    pub ok: bool,
    pub error: Option<String>,
    /// Replicas that replied, in arrival order
    pub replied: Vec<String>,
    /// Expected replicas that never replied
    pub missing: Vec<String>,
}

impl BatchOutcome {
    fn failed(job_id: MessageId, error: String) -> Self {
        Self {
            job_id,
            files_processed: 0,
            files_failed: Vec::new(),
            result: Vec::new(),
            ok: false,
            error: Some(error),
            replied: Vec::new(),
            missing: Vec::new(),
        }
    }

    pub fn into_reply(self) -> BatchReply {
        BatchReply {
            files_processed: self.files_processed,
            files_failed: self.files_failed,
            result: self.result,
            ok: self.ok,
            error: self.error,
        }
    }
}

/// In-flight batch job summary (for the admin API)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingBatch {
    pub job_id: MessageId,
    pub kind: String,
    pub expected: Vec<String>,
    pub replied: Vec<String>,
    pub remaining_ms: u64,
}

struct Registration {
    job: BatchJob,
    origin: BatchOrigin,
    expected: BTreeSet<String>,
    replies: Vec<BatchEnded>,
    deadline: Instant,
    timer: Option<JoinHandle<()>>,
}

impl Registration {
    fn has_reply_from(&self, replica_id: &str) -> bool {
        self.replies.iter().any(|r| r.replica_id == replica_id)
    }

    fn is_complete(&self) -> bool {
        self.expected.iter().all(|id| self.has_reply_from(id))
    }
}

pub struct BatchCoordinator {
    sender: String,
    transport: Arc<dyn Transport>,
    liveness: Arc<ReplicaLivenessTable>,
    default_timeout: Duration,
    registrations: Mutex<HashMap<MessageId, Registration>>,
}

impl BatchCoordinator {
    pub fn new(
        sender: impl Into<String>,
        transport: Arc<dyn Transport>,
        liveness: Arc<ReplicaLivenessTable>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            sender: sender.into(),
            transport,
            liveness,
            default_timeout,
            registrations: Mutex::new(HashMap::new()),
        }
    }

    pub fn liveness(&self) -> &Arc<ReplicaLivenessTable> {
        &self.liveness
    }

    /// Send a job to the live replicas and register it.
    ///
    /// The outcome is delivered to `origin` once all of them replied or the
    /// deadline passed. Returns the id the replicas reply to.
    pub async fn submit_batch(self: &Arc<Self>, job: BatchJob, target: BatchTarget, origin: BatchOrigin) -> MessageId {
        let running = self.liveness.running_replicas().await;
        let (destination, replica_id, expected): (Destination, Option<String>, BTreeSet<String>) = match target {
            BatchTarget::AllReplicas => (Destination::AllReplicas, None, running.into_iter().collect()),
            BatchTarget::Replica(id) => {
                let expected = running.into_iter().filter(|r| *r == id).collect();
                (Destination::Replica(id.clone()), Some(id), expected)
            }
        };

        let envelope = Envelope::new(
            self.sender.clone(),
            Message::Batch(BatchRequest {
                job: job.clone(),
                replica_id,
            }),
        )
        .reply_to(Destination::Monitor);
        let job_id = envelope.id();

        if expected.is_empty() {
            let error = format!("No live replicas to run {} {} on {}", job.kind, job_id, destination);
            tracing::warn!("{}", error);
            self.deliver(origin, BatchOutcome::failed(job_id, error)).await;
            return job_id;
        }

        let timeout = job
            .timeout_hint()
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;

        tracing::info!(
            "Sending {} {} to {} ({} replicas expected, timeout {:?})",
            job.kind,
            job_id,
            destination,
            expected.len(),
            timeout
        );

        self.registrations.lock().await.insert(
            job_id,
            Registration {
                job,
                origin,
                expected,
                replies: Vec::new(),
                deadline,
                timer: None,
            },
        );

        if let Err(e) = self.transport.send(&destination, envelope).await {
            let error = format!("Could not send batch job {}: {}", job_id, e);
            tracing::error!("{}", error);
            let registration = self.registrations.lock().await.remove(&job_id);
            if let Some(registration) = registration {
                self.deliver(registration.origin, BatchOutcome::failed(job_id, error)).await;
            }
            return job_id;
        }

        let coordinator = Arc::clone(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            coordinator.expire(job_id).await;
        });

        let mut registrations = self.registrations.lock().await;
        match registrations.get_mut(&job_id) {
            Some(registration) => registration.timer = Some(timer),
            // Every reply already arrived
            None => timer.abort(),
        }

        job_id
    }

    /// Run a job and wait for its outcome
    pub async fn run_batch(self: &Arc<Self>, job: BatchJob, target: BatchTarget) -> Result<BatchOutcome> {
        let (tx, rx) = oneshot::channel();
        let job_id = self.submit_batch(job, target, BatchOrigin::Local(tx)).await;
        rx.await
            .map_err(|_| Error::Internal(format!("batch job {} was dropped before completion", job_id)))
    }

    /// Record a replica's ended-message
    pub async fn on_reply(&self, header: &Header, ended: BatchEnded) -> Result<()> {
        let job_id = header
            .in_reply_to
            .ok_or_else(|| Error::Validation(format!("batch reply {} has no correlation id", header.id)))?;

        let completed = {
            let mut registrations = self.registrations.lock().await;
            let Some(registration) = registrations.get_mut(&job_id) else {
                tracing::debug!(
                    "Discarding reply from {} for unknown batch job {}",
                    ended.replica_id,
                    job_id
                );
                return Ok(());
            };

            if registration.has_reply_from(&ended.replica_id) {
                tracing::warn!("Duplicate reply from {} for batch job {}, ignoring", ended.replica_id, job_id);
                return Ok(());
            }
            if !registration.expected.contains(&ended.replica_id) {
                tracing::warn!(
                    "Reply for batch job {} from {} which was not live when the job was sent",
                    job_id,
                    ended.replica_id
                );
            }

            tracing::debug!(
                "Batch job {}: reply from {} ({} files, ok: {})",
                job_id,
                ended.replica_id,
                ended.files_processed,
                ended.is_ok()
            );
            registration.replies.push(ended);

            if registration.is_complete() {
                registrations.remove(&job_id)
            } else {
                None
            }
        };

        if let Some(mut registration) = completed {
            if let Some(timer) = registration.timer.take() {
                timer.abort();
            }
            self.complete(job_id, registration, false).await;
        }
        Ok(())
    }

    async fn expire(&self, job_id: MessageId) {
        let registration = self.registrations.lock().await.remove(&job_id);
        if let Some(registration) = registration {
            self.complete(job_id, registration, true).await;
        }
    }

    async fn complete(&self, job_id: MessageId, registration: Registration, timed_out: bool) {
        let Registration {
            job,
            origin,
            expected,
            replies,
            ..
        } = registration;

        let outcome = aggregate(job_id, &job, &expected, replies, timed_out);
        if outcome.ok {
            tracing::info!(
                "{} {} completed: {} files processed",
                job.kind,
                job_id,
                outcome.files_processed
            );
        } else {
            tracing::warn!(
                "{} {} completed with errors: {}",
                job.kind,
                job_id,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }
        self.deliver(origin, outcome).await;
    }

    async fn deliver(&self, origin: BatchOrigin, outcome: BatchOutcome) {
        match origin {
            BatchOrigin::Remote(request) => {
                let job_id = outcome.job_id;
                let reply = Message::BatchReply(outcome.into_reply());
                if let Err(e) = self.transport.reply(&self.sender, &request, reply).await {
                    tracing::error!("Could not reply to {} for batch job {}: {}", request.sender, job_id, e);
                }
            }
            BatchOrigin::Local(tx) => {
                if tx.send(outcome).is_err() {
                    tracing::debug!("Batch outcome receiver went away");
                }
            }
        }
    }

    /// Ask every replica to stop a running job
    pub async fn terminate(&self, job_id: MessageId) -> Result<()> {
        tracing::info!("Requesting termination of batch job {}", job_id);
        let envelope = Envelope::new(self.sender.clone(), Message::BatchTermination(BatchTermination { job_id }));
        self.transport.send(&Destination::AllReplicas, envelope).await
    }

    /// Number of registered jobs
    pub async fn in_flight(&self) -> usize {
        self.registrations.lock().await.len()
    }

    pub async fn pending(&self) -> Vec<PendingBatch> {
        let registrations = self.registrations.lock().await;
        let now = Instant::now();
        let mut pending: Vec<PendingBatch> = registrations
            .iter()
            .map(|(job_id, registration)| PendingBatch {
                job_id: *job_id,
                kind: registration.job.kind.to_string(),
                expected: registration.expected.iter().cloned().collect(),
                replied: registration.replies.iter().map(|r| r.replica_id.clone()).collect(),
                remaining_ms: registration.deadline.saturating_duration_since(now).as_millis() as u64,
            })
            .collect();
        pending.sort_by_key(|p| p.remaining_ms);
        pending
    }
}

/// Check that a replica's output can be used for this job
fn validate_output(job: &BatchJob, output: &[u8]) -> Result<()> {
    let lines = output_lines(output)?;
    if job.kind == BatchKind::Checksum {
        for line in &lines {
            parse_checksum_line(line)?;
        }
    }
    Ok(())
}

/// Combine the replies of one job.
///
/// Counts and failed files do not depend on the reply order. Payloads are
/// concatenated in arrival order and then post-processed.
fn aggregate(
    job_id: MessageId,
    job: &BatchJob,
    expected: &BTreeSet<String>,
    replies: Vec<BatchEnded>,
    timed_out: bool,
) -> BatchOutcome {
    let mut files_processed = 0u64;
    let mut files_failed = BTreeSet::new();
    let mut raw = Vec::new();
    let mut errors = Vec::new();
    let mut replied = Vec::with_capacity(replies.len());

    for reply in replies {
        files_processed += reply.files_processed;
        files_failed.extend(reply.files_failed.iter().cloned());

        if let Err(e) = validate_output(job, &reply.result) {
            tracing::warn!("Unusable result from {} for batch job {}: {}", reply.replica_id, job_id, e);
            errors.push(format!("{}: unusable result: {}", reply.replica_id, e));
        } else {
            raw.extend_from_slice(&reply.result);
            if let Some(error) = &reply.error {
                errors.push(format!("{}: {}", reply.replica_id, error));
            }
        }
        replied.push(reply.replica_id);
    }

    let missing: Vec<String> = expected
        .iter()
        .filter(|id| !replied.iter().any(|r| r == *id))
        .cloned()
        .collect();
    if timed_out && !missing.is_empty() {
        errors.push(format!(
            "A timeout has occurred for batch job: {}. Missing replies from [{}]",
            job_id,
            missing.join(", ")
        ));
    }

    let result = match job.post_process(&raw) {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!("Post-processing of batch job {} failed, using raw output: {}", job_id, e);
            raw
        }
    };

    BatchOutcome {
        job_id,
        files_processed,
        files_failed: files_failed.into_iter().collect(),
        result,
        ok: errors.is_empty(),
        error: if errors.is_empty() { None } else { Some(errors.join("\n")) },
        replied,
        missing,
    }
}
