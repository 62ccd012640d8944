//! Repair workflow
//!
//! Replaces a corrupt copy on one replica in two steps. The bad copy is
//! removed (and returned) with a remove-and-get request, then the correct
//! content is uploaded to the same replica. A file missing from a replica
//! only needs the second step. Each step is tracked under the id of its
//! in-flight message and has a deadline; the requester gets exactly one
//! reply.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};

use super::engine::ReconciliationEngine;
use crate::checksum::sha256_hex;
use crate::error::{Error, Result};
use crate::protocol::*;
use crate::transport::Transport;

/// Step a correction is waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionPhase {
    AwaitingRemoval,
    AwaitingUpload,
}

impl std::fmt::Display for CorrectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CorrectionPhase::AwaitingRemoval => write!(f, "removal"),
            CorrectionPhase::AwaitingUpload => write!(f, "upload"),
        }
    }
}

/// Who gets the final `CorrectionReply`
pub enum CorrectionOrigin {
    /// A remote requester of a `Correct` message
    Remote(Header),
    /// A local task waiting for the outcome
    Local(oneshot::Sender<CorrectionReply>),
}

/// A correction in progress
pub struct CorrectionWorkflow {
    pub origin: CorrectionOrigin,
    pub filename: String,
    pub replica_id: String,
    /// Content uploaded in the last step
    pub content: Vec<u8>,
    pub phase: CorrectionPhase,
    /// The copy taken out of the replica
    pub removed_file: Option<Vec<u8>>,
    pub started: Instant,
}

/// Correction summary (for the admin API)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingCorrection {
    pub filename: String,
    pub replica_id: String,
    pub phase: String,
    pub age_ms: u64,
}

pub struct RepairCoordinator {
    sender: String,
    transport: Arc<dyn Transport>,
    engine: Arc<ReconciliationEngine>,
    step_timeout: Duration,
    workflows: Mutex<HashMap<MessageId, CorrectionWorkflow>>,
}

impl RepairCoordinator {
    pub fn new(
        sender: impl Into<String>,
        transport: Arc<dyn Transport>,
        engine: Arc<ReconciliationEngine>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            sender: sender.into(),
            transport,
            engine,
            step_timeout,
            workflows: Mutex::new(HashMap::new()),
        }
    }

    /// Corrections waiting for a replica
    pub async fn pending(&self) -> usize {
        self.workflows.lock().await.len()
    }

    /// Every correction waiting for a replica, oldest first
    pub async fn pending_corrections(&self) -> Vec<PendingCorrection> {
        let workflows = self.workflows.lock().await;
        let mut pending: Vec<PendingCorrection> = workflows
            .values()
            .map(|w| PendingCorrection {
                filename: w.filename.clone(),
                replica_id: w.replica_id.clone(),
                phase: w.phase.to_string(),
                age_ms: w.started.elapsed().as_millis() as u64,
            })
            .collect();
        pending.sort_by(|a, b| b.age_ms.cmp(&a.age_ms));
        pending
    }

    /// Start a correction by asking the replica to give up its bad copy
    pub async fn start(self: &Arc<Self>, origin: CorrectionOrigin, correction: CorrectionRequest) -> Result<()> {
        if correction.filename.is_empty() {
            return Err(Error::Validation("correction needs a filename".into()));
        }
        if correction.credentials.is_empty() {
            return Err(Error::Validation("correction needs credentials".into()));
        }
        if correction.incorrect_checksum.is_empty() {
            return Err(Error::Validation("correction needs the checksum of the bad copy".into()));
        }
        self.require_replica(&correction.replica_id)?;

        tracing::info!(
            "Correcting '{}' on replica {}: removing the copy with checksum {}",
            correction.filename,
            correction.replica_id,
            correction.incorrect_checksum
        );

        let CorrectionRequest {
            filename,
            replica_id,
            incorrect_checksum,
            correct_content,
            credentials,
        } = correction;

        let removal = Envelope::new(
            self.sender.clone(),
            Message::RemoveAndGet(RemoveAndGetRequest {
                filename: filename.clone(),
                replica_id: replica_id.clone(),
                expected_checksum: incorrect_checksum,
                credentials,
            }),
        )
        .reply_to(Destination::Monitor);

        self.track_and_send(
            removal,
            CorrectionWorkflow {
                origin,
                filename,
                replica_id,
                content: correct_content,
                phase: CorrectionPhase::AwaitingRemoval,
                removed_file: None,
                started: Instant::now(),
            },
        )
        .await
    }

    /// Run a correction on behalf of a local caller
    pub async fn correct(self: &Arc<Self>, correction: CorrectionRequest) -> Result<CorrectionReply> {
        let (tx, rx) = oneshot::channel();
        self.start(CorrectionOrigin::Local(tx), correction).await?;
        rx.await
            .map_err(|_| Error::Internal("correction finished without an answer".into()))
    }

    /// Upload a file a replica is missing; only the last step of a correction
    pub async fn upload_missing(
        self: &Arc<Self>,
        filename: &str,
        replica_id: &str,
        content: Vec<u8>,
    ) -> Result<CorrectionReply> {
        if filename.is_empty() {
            return Err(Error::Validation("upload needs a filename".into()));
        }
        self.require_replica(replica_id)?;

        tracing::info!("Uploading the missing '{}' to replica {}", filename, replica_id);

        let (tx, rx) = oneshot::channel();
        let upload = Envelope::new(
            self.sender.clone(),
            Message::Upload(UploadRequest {
                filename: filename.to_string(),
                content: content.clone(),
            }),
        )
        .reply_to(Destination::Monitor);

        self.track_and_send(
            upload,
            CorrectionWorkflow {
                origin: CorrectionOrigin::Local(tx),
                filename: filename.to_string(),
                replica_id: replica_id.to_string(),
                content,
                phase: CorrectionPhase::AwaitingUpload,
                removed_file: None,
                started: Instant::now(),
            },
        )
        .await?;

        rx.await
            .map_err(|_| Error::Internal("upload finished without an answer".into()))
    }

    fn require_replica(&self, replica_id: &str) -> Result<()> {
        match self.engine.store().replica(replica_id) {
            Some(_) => Ok(()),
            None => Err(Error::UnknownReplica(replica_id.to_string())),
        }
    }

    /// Register the workflow under the message id, arm its deadline, then
    /// send the message to the workflow's replica
    async fn track_and_send(self: &Arc<Self>, envelope: Envelope, workflow: CorrectionWorkflow) -> Result<()> {
        let id = envelope.id();
        let phase = workflow.phase;
        let destination = Destination::Replica(workflow.replica_id.clone());
        self.workflows.lock().await.insert(id, workflow);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.step_timeout).await;
            this.expire(id).await;
        });

        if let Err(e) = self.transport.send(&destination, envelope).await {
            let Some(workflow) = self.workflows.lock().await.remove(&id) else {
                return Ok(());
            };
            let error = format!(
                "Could not send the {} request for '{}' to replica {}: {}",
                phase, workflow.filename, workflow.replica_id, e
            );
            tracing::error!("{}", error);
            return self.answer(workflow, false, Some(error)).await;
        }
        Ok(())
    }

    /// Give up on a step whose reply never came
    async fn expire(&self, id: MessageId) {
        let Some(workflow) = self.workflows.lock().await.remove(&id) else {
            return;
        };
        let error = format!(
            "Correction of '{}' on replica {} timed out after {} ms waiting for the {} reply",
            workflow.filename,
            workflow.replica_id,
            self.step_timeout.as_millis(),
            workflow.phase
        );
        tracing::warn!("{}", error);
        if let Err(e) = self.answer(workflow, false, Some(error)).await {
            tracing::error!("Could not report the timed out correction: {}", e);
        }
    }

    /// Take the workflow a reply belongs to, if it is in the expected phase
    async fn take(&self, header: &Header, phase: CorrectionPhase) -> Option<CorrectionWorkflow> {
        let id = header.in_reply_to?;
        let mut workflows = self.workflows.lock().await;
        match workflows.get(&id) {
            Some(workflow) if workflow.phase == phase => workflows.remove(&id),
            Some(workflow) => {
                tracing::warn!(
                    "Reply {} for correction of '{}' arrived in phase {:?}, ignoring",
                    header.id,
                    workflow.filename,
                    workflow.phase
                );
                None
            }
            None => None,
        }
    }

    /// Second step: the replica answered the removal
    pub async fn on_removal_reply(self: &Arc<Self>, header: &Header, reply: RemoveAndGetReply) -> Result<()> {
        let Some(mut workflow) = self.take(header, CorrectionPhase::AwaitingRemoval).await else {
            tracing::debug!("Removal reply {} does not belong to a correction", header.id);
            return Ok(());
        };

        if !reply.ok {
            let error = format!(
                "Removal of '{}' from replica {} failed with the error: '{}'",
                workflow.filename,
                workflow.replica_id,
                reply.error.unwrap_or_default()
            );
            tracing::warn!("{}", error);
            return self.answer(workflow, false, Some(error)).await;
        }
        workflow.removed_file = reply.content;

        if let Err(e) = self
            .engine
            .update_checksum_for_file(&workflow.filename, None, &workflow.replica_id)
            .await
        {
            let error = format!(
                "Could not record the removal of '{}' from replica {}: {}",
                workflow.filename, workflow.replica_id, e
            );
            tracing::error!("{}", error);
            return self.answer(workflow, false, Some(error)).await;
        }

        tracing::info!(
            "Bad copy of '{}' removed from replica {}, uploading the correct one",
            workflow.filename,
            workflow.replica_id
        );

        workflow.phase = CorrectionPhase::AwaitingUpload;
        let upload = Envelope::new(
            self.sender.clone(),
            Message::Upload(UploadRequest {
                filename: workflow.filename.clone(),
                content: workflow.content.clone(),
            }),
        )
        .reply_to(Destination::Monitor);

        self.track_and_send(upload, workflow).await
    }

    /// Last step: the replica answered the upload.
    ///
    /// Returns false when the reply is not part of a correction.
    pub async fn on_upload_reply(&self, header: &Header, reply: UploadReply) -> Result<bool> {
        let Some(workflow) = self.take(header, CorrectionPhase::AwaitingUpload).await else {
            return Ok(false);
        };

        if !reply.ok {
            let error = format!(
                "Upload of the correct '{}' to replica {} failed: {}",
                workflow.filename,
                workflow.replica_id,
                reply.error.unwrap_or_default()
            );
            tracing::error!("{}", error);
            self.answer(workflow, false, Some(error)).await?;
            return Ok(true);
        }

        if let Err(e) = self.record_upload(&workflow).await {
            let error = format!(
                "'{}' was uploaded to replica {} but could not be recorded: {}",
                workflow.filename, workflow.replica_id, e
            );
            tracing::error!("{}", error);
            self.answer(workflow, false, Some(error)).await?;
            return Ok(true);
        }

        tracing::info!("Corrected '{}' on replica {}", workflow.filename, workflow.replica_id);
        self.answer(workflow, true, None).await?;
        Ok(true)
    }

    async fn record_upload(&self, workflow: &CorrectionWorkflow) -> Result<()> {
        let checksum = sha256_hex(&workflow.content);
        self.engine
            .update_checksum_for_file(&workflow.filename, Some(&checksum), &workflow.replica_id)
            .await?;
        self.engine.vote_file(&workflow.filename).await?;
        Ok(())
    }

    async fn answer(&self, workflow: CorrectionWorkflow, ok: bool, error: Option<String>) -> Result<()> {
        let reply = CorrectionReply {
            ok,
            removed_file: workflow.removed_file,
            error,
        };
        match workflow.origin {
            CorrectionOrigin::Remote(request) => {
                self.transport
                    .reply(&self.sender, &request, Message::CorrectReply(reply))
                    .await
            }
            CorrectionOrigin::Local(tx) => {
                if tx.send(reply).is_err() {
                    tracing::debug!("Correction outcome receiver went away");
                }
                Ok(())
            }
        }
    }
}
