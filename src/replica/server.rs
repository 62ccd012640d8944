//! Replica Server
//!
//! Serves one replica's archive: gets, uploads, remove-and-get requests and
//! batch jobs. Listens on the replica topic, its own destination and, while
//! there is enough free space, the upload queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use async_trait::async_trait;

use super::archive::Archive;
use super::batch::{run_job, BatchRegistry};
use crate::checksum::file_checksum;
use crate::error::{Error, Result};
use crate::notify::{NotificationLevel, Notifier};
use crate::protocol::*;
use crate::router::MessageHandler;
use crate::transport::{inbox, Inbox, Transport};

/// Per-filename mutual exclusion
#[derive(Default)]
struct FileLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileLocks {
    fn get(&self, filename: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(filename.to_string()).or_default())
    }

    /// Drop the entry once nobody else holds or waits for it
    fn release(&self, filename: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        // One reference in the map, one in `lock`
        if Arc::strong_count(&lock) == 2 {
            locks.remove(filename);
        }
    }
}

/// Server for one replica
pub struct ReplicaServer {
    replica_id: String,
    archive: Arc<Archive>,
    credentials: String,
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn Notifier>,
    file_locks: FileLocks,
    batches: Arc<BatchRegistry>,
    accepting_uploads: AtomicBool,
}

impl ReplicaServer {
    pub fn new(
        replica_id: String,
        archive: Arc<Archive>,
        credentials: String,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            replica_id,
            archive,
            credentials,
            transport,
            notifier,
            file_locks: FileLocks::default(),
            batches: Arc::new(BatchRegistry::new()),
            accepting_uploads: AtomicBool::new(false),
        }
    }

    fn inbox_name(&self) -> String {
        format!("replica-{}", self.replica_id)
    }

    /// Subscribe to the replica destinations and return the inbox.
    ///
    /// The upload queue is only joined when the archive has enough space.
    pub async fn start(&self) -> Result<Inbox> {
        let (subscriber, inbox) = inbox(self.inbox_name());

        self.transport
            .subscribe(Destination::AllReplicas, subscriber.clone())
            .await?;
        self.transport
            .subscribe(Destination::Replica(self.replica_id.clone()), subscriber.clone())
            .await?;

        if self.archive.has_enough_space() {
            self.transport.subscribe(Destination::AnyReplica, subscriber).await?;
            self.accepting_uploads.store(true, Ordering::SeqCst);
        } else {
            let text = format!(
                "Replica {}: Not enough space to guarantee store -- not listening for uploads",
                self.replica_id
            );
            tracing::warn!("{}", text);
            self.notifier.notify(NotificationLevel::Warning, &text);
        }

        tracing::info!(
            "Replica server {} started (accepting uploads: {})",
            self.replica_id,
            self.is_accepting_uploads()
        );
        Ok(inbox)
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub fn is_accepting_uploads(&self) -> bool {
        self.accepting_uploads.load(Ordering::SeqCst)
    }

    /// Number of batch jobs currently running here
    pub async fn running_batches(&self) -> usize {
        self.batches.running().await
    }

    /// Leave the upload queue for good (until restart)
    async fn stop_accepting_uploads(&self) {
        if !self.accepting_uploads.swap(false, Ordering::SeqCst) {
            return;
        }
        let text = format!(
            "Replica {}: Not enough space to guarantee store -- no longer listening for uploads",
            self.replica_id
        );
        tracing::warn!("{}", text);
        self.notifier.notify(NotificationLevel::Warning, &text);
        if let Err(e) = self
            .transport
            .unsubscribe(&Destination::AnyReplica, &self.inbox_name())
            .await
        {
            tracing::warn!("Failed to leave the upload queue: {}", e);
        }
    }

    async fn reply(&self, header: &Header, body: Message) -> Result<()> {
        self.transport.reply(&self.replica_id, header, body).await
    }


    /// Refuse a removal; the router answers the requester with the error
    fn refuse_removal(&self, text: String) -> Result<()> {
        self.notifier.notify(NotificationLevel::Security, &text);
        Err(Error::SecurityViolation(text))
    }
}

#[async_trait]
impl MessageHandler for ReplicaServer {
    fn name(&self) -> &'static str {
        "ReplicaServer"
    }

    fn replica_id(&self) -> &str {
        &self.replica_id
    }

    async fn on_get(&self, header: &Header, msg: GetRequest) -> Result<()> {
        let Some(path) = self.archive.lookup(&msg.filename) else {
            tracing::debug!("Get for {}: not stored on {}", msg.filename, self.replica_id);
            return Ok(());
        };

        let content = tokio::fs::read(&path).await?;
        let offset = usize::try_from(msg.offset)
            .ok()
            .filter(|offset| *offset <= content.len())
            .ok_or_else(|| {
                Error::Validation(format!(
                    "offset {} is beyond the end of {} ({} bytes)",
                    msg.offset,
                    msg.filename,
                    content.len()
                ))
            })?;

        self.reply(
            header,
            Message::GetReply(GetReply {
                ok: true,
                replica_id: self.replica_id.clone(),
                record: Some(content[offset..].to_vec()),
                error: None,
            }),
        )
        .await
    }

    async fn on_upload(&self, header: &Header, msg: UploadRequest) -> Result<()> {
        let lock = self.file_locks.get(&msg.filename);
        let stored = {
            let _guard = lock.lock().await;
            self.archive.store(&msg.filename, &msg.content).await
        };
        self.file_locks.release(&msg.filename, lock);

        if !self.archive.has_enough_space() {
            self.stop_accepting_uploads().await;
        }

        let path = stored?;
        tracing::info!("Replica {} stored {} at {}", self.replica_id, msg.filename, path.display());
        self.reply(
            header,
            Message::UploadReply(UploadReply {
                ok: true,
                replica_id: self.replica_id.clone(),
                error: None,
            }),
        )
        .await
    }

    async fn on_remove_and_get(&self, header: &Header, msg: RemoveAndGetRequest) -> Result<()> {
        if msg.replica_id != self.replica_id {
            tracing::debug!("RemoveAndGet for replica {} ignored by {}", msg.replica_id, self.replica_id);
            return Ok(());
        }

        let request = format!(
            "Replica {} received a request from {} to remove file '{}'",
            self.replica_id, header.sender, msg.filename
        );
        tracing::warn!("{}", request);
        self.notifier.notify(NotificationLevel::Security, &request);

        if msg.credentials.is_empty() {
            return Err(Error::Validation("credentials are required to remove a file".into()));
        }
        if msg.expected_checksum.is_empty() {
            return Err(Error::Validation("a checksum is required to remove a file".into()));
        }

        let lock = self.file_locks.get(&msg.filename);
        let outcome = {
            let _guard = lock.lock().await;
            self.remove_locked(header, &msg).await
        };
        self.file_locks.release(&msg.filename, lock);
        outcome
    }

    async fn on_batch(&self, header: &Header, msg: BatchRequest) -> Result<()> {
        if let Some(target) = &msg.replica_id {
            if target != &self.replica_id {
                return Ok(());
            }
        }

        let job_id = header.id;
        let token = match self.batches.register(job_id).await {
            Ok(token) => token,
            Err(e) => {
                // The running instance sends the one ended-message
                tracing::warn!("Replica {} ignoring batch {}: {}", self.replica_id, job_id, e);
                return Ok(());
            }
        };
        tracing::info!("Replica {} starting {} {}", self.replica_id, msg.job.kind, job_id);

        let replica_id = self.replica_id.clone();
        let archive = Arc::clone(&self.archive);
        let transport = Arc::clone(&self.transport);
        let batches = Arc::clone(&self.batches);
        let header = header.clone();
        let job = msg.job;

        tokio::spawn(async move {
            let work = {
                let archive = Arc::clone(&archive);
                tokio::spawn(async move { run_job(job_id, &job, &archive, &token).await })
            };

            let ended = match work.await {
                Ok(Ok(result)) => result.into_ended(&replica_id),
                Ok(Err(e)) => failed_batch(&replica_id, format!("Batch job {} failed: {}", job_id, e)),
                Err(e) => failed_batch(&replica_id, format!("Batch job {} aborted: {}", job_id, e)),
            };
            batches.finish(&job_id).await;

            tracing::info!(
                "Replica {} finished batch {}: {} files processed, {} failed",
                replica_id,
                job_id,
                ended.files_processed,
                ended.files_failed.len()
            );

            let destination = header.reply_to.clone().unwrap_or(Destination::Monitor);
            let envelope = Envelope::reply(replica_id.clone(), &header, Message::BatchEnded(ended));
            if let Err(e) = transport.send(&destination, envelope).await {
                tracing::error!("Could not deliver end of batch {} from {}: {}", job_id, replica_id, e);
            }
        });

        Ok(())
    }

    async fn on_batch_termination(&self, _header: &Header, msg: BatchTermination) -> Result<()> {
        if self.batches.cancel(&msg.job_id).await {
            tracing::info!("Replica {} terminating batch job {}", self.replica_id, msg.job_id);
        } else {
            tracing::debug!("Batch job {} is not running on {}", msg.job_id, self.replica_id);
        }
        Ok(())
    }
}

impl ReplicaServer {
    async fn remove_locked(&self, header: &Header, msg: &RemoveAndGetRequest) -> Result<()> {
        let Some(path) = self.archive.lookup(&msg.filename) else {
            tracing::warn!(
                "Replica {}: file '{}' to remove is not stored here, ignoring",
                self.replica_id,
                msg.filename
            );
            return Ok(());
        };

        let checksum = file_checksum(&path).await?;
        if checksum != msg.expected_checksum {
            let text = format!(
                "Refused to remove '{}' from replica {}: checksum mismatch (stored {}, expected {})",
                msg.filename, self.replica_id, checksum, msg.expected_checksum
            );
            return self.refuse_removal(text);
        }

        if msg.credentials != self.credentials {
            let text = format!(
                "Refused to remove '{}' from replica {}: wrong credentials",
                msg.filename, self.replica_id
            );
            return self.refuse_removal(text);
        }

        let attic = self.archive.move_to_attic(&msg.filename).await?;
        let content = tokio::fs::read(&attic).await?;
        tracing::warn!(
            "Replica {} moved '{}' to the attic on request of {}",
            self.replica_id,
            msg.filename,
            header.sender
        );
        self.reply(
            header,
            Message::RemoveAndGetReply(RemoveAndGetReply {
                ok: true,
                replica_id: self.replica_id.clone(),
                content: Some(content),
                error: None,
            }),
        )
        .await
    }
}

fn failed_batch(replica_id: &str, error: String) -> BatchEnded {
    tracing::error!("{}", error);
    BatchEnded {
        replica_id: replica_id.to_string(),
        files_processed: 0,
        files_failed: Vec::new(),
        result: Vec::new(),
        error: Some(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchJob;
    use crate::checksum::sha256_hex;
    use crate::notify::RecordingNotifier;
    use crate::replica::archive::{FixedSpaceProbe, SpaceProbe};
    use crate::router::MessageRouter;
    use crate::transport::LocalTransport;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    const CREDENTIALS: &str = "secret";

    struct Fixture {
        _dir: TempDir,
        hub: Arc<LocalTransport>,
        server: Arc<ReplicaServer>,
        notifier: Arc<RecordingNotifier>,
        replies: Inbox,
        _shutdown: tokio::sync::watch::Sender<bool>,
    }

    /// Plenty of space until the first file lands in the root
    struct FillingDisk;

    impl SpaceProbe for FillingDisk {
        fn free_bytes(&self, path: &std::path::Path) -> Option<u64> {
            let stored = std::fs::read_dir(path.join("filedir")).ok()?.next().is_some();
            Some(if stored { 10 } else { u64::MAX })
        }
    }

    async fn fixture(free: u64) -> Fixture {
        fixture_with(Box::new(FixedSpaceProbe(free))).await
    }

    async fn fixture_with(probe: Box<dyn SpaceProbe>) -> Fixture {
        let dir = tempdir().unwrap();
        let archive = Arc::new(Archive::open(&[dir.path().join("root")], 1024, probe).unwrap());
        let hub = Arc::new(LocalTransport::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let server = Arc::new(ReplicaServer::new(
            "ONE".into(),
            archive,
            CREDENTIALS.into(),
            hub.clone(),
            notifier.clone(),
        ));
        let inbox = server.start().await.unwrap();
        let (shutdown, shutdown_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(MessageRouter::new(server.clone(), hub.clone()).run(inbox, shutdown_rx));

        let (client, replies) = crate::transport::inbox("client");
        hub.subscribe(Destination::Client("client".into()), client).await.unwrap();

        Fixture {
            _dir: dir,
            hub,
            server,
            notifier,
            replies,
            _shutdown: shutdown,
        }
    }

    fn request(body: Message) -> Envelope {
        Envelope::new("client", body).reply_to(Destination::Client("client".into()))
    }

    async fn next_reply(replies: &mut Inbox) -> Envelope {
        tokio::time::timeout(Duration::from_secs(2), replies.recv())
            .await
            .expect("no reply in time")
            .expect("reply channel closed")
    }

    async fn upload(fx: &mut Fixture, name: &str, content: &[u8]) -> UploadReply {
        fx.hub
            .send(
                &Destination::AnyReplica,
                request(Message::Upload(UploadRequest {
                    filename: name.into(),
                    content: content.to_vec(),
                })),
            )
            .await
            .unwrap();
        match next_reply(&mut fx.replies).await.body {
            Message::UploadReply(r) => r,
            other => panic!("Wrong reply type: {}", other.type_name()),
        }
    }

    fn remove(name: &str, checksum: &str, credentials: &str) -> Envelope {
        request(Message::RemoveAndGet(RemoveAndGetRequest {
            filename: name.into(),
            replica_id: "ONE".into(),
            expected_checksum: checksum.into(),
            credentials: credentials.into(),
        }))
    }

    #[tokio::test]
    async fn test_upload_then_get() {
        let mut fx = fixture(u64::MAX).await;
        assert!(upload(&mut fx, "a.warc", b"0123456789").await.ok);

        fx.hub
            .send(&Destination::AllReplicas, request(Message::Get(GetRequest {
                filename: "a.warc".into(),
                offset: 4,
            })))
            .await
            .unwrap();
        match next_reply(&mut fx.replies).await.body {
            Message::GetReply(r) => {
                assert!(r.ok);
                assert_eq!(r.record.unwrap(), b"456789");
            }
            other => panic!("Wrong reply type: {}", other.type_name()),
        }

        // A file that is not stored gets no reply at all
        fx.hub
            .send(&Destination::AllReplicas, request(Message::Get(GetRequest {
                filename: "missing.warc".into(),
                offset: 0,
            })))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.replies.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_uploads_have_one_winner() {
        let mut fx = fixture(u64::MAX).await;
        for content in [b"first".as_slice(), b"second".as_slice()] {
            fx.hub
                .send(
                    &Destination::AnyReplica,
                    request(Message::Upload(UploadRequest {
                        filename: "race.warc".into(),
                        content: content.to_vec(),
                    })),
                )
                .await
                .unwrap();
        }

        let mut oks = 0;
        let mut refused = 0;
        for _ in 0..2 {
            match next_reply(&mut fx.replies).await.body {
                Message::UploadReply(r) if r.ok => oks += 1,
                Message::UploadReply(r) => {
                    assert!(r.error.unwrap().contains("already exists"));
                    refused += 1;
                }
                other => panic!("Wrong reply type: {}", other.type_name()),
            }
        }
        assert_eq!((oks, refused), (1, 1));

        let stored = tokio::fs::read(fx.server.archive.lookup("race.warc").unwrap()).await.unwrap();
        assert!(stored == b"first" || stored == b"second");
    }

    #[tokio::test]
    async fn test_remove_and_get_gates() {
        let mut fx = fixture(u64::MAX).await;
        let content = b"archived content".to_vec();
        assert!(upload(&mut fx, "a.warc", &content).await.ok);
        let checksum = sha256_hex(&content);

        // Wrong filename: silent no-op
        fx.hub.send(&Destination::Replica("ONE".into()), remove("b.warc", &checksum, CREDENTIALS)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.replies.try_recv().is_err());

        // Wrong checksum
        fx.hub.send(&Destination::Replica("ONE".into()), remove("a.warc", "bad", CREDENTIALS)).await.unwrap();
        match next_reply(&mut fx.replies).await.body {
            Message::RemoveAndGetReply(r) => assert!(!r.ok),
            other => panic!("Wrong reply type: {}", other.type_name()),
        }
        assert!(fx.notifier.contains("checksum mismatch"));
        assert!(fx.server.archive.lookup("a.warc").is_some());

        // Wrong credentials
        fx.hub.send(&Destination::Replica("ONE".into()), remove("a.warc", &checksum, "guess")).await.unwrap();
        match next_reply(&mut fx.replies).await.body {
            Message::RemoveAndGetReply(r) => assert!(!r.ok),
            other => panic!("Wrong reply type: {}", other.type_name()),
        }
        assert!(fx.notifier.contains("wrong credentials"));
        assert!(fx.server.archive.lookup("a.warc").is_some());

        // All gates pass
        fx.hub.send(&Destination::Replica("ONE".into()), remove("a.warc", &checksum, CREDENTIALS)).await.unwrap();
        match next_reply(&mut fx.replies).await.body {
            Message::RemoveAndGetReply(r) => {
                assert!(r.ok);
                assert_eq!(r.content.unwrap().len(), content.len());
            }
            other => panic!("Wrong reply type: {}", other.type_name()),
        }
        assert!(fx.server.archive.lookup("a.warc").is_none());
        let attic = fx.server.archive.roots()[0].attic_dir.join("a.warc");
        assert_eq!(tokio::fs::metadata(attic).await.unwrap().len(), content.len() as u64);
    }

    #[tokio::test]
    async fn test_space_exhausted_never_listens_for_uploads() {
        let mut fx = fixture(10).await;
        assert!(!fx.server.is_accepting_uploads());
        assert!(fx.notifier.contains("not listening for uploads"));
        assert!(!fx.hub.is_subscribed(&Destination::AnyReplica, "replica-ONE").await);

        let result = fx
            .hub
            .send(
                &Destination::AnyReplica,
                request(Message::Upload(UploadRequest {
                    filename: "a.warc".into(),
                    content: b"x".to_vec(),
                })),
            )
            .await;
        assert!(result.is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.replies.try_recv().is_err());
        assert!(fx.server.archive.list_files().await.unwrap().is_empty());

        // Still serves batch jobs
        fx.hub
            .send(
                &Destination::AllReplicas,
                request(Message::Batch(BatchRequest {
                    job: BatchJob::filelist(),
                    replica_id: None,
                })),
            )
            .await
            .unwrap();
        match next_reply(&mut fx.replies).await.body {
            Message::BatchEnded(ended) => {
                assert!(ended.is_ok());
                assert_eq!(ended.files_processed, 0);
            }
            other => panic!("Wrong reply type: {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_leaves_upload_queue_when_space_runs_out() {
        let mut fx = fixture_with(Box::new(FillingDisk)).await;
        assert!(fx.server.is_accepting_uploads());
        assert!(fx.hub.is_subscribed(&Destination::AnyReplica, "replica-ONE").await);

        assert!(upload(&mut fx, "a.warc", b"first").await.ok);

        assert!(!fx.server.is_accepting_uploads());
        assert!(!fx.hub.is_subscribed(&Destination::AnyReplica, "replica-ONE").await);
        assert!(fx.notifier.contains("no longer listening for uploads"));
        assert_eq!(fx.notifier.count(NotificationLevel::Warning), 1);

        // Nobody takes the next upload from the queue
        let result = fx
            .hub
            .send(
                &Destination::AnyReplica,
                request(Message::Upload(UploadRequest {
                    filename: "b.warc".into(),
                    content: b"second".to_vec(),
                })),
            )
            .await;
        assert!(result.is_err());
        assert!(fx.server.archive.lookup("b.warc").is_none());

        // The replica keeps its own destination
        assert!(fx.hub.is_subscribed(&Destination::Replica("ONE".into()), "replica-ONE").await);
    }

    #[tokio::test]
    async fn test_batch_ended_carries_output() {
        let mut fx = fixture(u64::MAX).await;
        assert!(upload(&mut fx, "b.warc", b"b").await.ok);
        assert!(upload(&mut fx, "a.warc", b"a").await.ok);

        let batch = request(Message::Batch(BatchRequest {
            job: BatchJob::checksum(),
            replica_id: None,
        }));
        let batch_id = batch.id();
        fx.hub.send(&Destination::AllReplicas, batch).await.unwrap();

        let reply = next_reply(&mut fx.replies).await;
        assert_eq!(reply.header.in_reply_to, Some(batch_id));
        match reply.body {
            Message::BatchEnded(ended) => {
                assert_eq!(ended.replica_id, "ONE");
                assert_eq!(ended.files_processed, 2);
                let text = String::from_utf8(ended.result).unwrap();
                assert_eq!(text, format!("a.warc##{}\nb.warc##{}\n", sha256_hex(b"a"), sha256_hex(b"b")));
            }
            other => panic!("Wrong reply type: {}", other.type_name()),
        }
        assert_eq!(fx.server.running_batches().await, 0);
    }
}
