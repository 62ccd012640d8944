//! Monitor Server
//!
//! Message handler of the monitor node. Batch requests go to the
//! coordinator, heartbeats and batch-ended messages refresh liveness,
//! corrections run through the repair workflow and checksum queries are
//! answered with converted batch jobs. Operator repairs fetch a good copy
//! from another bitarchive replica before correcting or re-uploading.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};

use super::coordinator::{BatchCoordinator, BatchOrigin, BatchOutcome, BatchTarget};
use crate::batch::{output_lines, parse_checksum_line, BatchJob};
use crate::checksum::sha256_hex;
use crate::config::ArchiveConfig;
use crate::error::{Error, Result};
use crate::notify::{NotificationLevel, Notifier};
use crate::protocol::*;
use crate::reconcile::{CorrectionOrigin, ReconciliationEngine, RepairCoordinator};
use crate::router::MessageHandler;
use crate::state::{FileListStatus, ReplicaFileStatus, ReplicaLivenessTable, ReplicaStore, ReplicaType};
use crate::transport::{inbox, Inbox, Transport};

const SENDER: &str = "monitor";

pub struct MonitorServer {
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn Notifier>,
    liveness: Arc<ReplicaLivenessTable>,
    coordinator: Arc<BatchCoordinator>,
    engine: Arc<ReconciliationEngine>,
    repair: Arc<RepairCoordinator>,
    /// Good-copy fetches waiting for a `GetReply`
    fetches: Mutex<HashMap<MessageId, oneshot::Sender<GetReply>>>,
    single_checksum_timeout: Duration,
    fetch_timeout: Duration,
}

impl MonitorServer {
    pub fn new(
        config: &ArchiveConfig,
        store: Arc<ReplicaStore>,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let liveness = Arc::new(ReplicaLivenessTable::new(config.acceptable_heartbeat_delay()));
        let coordinator = Arc::new(BatchCoordinator::new(
            SENDER,
            Arc::clone(&transport),
            Arc::clone(&liveness),
            config.batch_timeout(),
        ));
        let engine = Arc::new(ReconciliationEngine::new(store, Arc::clone(&notifier)));
        let repair = Arc::new(RepairCoordinator::new(
            SENDER,
            Arc::clone(&transport),
            Arc::clone(&engine),
            config.correction_timeout(),
        ));

        Self {
            transport,
            notifier,
            liveness,
            coordinator,
            engine,
            repair,
            fetches: Mutex::new(HashMap::new()),
            single_checksum_timeout: config.single_checksum_timeout(),
            fetch_timeout: config.fetch_timeout(),
        }
    }

    /// Subscribe to the monitor destination and return the inbox
    pub async fn start(&self) -> Result<Inbox> {
        let (subscriber, inbox) = inbox(SENDER);
        self.transport.subscribe(Destination::Monitor, subscriber).await?;
        tracing::info!("Monitor server started");
        Ok(inbox)
    }

    pub fn coordinator(&self) -> &Arc<BatchCoordinator> {
        &self.coordinator
    }

    pub fn engine(&self) -> &Arc<ReconciliationEngine> {
        &self.engine
    }

    pub fn liveness(&self) -> &Arc<ReplicaLivenessTable> {
        &self.liveness
    }

    pub fn repair(&self) -> &Arc<RepairCoordinator> {
        &self.repair
    }

    fn require_replica(&self, replica_id: &str) -> Result<()> {
        match self.engine.store().replica(replica_id) {
            Some(_) => Ok(()),
            None => Err(Error::UnknownReplica(replica_id.to_string())),
        }
    }

    /// Replace a corrupt copy with one fetched from a replica holding a good copy
    pub async fn replace_corrupt_copy(
        &self,
        filename: &str,
        replica_id: &str,
        credentials: &str,
    ) -> Result<CorrectionReply> {
        let status = self.repair_target(filename, replica_id).await?;
        let Some(incorrect_checksum) = status.checksum.filter(|c| !c.is_empty()) else {
            return Err(Error::Validation(format!(
                "No checksum is recorded for '{}' on replica {}",
                filename, replica_id
            )));
        };

        let canonical = self.engine.require_checksum(filename).await?;
        if incorrect_checksum == canonical {
            return Err(Error::Validation(format!(
                "Replica {} already holds the correct copy of '{}'",
                replica_id, filename
            )));
        }

        let content = self.fetch_good_copy(filename, replica_id, &canonical).await?;
        self.repair
            .correct(CorrectionRequest {
                filename: filename.to_string(),
                replica_id: replica_id.to_string(),
                incorrect_checksum,
                correct_content: content,
                credentials: credentials.to_string(),
            })
            .await
    }

    /// Upload a file a replica is missing from a replica holding a good copy
    pub async fn upload_missing_file(&self, filename: &str, replica_id: &str) -> Result<CorrectionReply> {
        let status = self.repair_target(filename, replica_id).await?;
        if status.file_list_status != FileListStatus::Missing {
            return Err(Error::Validation(format!(
                "'{}' is not known to be missing from replica {}",
                filename, replica_id
            )));
        }

        let canonical = self.engine.require_checksum(filename).await?;
        let content = self.fetch_good_copy(filename, replica_id, &canonical).await?;
        self.repair.upload_missing(filename, replica_id, content).await
    }

    /// Status of the copy to repair; the replica must hold full copies
    async fn repair_target(&self, filename: &str, replica_id: &str) -> Result<ReplicaFileStatus> {
        self.require_replica(replica_id)?;
        if let Some(replica) = self.engine.store().replica(replica_id) {
            if replica.replica_type != ReplicaType::Bitarchive {
                return Err(Error::Validation(format!(
                    "Replica {} only holds checksums and cannot be repaired",
                    replica_id
                )));
            }
        }
        self.engine
            .store()
            .status(filename, replica_id)
            .await?
            .ok_or_else(|| Error::UnknownFile(filename.to_string()))
    }

    /// Fetch the file from another bitarchive replica and check it against
    /// the canonical checksum
    async fn fetch_good_copy(&self, filename: &str, excluding: &str, canonical: &str) -> Result<Vec<u8>> {
        let Some(source) = self.engine.bitarchive_with_good_file(filename, Some(excluding)).await? else {
            return Err(Error::FileNotFound(format!(
                "No bitarchive replica other than {} has a correct copy of '{}'",
                excluding, filename
            )));
        };

        let content = self.fetch(&source.id, filename).await?;
        let checksum = sha256_hex(&content);
        if checksum != canonical {
            return Err(Error::Validation(format!(
                "The copy of '{}' fetched from replica {} has checksum {} instead of {}",
                filename, source.id, checksum, canonical
            )));
        }
        tracing::info!("Fetched a good copy of '{}' from replica {}", filename, source.id);
        Ok(content)
    }

    /// Get a whole file from one replica
    async fn fetch(&self, replica_id: &str, filename: &str) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        let request = Envelope::new(
            SENDER,
            Message::Get(GetRequest {
                filename: filename.to_string(),
                offset: 0,
            }),
        )
        .reply_to(Destination::Monitor);
        let id = request.id();
        self.fetches.lock().await.insert(id, tx);

        if let Err(e) = self
            .transport
            .send(&Destination::Replica(replica_id.to_string()), request)
            .await
        {
            self.fetches.lock().await.remove(&id);
            return Err(e);
        }

        let reply = match tokio::time::timeout(self.fetch_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(Error::Internal(format!("fetch {} was dropped", id))),
            Err(_) => {
                self.fetches.lock().await.remove(&id);
                return Err(Error::FileNotFound(format!(
                    "Replica {} did not deliver '{}' within {} ms",
                    replica_id,
                    filename,
                    self.fetch_timeout.as_millis()
                )));
            }
        };

        match reply.record {
            Some(record) if reply.ok => Ok(record),
            _ => Err(Error::FileNotFound(format!(
                "Replica {} could not deliver '{}': {}",
                replica_id,
                filename,
                reply.error.unwrap_or_default()
            ))),
        }
    }

    async fn reply(&self, header: &Header, body: Message) -> Result<()> {
        self.transport.reply(SENDER, header, body).await
    }

    /// Run a full-list job on one replica; the lines only when it fully succeeded
    async fn list_job(&self, job: BatchJob, replica_id: &str) -> Result<(BatchOutcome, Option<Vec<String>>)> {
        self.require_replica(replica_id)?;
        let outcome = self
            .coordinator
            .run_batch(job, BatchTarget::Replica(replica_id.to_string()))
            .await?;
        if !outcome.ok {
            return Ok((outcome, None));
        }
        let lines = output_lines(&outcome.result)?;
        Ok((outcome, Some(lines)))
    }

    /// Look up the checksum of one file on one replica
    async fn single_checksum(&self, filename: &str, replica_id: &str) -> Result<String> {
        self.require_replica(replica_id)?;
        let job = BatchJob::checksum()
            .only_file(filename)
            .with_timeout_ms(self.single_checksum_timeout.as_millis() as u64);
        let outcome = self
            .coordinator
            .run_batch(job, BatchTarget::Replica(replica_id.to_string()))
            .await?;

        let lines = output_lines(&outcome.result)?;
        let Some(first) = lines.first() else {
            if outcome.ok {
                self.engine.update_checksum_for_file(filename, None, replica_id).await?;
            }
            let mut error = format!("Replica {} did not find the file '{}'", replica_id, filename);
            if let Some(cause) = outcome.error {
                error = format!("{}: {}", error, cause);
            }
            return Err(Error::FileNotFound(error));
        };

        let (name, checksum) = parse_checksum_line(first)?;
        if lines.len() > 1 {
            let distinct = lines
                .iter()
                .filter_map(|line| parse_checksum_line(line).ok())
                .any(|(_, other)| other != checksum);
            if distinct {
                self.notifier.notify(
                    NotificationLevel::Warning,
                    &format!(
                        "Replica {} has unidentical duplicates of '{}', using the first checksum {}",
                        replica_id, filename, checksum
                    ),
                );
            }
        }
        if name != filename {
            return Err(Error::Validation(format!(
                "Replica {} returned a checksum for '{}' instead of '{}'",
                replica_id, name, filename
            )));
        }

        self.engine
            .update_checksum_for_file(filename, Some(&checksum), replica_id)
            .await?;
        Ok(checksum)
    }
}

#[async_trait]
impl MessageHandler for MonitorServer {
    fn name(&self) -> &'static str {
        "MonitorServer"
    }

    async fn on_batch(&self, header: &Header, msg: BatchRequest) -> Result<()> {
        if header.reply_to.is_none() {
            return Err(Error::Validation(format!("batch request {} has no reply destination", header.id)));
        }
        if let Some(replica_id) = &msg.replica_id {
            self.require_replica(replica_id)?;
        }
        self.coordinator
            .submit_batch(msg.job, BatchTarget::from(msg.replica_id), BatchOrigin::Remote(header.clone()))
            .await;
        Ok(())
    }

    async fn on_batch_ended(&self, header: &Header, msg: BatchEnded) -> Result<()> {
        self.liveness.sign_of_life(&msg.replica_id).await;
        self.coordinator.on_reply(header, msg).await
    }

    async fn on_heartbeat(&self, _header: &Header, msg: Heartbeat) -> Result<()> {
        self.liveness.sign_of_life(&msg.replica_id).await;
        Ok(())
    }

    async fn on_batch_termination(&self, _header: &Header, msg: BatchTermination) -> Result<()> {
        self.coordinator.terminate(msg.job_id).await
    }

    async fn on_correct(&self, header: &Header, msg: CorrectionRequest) -> Result<()> {
        self.repair.start(CorrectionOrigin::Remote(header.clone()), msg).await
    }

    async fn on_get_reply(&self, header: &Header, msg: GetReply) -> Result<()> {
        let waiting = match header.in_reply_to {
            Some(id) => self.fetches.lock().await.remove(&id),
            None => None,
        };
        match waiting {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    tracing::debug!("Fetch for reply {} was abandoned", header.id);
                }
            }
            None => tracing::debug!("Get reply {} from {} was not expected", header.id, header.sender),
        }
        Ok(())
    }

    async fn on_remove_and_get_reply(&self, header: &Header, msg: RemoveAndGetReply) -> Result<()> {
        self.repair.on_removal_reply(header, msg).await
    }

    async fn on_upload_reply(&self, header: &Header, msg: UploadReply) -> Result<()> {
        if !self.repair.on_upload_reply(header, msg).await? {
            tracing::debug!("Upload reply {} is not part of a correction", header.id);
        }
        Ok(())
    }

    async fn on_get_all_checksums(&self, header: &Header, msg: GetAllChecksumsRequest) -> Result<()> {
        let (outcome, lines) = self.list_job(BatchJob::checksum(), &msg.replica_id).await?;
        if let Some(lines) = lines {
            self.engine.add_checksum_information(&lines, &msg.replica_id).await?;
        }
        self.reply(
            header,
            Message::GetAllChecksumsReply(GetAllChecksumsReply {
                ok: outcome.ok,
                checksums: outcome.result,
                error: outcome.error,
            }),
        )
        .await
    }

    async fn on_get_all_filenames(&self, header: &Header, msg: GetAllFilenamesRequest) -> Result<()> {
        let (outcome, lines) = self.list_job(BatchJob::filelist(), &msg.replica_id).await?;
        if let Some(lines) = &lines {
            self.engine.add_filelist_information(lines, &msg.replica_id).await?;
        }
        let filenames = match lines {
            Some(lines) => lines,
            None => output_lines(&outcome.result).unwrap_or_default(),
        };
        self.reply(
            header,
            Message::GetAllFilenamesReply(GetAllFilenamesReply {
                ok: outcome.ok,
                filenames,
                error: outcome.error,
            }),
        )
        .await
    }

    async fn on_get_checksum(&self, header: &Header, msg: GetChecksumRequest) -> Result<()> {
        let checksum = self.single_checksum(&msg.filename, &msg.replica_id).await?;
        self.reply(
            header,
            Message::GetChecksumReply(GetChecksumReply {
                ok: true,
                checksum: Some(checksum),
                error: None,
            }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::sha256_hex;
    use crate::notify::RecordingNotifier;
    use crate::router::MessageRouter;
    use crate::state::ChecksumStatus;
    use crate::transport::LocalTransport;
    use tokio::sync::watch;

    const CONFIG: &str = r#"
        [node]
        id = "monitor"
        role = "monitor"
        bind_address = "127.0.0.1:7700"

        [[replicas]]
        id = "ONE"
        name = "Replica one"
        replica_type = "bitarchive"

        [[replicas]]
        id = "TWO"
        name = "Replica two"
        replica_type = "bitarchive"

        [monitor]
        batch_timeout_ms = 2000
        single_checksum_timeout_ms = 500
    "#;

    struct Fixture {
        hub: Arc<LocalTransport>,
        monitor: Arc<MonitorServer>,
        client: Inbox,
        _shutdown: watch::Sender<bool>,
    }

    async fn fixture() -> Fixture {
        let config = ArchiveConfig::from_str(CONFIG).unwrap();
        let store = Arc::new(ReplicaStore::in_memory(config.known_replicas()).unwrap());
        let hub = Arc::new(LocalTransport::new());
        let monitor = Arc::new(MonitorServer::new(
            &config,
            store,
            hub.clone(),
            Arc::new(RecordingNotifier::new()),
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let inbox = monitor.start().await.unwrap();
        tokio::spawn(MessageRouter::new(monitor.clone(), hub.clone()).run(inbox, shutdown_rx));

        let (client_sub, client) = crate::transport::inbox("client");
        hub.subscribe(Destination::Client("client".into()), client_sub).await.unwrap();

        Fixture {
            hub,
            monitor,
            client,
            _shutdown: shutdown,
        }
    }

    /// A fake replica answering every batch with fixed output
    async fn fake_replica(hub: Arc<LocalTransport>, id: &'static str, output: String) {
        let (sub, mut rx) = crate::transport::inbox(format!("fake-{}", id));
        hub.subscribe(Destination::AllReplicas, sub.clone()).await.unwrap();
        hub.subscribe(Destination::Replica(id.into()), sub).await.unwrap();

        hub.send(
            &Destination::Monitor,
            Envelope::new(id, Message::Heartbeat(Heartbeat {
                replica_id: id.into(),
                timestamp: chrono::Utc::now(),
            })),
        )
        .await
        .unwrap();

        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Message::Batch(_) = envelope.body {
                    let ended = Message::BatchEnded(BatchEnded {
                        replica_id: id.into(),
                        files_processed: output.lines().count() as u64,
                        files_failed: Vec::new(),
                        result: output.clone().into_bytes(),
                        error: None,
                    });
                    let reply = Envelope::reply(id, &envelope.header, ended);
                    let _ = hub.send(&Destination::Monitor, reply).await;
                }
            }
        });
    }

    async fn wait_alive(monitor: &MonitorServer, ids: &[&str]) {
        for _ in 0..100 {
            if monitor.liveness().running_replicas().await.len() == ids.len() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("replicas never became alive");
    }

    async fn ask(fx: &mut Fixture, body: Message) -> Message {
        fx.hub
            .send(
                &Destination::Monitor,
                Envelope::new("client", body).reply_to(Destination::Client("client".into())),
            )
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), fx.client.recv())
            .await
            .unwrap()
            .unwrap()
            .body
    }

    #[tokio::test]
    async fn test_get_all_checksums_feeds_the_store() {
        let mut fx = fixture().await;
        let a = sha256_hex(b"a");
        fake_replica(fx.hub.clone(), "ONE", format!("b.warc##{}\na.warc##{}\n", a, a)).await;
        wait_alive(&fx.monitor, &["ONE"]).await;

        match ask(&mut fx, Message::GetAllChecksums(GetAllChecksumsRequest { replica_id: "ONE".into() })).await {
            Message::GetAllChecksumsReply(r) => {
                assert!(r.ok);
                assert_eq!(r.checksums, format!("a.warc##{}\nb.warc##{}\n", a, a).into_bytes());
            }
            other => panic!("Wrong reply type: {}", other.type_name()),
        }

        let store = fx.monitor.engine().store();
        assert_eq!(store.filenames().await.unwrap(), vec!["a.warc", "b.warc"]);
        let status = store.status("a.warc", "ONE").await.unwrap().unwrap();
        assert_eq!(status.checksum.as_deref(), Some(a.as_str()));
        assert_eq!(status.checksum_status, ChecksumStatus::Unknown);
    }

    #[tokio::test]
    async fn test_get_all_filenames_returns_names() {
        let mut fx = fixture().await;
        fake_replica(fx.hub.clone(), "TWO", "b.warc\na.warc\n".into()).await;
        wait_alive(&fx.monitor, &["TWO"]).await;

        match ask(&mut fx, Message::GetAllFilenames(GetAllFilenamesRequest { replica_id: "TWO".into() })).await {
            Message::GetAllFilenamesReply(r) => {
                assert!(r.ok, "{:?}", r.error);
                assert_eq!(r.filenames, vec!["a.warc".to_string(), "b.warc".to_string()]);
            }
            other => panic!("Wrong reply type: {}", other.type_name()),
        }
        let status = fx.monitor.engine().store().status("a.warc", "TWO").await.unwrap().unwrap();
        assert_eq!(status.file_list_status, crate::state::FileListStatus::Ok);
    }

    #[tokio::test]
    async fn test_get_checksum_rules() {
        let mut fx = fixture().await;
        fake_replica(fx.hub.clone(), "ONE", "a.warc##111\n".into()).await;
        fake_replica(fx.hub.clone(), "TWO", String::new()).await;
        wait_alive(&fx.monitor, &["ONE", "TWO"]).await;

        match ask(&mut fx, Message::GetChecksum(GetChecksumRequest {
            filename: "a.warc".into(),
            replica_id: "ONE".into(),
        }))
        .await
        {
            Message::GetChecksumReply(r) => {
                assert!(r.ok);
                assert_eq!(r.checksum.as_deref(), Some("111"));
            }
            other => panic!("Wrong reply type: {}", other.type_name()),
        }

        // The fake replica answers with a line for another file
        match ask(&mut fx, Message::GetChecksum(GetChecksumRequest {
            filename: "b.warc".into(),
            replica_id: "ONE".into(),
        }))
        .await
        {
            Message::GetChecksumReply(r) => {
                assert!(!r.ok);
                assert!(r.error.unwrap().contains("instead of 'b.warc'"));
            }
            other => panic!("Wrong reply type: {}", other.type_name()),
        }

        match ask(&mut fx, Message::GetChecksum(GetChecksumRequest {
            filename: "a.warc".into(),
            replica_id: "TWO".into(),
        }))
        .await
        {
            Message::GetChecksumReply(r) => {
                assert!(!r.ok);
                assert!(r.error.unwrap().contains("did not find the file"));
            }
            other => panic!("Wrong reply type: {}", other.type_name()),
        }
        let status = fx.monitor.engine().store().status("a.warc", "TWO").await.unwrap().unwrap();
        assert_eq!(status.file_list_status, crate::state::FileListStatus::Missing);
    }

    #[tokio::test]
    async fn test_remote_batch_and_unknown_replica() {
        let mut fx = fixture().await;
        fake_replica(fx.hub.clone(), "ONE", "x\n".into()).await;
        fake_replica(fx.hub.clone(), "TWO", "y\n".into()).await;
        wait_alive(&fx.monitor, &["ONE", "TWO"]).await;

        match ask(&mut fx, Message::Batch(BatchRequest {
            job: BatchJob::filelist(),
            replica_id: None,
        }))
        .await
        {
            Message::BatchReply(r) => {
                assert!(r.ok);
                assert_eq!(r.files_processed, 2);
                assert_eq!(r.result, b"x\ny\n");
            }
            other => panic!("Wrong reply type: {}", other.type_name()),
        }

        match ask(&mut fx, Message::GetAllFilenames(GetAllFilenamesRequest { replica_id: "NOPE".into() })).await {
            Message::GetAllFilenamesReply(r) => {
                assert!(!r.ok);
                assert!(r.error.unwrap().contains("Unknown replica: NOPE"));
            }
            other => panic!("Wrong reply type: {}", other.type_name()),
        }
    }
}
